//! The composition engine
//!
//! [`Compositor`] owns every client surface, the renderer and the output.
//! Remote clients only ever see [`RemoteSurface`] handles; property changes
//! and frame requests flow through them into the [`FrameScheduler`], which
//! wakes the presenter thread. The presenter runs one composite pass, the
//! output later reports the frame through vsync, and the surfaces drawn in
//! that frame are completed.

use crate::buffer::SharedBuffer;
use crate::config::Config;
use crate::error::{CompositorError, Result};
use crate::exchange::{DescriptorExchange, DescriptorSource, ExchangeServer};
use crate::format::{self, MODIFIER_LINEAR, PixelFormat};
use crate::output::{Backend, Output, PresentFeedback, now_ns};
use crate::presenter::{Compose, Presenter};
use crate::renderer::{Color, Renderer};
use crate::scheduler::FrameScheduler;
use crate::surface::{ClientSurface, RemoteSurface, SurfaceOwner};
use crate::transform::{self, Rectangle};
use mosaic_ipc::exchange_proto::DISPLAY_ID;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tracing::{debug, error, info, trace, warn};

/// Observers of surface creation and destruction
pub trait CompositionObserver: Send + Sync {
    fn attached(&self, name: &str, client: &RemoteSurface);
    fn detached(&self, name: &str);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between client threads, the presenter and the vsync callback
pub(crate) struct Shared {
    format: PixelFormat,
    background: Color,
    renderer: Arc<dyn Renderer>,
    output: Arc<dyn Output>,
    scheduler: Arc<FrameScheduler>,
    surfaces: Mutex<BTreeMap<u32, Arc<ClientSurface>>>,
    observers: Mutex<Vec<Arc<dyn CompositionObserver>>>,
    /// Surfaces drawn into the frame awaiting its vsync
    in_frame: Mutex<Vec<Arc<ClientSurface>>>,
    next_id: AtomicU32,
}

impl Shared {
    fn surface(&self, id: u32) -> Option<Arc<ClientSurface>> {
        lock(&self.surfaces).get(&id).cloned()
    }

    fn observers(&self) -> Vec<Arc<dyn CompositionObserver>> {
        lock(&self.observers).clone()
    }

    /// The output presented the last committed frame
    fn vsync(&self, sequence: u64, timestamp: u64) {
        let presented = std::mem::take(&mut *lock(&self.in_frame));
        trace!(
            "VSync {} at {}: completing {} surfaces",
            sequence,
            timestamp,
            presented.len()
        );

        for surface in &presented {
            surface.completed();
        }

        self.scheduler.presented();
    }
}

impl Compose for Shared {
    fn compose(&self) -> usize {
        let mut snapshot: Vec<Arc<ClientSurface>> = lock(&self.surfaces).values().cloned().collect();
        snapshot.sort_by_key(|surface| (surface.properties().z_order, surface.id()));

        let target = self.output.frame_buffer();
        if let Err(e) = self.renderer.bind(&target) {
            error!("Failed to bind output {}: {}", self.output.name(), e);
            self.vsync(0, now_ns());
            return snapshot.len();
        }

        self.renderer.begin(target.width, target.height);
        self.renderer.clear(self.background);

        let projection = transform::projection(target.width, target.height);
        let mut composited = Vec::with_capacity(snapshot.len());
        let mut skipped = 0;

        for surface in snapshot {
            let properties = surface.properties();

            let drawn = surface.with_texture(|texture| {
                let region = Rectangle::new(0, 0, texture.width(), texture.height());
                let matrix = transform::project_box(&properties.geometry, &projection);
                self.renderer.render(texture, &region, &matrix, surface.alpha())
            });

            match drawn {
                Some(Ok(())) => {
                    trace!("Drew surface {}", surface.id());
                    if surface.pending() {
                        composited.push(surface);
                    }
                }
                Some(Err(e)) => {
                    warn!("Failed to draw surface {}: {}", surface.id(), e);
                    skipped += 1;
                }
                None => {
                    debug!("Surface {} has no texture yet, skipped", surface.id());
                    skipped += 1;
                }
            }
        }

        self.renderer.end();
        self.renderer.unbind();

        *lock(&self.in_frame) = composited;

        match self.output.commit() {
            Ok(sequence) => trace!("Committed frame {} to {}", sequence, self.output.name()),
            Err(e) => {
                warn!("{} on {}, completing frame without present", e, self.output.name());
                self.vsync(0, now_ns());
            }
        }

        skipped
    }
}

impl SurfaceOwner for Shared {
    fn revoke(&self, id: u32) {
        let Some(surface) = lock(&self.surfaces).remove(&id) else {
            debug!("Surface {} already revoked", id);
            return;
        };

        for observer in self.observers() {
            observer.detached(surface.name());
        }

        surface.release_texture();
        surface.release_buffer();
        surface.set_callback(None);

        info!("Surface {} ({}) destroyed", id, surface.name());

        // Make it disappear from the next frame.
        self.scheduler.render();
    }
}

impl DescriptorSource for Shared {
    fn display_descriptor(&self) -> io::Result<OwnedFd> {
        self.renderer.device().try_clone_to_owned()
    }

    fn surface_descriptors(&self, id: u32, max: usize) -> Option<io::Result<Vec<OwnedFd>>> {
        self.surface(id).map(|surface| surface.descriptors(max))
    }

    fn import(&self, id: u32, fds: Vec<OwnedFd>) -> bool {
        let Some(surface) = self.surface(id) else {
            return false;
        };

        let (width, height) = surface
            .with_buffer(|buffer| (buffer.width(), buffer.height()))
            .unwrap_or_else(|| {
                let geometry = surface.properties().geometry;
                (geometry.width, geometry.height)
            });
        let modifier = self.format.modifiers().first().copied().unwrap_or(MODIFIER_LINEAR);
        let buffer = match SharedBuffer::import(width, height, self.format.fourcc(), modifier, fds) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Surface {}: offered planes rejected: {}", id, e);
                return true;
            }
        };

        match self.renderer.texture(&buffer) {
            Ok(texture) => {
                surface.set_texture(texture);
                surface.replace_buffer(buffer);
                debug!("Surface {}: imported {}x{} planes", id, width, height);
                self.scheduler.render();
            }
            Err(e) => warn!(
                "Surface {}: renderer rejected offered planes, keeping current buffer: {}",
                id, e
            ),
        }
        true
    }
}

/// Forwards presentation feedback to the compositor once it exists
#[derive(Default)]
struct VsyncRelay {
    target: OnceLock<Weak<Shared>>,
}

impl PresentFeedback for VsyncRelay {
    fn presented(&self, output: &str, sequence: u64, timestamp: u64) {
        match self.target.get().and_then(Weak::upgrade) {
            Some(shared) => shared.vsync(sequence, timestamp),
            None => debug!("Frame {} presented on {} without compositor", sequence, output),
        }
    }
}

// ============================================================================
// Compositor
// ============================================================================

pub struct Compositor {
    shared: Arc<Shared>,
    exchange: Arc<DescriptorExchange>,
    presenter: Presenter,
    server: Option<ExchangeServer>,
}

impl Compositor {
    /// Negotiate the pixel format, create the output and start the presenter.
    /// Fails rather than compositing with an invalid format.
    pub fn configure(config: &Config, backend: &dyn Backend) -> Result<Self> {
        let requested = config
            .compositor
            .requested_format()
            .map_err(|e| CompositorError::Config(format!("{:#}", e)))?;

        let renderer = backend.renderer()?;
        let scanout = backend.scanout_formats();
        let format = format::intersect(
            &requested,
            &[renderer.render_formats(), renderer.texture_formats(), scanout.as_slice()],
            config.compositor.prefer_high_quality,
        );
        if !format.is_valid() {
            error!("No common pixel format for requested {}", requested);
            return Err(CompositorError::NoCommonFormat(requested));
        }
        info!("Negotiated pixel format {}", format);

        let relay = Arc::new(VsyncRelay::default());
        let output = backend.output(&config.output, &format, relay.clone())?;
        info!(
            "Output {} ready: {}x{}",
            output.name(),
            output.width(),
            output.height()
        );

        let shared = Arc::new(Shared {
            format,
            background: config.compositor.background(),
            renderer,
            output,
            scheduler: Arc::new(FrameScheduler::new()),
            surfaces: Mutex::new(BTreeMap::new()),
            observers: Mutex::new(Vec::new()),
            in_frame: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(DISPLAY_ID + 1),
        });
        let _ = relay.target.set(Arc::downgrade(&shared));

        let presenter = Presenter::spawn(shared.scheduler.trigger(), shared.clone()).map_err(
            |source| CompositorError::Thread {
                name: "presenter",
                source,
            },
        )?;
        let exchange = Arc::new(DescriptorExchange::new(shared.clone()));

        Ok(Self {
            shared,
            exchange,
            presenter,
            server: None,
        })
    }

    /// Open the privileged channel at `path`
    pub fn serve(&mut self, path: &Path) -> Result<()> {
        let server = ExchangeServer::bind(path, Arc::clone(&self.exchange))?;
        self.server = Some(server);
        Ok(())
    }

    pub fn format(&self) -> &PixelFormat {
        &self.shared.format
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.shared.scheduler
    }

    pub fn exchange(&self) -> &Arc<DescriptorExchange> {
        &self.exchange
    }

    /// Live surfaces, by id
    pub fn surfaces(&self) -> Vec<Arc<ClientSurface>> {
        lock(&self.shared.surfaces).values().cloned().collect()
    }

    /// Create a `width` x `height` surface for client `name`. The returned
    /// handle carries the first external reference.
    pub fn create_client(&self, name: &str, width: u32, height: u32) -> Result<RemoteSurface> {
        info!("Create a {}x{} surface for client {}", width, height, name);

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let buffer = SharedBuffer::allocate(name, width, height, &self.shared.format)
            .map_err(CompositorError::Buffer)?;
        let texture = self
            .shared
            .renderer
            .texture(&buffer)
            .map_err(|e| CompositorError::Texture {
                id,
                reason: e.to_string(),
            })?;

        let surface = Arc::new(ClientSurface::new(
            id,
            name,
            width,
            height,
            buffer,
            Arc::clone(&self.shared.scheduler),
        ));
        surface.set_texture(texture);

        {
            let mut surfaces = lock(&self.shared.surfaces);
            if surfaces.values().any(|existing| existing.name() == name) {
                return Err(CompositorError::SurfaceExists(name.to_string()));
            }
            surfaces.insert(id, Arc::clone(&surface));
        }

        let owner: Weak<dyn SurfaceOwner> = Arc::downgrade(&self.shared) as Weak<dyn SurfaceOwner>;
        let remote = RemoteSurface::attach_new(&surface, owner);

        for observer in self.shared.observers() {
            observer.attached(name, &remote);
        }

        info!("Created client surface {} ({})", id, name);
        Ok(remote)
    }

    /// Add an observer; it hears `attached` for every live surface first
    pub fn register(&self, observer: Arc<dyn CompositionObserver>) {
        {
            let mut observers = lock(&self.shared.observers);
            if observers.iter().any(|known| Arc::ptr_eq(known, &observer)) {
                warn!("Observer registered twice, ignored");
                return;
            }
            observers.push(Arc::clone(&observer));
        }

        let owner: Weak<dyn SurfaceOwner> = Arc::downgrade(&self.shared) as Weak<dyn SurfaceOwner>;
        for surface in self.surfaces() {
            // A surface whose last reference is already gone is only waiting to be revoked.
            let Some(remote) = RemoteSurface::attach_live(&surface, owner.clone()) else {
                continue;
            };
            observer.attached(surface.name(), &remote);
            // The replayed handle is a view; the observer attaches if it keeps it.
            let _ = remote.release();
        }
    }

    /// Remove an observer; it hears `detached` for every live surface
    pub fn unregister(&self, observer: &Arc<dyn CompositionObserver>) {
        let removed = {
            let mut observers = lock(&self.shared.observers);
            let before = observers.len();
            observers.retain(|known| !Arc::ptr_eq(known, observer));
            before != observers.len()
        };

        if !removed {
            warn!("Unregistering an unknown observer");
            return;
        }

        for surface in self.surfaces() {
            observer.detached(surface.name());
        }
    }

    /// Schedule a composite pass
    pub fn render(&self) {
        self.shared.scheduler.render();
    }

    /// Stop the exchange server, then the presenter after its current pass
    pub fn shutdown(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
        self.presenter.shutdown();
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.shutdown();
        info!("Compositor stopped");
    }
}
