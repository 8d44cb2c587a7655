//! Client surfaces and the remote handles that keep them alive
//!
//! A [`ClientSurface`] is owned by the compositor. Its frame state cycles
//! `Idle -> Rendering -> Presenting -> Idle`, moved only by lock-free
//! compare-and-swap in [`ClientSurface::request`], [`ClientSurface::pending`]
//! and [`ClientSurface::completed`].
//!
//! Remote processes never own a surface; they hold a [`RemoteSurface`], a
//! capability with a weak back-reference plus an explicit reference count.
//! When the count drops to zero the compositor tears the surface down.

use crate::buffer::SharedBuffer;
use crate::error::{CompositorError, Result};
use crate::renderer::Texture;
use crate::scheduler::FrameScheduler;
use crate::transform::Rectangle;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

/// Fully opaque
pub const MAX_OPACITY: u32 = 255;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Idle = 0,
    Rendering = 1,
    Presenting = 2,
}

impl SurfaceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SurfaceState::Rendering,
            2 => SurfaceState::Presenting,
            _ => SurfaceState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    pub opacity: u32,
    pub z_order: u16,
    pub geometry: Rectangle,
}

/// Peer-side notifications for a surface's frames
pub trait SurfaceCallback: Send + Sync {
    /// The surface content was drawn; its buffer may be reused
    fn rendered(&self, id: u32);
    /// The frame containing the surface reached the screen
    fn published(&self, id: u32);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ClientSurface {
    id: u32,
    name: String,
    state: AtomicU8,
    external_refs: AtomicU32,
    properties: Mutex<Properties>,
    buffer: Mutex<Option<SharedBuffer>>,
    texture: Mutex<Option<Box<dyn Texture>>>,
    callback: Mutex<Option<Arc<dyn SurfaceCallback>>>,
    scheduler: Arc<FrameScheduler>,
}

impl std::fmt::Debug for ClientSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSurface")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("properties", &self.properties())
            .finish()
    }
}

impl ClientSurface {
    pub(crate) fn new(
        id: u32,
        name: &str,
        width: u32,
        height: u32,
        buffer: SharedBuffer,
        scheduler: Arc<FrameScheduler>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            state: AtomicU8::new(SurfaceState::Idle as u8),
            external_refs: AtomicU32::new(0),
            properties: Mutex::new(Properties {
                opacity: MAX_OPACITY,
                z_order: 0,
                geometry: Rectangle::new(0, 0, width, height),
            }),
            buffer: Mutex::new(Some(buffer)),
            texture: Mutex::new(None),
            callback: Mutex::new(None),
            scheduler,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SurfaceState {
        SurfaceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn properties(&self) -> Properties {
        *lock(&self.properties)
    }

    pub fn external_refs(&self) -> u32 {
        self.external_refs.load(Ordering::Acquire)
    }

    fn transition(&self, from: SurfaceState, to: SurfaceState) -> std::result::Result<(), SurfaceState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SurfaceState::from_u8)
    }

    // ------------------------------------------------------------------------
    // Frame state machine
    // ------------------------------------------------------------------------

    /// New content is ready. Only legal from `Idle`: asking again before the
    /// previous frame was presented means the caller ignored backpressure.
    pub fn request(&self) -> Result<()> {
        match self.transition(SurfaceState::Idle, SurfaceState::Rendering) {
            Ok(()) => {
                trace!("Surface {}: Idle -> Rendering", self.id);
                self.scheduler.render();
                Ok(())
            }
            Err(state) => {
                warn!(
                    "Surface {} ({}) requested a frame while {:?}",
                    self.id, self.name, state
                );
                Err(CompositorError::FrameInFlight { id: self.id, state })
            }
        }
    }

    /// The composite pass drew this surface. Returns false when the surface
    /// was not `Rendering`, which happens when the pass raced its request.
    pub fn pending(&self) -> bool {
        match self.transition(SurfaceState::Rendering, SurfaceState::Presenting) {
            Ok(()) => {
                trace!("Surface {}: Rendering -> Presenting", self.id);
                if let Some(callback) = self.callback() {
                    callback.rendered(self.id);
                }
                true
            }
            Err(state) => {
                trace!("Surface {}: pending ignored while {:?}", self.id, state);
                false
            }
        }
    }

    /// The frame holding this surface is on screen. Returns false when the
    /// surface was not `Presenting`.
    pub fn completed(&self) -> bool {
        match self.transition(SurfaceState::Presenting, SurfaceState::Idle) {
            Ok(()) => {
                trace!("Surface {}: Presenting -> Idle", self.id);
                if let Some(callback) = self.callback() {
                    callback.published(self.id);
                }
                true
            }
            Err(state) => {
                debug!("Surface {}: completed ignored while {:?}", self.id, state);
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn set_opacity(&self, opacity: u32) {
        lock(&self.properties).opacity = opacity.min(MAX_OPACITY);
        self.scheduler.render();
    }

    pub fn set_geometry(&self, geometry: Rectangle) {
        lock(&self.properties).geometry = geometry;
        self.scheduler.render();
    }

    pub fn set_z_order(&self, z_order: u16) {
        lock(&self.properties).z_order = z_order;
        self.scheduler.render();
    }

    /// Alpha handed to the renderer
    pub fn alpha(&self) -> f32 {
        self.properties().opacity as f32 / MAX_OPACITY as f32
    }

    // ------------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------------

    pub fn set_callback(&self, callback: Option<Arc<dyn SurfaceCallback>>) {
        *lock(&self.callback) = callback;
    }

    fn callback(&self) -> Option<Arc<dyn SurfaceCallback>> {
        lock(&self.callback).clone()
    }

    /// Run `f` with the texture, if there is one
    pub fn with_texture<R>(&self, f: impl FnOnce(&dyn Texture) -> R) -> Option<R> {
        let texture = lock(&self.texture);
        texture.as_ref().map(|texture| f(texture.as_ref()))
    }

    pub(crate) fn set_texture(&self, texture: Box<dyn Texture>) {
        *lock(&self.texture) = Some(texture);
    }

    /// Drop the GPU texture; returns whether there was one
    pub(crate) fn release_texture(&self) -> bool {
        lock(&self.texture).take().is_some()
    }

    pub(crate) fn release_buffer(&self) {
        lock(&self.buffer).take();
    }

    /// Run `f` with the shared buffer, if it is still attached
    pub fn with_buffer<R>(&self, f: impl FnOnce(&SharedBuffer) -> R) -> Option<R> {
        lock(&self.buffer).as_ref().map(f)
    }

    pub(crate) fn replace_buffer(&self, buffer: SharedBuffer) {
        *lock(&self.buffer) = Some(buffer);
    }

    /// Duplicated plane handles, at most `max`
    pub fn descriptors(&self, max: usize) -> io::Result<Vec<OwnedFd>> {
        match lock(&self.buffer).as_ref() {
            Some(buffer) => buffer.descriptors(max),
            None => Ok(Vec::new()),
        }
    }

    fn add_ref(&self) -> u32 {
        self.external_refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take a reference unless the count already reached zero
    fn try_add_ref(&self) -> Option<u32> {
        self.external_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Drop one external reference; `None` if there was none left
    fn drop_ref(&self) -> Option<u32> {
        self.external_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}

// ============================================================================
// Remote handle
// ============================================================================

/// Tears a surface down once its last external reference is gone
pub(crate) trait SurfaceOwner: Send + Sync {
    fn revoke(&self, id: u32);
}

/// Capability handed to remote clients. Copies share one reference count on
/// the surface; `attach`/`release` move it explicitly.
#[derive(Clone)]
pub struct RemoteSurface {
    id: u32,
    surface: Weak<ClientSurface>,
    owner: Weak<dyn SurfaceOwner>,
}

impl std::fmt::Debug for RemoteSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSurface").field("id", &self.id).finish()
    }
}

impl RemoteSurface {
    /// Wrap `surface` and take the first external reference on it
    pub(crate) fn attach_new(surface: &Arc<ClientSurface>, owner: Weak<dyn SurfaceOwner>) -> Self {
        surface.add_ref();
        Self {
            id: surface.id(),
            surface: Arc::downgrade(surface),
            owner,
        }
    }

    /// Another handle on a surface that must still be referenced elsewhere
    pub(crate) fn attach_live(
        surface: &Arc<ClientSurface>,
        owner: Weak<dyn SurfaceOwner>,
    ) -> Option<Self> {
        surface.try_add_ref()?;
        Some(Self {
            id: surface.id(),
            surface: Arc::downgrade(surface),
            owner,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn surface(&self) -> Result<Arc<ClientSurface>> {
        self.surface
            .upgrade()
            .filter(|surface| surface.external_refs() > 0)
            .ok_or(CompositorError::SurfaceGone(self.id))
    }

    /// Take another external reference; returns the new count
    pub fn attach(&self) -> Result<u32> {
        self.surface()?
            .try_add_ref()
            .ok_or(CompositorError::SurfaceGone(self.id))
    }

    /// Give one reference back; at zero the surface is removed from the
    /// composition. Returns the remaining count.
    pub fn release(&self) -> Result<u32> {
        let surface = self.surface()?;
        let remaining = surface
            .drop_ref()
            .ok_or(CompositorError::SurfaceGone(self.id))?;

        if remaining == 0 {
            debug!("Last reference to surface {} released", self.id);
            drop(surface);
            if let Some(owner) = self.owner.upgrade() {
                owner.revoke(self.id);
            }
        }
        Ok(remaining)
    }

    pub fn request(&self) -> Result<()> {
        self.surface()?.request()
    }

    pub fn set_opacity(&self, opacity: u32) -> Result<()> {
        self.surface()?.set_opacity(opacity);
        Ok(())
    }

    pub fn set_geometry(&self, geometry: Rectangle) -> Result<()> {
        self.surface()?.set_geometry(geometry);
        Ok(())
    }

    pub fn set_z_order(&self, z_order: u16) -> Result<()> {
        self.surface()?.set_z_order(z_order);
        Ok(())
    }

    pub fn properties(&self) -> Result<Properties> {
        Ok(self.surface()?.properties())
    }

    pub fn state(&self) -> Result<SurfaceState> {
        Ok(self.surface()?.state())
    }

    pub fn set_callback(&self, callback: Arc<dyn SurfaceCallback>) -> Result<()> {
        self.surface()?.set_callback(Some(callback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Fourcc, MODIFIER_LINEAR, PixelFormat};
    use crate::scheduler::SchedulerState;
    use std::sync::atomic::AtomicUsize;

    fn surface(scheduler: &Arc<FrameScheduler>) -> Arc<ClientSurface> {
        let format = PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR]);
        let buffer = SharedBuffer::allocate("surface", 16, 16, &format).unwrap();
        Arc::new(ClientSurface::new(1, "test", 16, 16, buffer, Arc::clone(scheduler)))
    }

    #[derive(Default)]
    struct Revoked(AtomicUsize);

    impl SurfaceOwner for Revoked {
        fn revoke(&self, _id: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Peer {
        rendered: AtomicUsize,
        published: AtomicUsize,
    }

    impl SurfaceCallback for Peer {
        fn rendered(&self, _id: u32) {
            self.rendered.fetch_add(1, Ordering::SeqCst);
        }
        fn published(&self, _id: u32) {
            self.published.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_full_cycle() {
        let scheduler = Arc::new(FrameScheduler::new());
        let surface = surface(&scheduler);
        let peer = Arc::new(Peer::default());
        surface.set_callback(Some(peer.clone()));

        surface.request().unwrap();
        assert_eq!(surface.state(), SurfaceState::Rendering);
        assert_eq!(scheduler.state(), SchedulerState::Presenting);

        assert!(surface.pending());
        assert_eq!(surface.state(), SurfaceState::Presenting);
        assert_eq!(peer.rendered.load(Ordering::SeqCst), 1);

        assert!(surface.completed());
        assert_eq!(surface.state(), SurfaceState::Idle);
        assert_eq!(peer.published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let scheduler = Arc::new(FrameScheduler::new());
        let surface = surface(&scheduler);

        assert!(!surface.pending());
        assert!(!surface.completed());
        assert_eq!(surface.state(), SurfaceState::Idle);

        surface.request().unwrap();
        assert!(matches!(
            surface.request(),
            Err(CompositorError::FrameInFlight {
                state: SurfaceState::Rendering,
                ..
            })
        ));
        assert!(!surface.completed());
        assert_eq!(surface.state(), SurfaceState::Rendering);

        assert!(surface.pending());
        assert!(!surface.pending());
        assert!(surface.request().is_err());
        assert_eq!(surface.state(), SurfaceState::Presenting);
    }

    #[test]
    fn test_property_changes_schedule_render() {
        let scheduler = Arc::new(FrameScheduler::new());
        let surface = surface(&scheduler);

        surface.set_opacity(1000);
        assert_eq!(surface.properties().opacity, MAX_OPACITY);
        assert_eq!(scheduler.state(), SchedulerState::Presenting);

        surface.set_geometry(Rectangle::new(10, 20, 30, 40));
        surface.set_z_order(3);
        assert_eq!(scheduler.state(), SchedulerState::Pending);
        assert_eq!(scheduler.passes(), 1);

        let properties = surface.properties();
        assert_eq!(properties.geometry, Rectangle::new(10, 20, 30, 40));
        assert_eq!(properties.z_order, 3);
        assert_eq!(surface.state(), SurfaceState::Idle);
    }

    #[test]
    fn test_remote_reference_counting() {
        let scheduler = Arc::new(FrameScheduler::new());
        let surface = surface(&scheduler);
        let owner = Arc::new(Revoked::default());
        let weak: Weak<dyn SurfaceOwner> = Arc::downgrade(&owner) as Weak<dyn SurfaceOwner>;

        let remote = RemoteSurface::attach_new(&surface, weak);
        assert_eq!(remote.attach().unwrap(), 2);
        assert_eq!(remote.release().unwrap(), 1);
        assert_eq!(owner.0.load(Ordering::SeqCst), 0);

        assert_eq!(remote.release().unwrap(), 0);
        assert_eq!(owner.0.load(Ordering::SeqCst), 1);

        assert!(matches!(remote.release(), Err(CompositorError::SurfaceGone(1))));
        assert!(matches!(remote.attach(), Err(CompositorError::SurfaceGone(1))));
        assert!(remote.set_opacity(10).is_err());
        assert_eq!(owner.0.load(Ordering::SeqCst), 1);
        assert_eq!(surface.external_refs(), 0);
    }

    #[test]
    fn test_attach_racing_last_release_never_revives() {
        for _ in 0..200 {
            let scheduler = Arc::new(FrameScheduler::new());
            let surface = surface(&scheduler);
            let owner = Arc::new(Revoked::default());
            let weak: Weak<dyn SurfaceOwner> = Arc::downgrade(&owner) as Weak<dyn SurfaceOwner>;
            let remote = RemoteSurface::attach_new(&surface, weak);

            let borrowers: Vec<_> = (0..4)
                .map(|_| {
                    let remote = remote.clone();
                    std::thread::spawn(move || {
                        for _ in 0..50 {
                            if remote.attach().is_ok() {
                                remote.release().unwrap();
                            }
                        }
                    })
                })
                .collect();
            remote.release().unwrap();
            for borrower in borrowers {
                borrower.join().unwrap();
            }

            assert_eq!(owner.0.load(Ordering::SeqCst), 1);
            assert_eq!(surface.external_refs(), 0);
            assert!(remote.attach().is_err());
        }
    }
}
