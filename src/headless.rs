//! Headless backend
//!
//! Draws nowhere and presents on a timer running at the configured refresh
//! rate. Used when no display is attached and by the daemon by default; it
//! exercises the full scheduling path including asynchronous vsync.

use crate::buffer::{self, SharedBuffer};
use crate::config::{CompositorConfig, OutputConfig};
use crate::error::{CompositorError, Result};
use crate::format::{Fourcc, MODIFIER_INVALID, MODIFIER_LINEAR, PixelFormat};
use crate::output::{Backend, CommitError, FrameBuffer, Output, PresentFeedback, now_ns};
use crate::renderer::{Color, RenderError, Renderer, Texture};
use crate::transform::{Matrix, Rectangle};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct HeadlessTexture {
    width: u32,
    height: u32,
}

impl Texture for HeadlessTexture {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Draw call counters
#[derive(Debug, Default)]
pub struct DrawStats {
    pub clears: AtomicU64,
    pub draws: AtomicU64,
}

pub struct HeadlessRenderer {
    device: OwnedFd,
    render_formats: Vec<PixelFormat>,
    texture_formats: Vec<PixelFormat>,
    target: Mutex<Option<FrameBuffer>>,
    stats: DrawStats,
}

impl HeadlessRenderer {
    /// Open `render_node` as the device handle, or an anonymous one
    pub fn open(render_node: Option<&Path>) -> Result<Self> {
        let device = match render_node {
            Some(path) => OwnedFd::from(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(CompositorError::DeviceUnavailable)?,
            ),
            None => buffer::memfd("mosaic-headless").map_err(CompositorError::DeviceUnavailable)?,
        };

        let modifiers = [MODIFIER_LINEAR, MODIFIER_INVALID];
        Ok(Self {
            device,
            render_formats: vec![
                PixelFormat::new(Fourcc::ARGB8888, modifiers),
                PixelFormat::new(Fourcc::XRGB8888, modifiers),
            ],
            texture_formats: vec![
                PixelFormat::new(Fourcc::ARGB8888, modifiers),
                PixelFormat::new(Fourcc::XRGB8888, modifiers),
                PixelFormat::new(Fourcc::RGB565, [MODIFIER_LINEAR]),
            ],
            target: Mutex::new(None),
            stats: DrawStats::default(),
        })
    }

    pub fn stats(&self) -> &DrawStats {
        &self.stats
    }

    fn bound(&self) -> std::result::Result<FrameBuffer, RenderError> {
        let target = *lock(&self.target);
        target.ok_or_else(|| RenderError("no frame buffer bound".to_string()))
    }
}

impl Renderer for HeadlessRenderer {
    fn bind(&self, target: &FrameBuffer) -> std::result::Result<(), RenderError> {
        let mut bound = lock(&self.target);
        if let Some(current) = *bound {
            return Err(RenderError(format!("frame buffer {} still bound", current.id)));
        }
        *bound = Some(*target);
        Ok(())
    }

    fn begin(&self, width: u32, height: u32) {
        trace!("Viewport {}x{}", width, height);
    }

    fn clear(&self, color: Color) {
        trace!("Clear to {:?}", color);
        self.stats.clears.fetch_add(1, Ordering::Relaxed);
    }

    fn render(
        &self,
        texture: &dyn Texture,
        region: &Rectangle,
        _transform: &Matrix,
        alpha: f32,
    ) -> std::result::Result<(), RenderError> {
        let target = self.bound()?;
        trace!(
            "Draw {:?} of a {}x{} texture into frame buffer {} at alpha {:.2}",
            region,
            texture.width(),
            texture.height(),
            target.id,
            alpha
        );
        self.stats.draws.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn end(&self) {}

    fn unbind(&self) {
        *lock(&self.target) = None;
    }

    fn texture(&self, buffer: &SharedBuffer) -> std::result::Result<Box<dyn Texture>, RenderError> {
        let format = self
            .texture_formats
            .iter()
            .find(|format| format.fourcc() == buffer.fourcc())
            .ok_or_else(|| RenderError(format!("unsupported texture format {}", buffer.fourcc())))?;
        if !format.modifiers().contains(&buffer.modifier()) {
            return Err(RenderError(format!(
                "modifier {:#x} not supported for {}",
                buffer.modifier(),
                buffer.fourcc()
            )));
        }
        if buffer.planes().is_empty() {
            return Err(RenderError("buffer has no planes".to_string()));
        }

        let row = u64::from(buffer.width()) * u64::from(buffer.fourcc().bytes_per_pixel());
        for (index, plane) in buffer.planes().iter().enumerate() {
            if u64::from(plane.stride) < row {
                return Err(RenderError(format!(
                    "plane {} stride {} is shorter than a {} byte row",
                    index, plane.stride, row
                )));
            }
            trace!("Plane {}: stride {} offset {}", index, plane.stride, plane.offset);
        }

        Ok(Box::new(HeadlessTexture {
            width: buffer.width(),
            height: buffer.height(),
        }))
    }

    fn render_formats(&self) -> &[PixelFormat] {
        &self.render_formats
    }

    fn texture_formats(&self) -> &[PixelFormat] {
        &self.texture_formats
    }

    fn device(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

/// An output whose vertical blank is a timer
pub struct HeadlessOutput {
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: AtomicU64,
    frames: Mutex<Option<Sender<u64>>>,
    vblank: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessOutput {
    pub fn new(
        config: &OutputConfig,
        format: &PixelFormat,
        feedback: Arc<dyn PresentFeedback>,
    ) -> Result<Self> {
        if config.refresh_rate == 0 || config.width == 0 || config.height == 0 {
            return Err(CompositorError::Output {
                name: config.connector.clone(),
                reason: format!(
                    "invalid mode {}x{}@{}",
                    config.width, config.height, config.refresh_rate
                ),
            });
        }

        let interval = Duration::from_secs(1) / config.refresh_rate;
        let (frames, pending) = mpsc::channel();
        let name = config.connector.clone();

        let vblank = thread::Builder::new()
            .name(format!("vblank-{}", name))
            .spawn(move || vblank_loop(&name, interval, pending, feedback))
            .map_err(|source| CompositorError::Thread {
                name: "vblank",
                source,
            })?;

        info!(
            "Headless output {} at {}x{}@{}Hz",
            config.connector, config.width, config.height, config.refresh_rate
        );

        Ok(Self {
            name: config.connector.clone(),
            width: config.width,
            height: config.height,
            format: format.clone(),
            sequence: AtomicU64::new(0),
            frames: Mutex::new(Some(frames)),
            vblank: Mutex::new(Some(vblank)),
        })
    }

    /// Stop the vblank timer once the frames already committed are shown
    pub fn shutdown(&self) {
        lock(&self.frames).take();

        let Some(vblank) = lock(&self.vblank).take() else {
            return;
        };
        // The last owner may be the vblank thread itself.
        if vblank.thread().id() == thread::current().id() {
            return;
        }
        if vblank.join().is_err() {
            error!("VBlank thread of {} panicked", self.name);
        }
    }
}

/// Present each committed frame on the next tick after the previous one
fn vblank_loop(
    name: &str,
    interval: Duration,
    pending: Receiver<u64>,
    feedback: Arc<dyn PresentFeedback>,
) {
    let mut last = Instant::now();

    for sequence in pending {
        let due = last + interval;
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        last = Instant::now();

        feedback.presented(name, sequence, now_ns());
    }

    debug!("VBlank timer of {} stopped", name);
}

impl Output for HeadlessOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> &PixelFormat {
        &self.format
    }

    fn frame_buffer(&self) -> FrameBuffer {
        FrameBuffer {
            id: 0,
            width: self.width,
            height: self.height,
        }
    }

    fn commit(&self) -> std::result::Result<u64, CommitError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frames = lock(&self.frames);
        let sent = frames.as_ref().is_some_and(|frames| frames.send(sequence).is_ok());
        if !sent {
            return Err(CommitError(format!("{} is shut down", self.name)));
        }
        Ok(sequence)
    }
}

impl Drop for HeadlessOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct HeadlessBackend {
    render_node: Option<PathBuf>,
}

impl HeadlessBackend {
    pub fn new(config: &CompositorConfig) -> Self {
        Self {
            render_node: config.render_node.clone(),
        }
    }
}

impl Backend for HeadlessBackend {
    fn renderer(&self) -> Result<Arc<dyn Renderer>> {
        Ok(Arc::new(HeadlessRenderer::open(self.render_node.as_deref())?))
    }

    fn scanout_formats(&self) -> Vec<PixelFormat> {
        vec![
            PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR]),
            PixelFormat::new(Fourcc::XRGB8888, [MODIFIER_LINEAR]),
            PixelFormat::new(Fourcc::RGB565, [MODIFIER_LINEAR]),
        ]
    }

    fn output(
        &self,
        config: &OutputConfig,
        format: &PixelFormat,
        feedback: Arc<dyn PresentFeedback>,
    ) -> Result<Arc<dyn Output>> {
        Ok(Arc::new(HeadlessOutput::new(config, format, feedback)?))
    }
}
