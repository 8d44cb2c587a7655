//! Output/backend capability
//!
//! An output owns the buffer the composite pass draws into. `commit` hands the
//! finished frame to the display; once it is visible the backend calls
//! [`PresentFeedback::presented`] from its own thread, which is what drives the
//! scheduler's vsync.

use crate::config::OutputConfig;
use crate::error::Result;
use crate::format::PixelFormat;
use crate::renderer::Renderer;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in nanoseconds, the unit of presentation timestamps
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Opaque handle to an output's backing buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBuffer {
    pub id: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("commit failed: {0}")]
pub struct CommitError(pub String);

/// Receives presentation feedback from an output
pub trait PresentFeedback: Send + Sync {
    /// Frame `sequence` became visible at `timestamp` (nanoseconds)
    fn presented(&self, output: &str, sequence: u64, timestamp: u64);
}

pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn format(&self) -> &PixelFormat;

    fn frame_buffer(&self) -> FrameBuffer;

    /// Submit the current frame buffer; returns its sequence number
    fn commit(&self) -> std::result::Result<u64, CommitError>;
}

/// Creates the renderer and the output at configuration time
pub trait Backend {
    /// Open the render device
    fn renderer(&self) -> Result<Arc<dyn Renderer>>;

    /// Formats the display can scan out
    fn scanout_formats(&self) -> Vec<PixelFormat>;

    fn output(
        &self,
        config: &OutputConfig,
        format: &PixelFormat,
        feedback: Arc<dyn PresentFeedback>,
    ) -> Result<Arc<dyn Output>>;
}
