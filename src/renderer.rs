//! Renderer capability consumed by the composite pass
//!
//! The compositor never draws pixels itself. Everything it needs from the GPU
//! side is behind [`Renderer`]: binding a target, clearing it, drawing textures
//! with a transform and alpha, and importing shared buffers as textures.

use crate::buffer::SharedBuffer;
use crate::format::PixelFormat;
use crate::output::FrameBuffer;
use crate::transform::{Matrix, Rectangle};
use std::fmt;
use std::os::fd::BorrowedFd;

/// RGBA color, components in 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl From<[f32; 4]> for Color {
    fn from([r, g, b, a]: [f32; 4]) -> Self {
        Self::new(r, g, b, a)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RenderError(pub String);

/// A GPU texture; dropping it releases the GPU resource
pub trait Texture: Send + Sync + fmt::Debug {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

pub trait Renderer: Send + Sync {
    /// Make `target` the destination of the following draw calls
    fn bind(&self, target: &FrameBuffer) -> Result<(), RenderError>;

    /// Set the viewport
    fn begin(&self, width: u32, height: u32);

    fn clear(&self, color: Color);

    /// Draw `texture`'s `region` with `transform` at opacity `alpha`
    fn render(
        &self,
        texture: &dyn Texture,
        region: &Rectangle,
        transform: &Matrix,
        alpha: f32,
    ) -> Result<(), RenderError>;

    fn end(&self);

    fn unbind(&self);

    /// Create a texture bound to the memory of `buffer`
    fn texture(&self, buffer: &SharedBuffer) -> Result<Box<dyn Texture>, RenderError>;

    /// Formats valid as render targets
    fn render_formats(&self) -> &[PixelFormat];

    /// Formats valid for textures
    fn texture_formats(&self) -> &[PixelFormat];

    /// Handle identifying the render device, handed to clients asking for the display
    fn device(&self) -> BorrowedFd<'_>;
}
