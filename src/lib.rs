//! Mosaic - frame-composition engine
//!
//! Clients draw into shared buffers and ask for frames through
//! [`RemoteSurface`] handles. A scheduler coalesces those requests into
//! composite passes, a presenter thread runs the passes, and vsync feedback
//! from the output paces the whole loop. Buffer handles travel to clients
//! over a privileged Unix socket, see [`exchange`].

pub mod buffer;
pub mod compositor;
pub mod config;
pub mod error;
pub mod exchange;
pub mod format;
pub mod fps;
pub mod headless;
pub mod output;
pub mod presenter;
pub mod renderer;
pub mod scheduler;
pub mod surface;
pub mod transform;

pub use compositor::{CompositionObserver, Compositor};
pub use config::Config;
pub use error::{CompositorError, Result};
pub use format::{Fourcc, PixelFormat};
pub use surface::{RemoteSurface, SurfaceCallback, SurfaceState};
