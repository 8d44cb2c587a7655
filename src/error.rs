//! Error types for the composition engine

use crate::format::PixelFormat;
use crate::surface::SurfaceState;
use mosaic_ipc::ProtocolError;

/// Errors surfaced by the compositor to its callers.
///
/// Per-frame problems (a surface without texture, a lost CAS race) never end
/// up here; they are logged and skipped inside the composite pass.
#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error("no pixel format common to all capability lists (requested {0})")]
    NoCommonFormat(PixelFormat),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("render device unavailable: {0}")]
    DeviceUnavailable(#[source] std::io::Error),

    #[error("output {name} could not be created: {reason}")]
    Output { name: String, reason: String },

    #[error("buffer allocation failed: {0}")]
    Buffer(#[source] std::io::Error),

    #[error("renderer rejected buffer of surface {id}: {reason}")]
    Texture { id: u32, reason: String },

    #[error("a surface named {0:?} already exists")]
    SurfaceExists(String),

    #[error("surface {0} is gone")]
    SurfaceGone(u32),

    #[error("surface {id} asked for a new frame while {state:?}")]
    FrameInFlight { id: u32, state: SurfaceState },

    #[error("{name} thread could not be started: {source}")]
    Thread {
        name: &'static str,
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, CompositorError>;
