use crate::gpu::ResourceId;
use thiserror::Error;

/// Failure of the underlying fetch/decode step of a load.
///
/// Cloneable so a single failure can be handed to every caller waiting on the same in-flight load.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Failed to fetch {path}: {reason}")]
    Fetch { path: String, reason: String },
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("{path} requires {extension}, but no codec path was configured for it")]
    MissingCodec { path: String, extension: String },
    #[error("{path} contains no scene")]
    EmptyScene { path: String },
    #[error("Load of {path} ended without producing a result")]
    Interrupted { path: String },
}

impl LoadError {
    pub fn path(&self) -> &str {
        match self {
            LoadError::Fetch { path, .. }
            | LoadError::Parse { path, .. }
            | LoadError::MissingCodec { path, .. }
            | LoadError::EmptyScene { path }
            | LoadError::Interrupted { path } => path,
        }
    }
}

/// Errors surfaced by [`crate::AssetCache`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("Invalid asset path {path:?}: {reason}")]
    InvalidKey { path: String, reason: &'static str },
    #[error("Unknown sample model {0:?}")]
    UnknownSample(String),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Raised by [`crate::gpu::GpuTracker::release`]. Disposal treats it as a no-op.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DisposeError {
    #[error("Resource {0:?} was already released")]
    AlreadyReleased(ResourceId),
}
