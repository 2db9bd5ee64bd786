use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use collective::CollectiveError;
use segmentation::ModelError;

/// Failures that abort a training run.
#[derive(Debug)]
pub enum Error {
    /// The run configuration is missing, unreadable or invalid.
    Config(String),
    /// A collective operation against the process group failed.
    Collective(CollectiveError),
    /// The model rejected a state dict or could not be built.
    Model(ModelError),
    /// A resume was requested but no record exists at the given path.
    CheckpointNotFound(PathBuf),
    /// A record exists but could not be decoded into run state.
    CheckpointCorrupt { path: PathBuf, reason: String },
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(reason) => write!(f, "invalid run configuration: {reason}"),
            Self::Collective(e) => write!(f, "collective operation failed: {e}"),
            Self::Model(e) => write!(f, "model error: {e}"),
            Self::CheckpointNotFound(path) => {
                write!(f, "no checkpoint found at {}", path.display())
            }
            Self::CheckpointCorrupt { path, reason } => {
                write!(f, "corrupt checkpoint at {}: {reason}", path.display())
            }
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Collective(e) => Some(e),
            Self::Model(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CollectiveError> for Error {
    fn from(e: CollectiveError) -> Self {
        Self::Collective(e)
    }
}

impl From<ModelError> for Error {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
