use std::{error::Error, fmt, io};

/// Failures of the collective-communication backend.
///
/// All of these are fatal to the run; the backend never retries past the
/// bounded connect loop during rendezvous.
#[derive(Debug)]
pub enum CollectiveError {
    /// Distributed mode was requested but no rendezvous configuration is
    /// present in the environment.
    UnavailableBackend,
    /// The process group could not be confirmed.
    InitializationFailed(String),
    /// A tensor arrived with a length different from the local buffer.
    SizeMismatch { got: usize, expected: usize },
    /// A peer sent a frame that is invalid at this point of the protocol.
    Protocol(String),
    Io(io::Error),
}

impl fmt::Display for CollectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveError::UnavailableBackend => {
                write!(
                    f,
                    "no collective backend available: set WORLD_SIZE, RANK, \
                     MASTER_ADDR and MASTER_PORT to enable distributed mode"
                )
            }
            CollectiveError::InitializationFailed(msg) => {
                write!(f, "process group initialization failed: {msg}")
            }
            CollectiveError::SizeMismatch { got, expected } => {
                write!(f, "tensor length mismatch: got {got}, expected {expected}")
            }
            CollectiveError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            CollectiveError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for CollectiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CollectiveError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
