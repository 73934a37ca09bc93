use crate::request::DecodeError;
use std::io;

/// Central error type for the server core.
#[derive(Debug)]
pub enum CoreError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Percent-decoding failed on a request target.
    Decode(DecodeError),
    /// The connection slab is at `MAX_FILE_DESCRIPTORS` capacity.
    ResourceExhausted,
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "I/O error: {}", e),
            CoreError::Decode(e) => write!(f, "decode error: {:?}", e),
            CoreError::ResourceExhausted => write!(f, "file descriptor capacity exhausted"),
            CoreError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self {
        CoreError::Io(e)
    }
}

impl From<DecodeError> for CoreError {
    fn from(e: DecodeError) -> Self {
        CoreError::Decode(e)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
