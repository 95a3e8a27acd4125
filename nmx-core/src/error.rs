use std::sync::Arc;
use thiserror::Error;

/// Main error type for nmx operations
///
/// The error is `Clone` because a link drop is fanned out to every listener
/// that is still waiting for a response.
#[derive(Error, Debug, Clone)]
pub enum NmxError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session already open: {0}")]
    AlreadyOpen(String),

    #[error("Session closed: {0}")]
    Closed(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Session already being closed")]
    AlreadyClosing,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Response received with no registered responder")]
    NoResponder,

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Duplicate sequence number: {0}")]
    DuplicateSequence(u8),

    #[error("No listener for sequence number {0}")]
    NoListener(u8),

    #[error("Encoding too large: {size} bytes (mtu: {mtu})")]
    EncodingTooLarge { size: usize, mtu: usize },

    #[error("Message rejected by filter: {0}")]
    Filtered(String),

    #[error("Rx aborted")]
    Aborted,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl NmxError {
    /// `true` for every flavour of deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, NmxError::Timeout(_))
    }

    /// `true` when a contended resource (responder slot, close rendezvous)
    /// is already held by someone else
    pub fn is_busy(&self) -> bool {
        matches!(self, NmxError::Busy(_) | NmxError::AlreadyClosing)
    }
}

impl From<std::io::Error> for NmxError {
    fn from(err: std::io::Error) -> Self {
        NmxError::Io(Arc::new(err))
    }
}

/// Result type alias for nmx operations
pub type NmxResult<T> = Result<T, NmxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_classification() {
        assert!(NmxError::Busy("responder".into()).is_busy());
        assert!(NmxError::AlreadyClosing.is_busy());
        assert!(!NmxError::Closed("x".into()).is_busy());
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err: NmxError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(!copy.is_timeout());
    }
}
