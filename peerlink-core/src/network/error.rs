//! Network Error Types

use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Fragment reassembly failed: {0}")]
    Reassembly(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Datagram socket not bound")]
    NotBound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::ConnectionFailed("refused".to_string());
        assert_eq!(err.to_string(), "Connection failed: refused");

        let err = NetworkError::FrameTooLarge {
            size: 100_000,
            limit: 65_536,
        };
        assert!(err.to_string().contains("100000"));
        assert!(err.to_string().contains("65536"));
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = NetworkError::NotConnected;
        let cloned = err.clone();
        assert_eq!(err, cloned);
    }
}
