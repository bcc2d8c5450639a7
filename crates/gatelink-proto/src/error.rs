//! Error types for the gatelink-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Failed to encode a frame.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The bytes are not valid MessagePack.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Valid MessagePack that does not have the frame shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtoError::InvalidFrame("expected 2 or 3 elements, got 1".to_string());
        assert_eq!(err.to_string(), "invalid frame: expected 2 or 3 elements, got 1");

        let err = ProtoError::Decoding("unexpected end of input".to_string());
        assert_eq!(err.to_string(), "decoding error: unexpected end of input");
    }
}
