//! Protocol error types.

use tether_transform::TransformError;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding a single message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint value {0} exceeds the 29-bit range")]
    VarintOverflow(u32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("unknown type id: {0}")]
    UnknownType(u32),

    #[error("type id {0} is reserved for control messages")]
    ReservedType(u32),

    #[error("type id {0} is already registered")]
    DuplicateType(u32),

    #[error("type id {0} exceeds the tag range")]
    TypeOutOfRange(u32),

    #[error("transformed payload received but no transform is active")]
    TransformInactive,

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("event decode failed: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Returns a short label describing the error class, used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::VarintOverflow(_) | ProtocolError::MalformedPayload(_) => "malformed",
            ProtocolError::FrameTooLarge { .. } => "too_large",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::ReservedType(_)
            | ProtocolError::DuplicateType(_)
            | ProtocolError::TypeOutOfRange(_) => "registry",
            ProtocolError::TransformInactive | ProtocolError::Transform(_) => "transform",
            ProtocolError::InvalidUtf8 | ProtocolError::Decode(_) => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::UnknownType(42);
        assert!(err.to_string().contains("42"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = ProtocolError::from(TransformError::Open);
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn test_error_reason() {
        assert_eq!(ProtocolError::UnknownType(1).reason(), "unknown_type");
        assert_eq!(
            ProtocolError::FrameTooLarge { size: 2, max: 1 }.reason(),
            "too_large"
        );
        assert_eq!(ProtocolError::TransformInactive.reason(), "transform");
        assert_eq!(ProtocolError::Decode("x".into()).reason(), "decode");
    }
}
