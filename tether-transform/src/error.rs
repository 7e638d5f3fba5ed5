//! Transform error types.

use thiserror::Error;

/// Errors raised by a buffer transform step.
///
/// A failed step aborts only that step: the link logs it and either skips the
/// affected message or reports a failed handshake acknowledgment.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed handshake blob: {0}")]
    MalformedBlob(&'static str),

    #[error("handshake step out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("key agreement produced a non-contributory secret")]
    WeakKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("transform not ready for {0}")]
    NotReady(&'static str),

    #[error("sealing failed")]
    Seal,

    #[error("payload failed authentication")]
    Open,

    #[error("payload truncated: {len} bytes (min {min})")]
    Truncated { len: usize, min: usize },

    #[error("replayed or reordered payload: counter {got}, expected at least {expected}")]
    Replay { got: u64, expected: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_error_display() {
        let err = TransformError::Truncated { len: 3, min: 24 };
        assert!(err.to_string().contains("24"));

        let err = TransformError::Replay {
            got: 4,
            expected: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains('4') && msg.contains('9'));

        let err = TransformError::NotReady("forward");
        assert!(err.to_string().contains("forward"));
    }
}
