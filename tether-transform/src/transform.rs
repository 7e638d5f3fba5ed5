//! The buffer transform abstraction.

use crate::error::TransformError;
use bytes::Bytes;
use std::fmt;

/// A stateful, reversible payload transformation activated by the handshake.
///
/// A link holds one instance as a template and calls [`BufferTransform::fresh`]
/// for every session, so key material never crosses sessions. Each peer plays
/// both handshake roles:
///
/// 1. `initial_blob` produces the request this side sends.
/// 2. `respond` consumes the peer's request; afterwards `forward` may be used
///    once the peer acknowledges.
/// 3. `finalize` consumes the peer's response; on `Ok(true)` `backward` may be used.
pub trait BufferTransform: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Returns a new instance with the template's configuration and no key state.
    fn fresh(&self) -> Box<dyn BufferTransform>;

    /// Produces the blob carried by this side's handshake request.
    fn initial_blob(&mut self) -> Result<Bytes, TransformError>;

    /// Consumes the peer's request blob and produces the response blob.
    fn respond(&mut self, request: &[u8]) -> Result<Bytes, TransformError>;

    /// Consumes the peer's response blob; `Ok(false)` rejects it.
    fn finalize(&mut self, response: &[u8]) -> Result<bool, TransformError>;

    /// Transforms an outbound payload.
    fn forward(&mut self, payload: &[u8]) -> Result<Bytes, TransformError>;

    /// Reverses the transform on an inbound payload.
    fn backward(&mut self, payload: &[u8]) -> Result<Bytes, TransformError>;
}
