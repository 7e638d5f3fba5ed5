//! # tether-transform
//!
//! Reversible payload transforms negotiated in-band by the link handshake.
//!
//! This crate provides:
//! - The `BufferTransform` trait every transform implements
//! - `ChaChaTransform`: X25519 key agreement, HKDF-SHA256 key derivation and
//!   ChaCha20-Poly1305 sealing, one key per direction

pub mod chacha;
pub mod error;
pub mod transform;

pub use chacha::ChaChaTransform;
pub use error::TransformError;
pub use transform::BufferTransform;
