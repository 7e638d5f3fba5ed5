//! # tether-protocol
//!
//! Wire protocol for the tether link layer.
//!
//! This crate provides:
//! - Variable-length integer encoding for lengths and type tags
//! - Length-prefixed framing with split and coalesced read handling
//! - The event model seam (`Event`, `EventRegistry`, `RawEvent`)
//! - Handshake and session-recovery control messages

pub mod codec;
pub mod control;
pub mod error;
pub mod frame;
pub mod message;
pub mod varint;

pub use codec::{Encoder, EventRegistry};
pub use control::Control;
pub use error::ProtocolError;
pub use frame::{Frame, FrameDecoder};
pub use message::{DecodeEvent, Event, RawEvent};

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Type ids below this value are reserved for control messages.
pub const RESERVED_TYPE_IDS: u32 = 16;

/// Largest type id that fits in a payload tag.
pub const MAX_TYPE_ID: u32 = varint::MAX_VARINT_VALUE >> 1;
