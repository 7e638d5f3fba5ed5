//! The event model seam.
//!
//! The link treats an event as something with a type id that can write its
//! fields into a buffer and be rebuilt from one. Field layout belongs to the
//! event; [`BodyReader`] and the `put_*` helpers cover the common cases.

use crate::error::ProtocolError;
use crate::varint;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::Any;
use std::fmt;

/// Upcast helper implemented for every `'static` type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed message carried over a link.
pub trait Event: AsAny + Send + Sync + fmt::Debug {
    /// Wire type id. Must not fall in the reserved control range.
    fn event_type(&self) -> u32;

    /// Appends the serialized fields to `buf`.
    fn write_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Whether the body may be transformed once the send path is ready.
    fn transform_eligible(&self) -> bool {
        true
    }
}

impl dyn Event {
    /// Returns the concrete event if it is a `T`.
    pub fn downcast_ref<T: Event + 'static>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Returns whether the concrete event is a `T`.
    pub fn is<T: Event + 'static>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

/// An event that can be rebuilt from its serialized fields.
pub trait DecodeEvent: Event + Sized {
    fn decode(body: Bytes) -> Result<Self, ProtocolError>;
}

/// An untyped event: a type id and opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: u32,
    pub body: Bytes,
    pub transform_eligible: bool,
}

impl RawEvent {
    pub fn new(event_type: u32, body: impl Into<Bytes>) -> Self {
        Self {
            event_type,
            body: body.into(),
            transform_eligible: true,
        }
    }

    /// Marks the event to be sent untransformed.
    pub fn plaintext(mut self) -> Self {
        self.transform_eligible = false;
        self
    }
}

impl Event for RawEvent {
    fn event_type(&self) -> u32 {
        self.event_type
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.extend_from_slice(&self.body);
        Ok(())
    }

    fn transform_eligible(&self) -> bool {
        self.transform_eligible
    }
}

/// Appends a varint-length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(data.len()).map_err(|_| ProtocolError::VarintOverflow(u32::MAX))?;
    varint::encode(len, buf)?;
    buf.put_slice(data);
    Ok(())
}

/// Appends a varint-length-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    put_bytes(buf, s.as_bytes())
}

/// Appends a boolean as one byte.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Sequential reader over an event body.
#[derive(Debug)]
pub struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn read_varint(&mut self) -> Result<u32, ProtocolError> {
        let (value, used) =
            varint::decode(&self.buf).ok_or(ProtocolError::MalformedPayload("truncated varint"))?;
        self.buf.advance(used);
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if self.buf.is_empty() {
            return Err(ProtocolError::MalformedPayload("truncated byte field"));
        }
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProtocolError::MalformedPayload("invalid boolean")),
        }
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_varint()? as usize;
        if self.buf.len() < len {
            return Err(ProtocolError::MalformedPayload("truncated byte string"));
        }
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Returns the unread remainder.
    pub fn remaining(&self) -> &[u8] {
        &self.buf
    }

    /// Fails if any bytes were left unread.
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::MalformedPayload("trailing bytes"))
        }
    }
}
