//! Event encoder and type-keyed decoder registry.

use crate::control::Control;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{DecodeEvent, Event, RawEvent};
use crate::{DEFAULT_MAX_PAYLOAD_SIZE, MAX_TYPE_ID, RESERVED_TYPE_IDS};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tether_transform::BufferTransform;

/// Serializes events and control messages into framed bytes.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    max_payload: u32,
}

impl Encoder {
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Appends one framed event to `out`.
    ///
    /// The body is forward-transformed when a transform is given and the
    /// event is eligible. On error `out` is left as it was.
    pub fn encode_event(
        &self,
        event: &dyn Event,
        transform: Option<&mut dyn BufferTransform>,
        out: &mut BytesMut,
    ) -> Result<usize, ProtocolError> {
        let type_id = event.event_type();
        if type_id < RESERVED_TYPE_IDS {
            return Err(ProtocolError::ReservedType(type_id));
        }

        let mut body = BytesMut::new();
        event.write_body(&mut body)?;

        let frame = match transform {
            Some(transform) if event.transform_eligible() => {
                Frame::transformed(type_id, transform.forward(&body)?)
            }
            _ => Frame::new(type_id, body.freeze()),
        };
        frame.encode_into(out, self.max_payload)
    }

    /// Appends one framed control message to `out`.
    pub fn encode_control(&self, control: &Control, out: &mut BytesMut) -> Result<usize, ProtocolError> {
        control.to_frame()?.encode_into(out, self.max_payload)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

type DecodeFn = Arc<dyn Fn(u32, Bytes) -> Result<Arc<dyn Event>, ProtocolError> + Send + Sync>;

/// Maps application type ids to decoders.
#[derive(Clone, Default)]
pub struct EventRegistry {
    decoders: HashMap<u32, DecodeFn>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed event.
    pub fn register<E: DecodeEvent + 'static>(&mut self, type_id: u32) -> Result<(), ProtocolError> {
        self.register_fn(type_id, |_, body| Ok(Arc::new(E::decode(body)?) as Arc<dyn Event>))
    }

    /// Registers `type_id` to decode into [`RawEvent`]s.
    pub fn register_raw(&mut self, type_id: u32) -> Result<(), ProtocolError> {
        self.register_fn(type_id, |id, body| {
            Ok(Arc::new(RawEvent::new(id, body)) as Arc<dyn Event>)
        })
    }

    /// Registers a decoding closure.
    pub fn register_fn<F>(&mut self, type_id: u32, decode: F) -> Result<(), ProtocolError>
    where
        F: Fn(u32, Bytes) -> Result<Arc<dyn Event>, ProtocolError> + Send + Sync + 'static,
    {
        if type_id < RESERVED_TYPE_IDS {
            return Err(ProtocolError::ReservedType(type_id));
        }
        if type_id > MAX_TYPE_ID {
            return Err(ProtocolError::TypeOutOfRange(type_id));
        }
        if self.decoders.contains_key(&type_id) {
            return Err(ProtocolError::DuplicateType(type_id));
        }
        self.decoders.insert(type_id, Arc::new(decode));
        Ok(())
    }

    pub fn contains(&self, type_id: u32) -> bool {
        self.decoders.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes an application frame, reversing the transform if the frame
    /// was transformed.
    pub fn decode(
        &self,
        frame: Frame,
        transform: Option<&mut dyn BufferTransform>,
    ) -> Result<Arc<dyn Event>, ProtocolError> {
        let decoder = self
            .decoders
            .get(&frame.type_id)
            .ok_or(ProtocolError::UnknownType(frame.type_id))?;

        let body = if frame.transformed {
            let transform = transform.ok_or(ProtocolError::TransformInactive)?;
            transform.backward(&frame.body)?
        } else {
            frame.body
        };
        decoder(frame.type_id, body)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("EventRegistry").field("types", &ids).finish()
    }
}
