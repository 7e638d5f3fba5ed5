//! Link control messages.
//!
//! Control messages are ordinary frames with reserved type ids. They are
//! never transformed and never reach the application.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{put_bool, put_bytes, put_str, BodyReader};
use crate::RESERVED_TYPE_IDS;
use bytes::{Bytes, BytesMut};

pub const HANDSHAKE_REQ: u32 = 1;
pub const HANDSHAKE_RESP: u32 = 2;
pub const HANDSHAKE_ACK: u32 = 3;
pub const SESSION_REQ: u32 = 4;
pub const SESSION_RESP: u32 = 5;
pub const SESSION_ACK: u32 = 6;
pub const SESSION_END: u32 = 7;

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Carries this side's initial transform blob.
    HandshakeReq { data: Bytes },
    /// Carries the response to the peer's blob; empty when the request failed.
    HandshakeResp { data: Bytes },
    /// Reports whether the peer's response finalized.
    HandshakeAck { result: bool },
    /// Asks for a session, presenting a recovery token when resuming.
    SessionReq { token: Option<String> },
    /// Grants a session token; `resumed` is set when the presented token matched.
    SessionResp { token: String, resumed: bool },
    /// Confirms the granted token.
    SessionAck { token: String, resumed: bool },
    /// Announces an intentional close.
    SessionEnd,
}

impl Control {
    /// Returns whether `type_id` is a control message id.
    pub fn is_control(type_id: u32) -> bool {
        (HANDSHAKE_REQ..=SESSION_END).contains(&type_id)
    }

    /// Returns whether `type_id` falls in the reserved range.
    pub fn is_reserved(type_id: u32) -> bool {
        type_id < RESERVED_TYPE_IDS
    }

    pub fn type_id(&self) -> u32 {
        match self {
            Control::HandshakeReq { .. } => HANDSHAKE_REQ,
            Control::HandshakeResp { .. } => HANDSHAKE_RESP,
            Control::HandshakeAck { .. } => HANDSHAKE_ACK,
            Control::SessionReq { .. } => SESSION_REQ,
            Control::SessionResp { .. } => SESSION_RESP,
            Control::SessionAck { .. } => SESSION_ACK,
            Control::SessionEnd => SESSION_END,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Control::HandshakeReq { .. } => "HandshakeReq",
            Control::HandshakeResp { .. } => "HandshakeResp",
            Control::HandshakeAck { .. } => "HandshakeAck",
            Control::SessionReq { .. } => "SessionReq",
            Control::SessionResp { .. } => "SessionResp",
            Control::SessionAck { .. } => "SessionAck",
            Control::SessionEnd => "SessionEnd",
        }
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Control::HandshakeReq { data } | Control::HandshakeResp { data } => {
                put_bytes(buf, data)?;
            }
            Control::HandshakeAck { result } => put_bool(buf, *result),
            Control::SessionReq { token } => match token {
                Some(token) => {
                    put_bool(buf, true);
                    put_str(buf, token)?;
                }
                None => put_bool(buf, false),
            },
            Control::SessionResp { token, resumed } | Control::SessionAck { token, resumed } => {
                put_str(buf, token)?;
                put_bool(buf, *resumed);
            }
            Control::SessionEnd => {}
        }
        Ok(())
    }

    /// Builds the (always untransformed) frame for this message.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let mut body = BytesMut::new();
        self.write_body(&mut body)?;
        Ok(Frame::new(self.type_id(), body.freeze()))
    }

    /// Parses a control frame.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        if frame.transformed {
            return Err(ProtocolError::MalformedPayload("transformed control message"));
        }

        let mut r = BodyReader::new(frame.body);
        let control = match frame.type_id {
            HANDSHAKE_REQ => Control::HandshakeReq {
                data: r.read_bytes()?,
            },
            HANDSHAKE_RESP => Control::HandshakeResp {
                data: r.read_bytes()?,
            },
            HANDSHAKE_ACK => Control::HandshakeAck {
                result: r.read_bool()?,
            },
            SESSION_REQ => {
                let token = if r.read_bool()? {
                    Some(r.read_string()?)
                } else {
                    None
                };
                Control::SessionReq { token }
            }
            SESSION_RESP => Control::SessionResp {
                token: r.read_string()?,
                resumed: r.read_bool()?,
            },
            SESSION_ACK => Control::SessionAck {
                token: r.read_string()?,
                resumed: r.read_bool()?,
            },
            SESSION_END => Control::SessionEnd,
            other => return Err(ProtocolError::UnknownType(other)),
        };
        r.finish()?;
        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Vec<Control> {
        vec![
            Control::HandshakeReq {
                data: Bytes::from_static(&[1, 2, 3]),
            },
            Control::HandshakeResp { data: Bytes::new() },
            Control::HandshakeAck { result: true },
            Control::SessionReq { token: None },
            Control::SessionReq {
                token: Some("8b0c-token".into()),
            },
            Control::SessionResp {
                token: "abc".into(),
                resumed: false,
            },
            Control::SessionAck {
                token: "abc".into(),
                resumed: true,
            },
            Control::SessionEnd,
        ]
    }

    #[test]
    fn test_control_frames_parse_back() {
        for control in all() {
            let frame = control.to_frame().unwrap();
            assert!(!frame.transformed);
            assert!(Control::is_control(frame.type_id));
            assert_eq!(Control::from_frame(frame).unwrap(), control);
        }
    }

    #[test]
    fn test_reserved_range() {
        for id in 1..=7 {
            assert!(Control::is_control(id));
        }
        assert!(!Control::is_control(0));
        assert!(!Control::is_control(8));
        assert!(Control::is_reserved(15));
        assert!(!Control::is_reserved(16));
    }

    #[test]
    fn test_session_end_is_empty() {
        let frame = Control::SessionEnd.to_frame().unwrap();
        assert!(frame.body.is_empty());
        assert_eq!(&frame.encode().unwrap()[..], &[0x01, 0x0E]);
    }

    #[test]
    fn test_transformed_control_rejected() {
        let frame = Frame::transformed(SESSION_END, Bytes::new());
        assert!(matches!(
            Control::from_frame(frame),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = Frame::new(HANDSHAKE_ACK, Bytes::from_static(&[1, 0]));
        assert!(Control::from_frame(frame).is_err());
    }

    #[test]
    fn test_unassigned_reserved_id() {
        let frame = Frame::new(9, Bytes::new());
        assert!(matches!(
            Control::from_frame(frame),
            Err(ProtocolError::UnknownType(9))
        ));
    }
}
