//! Per-direction buffer transform handshake.
//!
//! Both peers run the same exchange independently:
//!
//! ```text
//! inbound:  NotStarted --send Req--> ReqSent --recv Resp, finalize--> Ready | Failed
//! outbound: NotStarted --recv Req, respond--> RespSent --recv Ack--> Ready | Failed
//! ```
//!
//! A side's outbound key is produced when it answers the peer's request and
//! may be used once the peer acknowledges; its inbound key is produced when it
//! finalizes the peer's response to its own request.

use bytes::Bytes;
use tether_protocol::Control;
use tether_transform::BufferTransform;

/// State of one transform direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    NotStarted,
    ReqSent,
    RespSent,
    Ready,
    Failed,
}

impl DirectionState {
    fn is_settled(self) -> bool {
        matches!(self, DirectionState::Ready | DirectionState::Failed)
    }
}

/// The handshake state machine for one session.
#[derive(Debug)]
pub struct Handshake {
    transform: Option<Box<dyn BufferTransform>>,
    inbound: DirectionState,
    outbound: DirectionState,
}

impl Handshake {
    /// Creates a handshake around a fresh transform instance, or a no-op
    /// handshake when no transform is configured.
    pub fn new(transform: Option<Box<dyn BufferTransform>>) -> Self {
        Self {
            transform,
            inbound: DirectionState::NotStarted,
            outbound: DirectionState::NotStarted,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.transform.is_some()
    }

    pub fn transform_name(&self) -> Option<&'static str> {
        self.transform.as_ref().map(|t| t.name())
    }

    pub fn inbound(&self) -> DirectionState {
        self.inbound
    }

    pub fn outbound(&self) -> DirectionState {
        self.outbound
    }

    /// Produces this side's `HandshakeReq`.
    ///
    /// A failed blob is still announced (with empty data) so the peer's
    /// outbound direction can settle.
    pub fn start(&mut self) -> Option<Control> {
        let transform = self.transform.as_mut()?;
        if self.inbound != DirectionState::NotStarted {
            return None;
        }

        let data = match transform.initial_blob() {
            Ok(blob) => {
                self.inbound = DirectionState::ReqSent;
                blob
            }
            Err(e) => {
                tracing::warn!("Handshake request failed: {}", e);
                self.inbound = DirectionState::Failed;
                Bytes::new()
            }
        };
        Some(Control::HandshakeReq { data })
    }

    /// Answers the peer's `HandshakeReq`. Always yields a response.
    pub fn on_request(&mut self, data: &[u8]) -> Control {
        let Some(transform) = self.transform.as_mut() else {
            tracing::debug!("Peer requested a transform but none is configured");
            return Control::HandshakeResp { data: Bytes::new() };
        };

        match transform.respond(data) {
            Ok(resp) => {
                self.outbound = DirectionState::RespSent;
                Control::HandshakeResp { data: resp }
            }
            Err(e) => {
                tracing::warn!("Handshake response failed: {}", e);
                self.outbound = DirectionState::Failed;
                Control::HandshakeResp { data: Bytes::new() }
            }
        }
    }

    /// Finalizes the peer's `HandshakeResp` and produces the acknowledgment.
    ///
    /// Returns `None` for a response this side never asked for.
    pub fn on_response(&mut self, data: &[u8]) -> Option<Control> {
        let transform = self.transform.as_mut()?;
        let result = match self.inbound {
            DirectionState::ReqSent => match transform.finalize(data) {
                Ok(true) => true,
                Ok(false) => {
                    tracing::warn!("Handshake response rejected by transform");
                    false
                }
                Err(e) => {
                    tracing::warn!("Handshake finalize failed: {}", e);
                    false
                }
            },
            DirectionState::Failed => false,
            _ => return None,
        };

        self.inbound = if result {
            DirectionState::Ready
        } else {
            DirectionState::Failed
        };
        Some(Control::HandshakeAck { result })
    }

    /// Applies the peer's `HandshakeAck`. Returns whether the state changed.
    pub fn on_ack(&mut self, result: bool) -> bool {
        if self.outbound != DirectionState::RespSent {
            return false;
        }
        self.outbound = if result {
            DirectionState::Ready
        } else {
            DirectionState::Failed
        };
        true
    }

    /// Returns whether no further handshake messages are expected.
    ///
    /// An unconfigured handshake is always settled. When the inbound direction
    /// failed, the peer may never send its own request, so only inbound needs
    /// to settle.
    pub fn is_settled(&self) -> bool {
        if self.transform.is_none() {
            return true;
        }
        self.inbound.is_settled()
            && (self.outbound.is_settled() || self.inbound == DirectionState::Failed)
    }

    pub fn has_failed(&self) -> bool {
        self.inbound == DirectionState::Failed || self.outbound == DirectionState::Failed
    }

    pub fn tx_ready(&self) -> bool {
        self.outbound == DirectionState::Ready
    }

    pub fn rx_ready(&self) -> bool {
        self.inbound == DirectionState::Ready
    }

    /// The transform to apply to outbound payloads, once the send path is ready.
    pub fn outbound_transform(&mut self) -> Option<&mut dyn BufferTransform> {
        match self.transform.as_mut() {
            Some(t) if self.outbound == DirectionState::Ready => Some(&mut **t),
            _ => None,
        }
    }

    /// The transform to reverse inbound payloads, once the receive path is ready.
    pub fn inbound_transform(&mut self) -> Option<&mut dyn BufferTransform> {
        match self.transform.as_mut() {
            Some(t) if self.inbound == DirectionState::Ready => Some(&mut **t),
            _ => None,
        }
    }
}
