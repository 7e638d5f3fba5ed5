//! Delivery of session lifecycle signals and application events.

use crate::session::{Polarity, Session, SessionHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_protocol::Event;
use tokio::sync::mpsc;

/// Where a lifecycle signal came from.
#[derive(Debug, Clone)]
pub struct LinkContext {
    /// Name of the owning link.
    pub link: Arc<str>,
    /// Remote address, when the transport has one.
    pub peer: Option<SocketAddr>,
    pub polarity: Polarity,
}

/// An application event received on a session.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Handle of the originating session.
    pub handle: SessionHandle,
    pub event: Arc<dyn Event>,
    /// Routing attribute a dispatcher may stamp during preprocessing.
    pub route: Option<String>,
}

impl Envelope {
    pub fn new(handle: SessionHandle, event: Arc<dyn Event>) -> Self {
        Self {
            handle,
            event,
            route: None,
        }
    }
}

/// Everything a link reports to the application.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A session finished setup (`success`) or failed before becoming usable.
    Connected {
        handle: SessionHandle,
        success: bool,
        context: LinkContext,
    },
    /// A usable session ended for good.
    Disconnected {
        handle: SessionHandle,
        context: LinkContext,
    },
    /// A session resumed on a new connection with its handle and queue intact.
    Recovered {
        handle: SessionHandle,
        context: LinkContext,
    },
    Event(Envelope),
}

impl Delivery {
    pub fn handle(&self) -> SessionHandle {
        match self {
            Delivery::Connected { handle, .. }
            | Delivery::Disconnected { handle, .. }
            | Delivery::Recovered { handle, .. } => *handle,
            Delivery::Event(envelope) => envelope.handle,
        }
    }
}

/// The application side of a link.
///
/// `publish` is called from connection tasks and must not block.
pub trait Dispatcher: Send + Sync + 'static {
    fn publish(&self, delivery: Delivery);

    /// Inspects or rewrites every application event right before delivery.
    fn preprocess(&self, _session: &Session, _envelope: &mut Envelope) {}
}

/// Forwards deliveries into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn publish(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            tracing::trace!("Delivery receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::RawEvent;

    #[tokio::test]
    async fn test_channel_dispatcher() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel();
        let handle = SessionHandle::next();
        let event: Arc<dyn Event> = Arc::new(RawEvent::new(20, &b"x"[..]));
        dispatcher.publish(Delivery::Event(Envelope::new(handle, event)));

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.handle(), handle);
        assert!(matches!(delivery, Delivery::Event(ref e) if e.route.is_none()));
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (dispatcher, rx) = ChannelDispatcher::channel();
        drop(rx);
        dispatcher.publish(Delivery::Disconnected {
            handle: SessionHandle::next(),
            context: LinkContext {
                link: Arc::from("test"),
                peer: None,
                polarity: Polarity::Passive,
            },
        });
    }
}
