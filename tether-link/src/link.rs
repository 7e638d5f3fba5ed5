//! Session-based link: the set of sessions for one endpoint.

use crate::connection::{self, ConnectionOutcome};
use crate::dispatch::{Delivery, Dispatcher, Envelope, LinkContext};
use crate::handshake::Handshake;
use crate::metrics::Metrics;
use crate::session::{Announcement, Detach, Identity, Polarity, Session, SessionHandle, SessionState};
use crate::recovery::RecoveryManager;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{Control, Encoder, Event, EventRegistry, Frame, ProtocolError};
use tether_transform::BufferTransform;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What to do when a transform handshake fails in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeFailurePolicy {
    /// Close the session as an intentional close.
    #[default]
    Close,
    /// Carry on; the failed direction stays untransformed.
    Plaintext,
}

/// Link configuration.
#[derive(Clone)]
pub struct LinkConfig {
    /// Link name, reported in lifecycle notifications.
    pub name: Arc<str>,
    /// Whether instant disconnects park the session for recovery.
    pub recovery_enabled: bool,
    /// How long a parked session waits for its peer.
    pub recovery_timeout: Duration,
    /// Template cloned (via `fresh`) for every session.
    pub transform: Option<Arc<dyn BufferTransform>>,
    pub handshake_failure: HandshakeFailurePolicy,
    /// Largest accepted payload; bigger inbound frames are skipped.
    pub max_payload_size: u32,
    /// Bytes reserved per socket read.
    pub read_buffer_size: usize,
    /// Limit for handshake plus identity exchange.
    pub setup_timeout: Duration,
    /// Limit for establishing an outbound connection.
    pub connect_timeout: Duration,
    /// Delay between client reconnect attempts while recovering.
    pub reconnect_interval: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for LinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConfig")
            .field("name", &self.name)
            .field("recovery_enabled", &self.recovery_enabled)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("transform", &self.transform.as_ref().map(|t| t.name()))
            .field("handshake_failure", &self.handshake_failure)
            .field("max_payload_size", &self.max_payload_size)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("setup_timeout", &self.setup_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: Arc::from("tether"),
            recovery_enabled: false,
            recovery_timeout: Duration::from_secs(30),
            transform: None,
            handshake_failure: HandshakeFailurePolicy::default(),
            max_payload_size: tether_protocol::DEFAULT_MAX_PAYLOAD_SIZE,
            read_buffer_size: 64 * 1024,
            setup_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(500),
            metrics: None,
        }
    }
}

impl LinkConfig {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Enables session recovery with the given window.
    pub fn with_recovery(mut self, timeout: Duration) -> Self {
        self.recovery_enabled = true;
        self.recovery_timeout = timeout;
        self
    }

    /// Sets the transform template negotiated on every session.
    pub fn with_transform(mut self, transform: impl BufferTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_handshake_failure(mut self, policy: HandshakeFailurePolicy) -> Self {
        self.handshake_failure = policy;
        self
    }

    pub fn with_max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// One endpoint's sessions, shared by the server and client roles.
///
/// Lookups by handle take a read lock; the lock is never held while sending.
pub struct Link {
    config: LinkConfig,
    registry: EventRegistry,
    encoder: Encoder,
    dispatcher: Arc<dyn Dispatcher>,
    sessions: RwLock<HashMap<SessionHandle, Arc<Session>>>,
    recovery: RecoveryManager,
    connections: AtomicUsize,
}

impl Link {
    pub fn new(
        config: LinkConfig,
        registry: EventRegistry,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Arc<Self> {
        let encoder = Encoder::new(config.max_payload_size);
        Arc::new(Self {
            config,
            registry,
            encoder,
            dispatcher,
            sessions: RwLock::new(HashMap::new()),
            recovery: RecoveryManager::new(),
            connections: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub(crate) fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub(crate) fn metrics(&self) -> Option<&Metrics> {
        self.config.metrics.as_deref()
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Starts a session over an established stream and returns it.
    ///
    /// The application hears about the session once setup completes.
    pub fn attach<S>(self: &Arc<Self>, stream: S, polarity: Polarity, peer: Option<SocketAddr>) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.attach_with_task(stream, polarity, peer, None).0
    }

    /// Like [`Link::attach`], optionally presenting a recovery token, and also
    /// returning the connection task.
    pub(crate) fn attach_with_task<S>(
        self: &Arc<Self>,
        stream: S,
        polarity: Polarity,
        peer: Option<SocketAddr>,
        resume_token: Option<String>,
    ) -> (Arc<Session>, JoinHandle<ConnectionOutcome>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transform = self.config.transform.as_ref().map(|t| t.fresh());
        let session = Session::new(
            polarity,
            peer,
            self.config.recovery_enabled,
            Handshake::new(transform),
            resume_token.clone(),
            Arc::downgrade(self),
        );

        let count = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.handle(), Arc::clone(&session));
            sessions.len()
        };
        self.connections.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics() {
            metrics.sessions_total.inc();
            metrics.sessions_active.set(count as f64);
        }
        tracing::debug!(
            "[{}] Attached {:?} connection from {:?}",
            session.handle(),
            polarity,
            peer
        );

        self.start(&session, resume_token);

        let link = Arc::clone(self);
        let driven = Arc::clone(&session);
        let task = tokio::spawn(async move {
            let outcome = connection::drive(&link, &driven, stream).await;
            tracing::debug!("[{}] Connection ended: {}", driven.handle(), outcome);
            link.on_connection_lost(&driven, &outcome);
            link.connections.fetch_sub(1, Ordering::Relaxed);
            outcome
        });
        (session, task)
    }

    /// Queues the opening control messages and arms the setup timer.
    fn start(self: &Arc<Self>, session: &Arc<Session>, resume_token: Option<String>) {
        if let Some(request) = session.with_handshake(|hs| hs.start()) {
            session.push_control(request);
        }
        if session.polarity() == Polarity::Active && self.config.recovery_enabled {
            session.push_control(Control::SessionReq {
                token: resume_token,
            });
        }

        let timeout = self.config.setup_timeout;
        let pending = Arc::downgrade(session);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = pending.upgrade() {
                if session.state() == SessionState::Setup && session.close() {
                    tracing::warn!(
                        "[{}] Session setup did not complete within {:?}",
                        session.handle(),
                        timeout
                    );
                }
            }
        });

        self.maybe_complete_setup(session);
    }

    /// Sends an event to the session with `handle`.
    ///
    /// An unknown handle is not an error: the peer may have gone away
    /// between the caller's decision and now. Returns whether the event was
    /// queued.
    pub fn send(&self, handle: SessionHandle, event: Arc<dyn Event>) -> bool {
        let session = self.sessions.read().get(&handle).cloned();
        match session {
            Some(session) => session.send(event),
            None => {
                tracing::debug!(
                    "Dropping event type {} for unknown session {}",
                    event.event_type(),
                    handle
                );
                false
            }
        }
    }

    /// Sends an event to every session present at the time of the call.
    /// Returns how many sessions queued it.
    pub fn broadcast(&self, event: Arc<dyn Event>) -> usize {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        snapshot
            .iter()
            .filter(|session| session.send(Arc::clone(&event)))
            .count()
    }

    /// Closes the session with `handle`. Returns `false` if it is unknown or
    /// already closing.
    pub fn close_session(&self, handle: SessionHandle) -> bool {
        let session = self.sessions.read().get(&handle).cloned();
        session.map_or(false, |s| s.close())
    }

    pub fn session(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.sessions.read().get(&handle).cloned()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<_> = self.sessions.read().keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Number of sessions, including those parked for recovery.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Number of live transport connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Closes every session and ends every pending recovery.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down link {}", self.name());
        for token in self.recovery.tokens() {
            self.expire_recovery(&token);
        }
        let snapshot: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in snapshot {
            session.close();
        }
    }

    /// Routes one inbound frame.
    pub(crate) fn handle_frame(&self, session: &Arc<Session>, frame: Frame) {
        if Control::is_control(frame.type_id) {
            match Control::from_frame(frame) {
                Ok(control) => self.handle_control(session, control),
                Err(e) => self.skip_message(session, &e),
            }
            return;
        }
        if Control::is_reserved(frame.type_id) {
            self.skip_message(session, &ProtocolError::UnknownType(frame.type_id));
            return;
        }

        let decoded = session.with_handshake(|hs| self.registry.decode(frame, hs.inbound_transform()));
        match decoded {
            Ok(event) => {
                session
                    .counters()
                    .events_received
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = self.metrics() {
                    metrics.events_received_total.inc();
                }
                let mut envelope = Envelope::new(session.handle(), event);
                self.dispatcher.preprocess(session, &mut envelope);
                self.dispatcher.publish(Delivery::Event(envelope));
            }
            Err(e) => self.skip_message(session, &e),
        }
    }

    /// Logs and counts one message that could not be delivered.
    pub(crate) fn skip_message(&self, session: &Session, err: &ProtocolError) {
        session
            .counters()
            .messages_skipped
            .fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.metrics() {
            metrics
                .messages_skipped_total
                .with_label_values(&[err.reason()])
                .inc();
        }
        tracing::warn!("[{}] Skipping message: {}", session.handle(), err);
    }

    fn handle_control(&self, session: &Arc<Session>, control: Control) {
        tracing::debug!("[{}] Received {}", session.handle(), control.name());
        match control {
            Control::HandshakeReq { data } => {
                let response = session.with_handshake(|hs| hs.on_request(&data));
                session.push_control(response);
                self.maybe_complete_setup(session);
            }
            Control::HandshakeResp { data } => {
                if let Some(ack) = session.with_handshake(|hs| hs.on_response(&data)) {
                    session.push_control(ack);
                }
                self.maybe_complete_setup(session);
            }
            Control::HandshakeAck { result } => {
                session.with_handshake(|hs| hs.on_ack(result));
                self.maybe_complete_setup(session);
            }
            Control::SessionReq { token } => self.on_session_request(session, token),
            Control::SessionResp { token, resumed } => {
                self.on_session_response(session, token, resumed)
            }
            Control::SessionAck { token, .. } => self.on_session_ack(session, &token),
            Control::SessionEnd => {
                tracing::info!("[{}] Peer ended the session", session.handle());
                session.on_peer_end();
            }
        }
    }

    /// Grantor side: resume the presented token or issue a new one.
    fn on_session_request(&self, session: &Arc<Session>, token: Option<String>) {
        if session.polarity() != Polarity::Passive
            || matches!(session.identity(), Identity::Granted | Identity::Done)
        {
            tracing::warn!("[{}] Ignoring unexpected SessionReq", session.handle());
            return;
        }

        let mut granted = None;
        if let Some(token) = token {
            if self.config.recovery_enabled && self.resume(session, &token) {
                granted = Some(token);
            } else {
                tracing::info!(
                    "[{}] Recovery token not recognised, starting a new session",
                    session.handle()
                );
                if let Some(metrics) = self.metrics() {
                    metrics.recoveries_total.with_label_values(&["rejected"]).inc();
                }
            }
        }

        let resumed = granted.is_some();
        let token = granted.unwrap_or_else(|| Uuid::new_v4().to_string());
        let next = if self.config.recovery_enabled {
            Identity::Granted
        } else {
            Identity::NotRequired
        };
        session.set_identity(token.clone(), next);
        session.push_control(Control::SessionResp { token, resumed });
    }

    /// Finds the session owning `token` and moves it onto `session`.
    ///
    /// A session that is still open under that token is taken over: the peer
    /// only reconnects once its old connection is gone, whether or not this
    /// side has noticed yet.
    fn resume(&self, session: &Arc<Session>, token: &str) -> bool {
        let handle = match self.recovery.claim(token) {
            Some(handle) => handle,
            None => match self.find_open(token, session) {
                Some(handle) => handle,
                None => return false,
            },
        };
        match self.session(handle) {
            Some(old) => self.transfer(&old, session),
            None => false,
        }
    }

    fn find_open(&self, token: &str, exclude: &Arc<Session>) -> Option<SessionHandle> {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        snapshot
            .into_iter()
            .filter(|s| !Arc::ptr_eq(s, exclude) && s.state() == SessionState::Ready)
            .find(|s| s.token().as_deref() == Some(token))
            .map(|s| s.handle())
    }

    /// Moves `old`'s identity and queue onto `new` and rekeys the table.
    fn transfer(&self, old: &Arc<Session>, new: &Arc<Session>) -> bool {
        let provisional = new.handle();
        let Some(handle) = new.adopt(old) else {
            return false;
        };
        {
            let mut sessions = self.sessions.write();
            sessions.remove(&provisional);
            sessions.insert(handle, Arc::clone(new));
            if let Some(metrics) = self.metrics() {
                metrics.sessions_active.set(sessions.len() as f64);
            }
        }
        if let Some(metrics) = self.metrics() {
            metrics.recoveries_total.with_label_values(&["recovered"]).inc();
        }
        tracing::info!(
            "[{}] Session resumed on new connection {}",
            handle,
            provisional
        );
        true
    }

    /// Requester side: apply the grantor's decision and confirm it.
    fn on_session_response(&self, session: &Arc<Session>, token: String, resumed: bool) {
        if session.polarity() != Polarity::Active || session.identity() != Identity::Awaiting {
            tracing::warn!("[{}] Ignoring unexpected SessionResp", session.handle());
            return;
        }

        let mut resumed_here = false;
        if let Some(old_token) = session.resume_token() {
            if resumed && old_token == token {
                match self.recovery.claim(&old_token).and_then(|h| self.session(h)) {
                    Some(old) => resumed_here = self.transfer(&old, session),
                    None => tracing::warn!(
                        "[{}] Peer resumed a session whose recovery window already closed",
                        session.handle()
                    ),
                }
            } else {
                tracing::info!(
                    "[{}] Peer did not resume the session, starting a new one",
                    session.handle()
                );
                if let Some(metrics) = self.metrics() {
                    metrics.recoveries_total.with_label_values(&["rejected"]).inc();
                }
                self.expire_recovery(&old_token);
            }
        }

        session.set_identity(token.clone(), Identity::Done);
        session.push_control(Control::SessionAck {
            token,
            resumed: resumed_here,
        });
        self.maybe_complete_setup(session);
    }

    fn on_session_ack(&self, session: &Arc<Session>, token: &str) {
        if session.polarity() != Polarity::Passive || !session.finish_identity() {
            tracing::debug!("[{}] Ignoring unexpected SessionAck", session.handle());
            return;
        }
        if session.token().as_deref() != Some(token) {
            tracing::warn!("[{}] SessionAck carried a different token", session.handle());
        }
        self.maybe_complete_setup(session);
    }

    /// Announces the session once the handshake and identity exchange settle.
    fn maybe_complete_setup(&self, session: &Arc<Session>) {
        let (settled, failed, configured) = session.with_handshake(|hs| {
            (hs.is_settled(), hs.has_failed(), hs.is_configured())
        });
        if !settled || !matches!(session.identity(), Identity::NotRequired | Identity::Done) {
            return;
        }

        if failed && self.config.handshake_failure == HandshakeFailurePolicy::Close {
            if session.close() {
                tracing::warn!("[{}] Transform handshake failed, closing", session.handle());
                if let Some(metrics) = self.metrics() {
                    metrics.handshakes_total.with_label_values(&["failed"]).inc();
                }
            }
            return;
        }

        let Some(announcement) = session.mark_ready() else {
            return;
        };
        if configured {
            let outcome = if failed { "degraded" } else { "ok" };
            if failed {
                tracing::warn!(
                    "[{}] Transform handshake failed, continuing without protection",
                    session.handle()
                );
            }
            if let Some(metrics) = self.metrics() {
                metrics.handshakes_total.with_label_values(&[outcome]).inc();
            }
        }

        let handle = session.handle();
        let context = self.context(session);
        let delivery = match announcement {
            Announcement::Connected => {
                tracing::info!("[{}] Session ready ({:?})", handle, session.peer());
                Delivery::Connected {
                    handle,
                    success: true,
                    context,
                }
            }
            Announcement::Recovered => {
                tracing::info!("[{}] Session recovered ({:?})", handle, session.peer());
                Delivery::Recovered { handle, context }
            }
        };
        self.dispatcher.publish(delivery);
    }

    /// Routes a finished connection through the terminal or recovery path.
    pub(crate) fn on_connection_lost(self: &Arc<Self>, session: &Arc<Session>, outcome: &ConnectionOutcome) {
        match session.detach(outcome.is_instant()) {
            Detach::Park { token } => self.park(session, token),
            Detach::Terminate { announced } => {
                self.unregister(session);
                let handle = session.handle();
                let context = self.context(session);
                if announced {
                    tracing::info!("[{}] Session disconnected ({})", handle, outcome);
                    self.dispatcher
                        .publish(Delivery::Disconnected { handle, context });
                } else {
                    tracing::info!("[{}] Session failed during setup ({})", handle, outcome);
                    self.dispatcher.publish(Delivery::Connected {
                        handle,
                        success: false,
                        context,
                    });
                }
            }
            Detach::Ignore => {}
        }
    }

    fn park(self: &Arc<Self>, session: &Session, token: String) {
        let handle = session.handle();
        let timeout = self.config.recovery_timeout;
        // Keeps the link alive until the window closes; aborted on claim.
        let link = Arc::clone(self);
        let expiring = token.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if link.expire_recovery(&expiring) {
                tracing::info!("[{}] Recovery window expired", handle);
            }
        });
        self.recovery.park(token, handle, expiry);
        tracing::info!(
            "[{}] Connection lost, holding session for {:?}",
            handle,
            timeout
        );
    }

    /// Terminates a parked session and reports the disconnect.
    ///
    /// Returns `false` if the token was already claimed or expired.
    pub(crate) fn expire_recovery(&self, token: &str) -> bool {
        let Some(handle) = self.recovery.expire(token) else {
            return false;
        };
        let Some(session) = self.session(handle) else {
            return false;
        };
        if !session.terminate_parked() {
            return false;
        }

        self.unregister(&session);
        if let Some(metrics) = self.metrics() {
            metrics.recoveries_total.with_label_values(&["expired"]).inc();
        }
        tracing::info!("[{}] Session disconnected (not recovered)", handle);
        self.dispatcher.publish(Delivery::Disconnected {
            handle,
            context: self.context(&session),
        });
        true
    }

    fn unregister(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write();
        let handle = session.handle();
        if sessions
            .get(&handle)
            .map_or(false, |current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&handle);
        }
        if let Some(metrics) = self.metrics() {
            metrics.sessions_active.set(sessions.len() as f64);
        }
    }

    fn context(&self, session: &Session) -> LinkContext {
        LinkContext {
            link: Arc::clone(&self.config.name),
            peer: session.peer(),
            polarity: session.polarity(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("sessions", &self.session_count())
            .field("recovery", &self.recovery)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChannelDispatcher;
    use tether_protocol::RawEvent;
    use tether_transform::ChaChaTransform;
    use tokio::io::duplex;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn link(config: LinkConfig) -> (Arc<Link>, UnboundedReceiver<Delivery>) {
        let mut registry = EventRegistry::new();
        registry.register_raw(100).unwrap();
        let (dispatcher, rx) = ChannelDispatcher::channel();
        (Link::new(config, registry, Arc::new(dispatcher)), rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("dispatcher closed")
    }

    #[test]
    fn test_link_config_builder() {
        let config = LinkConfig::new("edge")
            .with_recovery(Duration::from_secs(3))
            .with_handshake_failure(HandshakeFailurePolicy::Plaintext)
            .with_max_payload_size(1024);
        assert_eq!(&*config.name, "edge");
        assert!(config.recovery_enabled);
        assert_eq!(config.recovery_timeout, Duration::from_secs(3));
        assert_eq!(config.handshake_failure, HandshakeFailurePolicy::Plaintext);
        assert!(format!("{:?}", config).contains("edge"));
    }

    #[tokio::test]
    async fn test_duplex_pair_connects_and_delivers() {
        let (server, mut server_rx) = link(LinkConfig::new("server"));
        let (client, mut client_rx) = link(LinkConfig::new("client"));
        let (a, b) = duplex(4096);

        let passive = server.attach(a, Polarity::Passive, None);
        let active = client.attach(b, Polarity::Active, None);

        assert!(matches!(next(&mut server_rx).await, Delivery::Connected { success: true, .. }));
        assert!(matches!(next(&mut client_rx).await, Delivery::Connected { success: true, .. }));

        assert!(client.send(active.handle(), Arc::new(RawEvent::new(100, &b"hello"[..]))));
        match next(&mut server_rx).await {
            Delivery::Event(envelope) => {
                assert_eq!(envelope.handle, passive.handle());
                let raw = envelope.event.downcast_ref::<RawEvent>().unwrap();
                assert_eq!(&raw.body[..], b"hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_handle_is_dropped() {
        let (link, _rx) = link(LinkConfig::default());
        let stale = SessionHandle::next();
        assert!(!link.send(stale, Arc::new(RawEvent::new(100, &b"x"[..]))));
        assert!(!link.close_session(stale));
        assert_eq!(link.session_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let (server, mut server_rx) = link(LinkConfig::new("server"));
        let (client, mut client_rx) = link(LinkConfig::new("client"));
        for _ in 0..3 {
            let (a, b) = duplex(4096);
            server.attach(a, Polarity::Passive, None);
            client.attach(b, Polarity::Active, None);
        }
        for _ in 0..3 {
            assert!(matches!(next(&mut server_rx).await, Delivery::Connected { .. }));
            assert!(matches!(next(&mut client_rx).await, Delivery::Connected { .. }));
        }

        assert_eq!(server.broadcast(Arc::new(RawEvent::new(100, &b"all"[..]))), 3);
        for _ in 0..3 {
            assert!(matches!(next(&mut client_rx).await, Delivery::Event(_)));
        }
    }

    #[tokio::test]
    async fn test_close_session_notifies_once() {
        let (server, mut server_rx) = link(LinkConfig::new("server"));
        let (client, mut client_rx) = link(LinkConfig::new("client"));
        let (a, b) = duplex(4096);
        let passive = server.attach(a, Polarity::Passive, None);
        client.attach(b, Polarity::Active, None);
        next(&mut server_rx).await;
        next(&mut client_rx).await;

        assert!(server.close_session(passive.handle()));
        assert!(!server.close_session(passive.handle()));
        assert!(!passive.close());

        assert!(matches!(next(&mut server_rx).await, Delivery::Disconnected { .. }));
        assert!(matches!(next(&mut client_rx).await, Delivery::Disconnected { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server_rx.try_recv().is_err());
        assert_eq!(server.session_count(), 0);
    }

    /// Stamps a route on every application event it sees.
    struct Stamping {
        inner: ChannelDispatcher,
        seen: AtomicUsize,
    }

    impl Dispatcher for Stamping {
        fn publish(&self, delivery: Delivery) {
            self.inner.publish(delivery);
        }

        fn preprocess(&self, session: &Session, envelope: &mut Envelope) {
            assert!(!Control::is_reserved(envelope.event.event_type()));
            self.seen.fetch_add(1, Ordering::SeqCst);
            envelope.route = Some(format!("edge-{}", session.handle()));
        }
    }

    #[tokio::test]
    async fn test_preprocess_sees_only_application_events() {
        let (inner, mut server_rx) = ChannelDispatcher::channel();
        let stamping = Arc::new(Stamping {
            inner,
            seen: AtomicUsize::new(0),
        });
        let mut registry = EventRegistry::new();
        registry.register_raw(100).unwrap();
        let config = || {
            LinkConfig::new("sealed")
                .with_recovery(Duration::from_secs(5))
                .with_transform(ChaChaTransform::new())
        };
        let server = Link::new(config(), registry, stamping.clone());
        let (client, mut client_rx) = link(config());

        let (a, b) = duplex(4096);
        let passive = server.attach(a, Polarity::Passive, None);
        let active = client.attach(b, Polarity::Active, None);
        assert!(matches!(next(&mut server_rx).await, Delivery::Connected { success: true, .. }));
        assert!(matches!(next(&mut client_rx).await, Delivery::Connected { success: true, .. }));

        // Handshake and identity exchange are done; none of it was preprocessed.
        assert_eq!(stamping.seen.load(Ordering::SeqCst), 0);

        for body in [&b"one"[..], &b"two"[..]] {
            client.send(active.handle(), Arc::new(RawEvent::new(100, body)));
        }
        let expected = format!("edge-{}", passive.handle());
        for _ in 0..2 {
            match next(&mut server_rx).await {
                Delivery::Event(envelope) => assert_eq!(envelope.route.as_deref(), Some(expected.as_str())),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(stamping.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parked_session_expires_without_link_handle() {
        let (server, mut server_rx) = link(LinkConfig::new("server").with_recovery(Duration::from_millis(100)));
        let (client, mut client_rx) = link(LinkConfig::new("client").with_recovery(Duration::from_millis(100)));
        let (a, b) = duplex(4096);
        server.attach(a, Polarity::Passive, None);
        let active = client.attach(b, Polarity::Active, None);
        next(&mut server_rx).await;
        next(&mut client_rx).await;

        // Only the connection task and the expiry timer keep the client link alive.
        drop(client);
        active.abort();

        match next(&mut client_rx).await {
            Delivery::Disconnected { handle, .. } => assert_eq!(handle, active.handle()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next(&mut server_rx).await, Delivery::Disconnected { .. }));
        assert_eq!(active.state(), SessionState::Closed);
    }
}
