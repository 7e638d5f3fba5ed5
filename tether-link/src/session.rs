//! Per-connection session state.
//!
//! A session owns its outbound queues, handshake state, identity token and
//! counters. Application sends and the connection's writer task meet at a
//! single mutex that is held only to inspect or swap the queues; encoding and
//! socket writes happen outside it.

use crate::handshake::Handshake;
use crate::link::Link;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_protocol::{Control, Encoder, Event};
use tokio::sync::{watch, Notify};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier. Never reused, and kept across recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Connection-initiating side.
    Active,
    /// Connection-accepting side.
    Passive,
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake or identity exchange in progress.
    Setup,
    /// Usable; application events flow.
    Ready,
    /// Connection lost; waiting for the peer to resume.
    Recovering,
    /// State moved to a session on a new connection.
    Transferred,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    PendingRecovery,
    Transferred,
    Terminated,
}

/// Progress of the identity exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Identity {
    NotRequired,
    /// Active: `SessionReq` sent. Passive: waiting for `SessionReq`.
    Awaiting,
    /// Passive: `SessionResp` sent, waiting for `SessionAck`.
    Granted,
    Done,
}

/// Notification owed to the application once setup completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Announcement {
    Connected,
    Recovered,
}

/// Outcome of losing the connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Detach {
    /// Eligible for recovery under this token.
    Park { token: String },
    /// Gone for good.
    Terminate { announced: bool },
    /// Already transferred or terminated.
    Ignore,
}

/// Work for the writer task.
#[derive(Debug)]
pub(crate) enum Batch {
    /// Framed messages to write in order, and how many were events.
    Write { chunks: Vec<Bytes>, events: usize },
    /// Nothing queued; wait for a wake-up.
    Idle,
    /// Close requested and everything flushed; shut the write side down.
    Finish,
    /// The connection no longer belongs to this session.
    Stop,
}

struct SessionInner {
    phase: Phase,
    identity: Identity,
    token: Option<String>,
    /// Token presented when this connection was opened to resume a session.
    resume_token: Option<String>,
    /// Application events, released once setup completes.
    pending: VecDeque<Arc<dyn Event>>,
    /// Events of the batch being written, requeued if the write never finishes.
    unwritten: VecDeque<Arc<dyn Event>>,
    /// Control messages, written ahead of application events.
    control: VecDeque<Control>,
    in_flight: bool,
    ready: bool,
    announced: bool,
    recovered_notice: bool,
    end_pending: bool,
    end_received: bool,
    successor: Option<Arc<Session>>,
}

/// Cumulative session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub events_sent: AtomicU64,
    pub events_received: AtomicU64,
    pub batches_written: AtomicU64,
    pub messages_skipped: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub batches_written: u64,
    pub messages_skipped: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            messages_skipped: self.messages_skipped.load(Ordering::Relaxed),
        }
    }

    fn absorb(&self, other: &StatsSnapshot) {
        self.bytes_sent.fetch_add(other.bytes_sent, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(other.bytes_received, Ordering::Relaxed);
        self.events_sent.fetch_add(other.events_sent, Ordering::Relaxed);
        self.events_received
            .fetch_add(other.events_received, Ordering::Relaxed);
        self.batches_written
            .fetch_add(other.batches_written, Ordering::Relaxed);
        self.messages_skipped
            .fetch_add(other.messages_skipped, Ordering::Relaxed);
    }
}

/// One connection's session.
pub struct Session {
    handle: AtomicU64,
    polarity: Polarity,
    peer: Option<SocketAddr>,
    recovery_enabled: bool,
    inner: Mutex<SessionInner>,
    handshake: Mutex<Handshake>,
    wake: Notify,
    halt: watch::Sender<bool>,
    state: watch::Sender<SessionState>,
    stats: SessionStats,
    link: Weak<Link>,
}

impl Session {
    pub(crate) fn new(
        polarity: Polarity,
        peer: Option<SocketAddr>,
        recovery_enabled: bool,
        handshake: Handshake,
        resume_token: Option<String>,
        link: Weak<Link>,
    ) -> Arc<Self> {
        let identity = if recovery_enabled {
            Identity::Awaiting
        } else {
            Identity::NotRequired
        };
        Arc::new(Self {
            handle: AtomicU64::new(SessionHandle::next().0),
            polarity,
            peer,
            recovery_enabled,
            inner: Mutex::new(SessionInner {
                phase: Phase::Open,
                identity,
                token: None,
                resume_token,
                pending: VecDeque::new(),
                unwritten: VecDeque::new(),
                control: VecDeque::new(),
                in_flight: false,
                ready: false,
                announced: false,
                recovered_notice: false,
                end_pending: false,
                end_received: false,
                successor: None,
            }),
            handshake: Mutex::new(handshake),
            wake: Notify::new(),
            halt: watch::channel(false).0,
            state: watch::channel(SessionState::Setup).0,
            stats: SessionStats::default(),
            link,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.handle.load(Ordering::Acquire))
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns the recovery token granted during the identity exchange.
    pub fn token(&self) -> Option<String> {
        self.inner.lock().token.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Whether outbound payloads are transformed.
    pub fn tx_ready(&self) -> bool {
        self.handshake.lock().tx_ready()
    }

    /// Whether inbound payloads can be reverse-transformed.
    pub fn rx_ready(&self) -> bool {
        self.handshake.lock().rx_ready()
    }

    /// Number of application events queued and not yet written.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &SessionStats {
        &self.stats
    }

    /// Waits until the session is usable. Returns `false` if it closed or
    /// was transferred first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        let ready = match rx
            .wait_for(|s| !matches!(s, SessionState::Setup | SessionState::Recovering))
            .await
        {
            Ok(state) => *state == SessionState::Ready,
            Err(_) => false,
        };
        ready
    }

    /// Waits until the session leaves `Ready`/`Setup`, returning the new state.
    pub async fn wait_detached(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let state = match rx
            .wait_for(|s| !matches!(s, SessionState::Setup | SessionState::Ready))
            .await
        {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        };
        state
    }

    /// Queues an event for delivery.
    ///
    /// Never blocks. Events queue while setup is in progress or while the
    /// session waits for recovery; a transferred session forwards to its
    /// successor. Returns `false` if the event was dropped because the
    /// session is closing or closed.
    pub fn send(&self, event: Arc<dyn Event>) -> bool {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Open => {
                inner.pending.push_back(event);
                let kick = inner.ready && !inner.in_flight;
                if kick {
                    inner.in_flight = true;
                }
                drop(inner);
                if kick {
                    self.wake.notify_one();
                }
                true
            }
            Phase::PendingRecovery => {
                inner.pending.push_back(event);
                true
            }
            Phase::Transferred => {
                let successor = inner.successor.clone();
                drop(inner);
                successor.map_or(false, |s| s.send(event))
            }
            Phase::Closing | Phase::Terminated => {
                tracing::debug!(
                    "[{}] Dropping event type {} on closed session",
                    self.handle(),
                    event.event_type()
                );
                false
            }
        }
    }

    /// Closes the session.
    ///
    /// Queued events that are ready to go are flushed first. With recovery
    /// enabled the peer is told this is intentional via `SessionEnd`.
    /// Idempotent: only the first call returns `true`.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Open => {
                self.begin_closing(&mut inner, self.recovery_enabled);
                tracing::debug!("[{}] Closing session", self.handle());
                true
            }
            Phase::PendingRecovery => {
                let token = inner.token.clone();
                drop(inner);
                match (token, self.link.upgrade()) {
                    (Some(token), Some(link)) => link.expire_recovery(&token),
                    _ => false,
                }
            }
            Phase::Transferred => {
                let successor = inner.successor.clone();
                drop(inner);
                successor.map_or(false, |s| s.close())
            }
            Phase::Closing | Phase::Terminated => false,
        }
    }

    /// Drops the connection without any goodbye, as a network failure would.
    pub fn abort(&self) {
        tracing::debug!("[{}] Aborting connection", self.handle());
        self.halt.send_replace(true);
    }

    fn begin_closing(&self, inner: &mut SessionInner, send_end: bool) {
        inner.phase = Phase::Closing;
        inner.end_pending = send_end;
        if !inner.in_flight {
            inner.in_flight = true;
            self.wake.notify_one();
        }
    }

    /// Handles a peer's `SessionEnd`: close without answering in kind.
    pub(crate) fn on_peer_end(&self) {
        let mut inner = self.inner.lock();
        inner.end_received = true;
        if inner.phase == Phase::Open {
            self.begin_closing(&mut inner, false);
        }
    }

    pub(crate) fn push_control(&self, control: Control) {
        let mut inner = self.inner.lock();
        if !matches!(inner.phase, Phase::Open | Phase::Closing) {
            return;
        }
        inner.control.push_back(control);
        let kick = !inner.in_flight;
        if kick {
            inner.in_flight = true;
        }
        drop(inner);
        if kick {
            self.wake.notify_one();
        }
    }

    pub(crate) fn with_handshake<R>(&self, f: impl FnOnce(&mut Handshake) -> R) -> R {
        f(&mut self.handshake.lock())
    }

    pub(crate) fn identity(&self) -> Identity {
        self.inner.lock().identity
    }

    pub(crate) fn resume_token(&self) -> Option<String> {
        self.inner.lock().resume_token.clone()
    }

    /// Records the token and advances the identity exchange.
    pub(crate) fn set_identity(&self, token: String, identity: Identity) {
        let mut inner = self.inner.lock();
        inner.token = Some(token);
        inner.identity = identity;
    }

    pub(crate) fn finish_identity(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.identity != Identity::Granted {
            return false;
        }
        inner.identity = Identity::Done;
        true
    }

    /// Opens the session for application traffic once setup is complete.
    ///
    /// Returns the notification owed to the application, if any.
    pub(crate) fn mark_ready(&self) -> Option<Announcement> {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Open || inner.ready {
            return None;
        }
        if !matches!(inner.identity, Identity::NotRequired | Identity::Done) {
            return None;
        }

        inner.ready = true;
        let announcement = if mem::take(&mut inner.recovered_notice) {
            Some(Announcement::Recovered)
        } else if !inner.announced {
            Some(Announcement::Connected)
        } else {
            None
        };
        inner.announced = true;

        let kick = !inner.pending.is_empty() && !inner.in_flight;
        if kick {
            inner.in_flight = true;
        }
        drop(inner);

        self.state.send_replace(SessionState::Ready);
        if kick {
            self.wake.notify_one();
        }
        announcement
    }

    /// Takes the next batch for the writer and frames it.
    ///
    /// Control messages go first, then application events (once ready), and
    /// a pending `SessionEnd` last. Events that fail to encode are logged
    /// and skipped.
    pub(crate) fn next_batch(&self, encoder: &Encoder) -> Batch {
        let (controls, events, send_end) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.phase, Phase::Open | Phase::Closing) {
                return Batch::Stop;
            }

            let controls = mem::take(&mut inner.control);
            let events = if inner.ready {
                let events = mem::take(&mut inner.pending);
                inner.unwritten = events.clone();
                events
            } else {
                VecDeque::new()
            };
            let send_end = inner.phase == Phase::Closing && mem::take(&mut inner.end_pending);

            if controls.is_empty() && events.is_empty() && !send_end {
                if inner.phase == Phase::Closing {
                    return Batch::Finish;
                }
                inner.in_flight = false;
                return Batch::Idle;
            }
            inner.in_flight = true;
            (controls, events, send_end)
        };

        let mut buf = BytesMut::new();
        let mut chunks = Vec::with_capacity(controls.len() + events.len() + 1);

        for control in &controls {
            match encoder.encode_control(control, &mut buf) {
                Ok(_) => chunks.push(buf.split().freeze()),
                Err(e) => tracing::warn!("[{}] Failed to encode {}: {}", self.handle(), control.name(), e),
            }
        }

        let mut encoded_events = 0;
        if !events.is_empty() {
            let mut handshake = self.handshake.lock();
            for event in &events {
                match encoder.encode_event(event.as_ref(), handshake.outbound_transform(), &mut buf) {
                    Ok(_) => {
                        chunks.push(buf.split().freeze());
                        encoded_events += 1;
                    }
                    Err(e) => {
                        self.stats.messages_skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "[{}] Skipping event type {}: {}",
                            self.handle(),
                            event.event_type(),
                            e
                        );
                    }
                }
            }
        }

        if send_end {
            match encoder.encode_control(&Control::SessionEnd, &mut buf) {
                Ok(_) => chunks.push(buf.split().freeze()),
                Err(e) => tracing::warn!("[{}] Failed to encode SessionEnd: {}", self.handle(), e),
            }
        }

        Batch::Write {
            chunks,
            events: encoded_events,
        }
    }

    pub(crate) fn record_batch(&self, bytes: usize, events: usize) {
        self.inner.lock().unwritten.clear();
        self.stats
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats
            .events_sent
            .fetch_add(events as u64, Ordering::Relaxed);
        self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Waits for new outbound work.
    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }

    /// Resolves once the connection should be dropped.
    pub(crate) async fn halted(&self) {
        let mut rx = self.halt.subscribe();
        let _ = rx.wait_for(|halted| *halted).await;
    }

    /// Detaches the session from its lost connection.
    ///
    /// `instant` marks an unplanned loss. The session parks for recovery only
    /// if recovery is enabled, it was announced with a token, and neither side
    /// asked to close.
    pub(crate) fn detach(&self, instant: bool) -> Detach {
        let mut inner = self.inner.lock();
        if !matches!(inner.phase, Phase::Open | Phase::Closing) {
            return Detach::Ignore;
        }

        inner.in_flight = false;
        inner.ready = false;
        inner.control.clear();

        let eligible = instant
            && self.recovery_enabled
            && inner.phase == Phase::Open
            && inner.announced
            && !inner.end_received;

        match inner.token.clone() {
            Some(token) if eligible => {
                inner.phase = Phase::PendingRecovery;
                requeue_unwritten(&mut inner);
                drop(inner);
                self.state.send_replace(SessionState::Recovering);
                Detach::Park { token }
            }
            _ => {
                inner.phase = Phase::Terminated;
                inner.pending.clear();
                inner.unwritten.clear();
                let announced = inner.announced;
                drop(inner);
                self.state.send_replace(SessionState::Closed);
                Detach::Terminate { announced }
            }
        }
    }

    /// Ends a parked session whose recovery window closed.
    pub(crate) fn terminate_parked(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::PendingRecovery {
            return false;
        }
        inner.phase = Phase::Terminated;
        let dropped = inner.pending.len();
        inner.pending.clear();
        drop(inner);

        if dropped > 0 {
            tracing::debug!("[{}] Discarding {} queued events", self.handle(), dropped);
        }
        self.state.send_replace(SessionState::Closed);
        true
    }

    /// Takes over `old`'s identity, queue and counters.
    ///
    /// `old` must be parked for recovery, or still open on a connection the
    /// peer has abandoned (its connection is halted). Events queued on `old`
    /// go ahead of anything already queued here, and later sends to `old` are
    /// forwarded. Returns the inherited handle.
    pub(crate) fn adopt(self: &Arc<Self>, old: &Session) -> Option<SessionHandle> {
        let (pending, token, announced) = {
            let mut inner = old.inner.lock();
            if !matches!(inner.phase, Phase::PendingRecovery | Phase::Open) {
                return None;
            }
            requeue_unwritten(&mut inner);
            inner.phase = Phase::Transferred;
            inner.successor = Some(Arc::clone(self));
            inner.ready = false;
            inner.control.clear();
            (mem::take(&mut inner.pending), inner.token.clone(), inner.announced)
        };
        old.state.send_replace(SessionState::Transferred);
        old.halt.send_replace(true);
        self.stats.absorb(&old.stats.snapshot());

        let handle = old.handle();
        {
            let mut inner = self.inner.lock();
            let mut queue = pending;
            queue.extend(inner.pending.drain(..));
            inner.pending = queue;
            inner.token = token;
            inner.announced = announced;
            inner.recovered_notice = announced;
        }
        self.handle.store(handle.0, Ordering::Release);
        Some(handle)
    }
}

/// Puts a batch that never reached the wire back in front of the queue.
fn requeue_unwritten(inner: &mut SessionInner) {
    while let Some(event) = inner.unwritten.pop_back() {
        inner.pending.push_front(event);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle())
            .field("polarity", &self.polarity)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
