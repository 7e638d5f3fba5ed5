//! Client role: one outbound session, reconnected while it can be recovered.

use crate::connection::ConnectionOutcome;
use crate::error::LinkError;
use crate::link::Link;
use crate::session::{Polarity, Session, SessionHandle, SessionState};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_protocol::Event;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Connecting endpoint of a link.
///
/// While the session is parked for recovery the client keeps reconnecting
/// with the session's token, so sends made in the meantime are delivered
/// once the peer takes the session back.
pub struct Client {
    link: Arc<Link>,
    addr: SocketAddr,
    current: Arc<RwLock<Arc<Session>>>,
    closed: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

impl Client {
    /// Connects to `addr` and waits until the session is usable.
    pub async fn connect(addr: SocketAddr, link: Arc<Link>) -> Result<Self, LinkError> {
        let (session, task) = establish(&link, addr, None).await?;
        tracing::info!("[{}] Connected to {}", session.handle(), addr);

        let current = Arc::new(RwLock::new(session));
        let closed = Arc::new(AtomicBool::new(false));
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&link),
            addr,
            Arc::clone(&current),
            Arc::clone(&closed),
            task,
        ));

        Ok(Self {
            link,
            addr,
            current,
            closed,
            supervisor,
        })
    }

    /// The session currently carrying this client's traffic.
    pub fn session(&self) -> Arc<Session> {
        self.current.read().clone()
    }

    pub fn handle(&self) -> SessionHandle {
        self.session().handle()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_ready()
    }

    /// Queues an event.
    ///
    /// Events sent while the session waits for recovery are kept for the
    /// resumed connection. Fails with [`LinkError::NotConnected`] once the
    /// session has ended.
    pub fn send(&self, event: Arc<dyn Event>) -> Result<(), LinkError> {
        if self.session().send(event) {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    /// Closes the session and stops reconnecting.
    pub fn close(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        self.session().close()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("session", &*self.current.read())
            .finish()
    }
}

/// Opens a connection and waits for session setup to finish.
async fn establish(
    link: &Arc<Link>,
    addr: SocketAddr,
    resume_token: Option<String>,
) -> Result<(Arc<Session>, JoinHandle<ConnectionOutcome>), LinkError> {
    let stream = tokio::time::timeout(link.config().connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| LinkError::ConnectTimeout(addr))??;
    stream.set_nodelay(true)?;

    let (session, task) = link.attach_with_task(stream, Polarity::Active, Some(addr), resume_token);
    match tokio::time::timeout(link.config().setup_timeout, session.wait_ready()).await {
        Ok(true) => Ok((session, task)),
        Ok(false) => Err(LinkError::SetupFailed(format!(
            "session {} closed during setup",
            session.handle()
        ))),
        Err(_) => {
            session.close();
            Err(LinkError::SetupFailed(format!(
                "session {} setup timed out",
                session.handle()
            )))
        }
    }
}

async fn supervise(
    link: Arc<Link>,
    addr: SocketAddr,
    current: Arc<RwLock<Arc<Session>>>,
    closed: Arc<AtomicBool>,
    mut task: JoinHandle<ConnectionOutcome>,
) {
    loop {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Connection task failed: {}", e);
                return;
            }
        };

        let session = current.read().clone();
        if closed.load(Ordering::Acquire) || session.state() != SessionState::Recovering {
            tracing::debug!("[{}] Connection ended ({}), not reconnecting", session.handle(), outcome);
            return;
        }
        let Some(token) = session.token() else {
            return;
        };
        tracing::info!(
            "[{}] Connection lost ({}), reconnecting to {}",
            session.handle(),
            outcome,
            addr
        );

        let mut attempt = 0u32;
        let (next, next_task) = loop {
            if closed.load(Ordering::Acquire) || !link.recovery().is_parked(&token) {
                tracing::info!("[{}] Giving up reconnecting", session.handle());
                return;
            }
            attempt += 1;
            match establish(&link, addr, Some(token.clone())).await {
                Ok(pair) => break pair,
                Err(e) => {
                    tracing::debug!("Reconnect attempt {} to {} failed: {}", attempt, addr, e);
                    tokio::time::sleep(link.config().reconnect_interval).await;
                }
            }
        };

        tracing::info!("[{}] Reconnected after {} attempt(s)", next.handle(), attempt);
        *current.write() = next;
        task = next_task;
    }
}
