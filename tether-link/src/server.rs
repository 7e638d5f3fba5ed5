//! Server role: accepts connections and attaches each as a passive session.

use crate::error::LinkError;
use crate::link::Link;
use crate::session::{Polarity, SessionHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tether_protocol::Event;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7600)),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,
}

/// Accepting endpoint of a link.
pub struct Server {
    config: ServerConfig,
    link: Arc<Link>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    stats: ServerStats,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Server {
    /// Binds the listening socket. Call [`Server::run`] to start accepting.
    pub async fn bind(config: ServerConfig, link: Arc<Link>) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            config,
            link,
            listener: Mutex::new(Some(listener)),
            local_addr,
            stats: ServerStats::default(),
            shutdown: watch::channel(false).0,
            running: AtomicBool::new(false),
        })
    }

    /// Returns the bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Runs the accept loop until [`Server::shutdown`] is called.
    pub async fn run(&self) -> Result<(), LinkError> {
        let listener = self.listener.lock().await.take().ok_or(LinkError::ShuttingDown)?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {} (link {})", self.local_addr, self.link.name());

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.link.connection_count() >= self.config.max_connections {
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            let session = self.link.attach(stream, Polarity::Passive, Some(addr));
                            tracing::debug!("[{}] Accepted connection from {}", session.handle(), addr);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.link.shutdown();
        Ok(())
    }

    /// Sends an event to one session.
    pub fn send(&self, handle: SessionHandle, event: Arc<dyn Event>) -> bool {
        self.link.send(handle, event)
    }

    /// Sends an event to every current session.
    pub fn broadcast(&self, event: Arc<dyn Event>) -> usize {
        self.link.broadcast(event)
    }

    pub fn close_session(&self, handle: SessionHandle) -> bool {
        self.link.close_session(handle)
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.link.handles()
    }

    pub fn session_count(&self) -> usize {
        self.link.session_count()
    }

    /// Stops accepting and closes every session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChannelDispatcher;
    use crate::link::LinkConfig;
    use std::time::Duration;
    use tether_protocol::EventRegistry;

    async fn test_server() -> Arc<Server> {
        let (dispatcher, _rx) = ChannelDispatcher::channel();
        let link = Link::new(LinkConfig::new("test"), EventRegistry::new(), Arc::new(dispatcher));
        let config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        Arc::new(Server::bind(config, link).await.unwrap())
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = test_server().await;
        assert!(!server.is_running());
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let server = test_server().await;
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.is_running());

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!server.is_running());

        // The listener is consumed by the first run.
        assert!(matches!(server.run().await, Err(LinkError::ShuttingDown)));
    }
}
