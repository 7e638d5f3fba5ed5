//! # tether-link
//!
//! Session-oriented link layer over byte streams.
//!
//! This crate provides:
//! - Sessions with FIFO batched sends and a control-message priority lane
//! - In-band transform handshake, one state machine per direction
//! - Server and client roles sharing one session table
//! - Session recovery across instant disconnects, keyed by an opaque token
//! - Configuration loading and Prometheus metrics

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod link;
pub mod metrics;
pub mod recovery;
pub mod server;
pub mod session;

pub use client::Client;
pub use config::{Config, ConfigError, LinkSettings, MetricsConfig, NetworkConfig, TransformKind};
pub use connection::ConnectionOutcome;
pub use dispatch::{ChannelDispatcher, Delivery, Dispatcher, Envelope, LinkContext};
pub use error::LinkError;
pub use link::{HandshakeFailurePolicy, Link, LinkConfig};
pub use metrics::Metrics;
pub use server::{Server, ServerConfig};
pub use session::{Polarity, Session, SessionHandle, SessionState, StatsSnapshot};
