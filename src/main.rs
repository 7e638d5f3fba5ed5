//! tether - session-oriented link node
//!
//! Runs an echo server or sends messages to one, over the tether link layer.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_link::metrics::run_metrics_server;
use tether_link::{ChannelDispatcher, Client, Config, Delivery, Link, Metrics, Server};
use tether_protocol::{EventRegistry, RawEvent};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Type id carried by echo messages.
const ECHO_EVENT: u32 = 100;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Session-oriented link node")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server that echoes every event back to its sender
    Serve {
        /// Address to bind (overrides configuration)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Send messages to a server and print the echoes
    Send {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7600")]
        server: SocketAddr,

        /// How long to wait for each echo, in milliseconds
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,

        /// Messages to send
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration (file, then env overrides)
    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };
    config.validate()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut link_config = config.link_config();
    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        link_config = link_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, stop).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let mut registry = EventRegistry::new();
    registry.register_raw(ECHO_EVENT)?;
    let (dispatcher, deliveries) = ChannelDispatcher::channel();
    let link = Link::new(link_config, registry, Arc::new(dispatcher));

    tracing::info!("Starting tether node");
    tracing::info!("  Link: {}", link.name());
    tracing::info!(
        "  Transform: {}",
        link.config().transform.as_ref().map_or("none", |t| t.name())
    );
    if link.config().recovery_enabled {
        tracing::info!("  Recovery: enabled ({:?})", link.config().recovery_timeout);
    } else {
        tracing::info!("  Recovery: disabled");
    }

    let result = match cli.command {
        Commands::Serve { bind } => {
            let mut server_config = config.server_config();
            if let Some(bind) = bind {
                server_config.bind_addr = bind;
            }
            serve(link, server_config, deliveries).await
        }
        Commands::Send {
            server,
            wait_ms,
            messages,
        } => send(link, server, messages, Duration::from_millis(wait_ms), deliveries).await,
    };

    stop_tx.send_replace(true);
    result
}

async fn serve(
    link: Arc<Link>,
    config: tether_link::ServerConfig,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(Server::bind(config, link.clone()).await?);

    let echo_link = link.clone();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                Delivery::Event(envelope) => {
                    echo_link.send(envelope.handle, envelope.event);
                }
                Delivery::Connected {
                    handle,
                    success,
                    context,
                } => {
                    tracing::info!("[{}] Connected from {:?} (success={})", handle, context.peer, success)
                }
                Delivery::Recovered { handle, context } => {
                    tracing::info!("[{}] Recovered from {:?}", handle, context.peer)
                }
                Delivery::Disconnected { handle, .. } => {
                    tracing::info!("[{}] Disconnected", handle)
                }
            }
        }
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn send(
    link: Arc<Link>,
    addr: SocketAddr,
    messages: Vec<String>,
    wait: Duration,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect(addr, link).await?;

    for message in &messages {
        client.send(Arc::new(RawEvent::new(ECHO_EVENT, message.clone().into_bytes())))?;
    }

    let mut remaining = messages.len();
    while remaining > 0 {
        match tokio::time::timeout(wait, deliveries.recv()).await {
            Ok(Some(Delivery::Event(envelope))) => {
                if let Some(raw) = envelope.event.downcast_ref::<RawEvent>() {
                    println!("{}", String::from_utf8_lossy(&raw.body));
                }
                remaining -= 1;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("Timed out waiting for {} echo(es)", remaining);
                break;
            }
        }
    }

    let session = client.session();
    client.close();
    let _ = tokio::time::timeout(Duration::from_secs(5), session.wait_detached()).await;
    Ok(())
}
