//! Prometheus metrics for tether links.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Events-per-batch histogram buckets.
const BATCH_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0];

/// Prometheus metrics for one node.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total sessions created (accepted or connected).
    pub sessions_total: Counter,
    /// Sessions currently known to the link, including parked ones.
    pub sessions_active: Gauge,
    pub bytes_sent_total: Counter,
    pub bytes_received_total: Counter,
    pub events_sent_total: Counter,
    pub events_received_total: Counter,
    /// Inbound or outbound messages dropped, by reason.
    pub messages_skipped_total: CounterVec,
    /// Transform handshake outcomes (`ok`, `degraded`, `failed`).
    pub handshakes_total: CounterVec,
    /// Recovery outcomes (`recovered`, `expired`, `rejected`).
    pub recoveries_total: CounterVec,
    /// Application events per written batch.
    pub batch_events: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Sessions
        let sessions_total = Counter::with_opts(Opts::new(
            "tether_sessions_total",
            "Total number of sessions created",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "tether_sessions_active",
            "Number of sessions currently held by the link",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        // Traffic
        let bytes_sent_total = Counter::with_opts(Opts::new(
            "tether_bytes_sent_total",
            "Total bytes written to transports",
        ))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;

        let bytes_received_total = Counter::with_opts(Opts::new(
            "tether_bytes_received_total",
            "Total bytes read from transports",
        ))?;
        registry.register(Box::new(bytes_received_total.clone()))?;

        let events_sent_total = Counter::with_opts(Opts::new(
            "tether_events_sent_total",
            "Total application events written",
        ))?;
        registry.register(Box::new(events_sent_total.clone()))?;

        let events_received_total = Counter::with_opts(Opts::new(
            "tether_events_received_total",
            "Total application events delivered",
        ))?;
        registry.register(Box::new(events_received_total.clone()))?;

        let messages_skipped_total = CounterVec::new(
            Opts::new("tether_messages_skipped_total", "Messages skipped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(messages_skipped_total.clone()))?;

        // Setup
        let handshakes_total = CounterVec::new(
            Opts::new("tether_handshakes_total", "Transform handshakes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(handshakes_total.clone()))?;

        let recoveries_total = CounterVec::new(
            Opts::new("tether_recoveries_total", "Session recoveries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(recoveries_total.clone()))?;

        let batch_events = Histogram::with_opts(
            HistogramOpts::new(
                "tether_batch_events",
                "Application events per written batch",
            )
            .buckets(BATCH_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(batch_events.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            sessions_active,
            bytes_sent_total,
            bytes_received_total,
            events_sent_total,
            events_received_total,
            messages_skipped_total,
            handshakes_total,
            recoveries_total,
            batch_events,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` turns true.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (status, content_type, body) = match req.uri().path() {
        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(metrics.encode()),
        ),
        "/health" | "/healthz" => (StatusCode::OK, "text/plain", Bytes::from_static(b"OK")),
        _ => (
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.sessions_total.inc();
        metrics.sessions_active.set(3.0);
        metrics
            .messages_skipped_total
            .with_label_values(&["unknown_type"])
            .inc();
        metrics.recoveries_total.with_label_values(&["expired"]).inc();
        metrics.batch_events.observe(12.0);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("tether_sessions_total 1"));
        assert!(encoded.contains("tether_sessions_active 3"));
        assert!(encoded.contains("reason=\"unknown_type\""));
        assert!(encoded.contains("outcome=\"expired\""));
        assert!(encoded.contains("tether_batch_events_bucket"));
    }

    #[tokio::test]
    async fn test_metrics_server_stops_on_shutdown() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(run_metrics_server(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            metrics,
            rx,
        ));
        tx.send_replace(true);
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
