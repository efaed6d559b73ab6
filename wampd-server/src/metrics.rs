//! Prometheus metrics for the wampd server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Message handling duration buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];

/// Prometheus metrics for the wampd server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Established sessions.
    pub sessions_active: Gauge,
    /// Inbound messages by type.
    pub messages_total: CounterVec,
    /// Error replies and aborts by URI.
    pub errors_total: CounterVec,
    /// Message handling duration by type.
    pub message_duration: HistogramVec,
    /// Registered procedures.
    pub registrations: Gauge,
    /// Invocations awaiting a callee reply.
    pub pending_invocations: Gauge,
    /// Calls ended by the dealer-side timeout.
    pub timeouts_total: Counter,
    /// Registration meta events published, by topic.
    pub meta_events_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "wampd_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "wampd_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "wampd_sessions_active",
            "Number of established sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        // Messages
        let messages_total = CounterVec::new(
            Opts::new("wampd_messages_total", "Inbound messages by type"),
            &["type"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("wampd_errors_total", "Errors sent to peers by URI"),
            &["uri"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let message_duration = HistogramVec::new(
            HistogramOpts::new(
                "wampd_message_duration_seconds",
                "Message handling duration in seconds by type",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["type"],
        )?;
        registry.register(Box::new(message_duration.clone()))?;

        // Dealer
        let registrations = Gauge::with_opts(Opts::new(
            "wampd_registrations",
            "Number of registered procedures",
        ))?;
        registry.register(Box::new(registrations.clone()))?;

        let pending_invocations = Gauge::with_opts(Opts::new(
            "wampd_pending_invocations",
            "Invocations awaiting a callee reply",
        ))?;
        registry.register(Box::new(pending_invocations.clone()))?;

        let timeouts_total = Counter::with_opts(Opts::new(
            "wampd_call_timeouts_total",
            "Calls ended by the dealer-side timeout",
        ))?;
        registry.register(Box::new(timeouts_total.clone()))?;

        let meta_events_total = CounterVec::new(
            Opts::new(
                "wampd_meta_events_total",
                "Registration meta events published by topic",
            ),
            &["topic"],
        )?;
        registry.register(Box::new(meta_events_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            sessions_active,
            messages_total,
            errors_total,
            message_duration,
            registrations,
            pending_invocations,
            timeouts_total,
            meta_events_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
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
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode failed")
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "text/plain", "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}
