//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Each binary owns its registry
//! and decides whether to expose it over HTTP.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Prometheus registry + handles for call signaling and media.
///
/// Hot paths only touch counter/gauge handles; cloning is cheap.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Signaling, labelled by message kind (e.g. "INVITE", "200")
    pub control_sent_total: IntCounterVec,
    pub control_received_total: IntCounterVec,

    // Call outcomes
    pub calls_placed_total: IntCounter,
    pub calls_established_total: IntCounter,
    pub calls_failed_total: IntCounter,
    pub calls_terminated_total: IntCounter,

    // Media
    pub packets_sent_total: IntCounter,
    pub packets_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub malformed_datagrams_total: IntCounter,
    pub sender_reports_sent_total: IntCounter,

    // Jitter buffer
    pub jitter_buffer_dropped_total: IntCounter,
    pub jitter_buffer_occupancy_packets: IntGauge,

    // Send pacing lateness (seconds behind the frame schedule)
    pub pacing_drift_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("voice_call".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let control_sent_total = IntCounterVec::new(
            Opts::new("control_messages_sent_total", "Control messages sent"),
            &["kind"],
        )?;
        let control_received_total = IntCounterVec::new(
            Opts::new("control_messages_received_total", "Control messages received"),
            &["kind"],
        )?;

        let counter = |name: &str, help: &str| IntCounter::with_opts(Opts::new(name, help));

        let calls_placed_total = counter("calls_placed_total", "Calls initiated")?;
        let calls_established_total = counter("calls_established_total", "Calls established")?;
        let calls_failed_total = counter("calls_failed_total", "Calls that failed to establish")?;
        let calls_terminated_total = counter("calls_terminated_total", "Calls terminated")?;

        let packets_sent_total = counter("media_packets_sent_total", "Media packets sent")?;
        let packets_received_total =
            counter("media_packets_received_total", "Media packets received")?;
        let bytes_sent_total = counter("media_bytes_sent_total", "Media payload bytes sent")?;
        let bytes_received_total =
            counter("media_bytes_received_total", "Media payload bytes received")?;
        let malformed_datagrams_total = counter(
            "malformed_datagrams_total",
            "Control or media datagrams discarded as malformed",
        )?;
        let sender_reports_sent_total =
            counter("sender_reports_sent_total", "Sender reports emitted")?;

        let jitter_buffer_dropped_total = counter(
            "jitter_buffer_dropped_total",
            "Packets dropped because the jitter buffer was full",
        )?;
        let jitter_buffer_occupancy_packets = IntGauge::with_opts(Opts::new(
            "jitter_buffer_occupancy_packets",
            "Current jitter buffer occupancy in packets",
        ))?;

        let pacing_drift_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pacing_drift_seconds",
                "How far behind schedule each media frame was sent (seconds)",
            )
            .buckets(vec![0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1]),
        )?;

        registry.register(Box::new(control_sent_total.clone()))?;
        registry.register(Box::new(control_received_total.clone()))?;
        registry.register(Box::new(calls_placed_total.clone()))?;
        registry.register(Box::new(calls_established_total.clone()))?;
        registry.register(Box::new(calls_failed_total.clone()))?;
        registry.register(Box::new(calls_terminated_total.clone()))?;
        registry.register(Box::new(packets_sent_total.clone()))?;
        registry.register(Box::new(packets_received_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(malformed_datagrams_total.clone()))?;
        registry.register(Box::new(sender_reports_sent_total.clone()))?;
        registry.register(Box::new(jitter_buffer_dropped_total.clone()))?;
        registry.register(Box::new(jitter_buffer_occupancy_packets.clone()))?;
        registry.register(Box::new(pacing_drift_seconds.clone()))?;

        Ok(Self {
            registry,
            control_sent_total,
            control_received_total,
            calls_placed_total,
            calls_established_total,
            calls_failed_total,
            calls_terminated_total,
            packets_sent_total,
            packets_received_total,
            bytes_sent_total,
            bytes_received_total,
            malformed_datagrams_total,
            sender_reports_sent_total,
            jitter_buffer_dropped_total,
            jitter_buffer_occupancy_packets,
            pacing_drift_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics` on `bind`.
    pub fn spawn_metrics_server(&self, bind: SocketAddr) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { Ok::<_, hyper::Error>(scrape(req, &registry)) }
                    }))
                }
            });

            Server::bind(&bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))
        })
    }
}

fn scrape(req: Request<Body>, registry: &Registry) -> Response<Body> {
    // ---
    if (req.method(), req.uri().path()) != (&Method::GET, "/metrics") {
        return with_status(Response::new(Body::from("not found")), StatusCode::NOT_FOUND);
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        return with_status(
            Response::new(Body::from(format!("encode error: {e}"))),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }

    let mut resp = Response::new(Body::from(buffer));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    resp
}

fn with_status(mut resp: Response<Body>, status: StatusCode) -> Response<Body> {
    *resp.status_mut() = status;
    resp
}
