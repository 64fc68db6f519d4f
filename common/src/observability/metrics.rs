//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Hot-path
//! instrumentation is just counter increments / histogram observations;
//! the scrape endpoint is opt-in and runs on its own port.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Covers the three pipeline stages: URTP ingest, gap repair /
/// encoding, and segment publication.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Ingest counters
    pub frames_received_total: IntCounter,
    pub frames_rejected_total: IntCounter,
    pub bytes_received_total: IntCounter,

    // Gap repair
    pub gap_samples_filled_total: IntCounter,
    pub silly_gaps_total: IntCounter,

    // Segment lifecycle
    pub segments_published_total: IntCounter,
    pub segments_retired_total: IntCounter,
    pub segments_removed_total: IntCounter,
    pub playlist_rebuilds_total: IntCounter,

    // Buffer gauge
    pub pcm_buffer_bytes: IntGauge,

    // Latency histogram (seconds)
    pub encode_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("chuff".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let frames_received_total = IntCounter::with_opts(Opts::new(
            "urtp_frames_received_total",
            "Total URTP frames accepted from the transport",
        ))?;
        let frames_rejected_total = IntCounter::with_opts(Opts::new(
            "urtp_frames_rejected_total",
            "Total datagrams discarded for a bad header",
        ))?;
        let bytes_received_total = IntCounter::with_opts(Opts::new(
            "urtp_bytes_received_total",
            "Total bytes read from the audio transport",
        ))?;

        let gap_samples_filled_total = IntCounter::with_opts(Opts::new(
            "gap_samples_filled_total",
            "Total PCM samples synthesized to repair sequence gaps",
        ))?;
        let silly_gaps_total = IntCounter::with_opts(Opts::new(
            "silly_gaps_total",
            "Total sequence gaps too large to repair",
        ))?;

        let segments_published_total = IntCounter::with_opts(Opts::new(
            "segments_published_total",
            "Total MP3 segments handed to the playlist",
        ))?;
        let segments_retired_total = IntCounter::with_opts(Opts::new(
            "segments_retired_total",
            "Total MP3 segments aged out of the playlist",
        ))?;
        let segments_removed_total = IntCounter::with_opts(Opts::new(
            "segments_removed_total",
            "Total MP3 segment files deleted from disk",
        ))?;
        let playlist_rebuilds_total = IntCounter::with_opts(Opts::new(
            "playlist_rebuilds_total",
            "Total playlist file rewrites",
        ))?;

        let pcm_buffer_bytes = IntGauge::with_opts(Opts::new(
            "pcm_buffer_bytes",
            "Bytes waiting in the PCM buffer at the last tick",
        ))?;

        let encode_seconds = Histogram::with_opts(HistogramOpts::new(
            "mp3_encode_seconds",
            "MP3 encode duration per tick in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(frames_received_total.clone()))?;
        registry.register(Box::new(frames_rejected_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(gap_samples_filled_total.clone()))?;
        registry.register(Box::new(silly_gaps_total.clone()))?;
        registry.register(Box::new(segments_published_total.clone()))?;
        registry.register(Box::new(segments_retired_total.clone()))?;
        registry.register(Box::new(segments_removed_total.clone()))?;
        registry.register(Box::new(playlist_rebuilds_total.clone()))?;
        registry.register(Box::new(pcm_buffer_bytes.clone()))?;
        registry.register(Box::new(encode_seconds.clone()))?;

        Ok(Self {
            registry,
            frames_received_total,
            frames_rejected_total,
            bytes_received_total,
            gap_samples_filled_total,
            silly_gaps_total,
            segments_published_total,
            segments_retired_total,
            segments_removed_total,
            playlist_rebuilds_total,
            pcm_buffer_bytes,
            encode_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// This is intentionally explicit (callers decide whether to run it).
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let families = ctx.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn counters_start_at_zero() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        assert_eq!(ctx.frames_received_total.get(), 0);
        assert_eq!(ctx.segments_published_total.get(), 0);
    }
}
