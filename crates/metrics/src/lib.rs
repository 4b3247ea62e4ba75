use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use state::StatusHandle;
use storage::SampleStore;
use tracing::{info, warn};

pub const ROOT_BODY: &str = "Storage simulation service is running.";

/// Prometheus registry plus the counters the pipeline and prober update.
#[derive(Clone)]
pub struct MetricsHandle {
    registry: Registry,
    samples_written: IntCounterVec,
    write_failures: IntCounterVec,
    probes: IntCounterVec,
    live_cycles: IntCounter,
}

impl MetricsHandle {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let samples_written = IntCounterVec::new(
            Opts::new("samples_written_total", "Samples persisted, by mode."),
            &["mode"],
        )?;
        let write_failures = IntCounterVec::new(
            Opts::new(
                "sample_write_failures_total",
                "Failed sample writes, by series.",
            ),
            &["series"],
        )?;
        let probes = IntCounterVec::new(
            Opts::new("liveness_probes_total", "Self probes, by outcome."),
            &["outcome"],
        )?;
        let live_cycles = IntCounter::new("live_cycles_total", "Completed live cycles.")?;

        registry.register(Box::new(samples_written.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;
        registry.register(Box::new(probes.clone()))?;
        registry.register(Box::new(live_cycles.clone()))?;

        Ok(Self {
            registry,
            samples_written,
            write_failures,
            probes,
            live_cycles,
        })
    }

    pub fn record_written(&self, mode: &str, count: u64) {
        self.samples_written.with_label_values(&[mode]).inc_by(count);
    }

    pub fn record_write_failure(&self, series: &str) {
        self.write_failures.with_label_values(&[series]).inc();
    }

    pub fn record_probe(&self, outcome: &str) {
        self.probes.with_label_values(&[outcome]).inc();
    }

    pub fn record_cycle(&self) {
        self.live_cycles.inc();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Serves the health routes and `/metrics` until the server fails.
    pub async fn serve(
        self,
        addr: SocketAddr,
        store: Arc<dyn SampleStore>,
        status: StatusHandle,
    ) -> Result<()> {
        let make_svc = make_service_fn(move |_| {
            let metrics = self.clone();
            let store = store.clone();
            let status = status.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let metrics = metrics.clone();
                    let store = store.clone();
                    let status = status.clone();
                    async move { Ok::<_, Infallible>(route(req, &metrics, store.as_ref(), &status).await) }
                }))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);
        info!(%addr, "health server listening");
        server.await?;
        Ok(())
    }
}

pub async fn route(
    req: Request<Body>,
    metrics: &MetricsHandle,
    store: &dyn SampleStore,
    status: &StatusHandle,
) -> Response<Body> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed".into());
    }
    match req.uri().path() {
        "/" => text(StatusCode::OK, ROOT_BODY.into()),
        "/helpline" => text(StatusCode::OK, "OK".into()),
        "/status" => {
            let snapshot = status.snapshot();
            match store.health_check().await {
                Ok(()) => text(
                    StatusCode::OK,
                    format!(
                        "Service is healthy. Store connection is working. phase={:?} cycles={}",
                        snapshot.phase, snapshot.cycles_completed
                    ),
                ),
                Err(err) => {
                    warn!(error = %err, "status check found store unhealthy");
                    text(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Service is running but store connection is failing: {err}"),
                    )
                }
            }
        }
        "/metrics" => match metrics.encode() {
            Ok(buffer) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", TextEncoder::new().format_type())
                .body(Body::from(buffer))
                .unwrap_or_else(|_| Response::new(Body::empty())),
            Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        },
        _ => text(StatusCode::NOT_FOUND, "not found".into()),
    }
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
