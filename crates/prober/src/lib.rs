//! Periodic self probe that keeps idle-reaping hosts from suspending the
//! process. Every outcome is informational; nothing here can fail the caller.

use std::time::Duration;

use anyhow::Result;
use metrics::MetricsHandle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on a whole probe, including connection setup.
pub const PROBE_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Skipped,
    Healthy(u16),
    Unhealthy(u16),
    Failed(String),
}

impl ProbeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Skipped => "skipped",
            ProbeOutcome::Healthy(_) => "ok",
            ProbeOutcome::Unhealthy(_) => "bad_status",
            ProbeOutcome::Failed(_) => "error",
        }
    }
}

#[derive(Clone)]
pub struct LivenessProber {
    client: reqwest::Client,
    config: ProbeConfig,
    metrics: MetricsHandle,
}

impl LivenessProber {
    pub fn new(config: ProbeConfig, metrics: MetricsHandle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        if config.url.is_none() {
            warn!("self ping url not set; liveness probes disabled");
        }
        Ok(Self {
            client,
            config,
            metrics,
        })
    }

    /// Runs one probe to completion. Never returns an error.
    pub async fn probe_once(&self) -> ProbeOutcome {
        let outcome = match &self.config.url {
            None => ProbeOutcome::Skipped,
            Some(url) => {
                let budget = PROBE_BUDGET.max(self.config.timeout);
                match time::timeout(budget, self.client.get(url).send()).await {
                    Ok(Ok(resp)) if resp.status().is_success() => {
                        ProbeOutcome::Healthy(resp.status().as_u16())
                    }
                    Ok(Ok(resp)) => ProbeOutcome::Unhealthy(resp.status().as_u16()),
                    Ok(Err(err)) => ProbeOutcome::Failed(err.to_string()),
                    Err(_) => ProbeOutcome::Failed(format!("no response within {budget:?}")),
                }
            }
        };

        match &outcome {
            ProbeOutcome::Skipped => debug!("probe skipped: url not configured"),
            ProbeOutcome::Healthy(code) => info!(code, "self probe ok"),
            ProbeOutcome::Unhealthy(code) => warn!(code, "self probe returned non-success"),
            ProbeOutcome::Failed(reason) => warn!(%reason, "self probe failed"),
        }
        self.metrics.record_probe(outcome.label());
        outcome
    }

    /// Starts one probe in the background and returns immediately.
    pub fn fire(&self) -> JoinHandle<ProbeOutcome> {
        let prober = self.clone();
        tokio::spawn(async move { prober.probe_once().await })
    }

    /// Fires a probe now and then once per interval, forever.
    pub async fn run(self) {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            drop(self.fire());
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
