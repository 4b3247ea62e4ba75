//! Backfill then live sampling of every configured series.

pub mod backfill;
pub mod scheduler;

pub use backfill::{backfill, backfill_all, backfill_through};
pub use scheduler::{CycleReport, Scheduler};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use clock::Clock;
use generator::{ProfileTable, Reading, SeriesProfile};
use metrics::MetricsHandle;
use state::{StatusHandle, StatusSnapshot};
use storage::{Sample, SampleStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FAULT_BACKOFF: Duration = Duration::from_secs(60);

/// Where an empty series starts.
pub fn default_origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 10, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub origin: DateTime<Utc>,
    pub poll_interval: Duration,
    pub fault_backoff: Duration,
    /// Fixed RNG seed; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            fault_backoff: DEFAULT_FAULT_BACKOFF,
            seed: None,
        }
    }
}

/// Everything the pipeline depends on, built once at startup.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn SampleStore>,
    pub clock: Arc<dyn Clock>,
    pub profiles: Arc<ProfileTable>,
    pub metrics: MetricsHandle,
    pub status: StatusHandle,
    pub settings: PipelineSettings,
}

/// In-memory generator state for one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesState {
    pub last_value: f64,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Set when backfill failed; the next live cycle retries it.
    pub pending_backfill: bool,
}

impl SeriesState {
    pub fn seed(profile: &SeriesProfile) -> Self {
        Self {
            last_value: profile.base,
            last_timestamp: None,
            pending_backfill: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no boundary representable after {0}")]
    Overflow(DateTime<Utc>),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("all {failed} series failed to persist for slot {slot}")]
    AllSeriesFailed { slot: DateTime<Utc>, failed: usize },
    #[error("no boundary representable after {0}")]
    ClockOverflow(DateTime<Utc>),
}

pub(crate) fn to_sample(series: &str, timestamp: DateTime<Utc>, reading: Reading) -> Sample {
    Sample {
        timestamp,
        series_id: series.to_string(),
        value: reading.value,
        added: reading.added,
        deleted: reading.deleted,
        updated: reading.updated,
    }
}

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    status: StatusHandle,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn spawn(ctx: PipelineContext) -> Self {
        let status = ctx.status.clone();
        let task = tokio::spawn(async move {
            Scheduler::new(ctx).run().await;
        });
        Self { status, task }
    }

    /// Asks the pipeline to halt at its next poll tick.
    pub fn stop(&self) {
        self.status.request_stop();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.task.await
    }
}
