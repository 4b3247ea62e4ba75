use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Backfilling,
    Live,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStatus {
    pub last_value: f64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub series: BTreeMap<String, SeriesStatus>,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Shared view of the pipeline. The pipeline writes, everyone else reads.
#[derive(Clone, Default)]
pub struct StatusHandle {
    state: Arc<RwLock<StatusSnapshot>>,
    stop: Arc<AtomicBool>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, phase: Phase) {
        if let Ok(mut guard) = self.state.write() {
            guard.phase = phase;
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.read().map(|g| g.phase).unwrap_or(Phase::Stopped)
    }

    pub fn record_success(&self, series: &str, value: f64, at: Option<DateTime<Utc>>) {
        if let Ok(mut guard) = self.state.write() {
            guard.series.insert(
                series.to_string(),
                SeriesStatus {
                    last_value: value,
                    last_timestamp: at,
                    consecutive_failures: 0,
                },
            );
        }
    }

    /// Bumps the failure count and leaves the last good value alone.
    pub fn record_failure(&self, series: &str, fallback_value: f64) {
        if let Ok(mut guard) = self.state.write() {
            guard
                .series
                .entry(series.to_string())
                .or_insert(SeriesStatus {
                    last_value: fallback_value,
                    last_timestamp: None,
                    consecutive_failures: 0,
                })
                .consecutive_failures += 1;
        }
    }

    pub fn complete_cycle(&self, at: DateTime<Utc>) {
        if let Ok(mut guard) = self.state.write() {
            guard.cycles_completed += 1;
            guard.last_cycle_at = Some(at);
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.read().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}
