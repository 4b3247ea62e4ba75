use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clock::{align_down, cadence, next_boundary};
use generator::{next_value, SeriesProfile};
use rand::rngs::StdRng;
use rand::SeedableRng;
use state::Phase;
use tracing::{debug, info, warn};

use crate::backfill::{backfill_all, backfill_through};
use crate::{to_sample, BackfillError, PipelineContext, SchedulerError, SeriesState};

const WAIT_LOG_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub slot: DateTime<Utc>,
    pub written: usize,
    pub failed: Vec<String>,
}

/// Drives the BACKFILLING → LIVE state machine.
pub struct Scheduler {
    ctx: PipelineContext,
    rng: StdRng,
    series: BTreeMap<String, SeriesState>,
    last_slot: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(ctx: PipelineContext) -> Self {
        let rng = match ctx.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            ctx,
            rng,
            series: BTreeMap::new(),
            last_slot: None,
        }
    }

    pub fn series_state(&self, series: &str) -> Option<&SeriesState> {
        self.series.get(series)
    }

    pub fn last_slot(&self) -> Option<DateTime<Utc>> {
        self.last_slot
    }

    /// Backfills every series through the current slot and marks it covered.
    pub async fn backfill(&mut self) {
        self.ctx.status.set_phase(Phase::Backfilling);
        let through = align_down(self.ctx.clock.now());
        info!(series = self.ctx.profiles.len(), %through, "backfilling missing data");
        self.series = backfill_all(&self.ctx, &mut self.rng, through).await;
        self.last_slot = Some(through);
    }

    /// Runs until a stop is requested. Cycle faults back off and resume.
    pub async fn run(mut self) {
        self.backfill().await;
        let entered = self.ctx.clock.now();
        self.ctx.status.set_phase(Phase::Live);

        match next_boundary(entered) {
            Some(first) => {
                info!(at = %first, "waiting for first live slot");
                if !self.wait_until(first).await {
                    return self.halt();
                }
            }
            None => warn!(%entered, "no boundary after entry time; sampling immediately"),
        }
        info!("entering live mode");

        loop {
            let slot = align_down(self.ctx.clock.now());
            if let Some(last) = self.last_slot.filter(|last| slot <= *last) {
                let resume = next_boundary(last).unwrap_or_else(|| self.ctx.clock.now() + cadence());
                if !self.wait_until(resume).await {
                    break;
                }
                continue;
            }

            let outcome = match self.run_cycle(slot).await {
                Ok(report) => self.wake_after(report.slot),
                Err(err) => Err(err),
            };
            let keep_going = match outcome {
                Ok(wake) => {
                    debug!(until = %wake, "sleeping until next slot");
                    self.wait_until(wake).await
                }
                Err(err) => {
                    warn!(error = %err, backoff = ?self.ctx.settings.fault_backoff, "live cycle failed");
                    self.pause(self.ctx.settings.fault_backoff).await
                }
            };
            if !keep_going {
                break;
            }
        }
        self.halt();
    }

    /// Samples every series once for `slot`. Per-series failures are
    /// reported, not returned; the cycle only fails when nothing persisted.
    pub async fn run_cycle(&mut self, slot: DateTime<Utc>) -> Result<CycleReport, SchedulerError> {
        info!(%slot, "generating live samples");
        let profiles = Arc::clone(&self.ctx.profiles);
        let mut report = CycleReport {
            slot,
            written: 0,
            failed: Vec::new(),
        };

        for (series, profile) in profiles.iter() {
            match self.sample_series(series, profile, slot).await {
                Ok(()) => report.written += 1,
                Err(err) => {
                    warn!(series, error = %err, "live sample failed; state unchanged");
                    self.ctx.metrics.record_write_failure(series);
                    let fallback = self
                        .series
                        .get(series)
                        .map(|state| state.last_value)
                        .unwrap_or(profile.base);
                    self.ctx.status.record_failure(series, fallback);
                    report.failed.push(series.to_string());
                }
            }
        }

        if report.written == 0 && !report.failed.is_empty() {
            return Err(SchedulerError::AllSeriesFailed {
                slot,
                failed: report.failed.len(),
            });
        }

        self.last_slot = Some(slot);
        self.ctx.status.complete_cycle(slot);
        self.ctx.metrics.record_cycle();
        info!(%slot, written = report.written, failed = report.failed.len(), "live cycle complete");
        Ok(report)
    }

    async fn sample_series(
        &mut self,
        series: &str,
        profile: &SeriesProfile,
        slot: DateTime<Utc>,
    ) -> Result<(), BackfillError> {
        let state = self
            .series
            .get(series)
            .cloned()
            .unwrap_or_else(|| SeriesState::seed(profile));

        let behind = state
            .last_timestamp
            .and_then(|last| last.checked_add_signed(cadence()))
            .is_some_and(|next| next < slot);
        if state.pending_backfill || behind {
            info!(
                series,
                pending = state.pending_backfill,
                last = ?state.last_timestamp,
                "catching up before live sampling"
            );
            let fresh = backfill_through(&self.ctx, &mut self.rng, series, profile, slot).await?;
            self.ctx
                .status
                .record_success(series, fresh.last_value, fresh.last_timestamp);
            self.series.insert(series.to_string(), fresh);
            return Ok(());
        }

        let reading = next_value(&mut self.rng, state.last_value, profile);
        self.ctx
            .store
            .insert_one(&to_sample(series, slot, reading))
            .await?;
        self.ctx.metrics.record_written("live", 1);
        debug!(series, value = reading.value, "live sample stored");

        self.ctx.status.record_success(series, reading.value, Some(slot));
        self.series.insert(
            series.to_string(),
            SeriesState {
                last_value: reading.value,
                last_timestamp: Some(slot),
                pending_backfill: false,
            },
        );
        Ok(())
    }

    /// Next wake time after `slot`, or a full cadence from now when that
    /// boundary has already passed.
    fn wake_after(&self, slot: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let now = self.ctx.clock.now();
        let next = next_boundary(slot).ok_or(SchedulerError::ClockOverflow(slot))?;
        if next > now {
            return Ok(next);
        }
        warn!(%slot, %now, "next slot already passed; sleeping a full cadence");
        now.checked_add_signed(cadence())
            .ok_or(SchedulerError::ClockOverflow(now))
    }

    async fn pause(&self, duration: Duration) -> bool {
        let now = self.ctx.clock.now();
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        self.wait_until(until).await
    }

    /// Polls the clock until `target`. Returns false if a stop was requested.
    async fn wait_until(&self, target: DateTime<Utc>) -> bool {
        let poll = self.ctx.settings.poll_interval.max(Duration::from_millis(1));
        let log_every = (WAIT_LOG_EVERY.as_millis() / poll.as_millis()).max(1);
        let mut ticks: u128 = 0;

        loop {
            if self.ctx.status.stop_requested() {
                return false;
            }
            let now = self.ctx.clock.now();
            if now >= target {
                return true;
            }
            if ticks % log_every == 0 {
                info!(
                    until = %target,
                    remaining_secs = (target - now).num_seconds(),
                    "waiting for next slot"
                );
            }
            tokio::time::sleep(poll).await;
            ticks += 1;
        }
    }

    fn halt(&self) {
        info!("pipeline stopped");
        self.ctx.status.set_phase(Phase::Stopped);
    }
}
