use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clock::{align_down, boundaries, cadence, is_due};
use generator::{next_value, SeriesProfile};
use rand::Rng;
use tracing::{error, info};

use crate::{to_sample, BackfillError, PipelineContext, SeriesState};

/// Generates and persists every missing boundary of `series` up to now.
pub async fn backfill<R: Rng + ?Sized>(
    ctx: &PipelineContext,
    rng: &mut R,
    series: &str,
    profile: &SeriesProfile,
) -> Result<SeriesState, BackfillError> {
    let through = align_down(ctx.clock.now());
    backfill_through(ctx, rng, series, profile, through).await
}

/// Generates and persists every missing boundary of `series` up to and
/// including `through`.
///
/// The batch is written with a single `insert_many`; on error nothing is
/// assumed persisted and the caller keeps its previous state.
pub async fn backfill_through<R: Rng + ?Sized>(
    ctx: &PipelineContext,
    rng: &mut R,
    series: &str,
    profile: &SeriesProfile,
    through: DateTime<Utc>,
) -> Result<SeriesState, BackfillError> {
    let (resume, first_missing) = match ctx.store.find_latest(series).await? {
        Some(latest) => {
            let last_value = ctx
                .store
                .find_one(series, latest.timestamp)
                .await?
                .map(|sample| sample.value)
                .unwrap_or(profile.base);
            let next = latest
                .timestamp
                .checked_add_signed(cadence())
                .ok_or(BackfillError::Overflow(latest.timestamp))?;
            let resume = SeriesState {
                last_value,
                last_timestamp: Some(latest.timestamp),
                pending_backfill: false,
            };
            (resume, next)
        }
        None => (SeriesState::seed(profile), align_down(ctx.settings.origin)),
    };

    if !is_due(first_missing, through) {
        info!(series, value = resume.last_value, "series already up to date");
        return Ok(resume);
    }

    let mut value = resume.last_value;
    let samples: Vec<_> = boundaries(first_missing, through)
        .map(|ts| {
            let reading = next_value(rng, value, profile);
            value = reading.value;
            to_sample(series, ts, reading)
        })
        .collect();
    let Some(last) = samples.last().map(|sample| sample.timestamp) else {
        return Ok(resume);
    };

    info!(
        series,
        from = %first_missing,
        through = %through,
        count = samples.len(),
        "backfilling series"
    );
    let written = ctx.store.insert_many(&samples).await?;
    ctx.metrics.record_written("backfill", written);
    info!(series, value, last = %last, "backfill complete");

    Ok(SeriesState {
        last_value: value,
        last_timestamp: Some(last),
        pending_backfill: false,
    })
}

/// Backfills every series independently up to the same `through` boundary.
/// A failing series is seeded from its profile base and flagged for retry.
pub async fn backfill_all<R: Rng + ?Sized>(
    ctx: &PipelineContext,
    rng: &mut R,
    through: DateTime<Utc>,
) -> BTreeMap<String, SeriesState> {
    let mut states = BTreeMap::new();
    for (series, profile) in ctx.profiles.iter() {
        let state = match backfill_through(ctx, rng, series, profile, through).await {
            Ok(state) => {
                ctx.status
                    .record_success(series, state.last_value, state.last_timestamp);
                state
            }
            Err(err) => {
                error!(series, error = %err, "backfill failed; falling back to profile base");
                ctx.metrics.record_write_failure(series);
                ctx.status.record_failure(series, profile.base);
                SeriesState {
                    pending_backfill: true,
                    ..SeriesState::seed(profile)
                }
            }
        };
        states.insert(series.to_string(), state);
    }
    states
}
