use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use clock::{cadence, Clock, ManualClock};
use generator::{ProfileTable, SeriesProfile};
use metrics::MetricsHandle;
use pipeline::{PipelineContext, PipelineHandle, PipelineSettings, Scheduler, SchedulerError};
use state::{Phase, StatusHandle};
use storage::MemoryStore;

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 10, 0, 0, 0)
        .single()
        .expect("valid time")
}

/// Returns the queued instants in order, then repeats the last one.
struct SteppingClock {
    reads: Mutex<VecDeque<DateTime<Utc>>>,
    last: Mutex<DateTime<Utc>>,
}

impl SteppingClock {
    fn new(reads: &[DateTime<Utc>]) -> Self {
        Self {
            reads: Mutex::new(reads.iter().copied().collect()),
            last: Mutex::new(reads[0]),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().expect("clock lock");
        if let Some(next) = self.reads.lock().expect("clock lock").pop_front() {
            *last = next;
        }
        *last
    }
}

fn context(store: &MemoryStore, clock: &ManualClock) -> PipelineContext {
    context_with(store, Arc::new(clock.clone()))
}

fn context_with(store: &MemoryStore, clock: Arc<dyn Clock>) -> PipelineContext {
    let table: BTreeMap<String, SeriesProfile> = [
        ("/a", SeriesProfile::new(100.0, 2.0, 0.01, 0.01, 0.01)),
        ("/b", SeriesProfile::new(200.0, 0.0, 0.0, 0.0, 0.0)),
    ]
    .into_iter()
    .map(|(name, profile)| (name.to_string(), profile))
    .collect();
    PipelineContext {
        store: Arc::new(store.clone()),
        clock,
        profiles: Arc::new(ProfileTable::new(table).expect("valid profiles")),
        metrics: MetricsHandle::new().expect("metrics registry"),
        status: StatusHandle::new(),
        settings: PipelineSettings {
            origin: origin(),
            poll_interval: StdDuration::from_millis(2),
            fault_backoff: StdDuration::from_secs(60),
            seed: Some(7),
        },
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn consecutive_cycles_write_one_sample_per_series_each() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(origin() + Duration::minutes(20));
    let mut scheduler = Scheduler::new(context(&store, &clock));
    scheduler.backfill().await;
    assert_eq!(scheduler.last_slot(), Some(origin() + Duration::minutes(15)));

    let before = store.samples("/a").len();
    for i in 1..=4 {
        let slot = origin() + Duration::minutes(15) + cadence() * i;
        clock.set(slot);
        let report = scheduler.run_cycle(slot).await.expect("cycle succeeds");
        assert_eq!(report.written, 2);
        assert!(report.failed.is_empty());
    }

    for series in ["/a", "/b"] {
        let samples = store.samples(series);
        assert_eq!(samples.len(), before + 4);
        for pair in samples.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, cadence());
        }
    }
    assert_eq!(
        scheduler.series_state("/b").map(|s| s.last_value),
        Some(200.0)
    );
}

#[tokio::test]
async fn series_failure_is_isolated_within_a_cycle() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(origin());
    let ctx = context(&store, &clock);
    let status = ctx.status.clone();
    let mut scheduler = Scheduler::new(ctx);
    scheduler.backfill().await;
    let b_before = scheduler.series_state("/b").cloned().expect("state for /b");

    store.fail_series("/b", true);
    let slot = origin() + cadence();
    clock.set(slot);
    let report = scheduler.run_cycle(slot).await.expect("partial cycle is ok");

    assert_eq!(report.written, 1);
    assert_eq!(report.failed, vec!["/b".to_string()]);
    assert_eq!(scheduler.series_state("/b"), Some(&b_before));
    assert_eq!(
        scheduler.series_state("/a").and_then(|s| s.last_timestamp),
        Some(slot)
    );
    assert_eq!(status.snapshot().series["/b"].consecutive_failures, 1);

    store.fail_series("/b", false);
    let next = slot + cadence();
    clock.set(next);
    scheduler.run_cycle(next).await.expect("recovered cycle");
    assert_eq!(
        store.samples("/b").last().map(|s| s.timestamp),
        Some(next)
    );
}

#[tokio::test]
async fn total_outage_is_a_cycle_fault_and_keeps_the_slot() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(origin());
    let mut scheduler = Scheduler::new(context(&store, &clock));
    scheduler.backfill().await;

    store.set_unavailable(true);
    let slot = origin() + cadence();
    clock.set(slot);
    let err = scheduler
        .run_cycle(slot)
        .await
        .expect_err("every series failing is a cycle fault");
    assert!(matches!(err, SchedulerError::AllSeriesFailed { failed: 2, .. }));
    assert_eq!(scheduler.last_slot(), Some(origin()));

    store.set_unavailable(false);
    scheduler.run_cycle(slot).await.expect("retry of the same slot");
    assert_eq!(store.samples("/a").len(), 2);
}

#[tokio::test]
async fn failed_backfill_is_retried_by_the_next_live_cycle() {
    let store = MemoryStore::new();
    store.fail_series("/b", true);
    let clock = ManualClock::new(origin() + Duration::minutes(30));
    let mut scheduler = Scheduler::new(context(&store, &clock));
    scheduler.backfill().await;
    assert!(store.samples("/b").is_empty());
    assert!(scheduler
        .series_state("/b")
        .is_some_and(|s| s.pending_backfill));

    store.fail_series("/b", false);
    let slot = origin() + Duration::minutes(45);
    clock.set(slot);
    scheduler.run_cycle(slot).await.expect("cycle succeeds");

    let samples = store.samples("/b");
    assert_eq!(samples.len(), 4);
    assert_eq!(samples[0].timestamp, origin());
    assert_eq!(samples[3].timestamp, slot);
    assert!(!scheduler
        .series_state("/b")
        .is_some_and(|s| s.pending_backfill));
}

#[tokio::test]
async fn pipeline_backfills_goes_live_and_stops_on_request() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(origin() + Duration::minutes(5));
    let handle = PipelineHandle::spawn(context(&store, &clock));

    eventually("live phase", || handle.snapshot().phase == Phase::Live).await;
    assert_eq!(store.samples("/a").len(), 1);

    clock.set(origin() + Duration::minutes(15));
    eventually("first cycle", || handle.snapshot().cycles_completed == 1).await;

    // Still inside the same slot: no extra writes.
    clock.set(origin() + Duration::minutes(20));
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    assert_eq!(handle.snapshot().cycles_completed, 1);

    clock.set(origin() + Duration::minutes(30));
    eventually("second cycle", || handle.snapshot().cycles_completed == 2).await;

    let stamps: Vec<_> = store.samples("/b").iter().map(|s| s.timestamp).collect();
    assert_eq!(
        stamps,
        vec![
            origin(),
            origin() + Duration::minutes(15),
            origin() + Duration::minutes(30)
        ]
    );

    handle.stop();
    eventually("pipeline exit", || handle.is_finished()).await;
    assert_eq!(handle.snapshot().phase, Phase::Stopped);
    handle.join().await.expect("pipeline task joins cleanly");
}

fn stamps(store: &MemoryStore, series: &str) -> Vec<DateTime<Utc>> {
    store.samples(series).iter().map(|s| s.timestamp).collect()
}

fn assert_gap_free(store: &MemoryStore, series: &str, through: DateTime<Utc>) {
    let stamps = stamps(store, series);
    assert_eq!(stamps.first(), Some(&origin()), "{series} starts at origin");
    assert_eq!(stamps.last(), Some(&through), "{series} reaches {through}");
    for pair in stamps.windows(2) {
        assert_eq!(pair[1] - pair[0], cadence(), "{series} has a gap after {}", pair[0]);
    }
}

#[tokio::test]
async fn boundary_passing_during_backfill_leaves_no_gap() {
    let store = MemoryStore::new();
    let ten = origin() + Duration::hours(10);
    let clock = SteppingClock::new(&[
        ten + Duration::minutes(14) + Duration::seconds(59),
        ten + Duration::minutes(15) + Duration::seconds(1),
    ]);
    let mut scheduler = Scheduler::new(context_with(&store, Arc::new(clock)));

    scheduler.backfill().await;
    assert_eq!(scheduler.last_slot(), Some(ten));
    for series in ["/a", "/b"] {
        assert_eq!(stamps(&store, series).last(), Some(&ten));
    }

    let slot = ten + Duration::minutes(30);
    let report = scheduler.run_cycle(slot).await.expect("cycle succeeds");
    assert_eq!(report.written, 2);
    for series in ["/a", "/b"] {
        assert_gap_free(&store, series, slot);
        assert_eq!(
            scheduler.series_state(series).and_then(|s| s.last_timestamp),
            Some(slot)
        );
    }
}

#[tokio::test]
async fn skipped_live_slot_is_filled_by_the_next_cycle() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(origin() + Duration::minutes(20));
    let mut scheduler = Scheduler::new(context(&store, &clock));
    scheduler.backfill().await;

    // 00:30 never ran; the scheduler woke a full cadence late.
    let slot = origin() + Duration::minutes(45);
    clock.set(slot + Duration::minutes(2));
    scheduler.run_cycle(slot).await.expect("cycle succeeds");

    for series in ["/a", "/b"] {
        assert_gap_free(&store, series, slot);
        assert_eq!(store.samples(series).len(), 4);
    }
    assert_eq!(scheduler.last_slot(), Some(slot));
}

#[tokio::test]
async fn pipeline_backs_off_after_outage_and_resumes() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(origin() + Duration::minutes(5));
    let handle = PipelineHandle::spawn(context(&store, &clock));
    eventually("live phase", || handle.snapshot().phase == Phase::Live).await;

    store.set_unavailable(true);
    clock.set(origin() + Duration::minutes(15));
    eventually("failed cycle", || {
        handle
            .snapshot()
            .series
            .get("/b")
            .is_some_and(|s| s.consecutive_failures == 1)
    })
    .await;
    assert_eq!(handle.snapshot().cycles_completed, 0);

    // The store is back but the 60 s backoff has not elapsed yet.
    store.set_unavailable(false);
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    assert_eq!(handle.snapshot().cycles_completed, 0);
    assert_eq!(store.samples("/b").len(), 1);

    clock.set(origin() + Duration::minutes(16) + Duration::seconds(1));
    eventually("recovered cycle", || handle.snapshot().cycles_completed == 1).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.phase, Phase::Live);
    assert_eq!(snapshot.series["/b"].consecutive_failures, 0);
    assert_eq!(
        stamps(&store, "/b"),
        vec![origin(), origin() + Duration::minutes(15)]
    );

    handle.stop();
    eventually("pipeline exit", || handle.is_finished()).await;
    handle.join().await.expect("pipeline task joins cleanly");
}
