use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Sample, SampleStore, StoreError};

#[derive(Default)]
struct Inner {
    series: BTreeMap<String, BTreeMap<DateTime<Utc>, Sample>>,
    failing_series: HashSet<String>,
    unavailable: bool,
    write_calls: u64,
}

/// In-process store with switchable failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation touching `series_id` fail until cleared.
    pub fn fail_series(&self, series_id: &str, failing: bool) {
        let mut inner = self.lock();
        if failing {
            inner.failing_series.insert(series_id.to_string());
        } else {
            inner.failing_series.remove(series_id);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of successful insert calls, single or batch.
    pub fn write_calls(&self) -> u64 {
        self.lock().write_calls
    }

    /// All samples of a series in timestamp order.
    pub fn samples(&self, series_id: &str) -> Vec<Sample> {
        self.lock()
            .series
            .get(series_id)
            .map(|points| points.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn check(&self, series_id: &str) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        if self.failing_series.contains(series_id) {
            return Err(StoreError::Unavailable(format!(
                "writes for `{series_id}` are failing"
            )));
        }
        Ok(())
    }

    fn check_vacant(&self, sample: &Sample) -> Result<(), StoreError> {
        let taken = self
            .series
            .get(&sample.series_id)
            .is_some_and(|points| points.contains_key(&sample.timestamp));
        if taken {
            return Err(StoreError::Duplicate {
                series_id: sample.series_id.clone(),
                timestamp: sample.timestamp,
            });
        }
        Ok(())
    }

    fn put(&mut self, sample: Sample) {
        self.series
            .entry(sample.series_id.clone())
            .or_default()
            .insert(sample.timestamp, sample);
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn find_latest(&self, series_id: &str) -> Result<Option<Sample>, StoreError> {
        let inner = self.lock();
        inner.check(series_id)?;
        Ok(inner
            .series
            .get(series_id)
            .and_then(|points| points.values().next_back().cloned()))
    }

    async fn find_one(
        &self,
        series_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError> {
        let inner = self.lock();
        inner.check(series_id)?;
        Ok(inner
            .series
            .get(series_id)
            .and_then(|points| points.get(&timestamp).cloned()))
    }

    async fn insert_many(&self, samples: &[Sample]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut batch = HashSet::new();
        for sample in samples {
            inner.check(&sample.series_id)?;
            inner.check_vacant(sample)?;
            if !batch.insert((sample.series_id.as_str(), sample.timestamp)) {
                return Err(StoreError::Duplicate {
                    series_id: sample.series_id.clone(),
                    timestamp: sample.timestamp,
                });
            }
        }
        for sample in samples {
            inner.put(sample.clone());
        }
        inner.write_calls += 1;
        Ok(samples.len() as u64)
    }

    async fn insert_one(&self, sample: &Sample) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check(&sample.series_id)?;
        inner.check_vacant(sample)?;
        inner.put(sample.clone());
        inner.write_calls += 1;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.lock().unavailable {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(())
    }
}
