//! Persistence for usage samples.
//!
//! The pipeline only talks to [`SampleStore`]; [`SqliteStore`] backs the
//! daemon and [`MemoryStore`] backs tests.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{init_sqlite, SqliteStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One persisted point of a series. Timestamps are always UTC boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub series_id: String,
    pub value: f64,
    pub added: f64,
    pub deleted: f64,
    pub updated: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored timestamp {0}ms is out of range")]
    Timestamp(i64),
    #[error("sample for `{series_id}` at {timestamp} already exists")]
    Duplicate {
        series_id: String,
        timestamp: DateTime<Utc>,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Most recent sample of the series by timestamp.
    async fn find_latest(&self, series_id: &str) -> Result<Option<Sample>, StoreError>;

    async fn find_one(
        &self,
        series_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError>;

    /// Inserts every sample or none of them.
    async fn insert_many(&self, samples: &[Sample]) -> Result<u64, StoreError>;

    async fn insert_one(&self, sample: &Sample) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
