use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::{Sample, SampleStore, StoreError};

const INIT_SQL: &str = include_str!("../../../scripts/init_db.sql");

const MEMORY_PREFIX: &str = "sqlite::memory:";

type SampleRow = (String, i64, f64, f64, f64, f64);

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if path.starts_with(MEMORY_PREFIX) {
            // Each in-memory connection is its own database; keep exactly one alive.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        run_init_sql(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert_run(&self, run_id: &str, git_sha: Option<&str>) -> Result<()> {
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT OR REPLACE INTO runs (run_id, started_at_ms, git_sha, host) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(git_sha)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_incident(
        &self,
        run_id: &str,
        severity: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO incidents (run_id, ts_ms, severity, kind, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(severity)
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SampleStore for SqliteStore {
    async fn find_latest(&self, series_id: &str) -> Result<Option<Sample>, StoreError> {
        let row: Option<SampleRow> = sqlx::query_as(
            "SELECT series_id, ts_ms, value, added, deleted, updated FROM samples \
             WHERE series_id = ?1 ORDER BY ts_ms DESC LIMIT 1",
        )
        .bind(series_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(sample_from_row).transpose()
    }

    async fn find_one(
        &self,
        series_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError> {
        let row: Option<SampleRow> = sqlx::query_as(
            "SELECT series_id, ts_ms, value, added, deleted, updated FROM samples \
             WHERE series_id = ?1 AND ts_ms = ?2",
        )
        .bind(series_id)
        .bind(timestamp.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        row.map(sample_from_row).transpose()
    }

    async fn insert_many(&self, samples: &[Sample]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            insert_sample(sample).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(samples.len() as u64)
    }

    async fn insert_one(&self, sample: &Sample) -> Result<(), StoreError> {
        insert_sample(sample).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn insert_sample(
    sample: &Sample,
) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO samples (series_id, ts_ms, value, added, deleted, updated) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(sample.series_id.as_str())
    .bind(sample.timestamp.timestamp_millis())
    .bind(sample.value)
    .bind(sample.added)
    .bind(sample.deleted)
    .bind(sample.updated)
}

fn sample_from_row(row: SampleRow) -> Result<Sample, StoreError> {
    let (series_id, ts_ms, value, added, deleted, updated) = row;
    let timestamp =
        DateTime::<Utc>::from_timestamp_millis(ts_ms).ok_or(StoreError::Timestamp(ts_ms))?;
    Ok(Sample {
        timestamp,
        series_id,
        value,
        added,
        deleted,
        updated,
    })
}

pub async fn init_sqlite(path: &str) -> Result<SqliteStore> {
    let store = SqliteStore::connect(path).await?;
    info!(path = path, "sqlite initialized");
    Ok(store)
}

async fn run_init_sql(pool: &SqlitePool) -> Result<()> {
    for statement in INIT_SQL.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}
