//! SQLite persistence and export sink
//!
//! Stores one row per profile: the dashboard columns used for filtering
//! plus the full profile as JSON. Memory samples that arrive after a
//! profile was written are appended to a side table rather than rewriting
//! the immutable profile.

use super::clock::current_millis;
use super::event::MemorySample;
use super::profile::{Profile, ProfileOutcome, ProfileSummary};
use super::sink::ProfileSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        correlation_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        view_name TEXT,
        status_code INTEGER,
        is_error INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        duration_us INTEGER NOT NULL,
        query_count INTEGER NOT NULL,
        query_time_us INTEGER NOT NULL,
        diagnostic_count INTEGER NOT NULL,
        peak_resident_bytes INTEGER,
        body TEXT NOT NULL,
        UNIQUE (correlation_id, started_at)
    )",
    "CREATE INDEX IF NOT EXISTS idx_profiles_started_at ON profiles (started_at)",
    "CREATE INDEX IF NOT EXISTS idx_profiles_view_name ON profiles (view_name)",
    "CREATE TABLE IF NOT EXISTS memory_samples_late (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        correlation_id TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_memory_samples_late_correlation ON memory_samples_late (correlation_id)",
];

const SUMMARY_COLUMNS: &str = "correlation_id, started_at, method, path, view_name, status_code, is_error, \
     outcome, duration_us, query_count, query_time_us, diagnostic_count, peak_resident_bytes";

/// Which requests the history view wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    /// HTTP status 400 and above
    Error,
    /// Slower than the filter's threshold
    Slow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileFilter {
    pub since: Option<DateTime<Utc>>,
    pub view_name: Option<String>,
    pub status: Option<StatusFilter>,
    pub slow_threshold_ms: u64,
    pub limit: usize,
}

impl Default for ProfileFilter {
    fn default() -> Self {
        Self {
            since: None,
            view_name: None,
            status: None,
            slow_threshold_ms: 500,
            limit: 50,
        }
    }
}

/// Aggregates shown on the dashboard header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_requests: u64,
    pub avg_duration_ms: f64,
    pub avg_queries: f64,
    pub total_query_time_ms: f64,
    pub error_count: u64,
}

pub struct SqliteProfileStore {
    pool: SqlitePool,
}

impl SqliteProfileStore {
    /// Open (and create if missing) the profile database
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {}", database_url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL");

        // Every connection to an in-memory database is a separate database.
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            ensure_parent_dir(database_url)?;
        }
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(30));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to profile database")?;

        Self::create_schema(&pool).await?;

        tracing::info!(database_url = %database_url, "Profile store opened");
        Ok(Self { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(pool)
                .await
                .context("Failed to create profile store schema")?;
        }
        Ok(())
    }

    pub async fn insert_batch(&self, profiles: &[Arc<Profile>]) -> Result<u64> {
        if profiles.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for profile in profiles {
            let summary = profile.to_summary();
            let body = serde_json::to_string(profile.as_ref())?;

            let result = sqlx::query(
                "INSERT OR IGNORE INTO profiles (correlation_id, started_at, method, path, view_name,
                    status_code, is_error, outcome, duration_us, query_count, query_time_us,
                    diagnostic_count, peak_resident_bytes, body)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&summary.correlation_id)
            .bind(summary.started_at.timestamp_millis())
            .bind(&summary.method)
            .bind(&summary.path)
            .bind(&summary.view_name)
            .bind(summary.status_code.map(i64::from))
            .bind(summary.is_error)
            .bind(outcome_str(summary.outcome))
            .bind(to_i64(summary.duration_us))
            .bind(summary.query_count as i64)
            .bind(to_i64(summary.query_time_us))
            .bind(summary.diagnostic_count as i64)
            .bind(summary.peak_resident_bytes.map(to_i64))
            .bind(body)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Most recent summaries, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<ProfileSummary>> {
        self.query(&ProfileFilter {
            limit,
            ..ProfileFilter::default()
        })
        .await
    }

    /// Filtered history, newest first
    pub async fn query(&self, filter: &ProfileFilter) -> Result<Vec<ProfileSummary>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM profiles WHERE 1 = 1", SUMMARY_COLUMNS));

        if let Some(since) = filter.since {
            builder.push(" AND started_at >= ").push_bind(since.timestamp_millis());
        }
        if let Some(view_name) = &filter.view_name {
            builder.push(" AND view_name = ").push_bind(view_name.clone());
        }
        match filter.status {
            Some(StatusFilter::Error) => {
                builder.push(" AND is_error = 1");
            }
            Some(StatusFilter::Slow) => {
                builder
                    .push(" AND duration_us > ")
                    .push_bind(to_i64(filter.slow_threshold_ms.saturating_mul(1_000)));
            }
            None => {}
        }
        builder
            .push(" ORDER BY started_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_summary).collect()
    }

    /// Latest stored profile for a correlation id
    pub async fn get(&self, correlation_id: &str) -> Result<Option<Profile>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM profiles WHERE correlation_id = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        body.map(|b| serde_json::from_str(&b).context("Corrupt profile body"))
            .transpose()
    }

    /// Full profiles started at or after `since`, oldest first (export)
    pub async fn since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Profile>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM profiles WHERE started_at >= ? ORDER BY started_at ASC, id ASC LIMIT ?",
        )
        .bind(since.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("Corrupt profile body"))
            .collect()
    }

    pub async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<DashboardStats> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);

        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    AVG(duration_us) AS avg_duration_us,
                    AVG(query_count) AS avg_queries,
                    SUM(query_time_us) AS total_query_time_us,
                    SUM(is_error) AS errors
             FROM profiles WHERE started_at >= ?",
        )
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let avg_duration_us: Option<f64> = row.get("avg_duration_us");
        let avg_queries: Option<f64> = row.get("avg_queries");
        let total_query_time_us: Option<i64> = row.get("total_query_time_us");
        let errors: Option<i64> = row.get("errors");

        Ok(DashboardStats {
            total_requests: total as u64,
            avg_duration_ms: avg_duration_us.unwrap_or(0.0) / 1_000.0,
            avg_queries: avg_queries.unwrap_or(0.0),
            total_query_time_ms: total_query_time_us.unwrap_or(0) as f64 / 1_000.0,
            error_count: errors.unwrap_or(0) as u64,
        })
    }

    /// Late memory samples appended for a request, in arrival order
    pub async fn late_samples(&self, correlation_id: &str) -> Result<Vec<MemorySample>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM memory_samples_late WHERE correlation_id = ? ORDER BY id ASC",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::new();
        for body in bodies {
            let batch: Vec<MemorySample> = serde_json::from_str(&body).context("Corrupt sample body")?;
            samples.extend(batch);
        }
        Ok(samples)
    }

    /// Delete profiles and late samples older than `days`
    pub async fn cleanup_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = current_millis() - i64::from(days) * 24 * 60 * 60 * 1000;
        let mut tx = self.pool.begin().await?;

        let profiles = sqlx::query("DELETE FROM profiles WHERE started_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM memory_samples_late WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(retention_days = days, deleted = profiles, "Cleaned up old profiles");
        Ok(profiles)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ProfileSink for SqliteProfileStore {
    async fn persist(&self, profiles: &[Arc<Profile>]) -> Result<()> {
        self.insert_batch(profiles).await?;
        Ok(())
    }

    async fn append_memory_samples(&self, correlation_id: &str, samples: &[MemorySample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        sqlx::query("INSERT INTO memory_samples_late (correlation_id, recorded_at, body) VALUES (?, ?, ?)")
            .bind(correlation_id)
            .bind(current_millis())
            .bind(serde_json::to_string(samples)?)
            .execute(&self.pool)
            .await
            .context("Failed to append late memory samples")?;

        Ok(())
    }
}

/// Periodically delete profiles past the retention window
pub fn spawn_retention_task<S: Clone + Send + 'static>(
    store: Arc<SqliteProfileStore>,
    retention_days: u32,
    check_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<S>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = store.cleanup_older_than(retention_days).await {
                        tracing::error!(error = %e, "Profile retention cleanup failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Retention task stopping");
                    break;
                }
            }
        }
    })
}

/// SQLite creates the file but not missing directories
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = Path::new(path.split('?').next().unwrap_or(path));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn outcome_str(outcome: ProfileOutcome) -> &'static str {
    match outcome {
        ProfileOutcome::Completed => "completed",
        ProfileOutcome::Abandoned => "abandoned",
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_summary(row: &SqliteRow) -> Result<ProfileSummary> {
    let started_ms: i64 = row.get("started_at");
    let started_at = Utc
        .timestamp_millis_opt(started_ms)
        .single()
        .with_context(|| format!("Invalid started_at {}", started_ms))?;

    let outcome = match row.get::<String, _>("outcome").as_str() {
        "abandoned" => ProfileOutcome::Abandoned,
        _ => ProfileOutcome::Completed,
    };

    Ok(ProfileSummary {
        correlation_id: row.get("correlation_id"),
        started_at,
        method: row.get("method"),
        path: row.get("path"),
        view_name: row.get("view_name"),
        status_code: row
            .get::<Option<i64>, _>("status_code")
            .and_then(|code| u16::try_from(code).ok()),
        is_error: row.get("is_error"),
        outcome,
        duration_us: row.get::<i64, _>("duration_us") as u64,
        query_count: row.get::<i64, _>("query_count") as usize,
        query_time_us: row.get::<i64, _>("query_time_us") as u64,
        diagnostic_count: row.get::<i64, _>("diagnostic_count") as usize,
        peak_resident_bytes: row
            .get::<Option<i64>, _>("peak_resident_bytes")
            .map(|b| b as u64),
    })
}
