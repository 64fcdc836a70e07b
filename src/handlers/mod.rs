//! Dashboard HTTP API
//!
//! - stream: live profile feed over SSE
//! - profiles: history, single profile and export
//! - stats: aggregate numbers for the dashboard header
//! - toggle: read and switch the runtime profiling flag
//! - health / metrics_handler: process endpoints

pub mod health;
pub mod metrics_handler;
pub mod profiles;
pub mod stats;
pub mod stream;
pub mod toggle;

use crate::error::ApiError;
use crate::profiler::{Profiler, SqliteProfileStore};
use chrono::{DateTime, Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Shared state for every dashboard route
#[derive(Clone)]
pub struct AppState {
    pub profiler: Arc<Profiler>,
    /// Absent when persistence is disabled; history endpoints then
    /// answer 503
    pub store: Option<Arc<SqliteProfileStore>>,
    pub metrics: Arc<PrometheusHandle>,
}

impl AppState {
    pub(crate) fn store(&self) -> Result<&Arc<SqliteProfileStore>, ApiError> {
        self.store.as_ref().ok_or(ApiError::StoreUnavailable)
    }
}

/// Turn a "last N seconds" query parameter into an absolute cutoff
pub(crate) fn since_seconds(seconds: Option<u64>) -> Option<DateTime<Utc>> {
    seconds.map(|s| {
        let window = Duration::try_seconds(i64::try_from(s).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX);
        Utc::now().checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

fn default_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_since_seconds() {
        assert!(since_seconds(None).is_none());

        let cutoff = since_seconds(Some(60)).unwrap();
        let age = Utc::now() - cutoff;
        assert!(age >= Duration::seconds(59) && age <= Duration::seconds(61));

        assert!(since_seconds(Some(u64::MAX)).is_some());
    }
}
