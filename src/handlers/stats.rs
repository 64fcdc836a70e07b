use super::{since_seconds, AppState};
use crate::error::ApiError;
use crate::profiler::{DashboardStats, ProfilerStats};
use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    /// Only requests from the last N seconds
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Aggregates over stored profiles; absent without a store
    #[serde(flatten)]
    pub history: Option<DashboardStats>,
    pub profiler: ProfilerStats,
}

/// GET {prefix}/stats - dashboard header numbers
///
/// Example: GET /__monitor__/stats?since=3600
pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<StatsResponse>, ApiError> {
    let history = match &state.store {
        Some(store) => Some(store.stats(since_seconds(params.since)).await?),
        None => None,
    };

    Ok(Json(StatsResponse {
        history,
        profiler: state.profiler.stats(),
    }))
}
