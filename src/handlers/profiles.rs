//! History, single-profile and export endpoints backed by the profile store

use super::{default_limit, since_seconds, AppState};
use crate::error::ApiError;
use crate::profiler::{Profile, ProfileFilter, ProfileSummary, StatusFilter};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_LIMIT: usize = 1000;

/// Query parameters for the history API
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Only requests from the last N seconds
    pub since: Option<u64>,

    pub view_name: Option<String>,

    /// `error` or `slow`
    pub status: Option<StatusFilter>,

    /// Threshold used by `status=slow`
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,

    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_slow_threshold_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub since: Option<u64>,

    #[serde(default = "default_export_limit")]
    pub limit: usize,
}

fn default_export_limit() -> usize {
    MAX_LIMIT
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub total: usize,
    pub profiles: Vec<ProfileSummary>,
}

/// GET {prefix}/profiles - filtered history, newest first
///
/// Example: GET /__monitor__/profiles?since=3600&status=slow&slow_threshold_ms=250
pub async fn list_profiles(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let store = state.store()?;
    if params.limit == 0 {
        return Err(ApiError::BadRequest("limit must be at least 1".to_string()));
    }

    let filter = ProfileFilter {
        since: since_seconds(params.since),
        view_name: params.view_name.filter(|v| !v.is_empty()),
        status: params.status,
        slow_threshold_ms: params.slow_threshold_ms,
        limit: params.limit.min(MAX_LIMIT),
    };

    let profiles = store.query(&filter).await?;
    Ok(Json(HistoryResponse {
        total: profiles.len(),
        profiles,
    }))
}

/// GET {prefix}/profiles/{id} - full stored profile
pub async fn get_profile(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    let store = state.store()?;

    store
        .get(&correlation_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("profile {}", correlation_id)))
}

/// GET {prefix}/export - full profiles as a JSON array, oldest first
pub async fn export_profiles(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Json<Vec<Profile>>, ApiError> {
    let store = state.store()?;
    let since = since_seconds(params.since).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let profiles = store.since(since, params.limit.min(MAX_LIMIT)).await?;
    tracing::info!(count = profiles.len(), "Exported profiles");

    Ok(Json(profiles))
}
