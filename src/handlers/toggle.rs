use super::AppState;
use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerToggle {
    pub enabled: bool,
}

/// GET {prefix}/profiler
pub async fn get_profiler_state(State(state): State<AppState>) -> Json<ProfilerToggle> {
    Json(ProfilerToggle {
        enabled: state.profiler.is_enabled(),
    })
}

/// POST {prefix}/profiler - switch profiling on or off at runtime.
///
/// Requests already being profiled finish normally.
pub async fn set_profiler_state(
    State(state): State<AppState>,
    Json(toggle): Json<ProfilerToggle>,
) -> Json<ProfilerToggle> {
    state.profiler.set_enabled(toggle.enabled);

    Json(ProfilerToggle {
        enabled: state.profiler.is_enabled(),
    })
}
