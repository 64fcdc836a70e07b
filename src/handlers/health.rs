use super::AppState;
use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

/// Handle /health endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "profiler_enabled": state.profiler.is_enabled(),
        "active_contexts": state.profiler.registry().active_count(),
        "persistence": state.store.is_some(),
    }))
}
