//! axum middleware that profiles every request passing through it
//!
//! Works for any router: the correlation id comes from `x-request-id` when
//! the client sent one and it is not already in flight, otherwise a fresh
//! UUID. The id actually used is echoed back. Handlers reach the id via
//! the `CorrelationId` request extension to record queries and spans.

use crate::error::ProfilerError;
use crate::profiler::{Completion, Profiler, RequestMetadata};
use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id of the request being served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub Arc<str>);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub async fn profiling_middleware(State(profiler): State<Arc<Profiler>>, mut req: Request, next: Next) -> Response {
    let requested_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string);

    let mut metadata = RequestMetadata::new(req.method().as_str(), req.uri().path());
    // Only present when installed with `route_layer`
    if let Some(matched) = req.extensions().get::<MatchedPath>() {
        metadata = metadata.with_view_name(matched.as_str());
    }

    let (correlation_id, profiling) = start_request(&profiler, requested_id, metadata);
    req.extensions_mut()
        .insert(CorrelationId(Arc::from(correlation_id.as_str())));

    let mut response = next.run(req).await;

    if profiling {
        let completion = Completion::with_status(response.status().as_u16());
        if let Some(profile) = profiler.on_request_end(&correlation_id, completion) {
            tracing::debug!(
                correlation_id = %correlation_id,
                duration_us = profile.total_duration_us,
                queries = profile.summary.total_queries,
                "Request profiled"
            );
        }
    }

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Pick the correlation id for a request and open its context.
///
/// A client-supplied id that names another request still in flight is
/// replaced by a fresh UUID, so this request can never record into the
/// other one's context.
fn start_request(profiler: &Profiler, requested_id: Option<String>, metadata: RequestMetadata) -> (String, bool) {
    let Some(requested_id) = requested_id else {
        let id = Uuid::new_v4().to_string();
        let profiling = profiler.on_request_start(&id, metadata);
        return (id, profiling);
    };

    match profiler.try_request_start(&requested_id, metadata.clone()) {
        Ok(profiling) if profiling || !profiler.registry().contains(&requested_id) => (requested_id, profiling),
        Ok(_) | Err(ProfilerError::DuplicateContext(_)) => {
            let id = Uuid::new_v4().to_string();
            tracing::debug!(
                requested_id = %requested_id,
                correlation_id = %id,
                "Request id already in flight, using a fresh one"
            );
            let profiling = profiler.on_request_start(&id, metadata);
            (id, profiling)
        }
        Err(e) => {
            tracing::warn!(correlation_id = %requested_id, error = %e, "Could not start profiling request");
            let id = Uuid::new_v4().to_string();
            (id, false)
        }
    }
}
