//! Live profile feed
//!
//! One SSE event per record. Every record is a JSON object tagged with
//! `type`: an `initial_data` snapshot of recent history, then one
//! `profile_update` per finished request, and a `heartbeat` whenever the
//! feed has been idle for the heartbeat interval.

use super::AppState;
use crate::profiler::{Profile, ProfileSummary, Subscription};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const INITIAL_HISTORY: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Send full profiles instead of summaries
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord<'a> {
    InitialData {
        profiles: Vec<ProfileSummary>,
    },
    ProfileUpdate {
        summary: ProfileSummary,
        #[serde(skip_serializing_if = "Option::is_none")]
        profile: Option<&'a Profile>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
        active_contexts: usize,
    },
}

struct FeedState {
    initial: Option<Vec<ProfileSummary>>,
    subscription: Subscription,
    heartbeat: Duration,
    full: bool,
    state: AppState,
}

/// GET {prefix}/stream - live profile feed
pub async fn stream_profiles(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading history so nothing falls in between
    let subscription = state.profiler.subscribe();

    let initial = match &state.store {
        Some(store) => store.recent(INITIAL_HISTORY).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load initial history for stream");
            Vec::new()
        }),
        None => Vec::new(),
    };

    tracing::debug!(subscriber_id = subscription.id(), full = params.full, "Dashboard stream opened");

    let feed = FeedState {
        initial: Some(initial),
        subscription,
        heartbeat: state.profiler.config().heartbeat_interval(),
        full: params.full,
        state,
    };

    let stream = stream::unfold(feed, |mut feed| async move {
        if let Some(profiles) = feed.initial.take() {
            let event = to_event(&StreamRecord::InitialData { profiles });
            return Some((Ok(event), feed));
        }

        match tokio::time::timeout(feed.heartbeat, feed.subscription.recv()).await {
            Ok(Some(profile)) => {
                let event = profile_event(&profile, feed.full);
                Some((Ok(event), feed))
            }
            // Publisher shut down
            Ok(None) => None,
            Err(_) => {
                let event = to_event(&StreamRecord::Heartbeat {
                    timestamp: Utc::now(),
                    active_contexts: feed.state.profiler.registry().active_count(),
                });
                Some((Ok(event), feed))
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn profile_event(profile: &Arc<Profile>, full: bool) -> Event {
    to_event(&StreamRecord::ProfileUpdate {
        summary: profile.to_summary(),
        profile: full.then_some(profile.as_ref()),
    })
}

fn to_event(record: &StreamRecord<'_>) -> Event {
    match serde_json::to_string(record) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize stream record");
            Event::default().comment("serialization error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::ProfileOutcome;

    fn summary() -> ProfileSummary {
        ProfileSummary {
            correlation_id: "r1".to_string(),
            started_at: Utc::now(),
            method: "GET".to_string(),
            path: "/items".to_string(),
            view_name: None,
            status_code: Some(200),
            is_error: false,
            outcome: ProfileOutcome::Completed,
            duration_us: 10,
            query_count: 1,
            query_time_us: 2,
            diagnostic_count: 0,
            peak_resident_bytes: None,
        }
    }

    #[test]
    fn test_records_are_tagged() {
        let json = serde_json::to_value(StreamRecord::InitialData { profiles: vec![summary()] }).unwrap();
        assert_eq!(json["type"], "initial_data");
        assert_eq!(json["profiles"][0]["correlation_id"], "r1");

        let json = serde_json::to_value(StreamRecord::ProfileUpdate {
            summary: summary(),
            profile: None,
        })
        .unwrap();
        assert_eq!(json["type"], "profile_update");
        assert!(json.get("profile").is_none());

        let json = serde_json::to_value(StreamRecord::Heartbeat {
            timestamp: Utc::now(),
            active_contexts: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["active_contexts"], 2);
    }
}
