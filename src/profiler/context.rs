//! Per-request aggregation unit
//!
//! A `RequestContext` is owned by the registry while the request is in
//! flight. All mutation goes through [`RequestContext::apply`], which takes
//! the per-context lock, so concurrent sub-operations of one request can
//! record without any external synchronization.

use super::clock::EventClock;
use super::event::{MemorySample, QueryEvent, RequestMetadata, Span, SpanCategory, SpanId};
use crate::error::ProfilerError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle of a request context. There is no transition out of `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Active,
    Finalizing,
    Closed,
}

/// Message applied to a context's buffers
#[derive(Debug, Clone)]
pub(crate) enum ContextEvent {
    Query(QueryEvent),
    SpanStart {
        name: String,
        category: SpanCategory,
        parent: Option<SpanId>,
        start_us: u64,
    },
    SpanEnd {
        id: SpanId,
        end_us: u64,
    },
    SpanAnnotate {
        id: SpanId,
        key: String,
        value: String,
    },
    SpanCompleted {
        name: String,
        category: SpanCategory,
        parent: Option<SpanId>,
        start_us: u64,
        duration_us: u64,
        attributes: BTreeMap<String, String>,
    },
    Memory(MemorySample),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Recorded,
    SpanStarted(SpanId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// The context is finalizing or closed
    NotActive,
    /// The event references state that does not exist in this request
    Invariant(String),
}

#[derive(Debug, Clone)]
struct SpanSlot {
    name: String,
    category: SpanCategory,
    parent: Option<SpanId>,
    start_us: u64,
    end_us: Option<u64>,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug)]
struct ContextBuffers {
    state: ContextState,
    queries: Vec<QueryEvent>,
    spans: Vec<SpanSlot>,
    samples: Vec<MemorySample>,
    dropped: u64,
}

/// Everything recorded for one request, detached from the live context
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub correlation_id: String,
    pub metadata: RequestMetadata,
    pub started_at: DateTime<Utc>,
    pub end_us: u64,
    /// In recording order
    pub queries: Vec<QueryEvent>,
    /// In start order; id `n` is at index `n - 1`
    pub spans: Vec<Span>,
    pub samples: Vec<MemorySample>,
    pub dropped_events: u64,
}

pub struct RequestContext {
    correlation_id: Arc<str>,
    metadata: RequestMetadata,
    clock: EventClock,
    last_activity_us: AtomicU64,
    buffers: Mutex<ContextBuffers>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("correlation_id", &self.correlation_id)
            .field("metadata", &self.metadata)
            // Formatting must not block on a held lock
            .field("state", &self.buffers.try_lock().ok().map(|b| b.state))
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(correlation_id: Arc<str>, metadata: RequestMetadata) -> Self {
        Self {
            correlation_id,
            metadata,
            clock: EventClock::start(),
            last_activity_us: AtomicU64::new(0),
            buffers: Mutex::new(ContextBuffers {
                state: ContextState::Active,
                queries: Vec::new(),
                spans: Vec::new(),
                samples: Vec::new(),
                dropped: 0,
            }),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn shared_id(&self) -> Arc<str> {
        self.correlation_id.clone()
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn clock(&self) -> &EventClock {
        &self.clock
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.clock.started_at()
    }

    pub fn state(&self) -> ContextState {
        self.lock().state
    }

    pub fn query_count(&self) -> usize {
        self.lock().queries.len()
    }

    pub fn span_count(&self) -> usize {
        self.lock().spans.len()
    }

    pub fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    /// Time since the last recorded event (or since `begin`) as of `now`
    pub fn idle_time_at(&self, now: Instant) -> Duration {
        let now_us = self.clock.offset_of(now);
        let last = self.last_activity_us.load(Ordering::Relaxed);
        Duration::from_micros(now_us.saturating_sub(last))
    }

    /// True when nothing has been recorded for at least `grace`
    pub fn is_idle_for(&self, grace: Duration) -> bool {
        self.idle_time_at(Instant::now()) >= grace
    }

    // Recording must keep working after a panic elsewhere poisoned the lock.
    fn lock(&self) -> MutexGuard<'_, ContextBuffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn apply(&self, event: ContextEvent) -> Result<Applied, Rejection> {
        let mut buffers = self.lock();
        if buffers.state != ContextState::Active {
            buffers.dropped += 1;
            return Err(Rejection::NotActive);
        }

        let applied = match event {
            ContextEvent::Query(query) => {
                if let Some(span) = query.span {
                    check_span_exists(&buffers, span)?;
                }
                buffers.queries.push(query);
                Applied::Recorded
            }
            ContextEvent::SpanStart {
                name,
                category,
                parent,
                start_us,
            } => {
                if let Some(parent) = parent {
                    check_span_exists(&buffers, parent)?;
                }
                buffers.spans.push(SpanSlot {
                    name,
                    category,
                    parent,
                    start_us,
                    end_us: None,
                    attributes: BTreeMap::new(),
                });
                Applied::SpanStarted(next_span_id(&buffers))
            }
            ContextEvent::SpanEnd { id, end_us } => {
                let slot = span_slot_mut(&mut buffers, id)?;
                if slot.end_us.is_some() {
                    return Err(Rejection::Invariant(format!("span {} ended twice", id)));
                }
                slot.end_us = Some(end_us.max(slot.start_us));
                Applied::Recorded
            }
            ContextEvent::SpanAnnotate { id, key, value } => {
                span_slot_mut(&mut buffers, id)?.attributes.insert(key, value);
                Applied::Recorded
            }
            ContextEvent::SpanCompleted {
                name,
                category,
                parent,
                start_us,
                duration_us,
                attributes,
            } => {
                if let Some(parent) = parent {
                    check_span_exists(&buffers, parent)?;
                }
                buffers.spans.push(SpanSlot {
                    name,
                    category,
                    parent,
                    start_us,
                    end_us: Some(start_us.saturating_add(duration_us)),
                    attributes,
                });
                Applied::SpanStarted(next_span_id(&buffers))
            }
            ContextEvent::Memory(sample) => {
                buffers.samples.push(sample);
                Applied::Recorded
            }
        };
        drop(buffers);

        self.last_activity_us.store(self.clock.now_us(), Ordering::Relaxed);
        Ok(applied)
    }

    /// Move `Active -> Finalizing`. Only one caller can win.
    pub(crate) fn begin_finalizing(&self) -> Result<(), ProfilerError> {
        let mut buffers = self.lock();
        match buffers.state {
            ContextState::Active => {
                buffers.state = ContextState::Finalizing;
                Ok(())
            }
            ContextState::Finalizing | ContextState::Closed => {
                Err(ProfilerError::AlreadyFinalizing(self.correlation_id.to_string()))
            }
        }
    }

    /// Drain the buffers and move to `Closed`.
    ///
    /// Spans still open are closed at `end_us` and flagged unfinished.
    pub(crate) fn take_snapshot(&self, end_us: u64) -> ContextSnapshot {
        let mut buffers = self.lock();
        buffers.state = ContextState::Closed;

        let queries = std::mem::take(&mut buffers.queries);
        let samples = std::mem::take(&mut buffers.samples);
        let slots = std::mem::take(&mut buffers.spans);
        let dropped_events = buffers.dropped;
        drop(buffers);

        let spans = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                let end = slot.end_us.unwrap_or_else(|| end_us.max(slot.start_us));
                Span {
                    id: idx as SpanId + 1,
                    name: slot.name,
                    category: slot.category,
                    start_us: slot.start_us,
                    duration_us: end.saturating_sub(slot.start_us),
                    parent: slot.parent,
                    attributes: slot.attributes,
                    unfinished: slot.end_us.is_none(),
                }
            })
            .collect();

        ContextSnapshot {
            correlation_id: self.correlation_id.to_string(),
            metadata: self.metadata.clone(),
            started_at: self.clock.started_at(),
            end_us,
            queries,
            spans,
            samples,
            dropped_events,
        }
    }
}

fn next_span_id(buffers: &ContextBuffers) -> SpanId {
    buffers.spans.len() as SpanId
}

fn check_span_exists(buffers: &ContextBuffers, id: SpanId) -> Result<(), Rejection> {
    if id == 0 || id as usize > buffers.spans.len() {
        return Err(Rejection::Invariant(format!("unknown span {}", id)));
    }
    Ok(())
}

fn span_slot_mut(buffers: &mut ContextBuffers, id: SpanId) -> Result<&mut SpanSlot, Rejection> {
    check_span_exists(buffers, id)?;
    Ok(&mut buffers.spans[id as usize - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_shows_identity_and_state() {
        let context = RequestContext::new(Arc::from("r1"), RequestMetadata::new("GET", "/items"));
        let rendered = format!("{:?}", context);
        assert!(rendered.contains("\"r1\""));
        assert!(rendered.contains("Active"));
    }

    fn context() -> RequestContext {
        RequestContext::new(Arc::from("req-1"), RequestMetadata::new("GET", "/items"))
    }

    fn query(text: &str, start_us: u64) -> QueryEvent {
        QueryEvent {
            text: text.to_string(),
            fingerprint: "f".to_string(),
            start_us,
            duration_us: 10,
            call_site: None,
            span: None,
        }
    }

    #[test]
    fn test_records_while_active() {
        let ctx = context();
        assert_eq!(ctx.apply(ContextEvent::Query(query("select 1", 0))), Ok(Applied::Recorded));
        assert_eq!(ctx.query_count(), 1);
        assert_eq!(ctx.state(), ContextState::Active);
    }

    #[test]
    fn test_span_ids_are_sequential() {
        let ctx = context();
        let start = |parent| ContextEvent::SpanStart {
            name: "s".to_string(),
            category: SpanCategory::Custom,
            parent,
            start_us: 0,
        };

        assert_eq!(ctx.apply(start(None)), Ok(Applied::SpanStarted(1)));
        assert_eq!(ctx.apply(start(Some(1))), Ok(Applied::SpanStarted(2)));
        assert!(matches!(ctx.apply(start(Some(9))), Err(Rejection::Invariant(_))));
        assert_eq!(ctx.span_count(), 2);
    }

    #[test]
    fn test_span_ended_twice_is_rejected() {
        let ctx = context();
        ctx.apply(ContextEvent::SpanStart {
            name: "s".to_string(),
            category: SpanCategory::Db,
            parent: None,
            start_us: 5,
        })
        .unwrap();

        assert!(ctx.apply(ContextEvent::SpanEnd { id: 1, end_us: 20 }).is_ok());
        assert!(matches!(
            ctx.apply(ContextEvent::SpanEnd { id: 1, end_us: 30 }),
            Err(Rejection::Invariant(_))
        ));
    }

    #[test]
    fn test_finalizing_rejects_events_and_second_finalizer() {
        let ctx = context();
        ctx.begin_finalizing().unwrap();

        assert_eq!(
            ctx.apply(ContextEvent::Memory(MemorySample::new(1, 1))),
            Err(Rejection::NotActive)
        );
        assert_eq!(
            ctx.begin_finalizing(),
            Err(ProfilerError::AlreadyFinalizing("req-1".to_string()))
        );

        let snapshot = ctx.take_snapshot(100);
        assert_eq!(snapshot.dropped_events, 1);
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(ctx.begin_finalizing().is_err());
    }

    #[test]
    fn test_idle_time_tracks_last_activity() {
        let ctx = context();
        let later = ctx.clock().origin() + Duration::from_secs(10);
        assert!(ctx.idle_time_at(later) >= Duration::from_secs(9));
        assert!(!ctx.is_idle_for(Duration::from_secs(60)));
    }

    #[test]
    fn test_snapshot_closes_open_spans() {
        let ctx = context();
        ctx.apply(ContextEvent::SpanStart {
            name: "outer".to_string(),
            category: SpanCategory::Http,
            parent: None,
            start_us: 10,
        })
        .unwrap();
        ctx.apply(ContextEvent::SpanCompleted {
            name: "inner".to_string(),
            category: SpanCategory::Http,
            parent: Some(1),
            start_us: 20,
            duration_us: 5,
            attributes: BTreeMap::new(),
        })
        .unwrap();
        ctx.begin_finalizing().unwrap();

        let snapshot = ctx.take_snapshot(110);
        assert_eq!(snapshot.spans.len(), 2);
        assert!(snapshot.spans[0].unfinished);
        assert_eq!(snapshot.spans[0].duration_us, 100);
        assert!(!snapshot.spans[1].unfinished);
        assert_eq!(snapshot.spans[1].parent, Some(1));
        assert_eq!(snapshot.spans[1].duration_us, 5);
        assert_eq!(ctx.query_count(), 0);
    }
}
