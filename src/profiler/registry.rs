//! Context registry and recorders
//!
//! Maps correlation ids to live [`RequestContext`]s. The map is sharded
//! (`DashMap`), and each context serializes its own mutations, so requests
//! never contend on a registry-wide lock.
//!
//! Recording calls never fail the caller. An event for an unknown or
//! finalizing request is dropped and counted; an event that references
//! state from another request is excluded and counted as an invariant
//! violation.

use super::analyzer::{analyze, AnalyzerConfig};
use super::assembler::{assemble, order_events, Completion};
use super::context::{Applied, ContextEvent, Rejection, RequestContext};
use super::event::{
    normalize_sql, parameter_fingerprint, truncate_chars, CompletedSpan, MemorySample, QueryEvent,
    QueryRecord, RequestMetadata, SpanCategory, SpanHandle, SpanId,
};
use super::profile::{Profile, ProfileOutcome};
use super::publisher::Publisher;
use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_contexts: usize,
    pub closed_tombstones: usize,
    pub dropped_events: u64,
    pub invariant_violations: u64,
    pub late_samples_accepted: u64,
    pub profiles_assembled: u64,
    pub abandoned: u64,
    pub discarded: u64,
}

/// Result of one reaper sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub finalized: usize,
    pub discarded: usize,
    pub tombstones_flushed: usize,
}

#[derive(Default)]
struct Counters {
    dropped_events: AtomicU64,
    invariant_violations: AtomicU64,
    late_samples_accepted: AtomicU64,
    profiles_assembled: AtomicU64,
    abandoned: AtomicU64,
    discarded: AtomicU64,
}

/// Recently closed request still accepting late memory samples
struct Tombstone {
    closed_at: Instant,
    samples: Vec<MemorySample>,
}

pub struct ContextRegistry {
    contexts: DashMap<String, Arc<RequestContext>>,
    closed: DashMap<String, Tombstone>,
    config: ArcSwap<ProfilerConfig>,
    enabled: AtomicBool,
    publisher: Arc<Publisher>,
    counters: Counters,
}

impl ContextRegistry {
    pub fn new(config: ProfilerConfig, publisher: Arc<Publisher>) -> Self {
        Self {
            contexts: DashMap::new(),
            closed: DashMap::new(),
            enabled: AtomicBool::new(config.enabled),
            config: ArcSwap::from_pointee(config),
            publisher,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> Arc<ProfilerConfig> {
        self.config.load_full()
    }

    /// Swap in new thresholds. Requests already in flight are analyzed
    /// with whatever configuration is current when they end.
    ///
    /// `config.enabled` only seeds the flag at construction; afterwards the
    /// flag belongs to `set_enabled`.
    pub fn update_config(&self, config: ProfilerConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Start profiling a request.
    pub fn begin(&self, correlation_id: &str, metadata: RequestMetadata) -> Result<Arc<RequestContext>, ProfilerError> {
        if !self.is_enabled() {
            return Err(ProfilerError::Disabled);
        }

        let context = match self.contexts.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(ProfilerError::DuplicateContext(correlation_id.to_string()));
            }
            Entry::Vacant(slot) => {
                let context = Arc::new(RequestContext::new(Arc::from(correlation_id), metadata));
                slot.insert(context.clone());
                context
            }
        };

        crate::metrics::set_active_contexts(self.contexts.len());
        tracing::trace!(
            correlation_id = %correlation_id,
            method = %context.metadata().method,
            path = %context.metadata().path,
            "Request context opened"
        );

        Ok(context)
    }

    pub fn get(&self, correlation_id: &str) -> Result<Arc<RequestContext>, ProfilerError> {
        self.lookup(correlation_id)
            .ok_or_else(|| ProfilerError::NotFound(correlation_id.to_string()))
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.contexts.contains_key(correlation_id)
    }

    pub fn active_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn end(&self, correlation_id: &str) -> Result<Arc<Profile>, ProfilerError> {
        self.end_with(correlation_id, Completion::default())
    }

    /// Finalize a request and publish its profile.
    ///
    /// Of several concurrent callers exactly one gets the profile; the
    /// others get `AlreadyFinalizing`, and callers after removal get
    /// `NotFound`.
    pub fn end_with(&self, correlation_id: &str, completion: Completion) -> Result<Arc<Profile>, ProfilerError> {
        let context = self.get(correlation_id)?;
        self.finalize(&context, completion, ProfileOutcome::Completed)
    }

    fn finalize(
        &self,
        context: &Arc<RequestContext>,
        completion: Completion,
        outcome: ProfileOutcome,
    ) -> Result<Arc<Profile>, ProfilerError> {
        context.begin_finalizing()?;

        let end_us = context.clock().now_us();
        let mut snapshot = context.take_snapshot(end_us);
        self.close(context, true);

        let excluded = order_events(&mut snapshot);
        if excluded > 0 {
            self.counters.invariant_violations.fetch_add(excluded, Ordering::Relaxed);
            for _ in 0..excluded {
                crate::metrics::record_invariant_violation();
            }
        }

        let analyzer_config = AnalyzerConfig::from(&**self.config.load());
        let analysis = analyze(
            &snapshot.queries,
            &snapshot.spans,
            &snapshot.samples,
            Some(end_us),
            &analyzer_config,
        );

        let profile = match assemble(snapshot, analysis, completion, outcome, excluded) {
            Ok(profile) => Arc::new(profile),
            Err(e) => {
                self.counters.invariant_violations.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_invariant_violation();
                tracing::warn!(
                    correlation_id = %context.correlation_id(),
                    error = %e,
                    "Failed to assemble profile"
                );
                return Err(e);
            }
        };

        for diagnostic in &profile.diagnostics {
            crate::metrics::record_diagnostic(diagnostic.kind.as_str());
        }
        let outcome_label = match outcome {
            ProfileOutcome::Completed => "completed",
            ProfileOutcome::Abandoned => "abandoned",
        };
        crate::metrics::record_profile(outcome_label, Duration::from_micros(profile.total_duration_us));
        self.counters.profiles_assembled.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            correlation_id = %profile.correlation_id,
            outcome = outcome_label,
            duration_us = profile.total_duration_us,
            queries = profile.queries.len(),
            spans = profile.spans.len(),
            diagnostics = profile.diagnostics.len(),
            "Profile assembled"
        );

        self.publisher.publish(profile.clone());
        Ok(profile)
    }

    /// Remove a closed context from the live map; optionally keep a
    /// tombstone for late memory samples.
    fn close(&self, context: &Arc<RequestContext>, keep_tombstone: bool) {
        let id = context.correlation_id();
        self.contexts.remove_if(id, |_, live| Arc::ptr_eq(live, context));
        if keep_tombstone {
            self.closed.insert(
                id.to_string(),
                Tombstone {
                    closed_at: Instant::now(),
                    samples: Vec::new(),
                },
            );
        }
        crate::metrics::set_active_contexts(self.contexts.len());
    }

    fn lookup(&self, correlation_id: &str) -> Option<Arc<RequestContext>> {
        self.contexts.get(correlation_id).map(|entry| entry.value().clone())
    }

    fn drop_event(&self, correlation_id: &str, kind: &'static str) {
        self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_dropped_event(kind);
        tracing::trace!(correlation_id = %correlation_id, kind = kind, "Dropped event");
    }

    fn invariant_violation(&self, correlation_id: &str, message: &str) {
        self.counters.invariant_violations.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_invariant_violation();
        tracing::warn!(correlation_id = %correlation_id, "Invariant violation: {}", message);
    }

    fn apply(&self, context: &RequestContext, event: ContextEvent, kind: &'static str) -> Option<Applied> {
        match context.apply(event) {
            Ok(applied) => Some(applied),
            Err(Rejection::NotActive) => {
                self.drop_event(context.correlation_id(), kind);
                None
            }
            Err(Rejection::Invariant(message)) => {
                self.invariant_violation(context.correlation_id(), &message);
                None
            }
        }
    }

    /// Resolve a parent handle for a span about to be recorded under
    /// `context`. `Err` means the span must be excluded.
    fn resolve_parent(&self, context: &RequestContext, parent: Option<&SpanHandle>) -> Result<Option<SpanId>, ()> {
        let Some(parent) = parent else {
            return Ok(None);
        };
        if parent.correlation_id() != context.correlation_id() {
            self.invariant_violation(
                context.correlation_id(),
                &format!("parent span belongs to request {}", parent.correlation_id()),
            );
            return Err(());
        }
        match parent.span_id() {
            Some(id) => Ok(Some(id)),
            None => {
                self.invariant_violation(context.correlation_id(), "parent span was never recorded");
                Err(())
            }
        }
    }

    /// Query recorder: normalize, fingerprint and buffer one query.
    pub fn record_query(&self, correlation_id: &str, record: QueryRecord) {
        let Some(context) = self.lookup(correlation_id) else {
            self.drop_event(correlation_id, "query");
            return;
        };
        let config = self.config.load();

        let normalized = normalize_sql(&record.sql);
        let fingerprint = parameter_fingerprint(&record.params_digest, &normalized.literals);
        let start_us = record
            .start_us
            .unwrap_or_else(|| context.clock().now_us().saturating_sub(record.duration_us));

        let span = match &record.span {
            Some(handle) if handle.correlation_id() != correlation_id => {
                self.invariant_violation(
                    correlation_id,
                    &format!("query span belongs to request {}", handle.correlation_id()),
                );
                None
            }
            Some(handle) => handle.span_id(),
            None => None,
        };

        let event = QueryEvent {
            text: truncate_chars(&normalized.text, config.max_query_text_len),
            fingerprint,
            start_us,
            duration_us: record.duration_us,
            call_site: record
                .call_site
                .as_deref()
                .map(|site| truncate_chars(site, config.max_call_site_len)),
            span,
        };

        self.apply(&context, ContextEvent::Query(event), "query");
    }

    /// Open a span. The returned handle is non-recording when the span
    /// could not be started.
    pub fn start_span(
        &self,
        correlation_id: &str,
        name: &str,
        category: SpanCategory,
        parent: Option<&SpanHandle>,
    ) -> SpanHandle {
        let Some(context) = self.lookup(correlation_id) else {
            self.drop_event(correlation_id, "span");
            return SpanHandle::detached(Arc::from(correlation_id));
        };

        let Ok(parent) = self.resolve_parent(&context, parent) else {
            return SpanHandle::detached(context.shared_id());
        };

        let event = ContextEvent::SpanStart {
            name: name.to_string(),
            category,
            parent,
            start_us: context.clock().now_us(),
        };
        match self.apply(&context, event, "span") {
            Some(Applied::SpanStarted(id)) => SpanHandle::recording(context.shared_id(), id),
            _ => SpanHandle::detached(context.shared_id()),
        }
    }

    pub fn end_span(&self, handle: &SpanHandle) {
        let Some(id) = handle.span_id() else {
            return;
        };
        let Some(context) = self.lookup(handle.correlation_id()) else {
            self.drop_event(handle.correlation_id(), "span");
            return;
        };

        let end_us = context.clock().now_us();
        self.apply(&context, ContextEvent::SpanEnd { id, end_us }, "span");
    }

    /// Attach a string attribute (url, method, status of an outbound call)
    pub fn annotate_span(&self, handle: &SpanHandle, key: &str, value: &str) {
        let Some(id) = handle.span_id() else {
            return;
        };
        let Some(context) = self.lookup(handle.correlation_id()) else {
            self.drop_event(handle.correlation_id(), "span");
            return;
        };

        let event = ContextEvent::SpanAnnotate {
            id,
            key: key.to_string(),
            value: value.to_string(),
        };
        self.apply(&context, event, "span");
    }

    /// Record a span the caller timed itself
    pub fn record_span(&self, correlation_id: &str, span: CompletedSpan) -> SpanHandle {
        let Some(context) = self.lookup(correlation_id) else {
            self.drop_event(correlation_id, "span");
            return SpanHandle::detached(Arc::from(correlation_id));
        };

        let Ok(parent) = self.resolve_parent(&context, span.parent.as_ref()) else {
            return SpanHandle::detached(context.shared_id());
        };

        let event = ContextEvent::SpanCompleted {
            name: span.name,
            category: span.category,
            parent,
            start_us: span.start_us,
            duration_us: span.duration_us,
            attributes: span.attributes,
        };
        match self.apply(&context, event, "span") {
            Some(Applied::SpanStarted(id)) => SpanHandle::recording(context.shared_id(), id),
            _ => SpanHandle::detached(context.shared_id()),
        }
    }

    /// Memory sampler adapter.
    ///
    /// Samples for a closed request are kept for `sample_grace_ms` and
    /// forwarded to the persistence sink when the tombstone is flushed.
    pub fn record_memory_sample(&self, correlation_id: &str, sample: MemorySample) {
        if let Some(context) = self.lookup(correlation_id) {
            self.apply(&context, ContextEvent::Memory(sample), "memory");
            return;
        }

        let grace = self.config.load().sample_grace();
        if let Some(mut tombstone) = self.closed.get_mut(correlation_id) {
            if tombstone.closed_at.elapsed() <= grace {
                tombstone.samples.push(sample);
                self.counters.late_samples_accepted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(correlation_id = %correlation_id, "Accepted late memory sample");
                return;
            }
        }

        self.drop_event(correlation_id, "memory");
    }

    /// One reaper sweep as of `now`.
    ///
    /// Contexts idle for `context_grace_seconds` are finalized as abandoned
    /// (or discarded when `finalize_abandoned` is off). Tombstones older than
    /// the sample grace window are flushed to the sink.
    pub fn reap_expired(&self, now: Instant) -> ReapReport {
        let config = self.config.load_full();
        let grace = config.context_grace();
        let mut report = ReapReport::default();

        // Collect first; finalizing removes entries from the map.
        let idle: Vec<Arc<RequestContext>> = self
            .contexts
            .iter()
            .filter(|entry| entry.value().idle_time_at(now) >= grace)
            .map(|entry| entry.value().clone())
            .collect();

        for context in idle {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                correlation_id = %context.correlation_id(),
                path = %context.metadata().path,
                "Reaping abandoned request context"
            );

            if config.finalize_abandoned {
                match self.finalize(&context, Completion::default(), ProfileOutcome::Abandoned) {
                    Ok(_) => report.finalized += 1,
                    Err(ProfilerError::AlreadyFinalizing(_)) => {}
                    Err(e) => {
                        tracing::warn!(
                            correlation_id = %context.correlation_id(),
                            error = %e,
                            "Failed to finalize abandoned context"
                        );
                    }
                }
            } else if context.begin_finalizing().is_ok() {
                let end_us = context.clock().now_us();
                let _ = context.take_snapshot(end_us);
                self.close(&context, false);
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                report.discarded += 1;
            }
        }

        let sample_grace = config.sample_grace();
        report.tombstones_flushed =
            self.flush_tombstones_where(|t| now.saturating_duration_since(t.closed_at) > sample_grace);

        report
    }

    /// Flush every tombstone regardless of age
    pub fn flush_tombstones(&self) -> usize {
        self.flush_tombstones_where(|_| true)
    }

    fn flush_tombstones_where(&self, expired: impl Fn(&Tombstone) -> bool) -> usize {
        let ids: Vec<String> = self
            .closed
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut flushed = 0;
        for id in ids {
            if let Some((id, tombstone)) = self.closed.remove_if(&id, |_, t| expired(t)) {
                flushed += 1;
                if !tombstone.samples.is_empty() {
                    tracing::debug!(
                        correlation_id = %id,
                        count = tombstone.samples.len(),
                        "Forwarding late memory samples"
                    );
                    self.publisher.publish_late_samples(&id, tombstone.samples);
                }
            }
        }
        flushed
    }

    pub fn stats(&self) -> RegistryStats {
        let c = &self.counters;
        RegistryStats {
            active_contexts: self.contexts.len(),
            closed_tombstones: self.closed.len(),
            dropped_events: c.dropped_events.load(Ordering::Relaxed),
            invariant_violations: c.invariant_violations.load(Ordering::Relaxed),
            late_samples_accepted: c.late_samples_accepted.load(Ordering::Relaxed),
            profiles_assembled: c.profiles_assembled.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}
