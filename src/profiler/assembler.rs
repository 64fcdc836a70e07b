//! Builds the final immutable `Profile` from a drained context snapshot

use super::analyzer::Analysis;
use super::context::ContextSnapshot;
use super::event::SpanId;
use super::profile::{Profile, ProfileOutcome};
use crate::error::ProfilerError;
use std::collections::HashSet;

/// How the request finished, as reported by the end-of-request hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub status_code: Option<u16>,
}

impl Completion {
    pub fn with_status(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
        }
    }
}

/// Put a snapshot's events into profile order and drop malformed spans.
///
/// Queries and spans are stably sorted by start offset. Spans whose parent
/// is missing (or was itself dropped) are excluded, and queries pointing at
/// an excluded span lose the reference. Returns the number of excluded
/// spans.
pub fn order_events(snapshot: &mut ContextSnapshot) -> u64 {
    let mut valid: HashSet<SpanId> = HashSet::with_capacity(snapshot.spans.len());
    let before = snapshot.spans.len();

    // Ids are assigned in creation order and a parent always exists before
    // its children, so one pass in id order settles every ancestor chain.
    snapshot.spans.sort_by_key(|s| s.id);
    snapshot.spans.retain(|span| {
        let ok = span.parent.map_or(true, |parent| valid.contains(&parent));
        if ok {
            valid.insert(span.id);
        } else {
            tracing::warn!(
                correlation_id = %snapshot.correlation_id,
                span_id = span.id,
                parent = ?span.parent,
                "Excluding span with broken parent chain"
            );
        }
        ok
    });
    let excluded = (before - snapshot.spans.len()) as u64;

    for query in &mut snapshot.queries {
        if query.span.is_some_and(|id| !valid.contains(&id)) {
            query.span = None;
        }
    }

    snapshot.queries.sort_by_key(|q| q.start_us);
    snapshot.spans.sort_by_key(|s| s.start_us);
    snapshot.samples.sort_by_key(|s| s.offset_us);

    excluded
}

/// Assemble the profile.
///
/// The snapshot was drained out of the live context, so the profile shares
/// no buffers with it. Fails only when the analysis refers to events that
/// do not exist, which indicates a bug rather than bad input.
pub fn assemble(
    snapshot: ContextSnapshot,
    analysis: Analysis,
    completion: Completion,
    outcome: ProfileOutcome,
    excluded_events: u64,
) -> Result<Profile, ProfilerError> {
    let span_ids: HashSet<SpanId> = snapshot.spans.iter().map(|s| s.id).collect();

    for span in &snapshot.spans {
        if let Some(parent) = span.parent {
            if !span_ids.contains(&parent) {
                return Err(ProfilerError::InvariantViolation(format!(
                    "span {} references missing parent {}",
                    span.id, parent
                )));
            }
        }
    }

    for diagnostic in &analysis.diagnostics {
        if let Some(&idx) = diagnostic.query_indices.iter().find(|&&idx| idx >= snapshot.queries.len()) {
            return Err(ProfilerError::InvariantViolation(format!(
                "diagnostic {} references query {} of {}",
                diagnostic.kind.as_str(),
                idx,
                snapshot.queries.len()
            )));
        }
        if let Some(id) = diagnostic.span_ids.iter().find(|id| !span_ids.contains(id)) {
            return Err(ProfilerError::InvariantViolation(format!(
                "diagnostic {} references missing span {}",
                diagnostic.kind.as_str(),
                id
            )));
        }
    }

    Ok(Profile {
        correlation_id: snapshot.correlation_id,
        metadata: snapshot.metadata,
        started_at: snapshot.started_at,
        status_code: completion.status_code,
        outcome,
        total_duration_us: analysis.summary.total_duration_us,
        queries: snapshot.queries,
        spans: snapshot.spans,
        memory_samples: snapshot.samples,
        diagnostics: analysis.diagnostics,
        summary: analysis.summary,
        dropped_events: snapshot.dropped_events + excluded_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::analyzer::{analyze, AnalyzerConfig};
    use crate::profiler::event::{QueryEvent, RequestMetadata, Span, SpanCategory};
    use crate::profiler::profile::{Diagnostic, DiagnosticKind, Severity};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn span(id: SpanId, parent: Option<SpanId>, start_us: u64) -> Span {
        Span {
            id,
            name: format!("span-{}", id),
            category: SpanCategory::Custom,
            start_us,
            duration_us: 10,
            parent,
            attributes: BTreeMap::new(),
            unfinished: false,
        }
    }

    fn query(start_us: u64, span: Option<SpanId>) -> QueryEvent {
        QueryEvent {
            text: format!("select {}", start_us),
            fingerprint: "f".to_string(),
            start_us,
            duration_us: 1,
            call_site: None,
            span,
        }
    }

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            correlation_id: "r1".to_string(),
            metadata: RequestMetadata::new("GET", "/"),
            started_at: Utc::now(),
            end_us: 100,
            queries: vec![query(30, Some(2)), query(10, None), query(30, Some(3))],
            spans: vec![span(1, None, 0), span(2, Some(1), 20), span(3, Some(9), 5), span(4, Some(3), 6)],
            samples: Vec::new(),
            dropped_events: 1,
        }
    }

    #[test]
    fn test_order_events_sorts_and_excludes_broken_chains() {
        let mut snap = snapshot();
        let excluded = order_events(&mut snap);

        assert_eq!(excluded, 2);
        let ids: Vec<SpanId> = snap.spans.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let starts: Vec<u64> = snap.queries.iter().map(|q| q.start_us).collect();
        assert_eq!(starts, vec![10, 30, 30]);
        assert_eq!(snap.queries[1].span, Some(2));
        assert_eq!(snap.queries[2].span, None);
    }

    #[test]
    fn test_assemble_moves_everything_into_profile() {
        let mut snap = snapshot();
        let excluded = order_events(&mut snap);
        let analysis = analyze(&snap.queries, &snap.spans, &snap.samples, Some(snap.end_us), &AnalyzerConfig::default());

        let profile = assemble(snap, analysis, Completion::with_status(200), ProfileOutcome::Completed, excluded).unwrap();

        assert_eq!(profile.correlation_id, "r1");
        assert_eq!(profile.status_code, Some(200));
        assert_eq!(profile.total_duration_us, 100);
        assert_eq!(profile.queries.len(), 3);
        assert_eq!(profile.spans.len(), 2);
        assert_eq!(profile.dropped_events, 3);
    }

    #[test]
    fn test_assemble_rejects_dangling_diagnostic() {
        let mut snap = snapshot();
        order_events(&mut snap);
        let mut analysis = analyze(&snap.queries, &snap.spans, &[], None, &AnalyzerConfig::default());
        analysis.diagnostics.push(Diagnostic {
            kind: DiagnosticKind::SlowQuery,
            severity: Severity::Warning,
            summary: String::new(),
            query_indices: vec![42],
            span_ids: Vec::new(),
            reasons: Vec::new(),
        });

        let result = assemble(snap, analysis, Completion::default(), ProfileOutcome::Completed, 0);
        assert!(matches!(result, Err(ProfilerError::InvariantViolation(_))));
    }
}
