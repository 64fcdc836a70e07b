//! The immutable profile record handed to subscribers and sinks

use super::event::{MemorySample, QueryEvent, RecordedEvent, RequestMetadata, Span, SpanId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    NPlusOne,
    DuplicateQuery,
    SlowQuery,
    SlowSpan,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NPlusOne => "n_plus_one",
            Self::DuplicateQuery => "duplicate_query",
            Self::SlowQuery => "slow_query",
            Self::SlowSpan => "slow_span",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Which threshold rule flagged a slow event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowReason {
    /// Longer than the absolute threshold
    Absolute,
    /// At least the configured share of the whole request
    Relative,
}

/// A finding derived from a profile's events. Never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub summary: String,
    /// Indices into `Profile::queries`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_indices: Vec<usize>,
    /// Ids from `Profile::spans`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub span_ids: Vec<SpanId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<SlowReason>,
}

/// Counters computed alongside the diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total_queries: usize,
    pub total_query_time_us: u64,
    pub distinct_queries: usize,
    /// Sum over duplicate groups of `count - 1`
    pub duplicate_count: usize,
    pub total_spans: usize,
    pub total_duration_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_resident_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileOutcome {
    /// Ended through the framework's end-of-request hook
    Completed,
    /// Reclaimed by the reaper after going idle
    Abandoned,
}

/// Terminal record for one request. Owns all of its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub correlation_id: String,
    pub metadata: RequestMetadata,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub outcome: ProfileOutcome,
    pub total_duration_us: u64,
    /// Ordered by start offset, ties in recording order
    pub queries: Vec<QueryEvent>,
    /// Ordered by start offset; parents are referenced by id
    pub spans: Vec<Span>,
    pub memory_samples: Vec<MemorySample>,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: Summary,
    /// Events that arrived after finalizing began, plus any excluded as
    /// malformed during assembly
    pub dropped_events: u64,
}

impl Profile {
    pub fn is_error(&self) -> bool {
        self.status_code.is_some_and(|code| code >= 400)
    }

    pub fn span(&self, id: SpanId) -> Option<&Span> {
        self.spans.iter().find(|s| s.id == id)
    }

    pub fn root_spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(|s| s.parent.is_none())
    }

    pub fn children(&self, id: SpanId) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(move |s| s.parent == Some(id))
    }

    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }

    /// Every recorded event merged into one list ordered by start offset.
    /// Ties keep queries before spans before samples.
    pub fn timeline(&self) -> Vec<RecordedEvent> {
        let mut events: Vec<RecordedEvent> = self
            .queries
            .iter()
            .cloned()
            .map(RecordedEvent::Query)
            .chain(self.spans.iter().cloned().map(RecordedEvent::Span))
            .chain(self.memory_samples.iter().copied().map(RecordedEvent::Memory))
            .collect();
        events.sort_by_key(RecordedEvent::start_us);
        events
    }

    pub fn to_summary(&self) -> ProfileSummary {
        ProfileSummary {
            correlation_id: self.correlation_id.clone(),
            started_at: self.started_at,
            method: self.metadata.method.clone(),
            path: self.metadata.path.clone(),
            view_name: self.metadata.view_name.clone(),
            status_code: self.status_code,
            is_error: self.is_error(),
            outcome: self.outcome,
            duration_us: self.total_duration_us,
            query_count: self.summary.total_queries,
            query_time_us: self.summary.total_query_time_us,
            diagnostic_count: self.diagnostics.len(),
            peak_resident_bytes: self.summary.peak_resident_bytes,
        }
    }
}

/// Dashboard projection of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub is_error: bool,
    pub outcome: ProfileOutcome,
    pub duration_us: u64,
    pub query_count: usize,
    pub query_time_us: u64,
    pub diagnostic_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_resident_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::event::SpanCategory;
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

    fn profile() -> Profile {
        Profile {
            correlation_id: "r1".to_string(),
            metadata: RequestMetadata::new("GET", "/"),
            started_at: Utc::now(),
            status_code: Some(500),
            outcome: ProfileOutcome::Completed,
            total_duration_us: 100,
            queries: vec![QueryEvent {
                text: "select n".to_string(),
                fingerprint: "ab".to_string(),
                start_us: 15,
                duration_us: 2,
                call_site: None,
                span: Some(1),
            }],
            spans: vec![span(1, None, 0), span(2, Some(1), 5), span(3, Some(1), 20)],
            memory_samples: vec![MemorySample::new(15, 4096)],
            diagnostics: Vec::new(),
            summary: Summary::default(),
            dropped_events: 0,
        }
    }

    #[test]
    fn test_span_tree_navigation() {
        let profile = profile();
        assert_eq!(profile.root_spans().count(), 1);
        let children: Vec<SpanId> = profile.children(1).map(|s| s.id).collect();
        assert_eq!(children, vec![2, 3]);
        assert!(profile.span(4).is_none());
    }

    #[test]
    fn test_timeline_is_ordered() {
        let timeline = profile().timeline();
        let starts: Vec<u64> = timeline.iter().map(RecordedEvent::start_us).collect();
        assert_eq!(starts, vec![0, 5, 15, 15, 20]);
        assert!(matches!(timeline[2], RecordedEvent::Query(_)));
        assert!(matches!(timeline[3], RecordedEvent::Memory(_)));
    }

    #[test]
    fn test_summary_projection() {
        let summary = profile().to_summary();
        assert!(summary.is_error);
        assert_eq!(summary.correlation_id, "r1");
        assert_eq!(summary.path, "/");
    }

    #[test]
    fn test_profile_serializes_with_tags() {
        let json = serde_json::to_value(profile()).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["spans"][0]["category"], "custom");
        let back: Profile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile_with_same_time(&back));
    }

    fn profile_with_same_time(other: &Profile) -> Profile {
        let mut p = profile();
        p.started_at = other.started_at;
        p
    }
}
