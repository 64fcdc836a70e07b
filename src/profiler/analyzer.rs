//! Post-hoc analysis of a finished request's events
//!
//! `analyze` is a pure function: the same ordered events and configuration
//! always produce the same diagnostics in the same order.
//!
//! ## N+1 adjacency rule
//!
//! Queries are grouped by normalized text, ignoring the fingerprint. Each
//! group is walked in start order and split into runs: a query joins the
//! current run when the gap between the previous member's end and its own
//! start is at most `n_query_max_gap_us` (overlapping queries have a gap of
//! zero). A run is reported when it is longer than `n_query_threshold` and
//! is not wrapped by a single transaction span, i.e. its members do not all
//! name the same enclosing span of category `transaction`.

use super::clock::ms_to_us;
use super::event::{MemorySample, QueryEvent, Span, SpanCategory, SpanId};
use super::profile::{Diagnostic, DiagnosticKind, Severity, SlowReason, Summary};
use crate::config::ProfilerConfig;
use std::collections::HashMap;

const DUPLICATE_CRITICAL_COUNT: usize = 5;
const DUPLICATE_WARNING_COUNT: usize = 3;
const SUMMARY_TEXT_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    pub n_query_threshold: usize,
    pub n_query_max_gap_us: u64,
    pub slow_query_us: u64,
    pub slow_relative_pct: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self::from(&ProfilerConfig::default())
    }
}

impl From<&ProfilerConfig> for AnalyzerConfig {
    fn from(cfg: &ProfilerConfig) -> Self {
        Self {
            n_query_threshold: cfg.n_query_threshold,
            n_query_max_gap_us: ms_to_us(cfg.n_query_max_gap_ms),
            slow_query_us: ms_to_us(cfg.slow_query_ms),
            slow_relative_pct: cfg.slow_span_relative_pct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub diagnostics: Vec<Diagnostic>,
    pub summary: Summary,
}

/// Analyze one request.
///
/// `queries` and `spans` must already be ordered by start offset (ties in
/// recording order); diagnostic indices refer to positions in `queries`.
/// `request_end_us` is the explicit end signal. Hooks may report
/// caller-timed events that end after it, so the total duration is the
/// later of the two.
pub fn analyze(
    queries: &[QueryEvent],
    spans: &[Span],
    samples: &[MemorySample],
    request_end_us: Option<u64>,
    config: &AnalyzerConfig,
) -> Analysis {
    let latest_end_us = latest_event_end(queries, spans, samples);
    let total_duration_us = request_end_us.map_or(latest_end_us, |end_us| end_us.max(latest_end_us));

    let mut findings: Vec<(u64, Diagnostic)> = Vec::new();

    let exact_groups = group_by(queries, |q| (q.text.as_str(), q.fingerprint.as_str()));
    let mut duplicate_count = 0;
    for members in exact_groups.iter().filter(|m| m.len() > 1) {
        duplicate_count += members.len() - 1;
        findings.push((
            queries[members[0]].start_us,
            duplicate_diagnostic(queries, members, config),
        ));
    }

    let spans_by_id: HashMap<SpanId, &Span> = spans.iter().map(|s| (s.id, s)).collect();
    for members in group_by(queries, |q| q.text.as_str()) {
        for run in split_runs(queries, &members, config.n_query_max_gap_us) {
            if run.len() > config.n_query_threshold
                && !wrapped_in_transaction(queries, &run, &spans_by_id)
            {
                findings.push((queries[run[0]].start_us, n_plus_one_diagnostic(queries, run, config)));
            }
        }
    }

    for (idx, query) in queries.iter().enumerate() {
        let reasons = slow_reasons(query.duration_us, total_duration_us, config);
        if !reasons.is_empty() {
            findings.push((
                query.start_us,
                Diagnostic {
                    kind: DiagnosticKind::SlowQuery,
                    severity: slow_severity(&reasons),
                    summary: format!(
                        "Slow query ({}): {}",
                        format_ms(query.duration_us),
                        shorten(&query.text)
                    ),
                    query_indices: vec![idx],
                    span_ids: Vec::new(),
                    reasons,
                },
            ));
        }
    }

    for span in spans {
        let reasons = slow_reasons(span.duration_us, total_duration_us, config);
        if !reasons.is_empty() {
            findings.push((
                span.start_us,
                Diagnostic {
                    kind: DiagnosticKind::SlowSpan,
                    severity: slow_severity(&reasons),
                    summary: format!("Slow span '{}' ({})", span.name, format_ms(span.duration_us)),
                    query_indices: Vec::new(),
                    span_ids: vec![span.id],
                    reasons,
                },
            ));
        }
    }

    // Stable: ties on start offset keep emission order.
    findings.sort_by_key(|(start_us, _)| *start_us);

    let summary = Summary {
        total_queries: queries.len(),
        total_query_time_us: queries.iter().map(|q| q.duration_us).sum(),
        distinct_queries: exact_groups.len(),
        duplicate_count,
        total_spans: spans.len(),
        total_duration_us,
        peak_resident_bytes: samples.iter().map(|s| s.resident_bytes).max(),
    };

    Analysis {
        diagnostics: findings.into_iter().map(|(_, d)| d).collect(),
        summary,
    }
}

/// Group query indices by key, groups in order of first appearance
fn group_by<'a, K, F>(queries: &'a [QueryEvent], key: F) -> Vec<Vec<usize>>
where
    K: std::hash::Hash + Eq,
    F: Fn(&'a QueryEvent) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (idx, query) in queries.iter().enumerate() {
        let slot = *positions.entry(key(query)).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(idx);
    }

    groups
}

fn split_runs(queries: &[QueryEvent], members: &[usize], max_gap_us: u64) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for &idx in members {
        if let Some(&prev) = current.last() {
            let gap = queries[idx].start_us.saturating_sub(queries[prev].end_us());
            if gap > max_gap_us {
                runs.push(std::mem::take(&mut current));
            }
        }
        current.push(idx);
    }
    if !current.is_empty() {
        runs.push(current);
    }

    runs
}

fn wrapped_in_transaction(
    queries: &[QueryEvent],
    run: &[usize],
    spans_by_id: &HashMap<SpanId, &Span>,
) -> bool {
    let Some(first_span) = queries[run[0]].span else {
        return false;
    };
    if !run.iter().all(|&idx| queries[idx].span == Some(first_span)) {
        return false;
    }
    spans_by_id
        .get(&first_span)
        .is_some_and(|span| span.category == SpanCategory::Transaction)
}

fn duplicate_diagnostic(queries: &[QueryEvent], members: &[usize], config: &AnalyzerConfig) -> Diagnostic {
    let count = members.len();
    let total_us: u64 = members.iter().map(|&idx| queries[idx].duration_us).sum();

    let severity = if count >= DUPLICATE_CRITICAL_COUNT || total_us >= config.slow_query_us {
        Severity::Critical
    } else if count >= DUPLICATE_WARNING_COUNT {
        Severity::Warning
    } else {
        Severity::Info
    };

    Diagnostic {
        kind: DiagnosticKind::DuplicateQuery,
        severity,
        summary: format!(
            "Query executed {} times with identical parameters ({} total): {}",
            count,
            format_ms(total_us),
            shorten(&queries[members[0]].text)
        ),
        query_indices: members.to_vec(),
        span_ids: Vec::new(),
        reasons: Vec::new(),
    }
}

fn n_plus_one_diagnostic(queries: &[QueryEvent], run: Vec<usize>, config: &AnalyzerConfig) -> Diagnostic {
    let severity = if run.len() >= config.n_query_threshold.saturating_mul(2) {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let total_us: u64 = run.iter().map(|&idx| queries[idx].duration_us).sum();

    Diagnostic {
        kind: DiagnosticKind::NPlusOne,
        severity,
        summary: format!(
            "Possible N+1: {} similar queries in a row ({} total): {}",
            run.len(),
            format_ms(total_us),
            shorten(&queries[run[0]].text)
        ),
        query_indices: run,
        span_ids: Vec::new(),
        reasons: Vec::new(),
    }
}

fn slow_reasons(duration_us: u64, total_duration_us: u64, config: &AnalyzerConfig) -> Vec<SlowReason> {
    let mut reasons = Vec::new();
    if duration_us > config.slow_query_us {
        reasons.push(SlowReason::Absolute);
    }
    if total_duration_us > 0
        && duration_us > 0
        && duration_us as f64 >= config.slow_relative_pct * total_duration_us as f64
    {
        reasons.push(SlowReason::Relative);
    }
    reasons
}

fn slow_severity(reasons: &[SlowReason]) -> Severity {
    if reasons.len() > 1 {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

fn latest_event_end(queries: &[QueryEvent], spans: &[Span], samples: &[MemorySample]) -> u64 {
    let query_end = queries.iter().map(QueryEvent::end_us).max().unwrap_or(0);
    let span_end = spans.iter().map(Span::end_us).max().unwrap_or(0);
    let sample_end = samples.iter().map(|s| s.offset_us).max().unwrap_or(0);
    query_end.max(span_end).max(sample_end)
}

fn format_ms(us: u64) -> String {
    format!("{:.1}ms", us as f64 / 1000.0)
}

fn shorten(text: &str) -> String {
    if text.chars().count() > SUMMARY_TEXT_LEN {
        format!("{}...", super::event::truncate_chars(text, SUMMARY_TEXT_LEN))
    } else {
        text.to_string()
    }
}
