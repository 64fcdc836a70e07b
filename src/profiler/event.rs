//! Recorded event types
//!
//! Every payload that flows into a request context is one of a closed set
//! of variants with explicit fields, so the analyzer can match on them
//! exhaustively.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

/// Per-request span identifier, assigned sequentially from 1
pub type SpanId = u32;

/// Opaque request metadata supplied by the framework at request start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RequestMetadata {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            view_name: None,
            user_id: None,
        }
    }

    pub fn with_view_name(mut self, view_name: impl Into<String>) -> Self {
        self.view_name = Some(view_name.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Span category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanCategory {
    /// Database work not captured query-by-query
    Db,
    /// Outbound HTTP/API call
    Http,
    /// Database transaction wrapping several queries
    Transaction,
    /// Application checkpoint
    Custom,
}

/// Handle to a span opened with `start_span`.
///
/// The handle carries the correlation id of the request that opened it, so
/// passing it to another request is detected instead of silently
/// mis-attributing the child. A handle whose span was rejected at start is
/// non-recording: ending or annotating it does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanHandle {
    correlation_id: Arc<str>,
    span_id: Option<SpanId>,
}

impl SpanHandle {
    pub(crate) fn recording(correlation_id: Arc<str>, span_id: SpanId) -> Self {
        Self {
            correlation_id,
            span_id: Some(span_id),
        }
    }

    pub(crate) fn detached(correlation_id: Arc<str>) -> Self {
        Self {
            correlation_id,
            span_id: None,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn span_id(&self) -> Option<SpanId> {
        self.span_id
    }

    pub fn is_recording(&self) -> bool {
        self.span_id.is_some()
    }
}

/// One executed query as reported by the ORM hook.
///
/// The raw SQL and parameter digest are reduced to a normalized text and a
/// fingerprint when recorded; literal values are never stored.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub sql: String,
    pub params_digest: String,
    pub duration_us: u64,
    pub call_site: Option<String>,
    /// Explicit start offset; when absent the query is assumed to have
    /// just finished
    pub start_us: Option<u64>,
    pub span: Option<SpanHandle>,
}

impl QueryRecord {
    pub fn new(sql: impl Into<String>, params_digest: impl Into<String>, duration_us: u64) -> Self {
        Self {
            sql: sql.into(),
            params_digest: params_digest.into(),
            duration_us,
            call_site: None,
            start_us: None,
            span: None,
        }
    }

    pub fn with_call_site(mut self, call_site: impl Into<String>) -> Self {
        self.call_site = Some(call_site.into());
        self
    }

    pub fn starting_at(mut self, start_us: u64) -> Self {
        self.start_us = Some(start_us);
        self
    }

    pub fn within(mut self, span: &SpanHandle) -> Self {
        self.span = Some(span.clone());
        self
    }
}

/// A recorded database query. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEvent {
    /// Normalized query text (literals replaced by placeholders)
    pub text: String,
    /// Hash over the parameter digest and any inline literals
    pub fingerprint: String,
    pub start_us: u64,
    pub duration_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_site: Option<String>,
    /// Enclosing span, if the hook knew it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SpanId>,
}

impl QueryEvent {
    pub fn end_us(&self) -> u64 {
        self.start_us.saturating_add(self.duration_us)
    }
}

/// A span whose interval the caller timed itself
#[derive(Debug, Clone)]
pub struct CompletedSpan {
    pub name: String,
    pub category: SpanCategory,
    pub start_us: u64,
    pub duration_us: u64,
    pub parent: Option<SpanHandle>,
    pub attributes: BTreeMap<String, String>,
}

impl CompletedSpan {
    pub fn new(name: impl Into<String>, category: SpanCategory, start_us: u64, duration_us: u64) -> Self {
        Self {
            name: name.into(),
            category,
            start_us,
            duration_us,
            parent: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: &SpanHandle) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A finished span as it appears in a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    pub name: String,
    pub category: SpanCategory,
    pub start_us: u64,
    pub duration_us: u64,
    /// Parent span id; `None` for root spans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SpanId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Still open when the request ended; closed at the request end offset
    #[serde(default)]
    pub unfinished: bool,
}

impl Span {
    pub fn end_us(&self) -> u64 {
        self.start_us.saturating_add(self.duration_us)
    }
}

/// Memory usage reported by the external sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub offset_us: u64,
    pub resident_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_alloc_bytes: Option<u64>,
}

impl MemorySample {
    pub fn new(offset_us: u64, resident_bytes: u64) -> Self {
        Self {
            offset_us,
            resident_bytes,
            peak_alloc_bytes: None,
        }
    }

    pub fn with_peak_alloc(mut self, peak_alloc_bytes: u64) -> Self {
        self.peak_alloc_bytes = Some(peak_alloc_bytes);
        self
    }
}

/// A single entry on a profile's merged timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedEvent {
    Query(QueryEvent),
    Span(Span),
    Memory(MemorySample),
}

impl RecordedEvent {
    pub fn start_us(&self) -> u64 {
        match self {
            Self::Query(q) => q.start_us,
            Self::Span(s) => s.start_us,
            Self::Memory(m) => m.offset_us,
        }
    }
}

static NAMED_PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\([^)]*\)s").expect("valid placeholder regex"));
static SINGLE_QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal regex"));
static DOUBLE_QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*""#).expect("valid quoted regex"));
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid number regex"));
static QUESTION_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?+").expect("valid placeholder run regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// SQL reduced to its shape, plus the literal values that were removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSql {
    pub text: String,
    pub literals: Vec<String>,
}

/// Normalize SQL so that queries differing only in literal values share
/// one text.
pub fn normalize_sql(sql: &str) -> NormalizedSql {
    let mut literals = Vec::new();

    let text = NAMED_PLACEHOLDER_RE.replace_all(sql.trim(), "%s");
    let text = SINGLE_QUOTED_RE.replace_all(&text, |caps: &Captures| {
        literals.push(caps[0].to_string());
        "'S'"
    });
    let text = DOUBLE_QUOTED_RE.replace_all(&text, |caps: &Captures| {
        literals.push(caps[0].to_string());
        "\"S\""
    });
    let text = NUMBER_RE.replace_all(&text, |caps: &Captures| {
        literals.push(caps[0].to_string());
        "N"
    });
    let text = QUESTION_RUN_RE.replace_all(&text, "?");
    let text = WHITESPACE_RE.replace_all(&text, " ");

    NormalizedSql {
        text: text.to_lowercase(),
        literals,
    }
}

/// Fingerprint over the hook's parameter digest and inline literals.
///
/// Two queries with the same normalized text and fingerprint are the same
/// query executed twice.
pub fn parameter_fingerprint(params_digest: &str, literals: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params_digest.as_bytes());
    for literal in literals {
        hasher.update([0x1f]);
        hasher.update(literal.as_bytes());
    }
    let digest = hasher.finalize();

    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Truncate to at most `max` characters on a char boundary
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
