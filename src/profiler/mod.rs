//! Request profiling and analysis engine
//!
//! This module provides:
//! - Per-request contexts keyed by correlation id
//! - Query, span and memory-sample recorders
//! - Post-hoc analysis (N+1, duplicate and slow-event detection)
//! - Immutable profile assembly and non-blocking publication
//! - SQLite persistence for history and export

pub mod analyzer;
pub mod assembler;
pub mod clock;
pub mod context;
pub mod event;
pub mod profile;
pub mod publisher;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod sink;
pub mod store;

pub use analyzer::{analyze, Analysis, AnalyzerConfig};
pub use assembler::Completion;
pub use clock::EventClock;
pub use context::{ContextState, RequestContext};
pub use event::{
    CompletedSpan, MemorySample, QueryEvent, QueryRecord, RecordedEvent, RequestMetadata, Span, SpanCategory,
    SpanHandle, SpanId,
};
pub use profile::{Diagnostic, DiagnosticKind, Profile, ProfileOutcome, ProfileSummary, Severity, SlowReason, Summary};
pub use publisher::{PersistenceSettings, Publisher, PublisherStats, Subscription};
pub use registry::{ContextRegistry, ReapReport, RegistryStats};
pub use service::{Profiler, ProfilerStats};
pub use sink::{MemorySink, ProfileSink};
pub use store::{DashboardStats, ProfileFilter, SqliteProfileStore, StatusFilter};
