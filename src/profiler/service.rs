//! Process-scoped profiler service
//!
//! `Profiler` owns the registry, the publisher and the background tasks.
//! Framework adapters call the `on_*` hooks; none of them can fail the
//! request being profiled.

use super::assembler::Completion;
use super::event::{CompletedSpan, MemorySample, QueryRecord, RequestMetadata, SpanCategory, SpanHandle};
use super::profile::Profile;
use super::publisher::{PersistenceSettings, Publisher, PublisherStats, Subscription};
use super::reaper::spawn_reaper_task;
use super::registry::{ContextRegistry, RegistryStats};
use super::sink::ProfileSink;
use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProfilerStats {
    pub enabled: bool,
    pub registry: RegistryStats,
    pub publisher: PublisherStats,
}

pub struct Profiler {
    registry: Arc<ContextRegistry>,
    publisher: Arc<Publisher>,
    shutdown_tx: broadcast::Sender<()>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Profiler {
    /// Start the profiler with default persistence settings.
    ///
    /// Must be called inside a tokio runtime: it spawns the reaper and, when
    /// a sink is given, the persistence task.
    pub fn init(config: ProfilerConfig, sink: Option<Arc<dyn ProfileSink>>) -> Arc<Self> {
        Self::init_with(config, sink, PersistenceSettings::default())
    }

    pub fn init_with(
        config: ProfilerConfig,
        sink: Option<Arc<dyn ProfileSink>>,
        settings: PersistenceSettings,
    ) -> Arc<Self> {
        let publisher = Arc::new(match sink {
            Some(sink) => Publisher::with_sink(config.subscriber_queue_depth, sink, settings),
            None => Publisher::new(config.subscriber_queue_depth),
        });

        let reaper_interval = config.reaper_interval();
        let registry = Arc::new(ContextRegistry::new(config, publisher.clone()));

        let (shutdown_tx, _) = broadcast::channel(1);
        let reaper = spawn_reaper_task(registry.clone(), reaper_interval, shutdown_tx.subscribe());

        tracing::info!(
            enabled = registry.is_enabled(),
            reaper_interval_secs = reaper_interval.as_secs(),
            "Profiler started"
        );

        Arc::new(Self {
            registry,
            publisher,
            shutdown_tx,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    pub fn config(&self) -> Arc<ProfilerConfig> {
        self.registry.config()
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.registry.set_enabled(enabled);
        tracing::info!(enabled = enabled, "Profiler toggled");
    }

    /// False when disabled or when `path` falls under an excluded prefix
    pub fn should_profile(&self, path: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let config = self.registry.config();
        !config
            .excluded_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Request-start hook. Returns whether the request is being profiled.
    pub fn on_request_start(&self, correlation_id: &str, metadata: RequestMetadata) -> bool {
        match self.try_request_start(correlation_id, metadata) {
            Ok(profiling) => profiling,
            Err(e) => {
                tracing::warn!(correlation_id = %correlation_id, error = %e, "Could not start profiling request");
                false
            }
        }
    }

    /// Like `on_request_start`, but reports why a context could not be
    /// opened. `Ok(false)` means the request is deliberately not profiled
    /// (disabled or excluded path).
    pub fn try_request_start(&self, correlation_id: &str, metadata: RequestMetadata) -> Result<bool, ProfilerError> {
        if !self.should_profile(&metadata.path) {
            return Ok(false);
        }

        match self.registry.begin(correlation_id, metadata) {
            Ok(_) => Ok(true),
            Err(ProfilerError::Disabled) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Request-end hook. Returns the published profile, if there was one.
    pub fn on_request_end(&self, correlation_id: &str, completion: Completion) -> Option<Arc<Profile>> {
        match self.registry.end_with(correlation_id, completion) {
            Ok(profile) => Some(profile),
            Err(ProfilerError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!(correlation_id = %correlation_id, error = %e, "Could not finalize request profile");
                None
            }
        }
    }

    pub fn on_query(&self, correlation_id: &str, record: QueryRecord) {
        self.registry.record_query(correlation_id, record);
    }

    pub fn start_span(
        &self,
        correlation_id: &str,
        name: &str,
        category: SpanCategory,
        parent: Option<&SpanHandle>,
    ) -> SpanHandle {
        self.registry.start_span(correlation_id, name, category, parent)
    }

    pub fn end_span(&self, handle: &SpanHandle) {
        self.registry.end_span(handle);
    }

    pub fn annotate_span(&self, handle: &SpanHandle, key: &str, value: &str) {
        self.registry.annotate_span(handle, key, value);
    }

    pub fn record_span(&self, correlation_id: &str, span: CompletedSpan) -> SpanHandle {
        self.registry.record_span(correlation_id, span)
    }

    pub fn on_memory_sample(&self, correlation_id: &str, sample: MemorySample) {
        self.registry.record_memory_sample(correlation_id, sample);
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Apply new thresholds without a restart
    pub fn reload_config(&self, config: ProfilerConfig) {
        self.publisher.set_subscriber_queue_depth(config.subscriber_queue_depth);
        self.registry.update_config(config);
        tracing::info!("Profiler configuration reloaded");
    }

    pub fn stats(&self) -> ProfilerStats {
        ProfilerStats {
            enabled: self.is_enabled(),
            registry: self.registry.stats(),
            publisher: self.publisher.stats(),
        }
    }

    /// Stop the reaper, flush late samples and drain persistence.
    ///
    /// Requests still in flight are not finalized.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Reaper task failed");
            }
        }

        let flushed = self.registry.flush_tombstones();
        self.publisher.shutdown().await;

        tracing::info!(
            in_flight = self.registry.active_count(),
            tombstones_flushed = flushed,
            "Profiler shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::sink::MemorySink;

    #[tokio::test]
    async fn test_excluded_paths_are_not_profiled() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);

        assert!(!profiler.on_request_start("r1", RequestMetadata::new("GET", "/static/app.js")));
        assert!(!profiler.on_request_start("r2", RequestMetadata::new("GET", "/__monitor__/stream")));
        assert!(profiler.on_request_start("r3", RequestMetadata::new("GET", "/items")));
        assert_eq!(profiler.registry().active_count(), 1);

        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_toggle_disables_new_requests() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);
        profiler.set_enabled(false);

        assert!(!profiler.on_request_start("r1", RequestMetadata::new("GET", "/items")));
        assert!(profiler.on_request_end("r1", Completion::default()).is_none());

        profiler.set_enabled(true);
        assert!(profiler.on_request_start("r1", RequestMetadata::new("GET", "/items")));
        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_reports_false() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);
        assert!(profiler.on_request_start("r1", RequestMetadata::new("GET", "/a")));
        assert!(!profiler.on_request_start("r1", RequestMetadata::new("GET", "/b")));
        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_try_request_start_reports_collision() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);

        assert_eq!(profiler.try_request_start("r1", RequestMetadata::new("GET", "/a")), Ok(true));
        assert_eq!(
            profiler.try_request_start("r1", RequestMetadata::new("GET", "/b")),
            Err(ProfilerError::DuplicateContext("r1".to_string()))
        );
        assert_eq!(profiler.try_request_start("r2", RequestMetadata::new("GET", "/static/x.css")), Ok(false));
        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_to_end_with_sink() {
        let sink = Arc::new(MemorySink::new());
        let profiler = Profiler::init(ProfilerConfig::default(), Some(sink.clone()));
        let mut sub = profiler.subscribe();

        assert!(profiler.on_request_start("r1", RequestMetadata::new("GET", "/items")));
        profiler.on_query("r1", QueryRecord::new("SELECT 1", "", 10));
        let span = profiler.start_span("r1", "render", SpanCategory::Custom, None);
        profiler.end_span(&span);
        let profile = profiler.on_request_end("r1", Completion::with_status(200)).unwrap();

        assert_eq!(sub.recv().await.unwrap().correlation_id, profile.correlation_id);

        profiler.on_memory_sample("r1", MemorySample::new(1, 64));
        profiler.shutdown().await;

        assert_eq!(sink.profiles().len(), 1);
        assert_eq!(sink.late_samples().len(), 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reload_config() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);
        profiler.reload_config(ProfilerConfig {
            slow_query_ms: 5,
            ..ProfilerConfig::default()
        });

        assert_eq!(profiler.config().slow_query_ms, 5);
        profiler.shutdown().await;
    }
}
