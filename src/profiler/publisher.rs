//! Fan-out of finished profiles
//!
//! Live subscribers each get a bounded queue that drops the oldest profile
//! when full, so the dashboard always sees the freshest data. Persistence
//! goes through a bounded channel into a background task that batches
//! writes and retries failed batches with backoff, in the same way the
//! observability writer batches log rows.
//!
//! `publish` never awaits. When the persistence channel is full the record
//! is handed to a background send that waits up to `enqueue_timeout` for
//! room; at most `overflow_limit` such sends are pending at once. Only a
//! record that cannot get in within that bound is discarded.

use super::event::MemorySample;
use super::profile::Profile;
use super::sink::ProfileSink;
use crate::config::PersistenceConfig;
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Settings for the background persistence task
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub queue_depth: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// How long a record may wait for room in a full channel
    pub enqueue_timeout: Duration,
    /// Records allowed to wait for room at the same time
    pub overflow_limit: usize,
}

impl From<&PersistenceConfig> for PersistenceSettings {
    fn from(cfg: &PersistenceConfig) -> Self {
        Self {
            queue_depth: cfg.queue_depth.max(1),
            batch_size: cfg.batch_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms.max(1)),
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            enqueue_timeout: Duration::from_millis(cfg.enqueue_timeout_ms),
            overflow_limit: cfg.overflow_depth,
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub subscribers: usize,
    pub subscriber_drops: u64,
    pub persistence_enqueued: u64,
    pub persisted: u64,
    pub persistence_failures: u64,
    pub persistence_discarded: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    subscriber_drops: AtomicU64,
    persistence_enqueued: AtomicU64,
    persisted: AtomicU64,
    persistence_failures: AtomicU64,
    persistence_discarded: AtomicU64,
    overflow_pending: AtomicUsize,
}

impl Counters {
    fn record_enqueued(&self, is_profile: bool) {
        if is_profile {
            self.persistence_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_discarded(&self, is_profile: bool) {
        if is_profile {
            self.persistence_discarded.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_persistence_discarded(1);
        }
    }
}

/// Bounded wait for room in a full persistence channel
struct Overflow {
    runtime: Handle,
    timeout: Duration,
    limit: usize,
}

enum SinkMessage {
    Profile(Arc<Profile>),
    LateSamples {
        correlation_id: String,
        samples: Vec<MemorySample>,
    },
}

struct SubscriberQueue {
    buffer: Mutex<VecDeque<Arc<Profile>>>,
    depth: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(depth: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns true when an older profile had to be dropped
    fn push(&self, profile: Arc<Profile>) -> bool {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let overflowed = buffer.len() >= self.depth;
        if overflowed {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(profile);
        drop(buffer);

        self.notify.notify_one();
        overflowed
    }

    fn pop(&self) -> Option<Arc<Profile>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct Shared {
    subscribers: DashMap<u64, Arc<SubscriberQueue>>,
    next_id: AtomicU64,
    queue_depth: AtomicUsize,
    counters: Arc<Counters>,
}

/// Live-stream subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next profile. Returns `None` once the publisher has
    /// shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<Profile>> {
        loop {
            if let Some(profile) = self.queue.pop() {
                return Some(profile);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Profile>> {
        self.queue.pop()
    }

    /// Profiles dropped from this subscription's queue because it was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.remove(&self.id);
            tracing::debug!(subscriber_id = self.id, "Subscriber removed");
        }
    }
}

pub struct Publisher {
    shared: Arc<Shared>,
    sender: ArcSwapOption<mpsc::Sender<SinkMessage>>,
    overflow: Option<Overflow>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Publisher with live subscribers only
    pub fn new(subscriber_queue_depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                queue_depth: AtomicUsize::new(subscriber_queue_depth.max(1)),
                counters: Arc::new(Counters::default()),
            }),
            sender: ArcSwapOption::empty(),
            overflow: None,
            worker: Mutex::new(None),
        }
    }

    /// Publisher that also persists every profile through `sink`.
    ///
    /// Spawns the persistence task, so it must be called inside a tokio
    /// runtime.
    pub fn with_sink(
        subscriber_queue_depth: usize,
        sink: Arc<dyn ProfileSink>,
        settings: PersistenceSettings,
    ) -> Self {
        let mut publisher = Self::new(subscriber_queue_depth);
        let (tx, rx) = mpsc::channel(settings.queue_depth);
        let counters = publisher.shared.counters.clone();
        publisher.overflow = Some(Overflow {
            runtime: Handle::current(),
            timeout: settings.enqueue_timeout,
            limit: settings.overflow_limit,
        });

        let handle = tokio::spawn(async move {
            sink_task(sink, rx, settings, counters).await;
        });

        publisher.sender.store(Some(Arc::new(tx)));
        *publisher.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        publisher
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.shared.queue_depth.load(Ordering::Relaxed)));
        self.shared.subscribers.insert(id, queue.clone());

        tracing::debug!(subscriber_id = id, "Subscriber registered");

        Subscription {
            id,
            queue,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Queue depth for subscriptions created from now on
    pub fn set_subscriber_queue_depth(&self, depth: usize) {
        self.shared.queue_depth.store(depth.max(1), Ordering::Relaxed);
    }

    /// Deliver a profile to every subscriber and enqueue it for persistence.
    pub fn publish(&self, profile: Arc<Profile>) {
        let counters = &self.shared.counters;
        counters.published.fetch_add(1, Ordering::Relaxed);

        for entry in self.shared.subscribers.iter() {
            if entry.value().push(profile.clone()) {
                counters.subscriber_drops.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_subscriber_drop();
            }
        }

        self.enqueue(SinkMessage::Profile(profile));
    }

    /// Forward memory samples that arrived after a profile was published
    pub fn publish_late_samples(&self, correlation_id: &str, samples: Vec<MemorySample>) {
        if samples.is_empty() {
            return;
        }
        self.enqueue(SinkMessage::LateSamples {
            correlation_id: correlation_id.to_string(),
            samples,
        });
    }

    fn enqueue(&self, message: SinkMessage) {
        let guard = self.sender.load();
        let Some(sender) = guard.as_ref() else {
            return;
        };

        let is_profile = matches!(message, SinkMessage::Profile(_));
        match sender.try_send(message) {
            Ok(()) => self.shared.counters.record_enqueued(is_profile),
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.enqueue_overflow(sender.as_ref().clone(), message, is_profile);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Persistence task stopped, record not persisted");
            }
        }
    }

    /// Wait for room off the caller's path, up to the overflow bounds
    fn enqueue_overflow(&self, sender: mpsc::Sender<SinkMessage>, message: SinkMessage, is_profile: bool) {
        let counters = self.shared.counters.clone();
        let Some(overflow) = self.overflow.as_ref() else {
            counters.record_discarded(is_profile);
            return;
        };

        if counters.overflow_pending.fetch_add(1, Ordering::AcqRel) >= overflow.limit {
            counters.overflow_pending.fetch_sub(1, Ordering::AcqRel);
            counters.record_discarded(is_profile);
            tracing::warn!("Persistence queue and overflow full, discarding record for persistence");
            return;
        }

        let timeout = overflow.timeout;
        overflow.runtime.spawn(async move {
            let result = sender.send_timeout(message, timeout).await;
            counters.overflow_pending.fetch_sub(1, Ordering::AcqRel);
            match result {
                Ok(()) => counters.record_enqueued(is_profile),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    counters.record_discarded(is_profile);
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Persistence queue stayed full, discarding record for persistence"
                    );
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    tracing::debug!("Persistence task stopped, record not persisted");
                }
            }
        });
    }

    pub fn stats(&self) -> PublisherStats {
        let c = &self.shared.counters;
        PublisherStats {
            published: c.published.load(Ordering::Relaxed),
            subscribers: self.shared.subscribers.len(),
            subscriber_drops: c.subscriber_drops.load(Ordering::Relaxed),
            persistence_enqueued: c.persistence_enqueued.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            persistence_discarded: c.persistence_discarded.load(Ordering::Relaxed),
        }
    }

    /// Close every subscription and drain the persistence task.
    pub async fn shutdown(&self) {
        for entry in self.shared.subscribers.iter() {
            entry.value().close();
        }

        // Dropping the last sender lets the task flush and exit. Pending
        // overflow sends hold their own senders and still get delivered.
        self.sender.store(None);
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Persistence task failed");
            }
        }
    }
}

async fn sink_task(
    sink: Arc<dyn ProfileSink>,
    mut rx: mpsc::Receiver<SinkMessage>,
    settings: PersistenceSettings,
    counters: Arc<Counters>,
) {
    let mut batch: Vec<Arc<Profile>> = Vec::with_capacity(settings.batch_size);

    let mut flush_timer = tokio::time::interval(settings.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(SinkMessage::Profile(profile)) => {
                        batch.push(profile);
                        if batch.len() >= settings.batch_size {
                            flush_profiles(sink.as_ref(), &mut batch, &settings, &counters).await;
                        }
                    }
                    Some(SinkMessage::LateSamples { correlation_id, samples }) => {
                        flush_late_samples(sink.as_ref(), &correlation_id, &samples, &settings).await;
                    }
                    // Every sender is gone: flush what is left and stop
                    None => {
                        if !batch.is_empty() {
                            flush_profiles(sink.as_ref(), &mut batch, &settings, &counters).await;
                        }
                        break;
                    }
                }
            }

            _ = flush_timer.tick() => {
                if !batch.is_empty() {
                    flush_profiles(sink.as_ref(), &mut batch, &settings, &counters).await;
                }
            }
        }
    }

    tracing::info!("Profile persistence task shutting down");
}

async fn flush_profiles(
    sink: &dyn ProfileSink,
    batch: &mut Vec<Arc<Profile>>,
    settings: &PersistenceSettings,
    counters: &Counters,
) {
    let count = batch.len() as u64;
    let start = std::time::Instant::now();
    let mut backoff = settings.initial_backoff;

    for attempt in 0..=settings.max_retries {
        match sink.persist(batch).await {
            Ok(()) => {
                counters.persisted.fetch_add(count, Ordering::Relaxed);
                tracing::debug!(
                    count = count,
                    attempt = attempt,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Persisted profile batch"
                );
                batch.clear();
                return;
            }
            Err(e) => {
                counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_persistence_failure();
                tracing::warn!(
                    error = %e,
                    count = count,
                    attempt = attempt,
                    "Failed to persist profile batch"
                );
                if attempt < settings.max_retries {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    counters.persistence_discarded.fetch_add(count, Ordering::Relaxed);
    crate::metrics::record_persistence_discarded(count);
    tracing::error!(
        count = count,
        retries = settings.max_retries,
        "Giving up on profile batch; profiles will not be persisted"
    );
    batch.clear();
}

async fn flush_late_samples(
    sink: &dyn ProfileSink,
    correlation_id: &str,
    samples: &[MemorySample],
    settings: &PersistenceSettings,
) {
    let mut backoff = settings.initial_backoff;

    for attempt in 0..=settings.max_retries {
        match sink.append_memory_samples(correlation_id, samples).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    correlation_id = %correlation_id,
                    attempt = attempt,
                    "Failed to persist late memory samples"
                );
                if attempt < settings.max_retries {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    tracing::error!(
        correlation_id = %correlation_id,
        count = samples.len(),
        "Giving up on late memory samples"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::event::RequestMetadata;
    use crate::profiler::profile::{ProfileOutcome, Summary};
    use crate::profiler::sink::MemorySink;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Instant;

    fn profile(id: &str) -> Arc<Profile> {
        Arc::new(Profile {
            correlation_id: id.to_string(),
            metadata: RequestMetadata::new("GET", "/"),
            started_at: Utc::now(),
            status_code: Some(200),
            outcome: ProfileOutcome::Completed,
            total_duration_us: 1,
            queries: Vec::new(),
            spans: Vec::new(),
            memory_samples: Vec::new(),
            diagnostics: Vec::new(),
            summary: Summary::default(),
            dropped_events: 0,
        })
    }

    fn fast_settings() -> PersistenceSettings {
        PersistenceSettings {
            queue_depth: 16,
            batch_size: 4,
            flush_interval: Duration::from_millis(10),
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            enqueue_timeout: Duration::from_millis(20),
            overflow_limit: 8,
        }
    }

    /// Takes a while per batch
    struct SlowSink {
        inner: MemorySink,
    }

    #[async_trait]
    impl ProfileSink for SlowSink {
        async fn persist(&self, profiles: &[Arc<Profile>]) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.inner.persist(profiles).await
        }
    }

    /// Fails every call
    struct BrokenSink {
        calls: AtomicU64,
    }

    #[async_trait]
    impl ProfileSink for BrokenSink {
        async fn persist(&self, _profiles: &[Arc<Profile>]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(anyhow!("database unavailable"))
        }
    }

    /// Never completes a write
    struct StalledSink;

    #[async_trait]
    impl ProfileSink for StalledSink {
        async fn persist(&self, _profiles: &[Arc<Profile>]) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivers_to_every_subscriber() {
        let publisher = Publisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.publish(profile("r1"));

        assert_eq!(a.recv().await.unwrap().correlation_id, "r1");
        assert_eq!(b.recv().await.unwrap().correlation_id, "r1");
        assert_eq!(publisher.stats().published, 1);
    }

    #[test]
    fn test_publish_wakes_pending_recv() {
        let publisher = Publisher::new(4);
        let mut sub = publisher.subscribe();

        let mut recv = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_pending!(recv.poll());

        publisher.publish(profile("r1"));
        assert!(recv.is_woken());
        let received = tokio_test::assert_ready!(recv.poll());
        assert_eq!(received.unwrap().correlation_id, "r1");
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let publisher = Publisher::new(2);
        let mut sub = publisher.subscribe();

        for id in ["r1", "r2", "r3"] {
            publisher.publish(profile(id));
        }

        assert_eq!(sub.dropped(), 1);
        assert_eq!(publisher.stats().subscriber_drops, 1);
        assert_eq!(sub.try_recv().unwrap().correlation_id, "r2");
        assert_eq!(sub.try_recv().unwrap().correlation_id, "r3");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let publisher = Publisher::new(4);
        let sub = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        drop(sub);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_persists_through_sink() {
        let sink = Arc::new(MemorySink::new());
        let publisher = Publisher::with_sink(4, sink.clone(), fast_settings());

        publisher.publish(profile("r1"));
        publisher.publish(profile("r2"));
        publisher.shutdown().await;

        let stored: Vec<String> = sink.profiles().iter().map(|p| p.correlation_id.clone()).collect();
        assert_eq!(stored, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(publisher.stats().persisted, 2);
    }

    #[tokio::test]
    async fn test_failed_batches_are_retried_then_discarded() {
        let sink = Arc::new(BrokenSink { calls: AtomicU64::new(0) });
        let publisher = Publisher::with_sink(4, sink.clone(), fast_settings());

        publisher.publish(profile("r1"));
        publisher.shutdown().await;

        assert_eq!(sink.calls.load(Ordering::Relaxed), 3);
        let stats = publisher.stats();
        assert_eq!(stats.persistence_failures, 3);
        assert_eq!(stats.persistence_discarded, 1);
        assert_eq!(stats.persisted, 0);
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_full_queues() {
        let settings = PersistenceSettings {
            queue_depth: 1,
            batch_size: 1,
            ..fast_settings()
        };
        let publisher = Publisher::with_sink(1, Arc::new(StalledSink), settings);
        let _slow_subscriber = publisher.subscribe();

        let start = Instant::now();
        for i in 0..200 {
            publisher.publish(profile(&format!("r{}", i)));
        }

        assert!(start.elapsed() < Duration::from_secs(1));
        let stats = publisher.stats();
        assert_eq!(stats.published, 200);
        assert_eq!(stats.subscriber_drops, 199);
        assert!(stats.persistence_discarded > 0);
    }

    #[tokio::test]
    async fn test_burst_over_queue_depth_is_still_persisted() {
        let settings = PersistenceSettings {
            queue_depth: 2,
            batch_size: 1,
            enqueue_timeout: Duration::from_secs(5),
            overflow_limit: 64,
            ..fast_settings()
        };
        let sink = Arc::new(SlowSink { inner: MemorySink::new() });
        let publisher = Publisher::with_sink(4, sink.clone(), settings);

        let start = Instant::now();
        for i in 0..20 {
            publisher.publish(profile(&format!("r{}", i)));
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        publisher.shutdown().await;

        let stats = publisher.stats();
        assert_eq!(stats.persistence_discarded, 0);
        assert_eq!(stats.persistence_enqueued, 20);
        assert_eq!(stats.persisted, 20);
        assert_eq!(sink.inner.profiles().len(), 20);
    }

    #[tokio::test]
    async fn test_shutdown_ends_pending_recv() {
        let publisher = Arc::new(Publisher::new(4));
        let mut sub = publisher.subscribe();
        publisher.publish(profile("r1"));

        publisher.shutdown().await;

        assert_eq!(sub.recv().await.unwrap().correlation_id, "r1");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_late_samples_reach_sink() {
        let sink = Arc::new(MemorySink::new());
        let publisher = Publisher::with_sink(4, sink.clone(), fast_settings());

        publisher.publish_late_samples("r1", vec![MemorySample::new(5, 1024)]);
        publisher.shutdown().await;

        assert_eq!(sink.late_samples(), vec![("r1".to_string(), MemorySample::new(5, 1024))]);
    }
}
