//! Persistence sink seam
//!
//! The publisher hands finished profiles to a `ProfileSink` from a
//! background task. Sinks may fail; the caller retries with backoff.

use super::event::MemorySample;
use super::profile::Profile;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

#[async_trait]
pub trait ProfileSink: Send + Sync {
    /// Persist a batch of profiles. Must be idempotent per correlation id
    /// and start time, since a failed batch is retried as a whole.
    async fn persist(&self, profiles: &[Arc<Profile>]) -> Result<()>;

    /// Memory samples that arrived after the request's profile was
    /// published but within the grace window.
    async fn append_memory_samples(&self, _correlation_id: &str, _samples: &[MemorySample]) -> Result<()> {
        Ok(())
    }
}

/// Keeps profiles in memory. Useful for tests and for running without a
/// database.
#[derive(Default)]
pub struct MemorySink {
    profiles: Mutex<Vec<Arc<Profile>>>,
    late_samples: Mutex<Vec<(String, MemorySample)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profiles(&self) -> Vec<Arc<Profile>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn late_samples(&self) -> Vec<(String, MemorySample)> {
        self.late_samples.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ProfileSink for MemorySink {
    async fn persist(&self, profiles: &[Arc<Profile>]) -> Result<()> {
        let mut stored = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        for profile in profiles {
            let already = stored.iter().any(|p| {
                p.correlation_id == profile.correlation_id && p.started_at == profile.started_at
            });
            if !already {
                stored.push(profile.clone());
            }
        }
        Ok(())
    }

    async fn append_memory_samples(&self, correlation_id: &str, samples: &[MemorySample]) -> Result<()> {
        let mut stored = self.late_samples.lock().unwrap_or_else(PoisonError::into_inner);
        stored.extend(samples.iter().map(|s| (correlation_id.to_string(), *s)));
        Ok(())
    }
}
