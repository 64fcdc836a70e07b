use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Make sure the dashboard's own routes are never profiled, whatever
    /// `server.monitor_prefix` is set to.
    pub fn exclude_monitor_prefix(&mut self) {
        let prefix = &self.server.monitor_prefix;
        let covered = self
            .profiler
            .excluded_path_prefixes
            .iter()
            .any(|excluded| prefix.starts_with(excluded.as_str()));
        if !covered {
            self.profiler.excluded_path_prefixes.push(prefix.clone());
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
    /// Path prefix the dashboard API is mounted under
    pub monitor_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            monitor_prefix: "/__monitor__".to_string(),
        }
    }
}

/// Settings consumed by the registry, analyzer and publisher
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub enabled: bool,
    /// A run of same-shape queries must be longer than this to count as N+1
    pub n_query_threshold: usize,
    /// Largest gap between two members of one N+1 run
    pub n_query_max_gap_ms: u64,
    pub slow_query_ms: u64,
    pub slow_span_relative_pct: f64,
    pub context_grace_seconds: u64,
    pub sample_grace_ms: u64,
    pub reaper_interval_seconds: u64,
    pub subscriber_queue_depth: usize,
    pub heartbeat_interval_seconds: u64,
    pub finalize_abandoned: bool,
    pub max_query_text_len: usize,
    pub max_call_site_len: usize,
    pub excluded_path_prefixes: Vec<String>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            n_query_threshold: 3,
            n_query_max_gap_ms: 50,
            slow_query_ms: 100,
            slow_span_relative_pct: 0.5,
            context_grace_seconds: 300,
            sample_grace_ms: 2000,
            reaper_interval_seconds: 5,
            subscriber_queue_depth: 64,
            heartbeat_interval_seconds: 15,
            finalize_abandoned: true,
            max_query_text_len: 1000,
            max_call_site_len: 2000,
            excluded_path_prefixes: vec![
                "/__monitor__".to_string(),
                "/static/".to_string(),
                "/media/".to_string(),
                "/.well-known/".to_string(),
                "/ws/".to_string(),
            ],
        }
    }
}

impl ProfilerConfig {
    pub fn context_grace(&self) -> Duration {
        Duration::from_secs(self.context_grace_seconds)
    }

    pub fn sample_grace(&self) -> Duration {
        Duration::from_millis(self.sample_grace_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub database_url: String,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Longest wait for room when the queue is full before discarding
    pub enqueue_timeout_ms: u64,
    /// Records allowed to wait for room at once
    pub overflow_depth: usize,
    pub retention_days: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: "sqlite:./data/profiles.db".to_string(),
            queue_depth: 1024,
            batch_size: 32,
            flush_interval_ms: 250,
            max_retries: 5,
            initial_backoff_ms: 50,
            enqueue_timeout_ms: 2000,
            overflow_depth: 1024,
            retention_days: 7,
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("PROFILEBOARD").separator("__"))
        .build()?;

    let mut cfg: Config = config.try_deserialize()?;
    cfg.exclude_monitor_prefix();
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    let profiler = &cfg.profiler;

    if profiler.n_query_threshold == 0 {
        anyhow::bail!("profiler.n_query_threshold must be at least 1");
    }

    if !(profiler.slow_span_relative_pct > 0.0 && profiler.slow_span_relative_pct <= 1.0) {
        anyhow::bail!(
            "profiler.slow_span_relative_pct must be in (0, 1], got {}",
            profiler.slow_span_relative_pct
        );
    }

    if profiler.subscriber_queue_depth == 0 {
        anyhow::bail!("profiler.subscriber_queue_depth must be at least 1");
    }

    let persistence = &cfg.persistence;
    if persistence.queue_depth == 0 {
        anyhow::bail!("persistence.queue_depth must be at least 1");
    }
    if persistence.batch_size == 0 {
        anyhow::bail!("persistence.batch_size must be at least 1");
    }
    if persistence.enabled && persistence.database_url.trim().is_empty() {
        anyhow::bail!("persistence.database_url cannot be empty when persistence is enabled");
    }

    if !cfg.server.monitor_prefix.starts_with('/') {
        anyhow::bail!("server.monitor_prefix must start with '/'");
    }

    Ok(())
}
