use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::profiler::Profiler;

/// Shutdown signal types
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// Graceful shutdown (drain connections, flush profiles)
    Graceful,
}

/// Setup signal handlers for the server
///
/// Returns a broadcast sender for shutdown signals and a join handle for the signal task
///
/// Handles:
/// - SIGTERM/SIGINT: Graceful shutdown
/// - SIGHUP: Reload profiler thresholds from `config_path`
#[cfg(unix)]
pub fn setup_signal_handlers(
    config_path: PathBuf,
    profiler: Arc<Profiler>,
) -> (broadcast::Sender<ShutdownSignal>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx_clone = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        let (mut sigterm, mut sigint, mut sighup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
            _ => {
                error!("Failed to install signal handlers");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, initiating graceful shutdown");
                    let _ = tx_clone.send(ShutdownSignal::Graceful);
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, initiating graceful shutdown");
                    let _ = tx_clone.send(ShutdownSignal::Graceful);
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if let Err(e) = reload_profiler_config(&config_path, &profiler) {
                        error!("Failed to reload configuration: {}", e);
                    } else {
                        info!("Configuration reloaded successfully");
                    }
                }
            }
        }
    });

    (shutdown_tx, handle)
}

/// Windows placeholder - only Ctrl+C is supported
#[cfg(not(unix))]
pub fn setup_signal_handlers(
    _config_path: PathBuf,
    _profiler: Arc<Profiler>,
) -> (broadcast::Sender<ShutdownSignal>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx_clone = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, initiating shutdown");
                let _ = tx_clone.send(ShutdownSignal::Graceful);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    });

    (shutdown_tx, handle)
}

/// Load and validate the config file, then swap the profiler thresholds.
///
/// On any error the running configuration stays in place. Server and
/// persistence settings need a restart to change, and the runtime
/// profiling toggle is left as it is.
pub fn reload_profiler_config(config_path: &Path, profiler: &Profiler) -> Result<()> {
    let new_config = crate::config::load_config(config_path)?;

    info!(
        n_query_threshold = new_config.profiler.n_query_threshold,
        slow_query_ms = new_config.profiler.slow_query_ms,
        "New profiler configuration loaded"
    );

    profiler.reload_config(new_config.profiler);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerConfig;
    use std::io::Write;

    #[tokio::test]
    async fn test_reload_applies_new_thresholds() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[profiler]\nslow_query_ms = 250\nn_query_threshold = 7").unwrap();

        reload_profiler_config(file.path(), &profiler).unwrap();

        let config = profiler.config();
        assert_eq!(config.slow_query_ms, 250);
        assert_eq!(config.n_query_threshold, 7);
        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_running_config() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[profiler]\nn_query_threshold = 0").unwrap();

        assert!(reload_profiler_config(file.path(), &profiler).is_err());
        assert_eq!(profiler.config().n_query_threshold, 3);
        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_channel_subscribe() {
        let profiler = Profiler::init(ProfilerConfig::default(), None);
        let (shutdown_tx, _handle) = setup_signal_handlers(PathBuf::from("config.toml"), profiler.clone());

        let mut rx = shutdown_tx.subscribe();
        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        assert!(matches!(rx.recv().await, Ok(ShutdownSignal::Graceful)));
        profiler.shutdown().await;
    }
}
