use anyhow::Result;
use colored::Colorize;
use profileboard::{config, server};
use std::path::Path;
use tracing::info;

/// Execute the serve command
///
/// Loads the configuration and runs the server until a shutdown signal.
pub async fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Starting profileboard...".green());

    let cfg = config::load_config(config_path)?;
    info!(
        config = %config_path.display(),
        persistence = cfg.persistence.enabled,
        "Configuration loaded"
    );

    server::start_server(cfg, config_path.to_path_buf()).await
}
