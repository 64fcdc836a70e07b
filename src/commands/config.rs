use anyhow::Result;
use colored::Colorize;
use profileboard::config::{self, Config};
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration (file plus environment overrides)
pub fn show(config_path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(config_path)?;

    println!("{}", "Current Configuration:".green().bold());
    println!();
    println!("{}", render(&cfg)?);

    info!("Configuration displayed successfully");
    Ok(())
}

/// Execute the config validate command
pub fn validate(config_path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = config::load_config(config_path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    for line in summary_lines(&cfg) {
        println!("  {}", line);
    }

    info!("Configuration validation successful");
    Ok(())
}

fn render(cfg: &Config) -> Result<String> {
    Ok(toml::to_string_pretty(cfg)?)
}

fn summary_lines(cfg: &Config) -> Vec<String> {
    let profiler = &cfg.profiler;
    vec![
        format!("Listen: {}:{}", cfg.server.host, cfg.server.port),
        format!("Dashboard prefix: {}", cfg.server.monitor_prefix),
        format!("Profiling: {}", if profiler.enabled { "enabled" } else { "disabled" }),
        format!(
            "N+1 threshold: {} queries within {}ms",
            profiler.n_query_threshold, profiler.n_query_max_gap_ms
        ),
        format!(
            "Slow thresholds: {}ms absolute, {:.0}% of request",
            profiler.slow_query_ms,
            profiler.slow_span_relative_pct * 100.0
        ),
        format!("Excluded paths: {}", profiler.excluded_path_prefixes.join(", ")),
        if cfg.persistence.enabled {
            format!(
                "Persistence: {} (retention {} days)",
                cfg.persistence.database_url, cfg.persistence.retention_days
            )
        } else {
            "Persistence: disabled".to_string()
        },
    ]
}
