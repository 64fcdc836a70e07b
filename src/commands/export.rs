use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use colored::Colorize;
use profileboard::config;
use profileboard::profiler::{Profile, SqliteProfileStore};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Execute the export command
///
/// Writes one JSON profile per line, oldest first.
pub async fn execute(config_path: &Path, limit: usize, since: Option<u64>, output: Option<PathBuf>) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    if !cfg.persistence.enabled {
        anyhow::bail!("Persistence is disabled in {}; nothing to export", config_path.display());
    }

    let store = SqliteProfileStore::open(&cfg.persistence.database_url).await?;
    let profiles = store.since(cutoff(since), limit).await?;

    let written = match &output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            write_json_lines(&profiles, BufWriter::new(file))?
        }
        None => write_json_lines(&profiles, io::stdout().lock())?,
    };

    info!(count = written, "Export finished");
    if let Some(path) = output {
        eprintln!("{} {} profiles to {}", "Exported".green(), written, path.display());
    }
    Ok(())
}

fn cutoff(since: Option<u64>) -> DateTime<Utc> {
    since
        .and_then(|s| Duration::try_seconds(i64::try_from(s).ok()?))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn write_json_lines<W: Write>(profiles: &[Profile], mut writer: W) -> Result<usize> {
    for profile in profiles {
        serde_json::to_writer(&mut writer, profile)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(profiles.len())
}
