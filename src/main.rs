use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use profileboard::config::{load_config, ServerConfig};
use profileboard::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Logging settings come from the config file when it loads; a broken
    // file is reported by the command itself.
    let server_config = load_config(&args.config)
        .map(|cfg| cfg.server)
        .unwrap_or_else(|_| ServerConfig::default());
    init_tracing(&server_config);

    match args.get_command() {
        cli::Commands::Serve => {
            commands::serve::execute(&args.config).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Export { limit, since, output } => {
            commands::export::execute(&args.config, limit, since, output).await?;
        }
        cli::Commands::Version => {
            println!("profileboard v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
