use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "profileboard", version, about = "Request profiling dashboard")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the dashboard server (default)
    Serve,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Export stored profiles as JSON lines
    Export {
        /// Maximum number of profiles
        #[arg(short, long, default_value = "1000")]
        limit: usize,

        /// Only profiles from the last N seconds
        #[arg(short, long)]
        since: Option<u64>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration
    Show,

    /// Validate configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Serve if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli {
            config: PathBuf::from("config.toml"),
            command: None,
        };

        assert!(matches!(cli.get_command(), Commands::Serve));
    }

    #[test]
    fn test_cli_parsing_export() {
        let args = vec!["profileboard", "export", "--limit", "20", "--since", "3600", "-o", "out.jsonl"];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.get_command() {
            Commands::Export { limit, since, output } => {
                assert_eq!(limit, 20);
                assert_eq!(since, Some(3600));
                assert_eq!(output, Some(PathBuf::from("out.jsonl")));
            }
            _ => panic!("Expected Export command"),
        }
    }

    #[test]
    fn test_cli_parsing_config_show() {
        let args = vec!["profileboard", "config", "show"];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.get_command() {
            Commands::Config { action } => {
                assert!(matches!(action, ConfigCommands::Show));
            }
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let args = vec!["profileboard", "serve", "--config", "/etc/profileboard.toml"];
        let cli = Cli::try_parse_from(args).unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/profileboard.toml"));
        assert!(matches!(cli.get_command(), Commands::Serve));
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        let args = vec!["profileboard", "start", "--daemon"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
