//! Command implementations for the CLI
//!
//! - serve: Start the dashboard server
//! - config: Configuration display and validation
//! - export: Dump stored profiles as JSON lines

pub mod config;
pub mod export;
pub mod serve;
