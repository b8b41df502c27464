//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running a crisis scenario against the simulated gateway (`simulate`)
//! - Printing the effective configuration (`config`)

mod config;
mod simulate;

pub use config::run_config_command;
pub use simulate::{SimulateArgs, run_simulate_command};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::OrchestratorConfig;

#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(about = "Crisis escalation and hotline-connection orchestrator")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (JSON). Defaults to LIFELINE_* environment variables
    #[arg(short, long, global = true, env = "LIFELINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a crisis scenario against the simulated gateway and print every event
    Simulate(SimulateArgs),

    /// Print the effective configuration
    Config {
        /// Only validate; print nothing on success
        #[arg(long)]
        check: bool,
    },
}

impl Cli {
    /// Default log level before `RUST_LOG` is applied.
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }

    /// Load configuration from `--config` or the environment.
    pub fn load_config(&self) -> crate::Result<OrchestratorConfig> {
        let config = match &self.config {
            Some(path) => OrchestratorConfig::load_from(path)?,
            None => OrchestratorConfig::from_env()?,
        };
        Ok(config)
    }
}
