use clap::Parser;
use tracing_subscriber::EnvFilter;

use lifeline::cli::{Cli, Command, run_config_command, run_simulate_command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Logs go to stderr so event output on stdout stays machine-readable.
    let filter = EnvFilter::builder()
        .with_default_directive(cli.log_level().into())
        .from_env_lossy();
    if cli.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = cli.load_config()?;

    match cli.command {
        Command::Simulate(args) => run_simulate_command(config, args).await,
        Command::Config { check } => run_config_command(&config, check),
    }
}
