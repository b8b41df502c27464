//! Configuration CLI command.

use crate::config::OrchestratorConfig;

/// Print the effective configuration as JSON.
pub fn run_config_command(config: &OrchestratorConfig, check: bool) -> anyhow::Result<()> {
    // Loaders validate already; validate again for configs built in code.
    config.validate()?;
    if check {
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
