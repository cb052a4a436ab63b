use std::path::PathBuf;

use aether_core::config::{self, TrackerConfig};
use miette::{IntoDiagnostic, Result};
use owo_colors::OwoColorize;

use crate::output::Output;

/// Show current configuration
pub fn show(config: &TrackerConfig, output: &Output) -> Result<()> {
    output.section("Current Configuration");
    output.print("");

    let toml_str = toml::to_string_pretty(config).into_diagnostic()?;
    for line in toml_str.lines() {
        output.print(line);
    }

    Ok(())
}

/// Write the configuration to `path`, or to the user config location.
pub async fn init(config: &TrackerConfig, path: Option<PathBuf>, output: &Output) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => config::config_paths()
            .into_iter()
            .nth(1)
            .ok_or_else(|| miette::miette!("No user config directory on this platform"))?,
    };

    if path.exists() {
        output.warning(&format!("Overwriting {}", path.display()));
    }
    output.info("💾", &format!("Saving configuration to: {}", path.display()));
    config::save_config(config, &path).await?;

    output.success("Configuration saved");
    output.status(&format!(
        "{} --config {}",
        "aether".bright_green(),
        path.display()
    ));
    Ok(())
}
