//! Configuration view and validation commands: `dossier config`.

use std::path::Path;

use anyhow::{Context, Result};
use dossier::config::DossierConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No {} found, showing defaults", config_path.display());
            }
            println!("# Effective values (with DOSSIER_* overrides)");
            println!();
            let config = DossierConfig::resolve(config_path)?;
            print!("{}", config.to_display_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No {} found. Using defaults.", config_path.display());
            }
            let config = DossierConfig::resolve(config_path)?;

            for warning in config.warnings() {
                println!("warning: {}", warning);
            }
            let errors = config.validate();
            if !errors.is_empty() {
                for error in &errors {
                    println!("error: {}", error);
                }
                anyhow::bail!("Configuration has {} error(s)", errors.len());
            }
            println!("Configuration is valid.");
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists.", config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let toml = toml::to_string_pretty(&DossierConfig::default())
                .context("Failed to serialize default configuration")?;
            std::fs::write(config_path, toml)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
