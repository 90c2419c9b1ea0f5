//! `labflow config` commands

use colored::Colorize;
use labflow::config::LabConfig;
use std::path::Path;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum ConfigCommand {
    /// Write a config file with every default filled in
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration (file + environment)
    Show {
        /// Output format (toml, json)
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

pub fn cmd_config(command: ConfigCommand, path: &Path, config: LabConfig) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Init { force } => cmd_config_init(path, force),
        ConfigCommand::Show { format } => cmd_config_show(&config, &format),
    }
}

fn cmd_config_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite it",
            path.display()
        );
    }
    LabConfig::default().save(path)?;
    println!("{} Wrote {}", "✓".bright_green(), path.display());
    Ok(())
}

fn cmd_config_show(config: &LabConfig, format: &str) -> anyhow::Result<()> {
    let mut shown = config.clone();
    redact(&mut shown.storage.sas_token);
    redact(&mut shown.tracking.token);
    redact(&mut shown.deployment.token);
    redact(&mut shown.inference.api_key);

    let output = match format {
        "json" => serde_json::to_string_pretty(&shown)?,
        "toml" => toml::to_string_pretty(&shown)?,
        other => anyhow::bail!("Unknown format: {}. Valid options: toml, json", other),
    };
    println!("{}", output);
    Ok(())
}

fn redact(secret: &mut Option<String>) {
    if secret.is_some() {
        *secret = Some("***".to_string());
    }
}
