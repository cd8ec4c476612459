use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tenant_core::config::{OrchestratorConfig, WarnLevel};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a new config file
    Init {
        /// Per-step timeout in seconds (omit for no timeout)
        #[arg(long)]
        step_timeout_secs: Option<u64>,
        /// Extra wait for a step that overran its timeout before it is left uncompensated
        #[arg(long, default_value_t = 30)]
        step_grace_secs: u64,
        /// Path of the saga log database
        #[arg(long)]
        saga_log: Option<PathBuf>,
        /// Age after which an unfinished run is recovered at startup
        #[arg(long, default_value_t = 300)]
        recovery_max_age_secs: u64,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective config (defaults when the file is missing)
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Init {
            step_timeout_secs,
            step_grace_secs,
            saga_log,
            recovery_max_age_secs,
            force,
        } => {
            let config = OrchestratorConfig {
                step_timeout_secs,
                step_grace_secs,
                saga_log,
                recovery_max_age_secs,
            };
            init(path, &config, force, json)
        }
        ConfigSubcommand::Show => show(path, json),
        ConfigSubcommand::Validate => validate(path, json),
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(path: &Path, config: &OrchestratorConfig, force: bool, json: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    config
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    if json {
        print_json(&serde_json::json!({
            "path": path,
            "config": config,
        }))?;
    } else {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(path).context("failed to load config")?;

    if json {
        print_json(&config)?;
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(path).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }

    Ok(())
}
