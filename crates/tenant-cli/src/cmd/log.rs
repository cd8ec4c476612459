use crate::output::{format_time, print_json, Table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::time::Duration;
use tenant_core::config::OrchestratorConfig;
use tenant_core::orchestrator::{RunSummary, SagaLog};

/// Longest message shown by `log show`; `--json` prints it whole.
const MESSAGE_WIDTH: usize = 60;

#[derive(Subcommand)]
pub enum LogSubcommand {
    /// List every recorded run, oldest first
    Runs,

    /// Show every log entry for one tenant
    Show { tenant_id: String },

    /// List unfinished runs that startup recovery would compensate
    Interrupted {
        /// Override the config's recovery_max_age_secs
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

pub fn run(config_path: &Path, subcmd: LogSubcommand, json: bool) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let log = open_log(&config, config_path)?;

    match subcmd {
        LogSubcommand::Runs => {
            let runs = log.runs().context("failed to read saga log")?;
            print_runs(&runs, json, "No runs recorded.")
        }
        LogSubcommand::Show { tenant_id } => show(&log, &tenant_id, json),
        LogSubcommand::Interrupted { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.recovery_max_age());
            let runs = log
                .interrupted_runs(max_age)
                .context("failed to read saga log")?;
            print_runs(&runs, json, "No interrupted runs.")
        }
    }
}

fn open_log(config: &OrchestratorConfig, config_path: &Path) -> anyhow::Result<SagaLog> {
    let Some(path) = &config.saga_log else {
        anyhow::bail!("saga_log is not set in {}", config_path.display());
    };
    if !path.exists() {
        anyhow::bail!("saga log {} does not exist", path.display());
    }
    SagaLog::open(path).with_context(|| format!("failed to open saga log {}", path.display()))
}

fn print_runs(runs: &[RunSummary], json: bool, empty: &str) -> anyhow::Result<()> {
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("{empty}");
        return Ok(());
    }
    let mut table = Table::new(&["RUN", "TENANT", "LIFECYCLE", "STARTED", "LAST EVENT", "FINISHED"]);
    for r in runs {
        table.push(vec![
            r.run_id.to_string(),
            r.tenant_id.clone(),
            r.lifecycle.to_string(),
            format_time(&r.started_at),
            r.last_event.clone(),
            if r.terminal { "yes" } else { "no" }.to_string(),
        ]);
    }
    table.print();
    Ok(())
}

fn show(log: &SagaLog, tenant_id: &str, json: bool) -> anyhow::Result<()> {
    let entries = log
        .entries_for_tenant(tenant_id)
        .context("failed to read saga log")?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No entries for '{tenant_id}'.");
        return Ok(());
    }
    let mut table = Table::new(&["RECORDED", "LIFECYCLE", "SEQ", "EVENT", "STEP", "MESSAGE"])
        .limit(5, MESSAGE_WIDTH);
    for e in &entries {
        table.push(vec![
            format_time(&e.recorded_at),
            e.lifecycle.to_string(),
            e.seq.to_string(),
            e.event.label().to_string(),
            e.event.step().unwrap_or("-").to_string(),
            e.event.message().unwrap_or("").to_string(),
        ]);
    }
    table.print();
    Ok(())
}
