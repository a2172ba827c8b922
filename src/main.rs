mod cli;
mod config;
mod report;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConfigAction, Format};
use config::Config;
use pvelink_core::{plan_with_probe, FreshHost, HostProbe, PveHost, Topology};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Set { key, value } => Config::set(&key, &value)?,
        },
        Command::Check { mapping } => cmd_check(&mapping)?,
        Command::Plan {
            mapping,
            format,
            fresh,
            conf_dir,
            qm,
        } => {
            let config = Config::load()?;
            let probe: Box<dyn HostProbe> = if fresh {
                Box::new(FreshHost)
            } else {
                Box::new(PveHost::new(
                    config.resolve_conf_dir(conf_dir.as_deref()),
                    config.resolve_qm_bin(qm.as_deref()),
                ))
            };
            cmd_plan(&mapping, format, probe.as_ref())?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_topology(mapping: &Path) -> Result<Topology> {
    let topology = Topology::load(mapping)
        .with_context(|| format!("invalid mapping {}", mapping.display()))?;
    debug!(
        path = %mapping.display(),
        links = topology.links.len(),
        strategy = %topology.strategy,
        "loaded mapping"
    );
    Ok(topology)
}

fn cmd_plan(mapping: &Path, format: Format, probe: &dyn HostProbe) -> Result<()> {
    let topology = load_topology(mapping)?;
    let plan = plan_with_probe(&topology, probe).context("link planning failed")?;
    let out = report::render(&topology, &plan, format)?;
    emit(&out)
}

fn cmd_check(mapping: &Path) -> Result<()> {
    let topology = load_topology(mapping)?;
    let plan = plan_with_probe(&topology, &FreshHost).context("link planning failed")?;
    emit(&report::describe(&topology, &plan))
}

/// Single write so a failed run never leaves a partial script behind.
fn emit(out: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(out.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
