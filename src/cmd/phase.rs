//! Phase listing and build status — `autoforge phases`, `autoforge status`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;
use super::run::print_status;
use autoforge::build::{BuildId, BuildStatus};
use autoforge::config::AutoforgeConfig;
use autoforge::contracts::Contracts;
use autoforge::service::BuildService;

pub fn cmd_phases(contracts: &Path) -> Result<()> {
    let docs = Contracts::load(contracts)?;
    let phases = docs.phases()?;

    println!();
    println!(
        "{} ({} contract documents, fingerprint {})",
        style("Phases").bold(),
        docs.len(),
        docs.fingerprint()
    );
    println!();
    for phase in &phases {
        println!("  {}", style(phase.label()).cyan().bold());
        if !phase.objective.is_empty() {
            println!("    {}", phase.objective);
        }
        for deliverable in &phase.deliverables {
            println!("    {} {}", style("-").dim(), deliverable);
        }
    }
    println!();
    println!("{} phases", phases.len());
    Ok(())
}

/// Expand a full id or unique prefix to a build id.
pub async fn find_build(service: &Arc<BuildService>, prefix: &str) -> Result<BuildId> {
    let builds = service.list().await.map_err(|e| anyhow::anyhow!(e.public_message()))?;
    let matches: Vec<BuildId> = builds
        .iter()
        .filter(|b| b.id.to_string().starts_with(prefix))
        .map(|b| b.id)
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No build matches '{}'", prefix),
        _ => bail!("'{}' matches {} builds; use a longer prefix", prefix, matches.len()),
    }
}

pub async fn cmd_status(cli: &Cli, config: AutoforgeConfig, id: Option<&str>, json: bool) -> Result<()> {
    let service = BuildService::open(&cli.state_dir, config).map_err(|e| anyhow::anyhow!(e.public_message()))?;

    if let Some(prefix) = id {
        let id = find_build(&service, prefix).await?;
        let report = service
            .status(id)
            .await
            .map_err(|e| anyhow::anyhow!(e.public_message()))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_status(&report);
        }
        return Ok(());
    }

    let mut builds = service.list().await.map_err(|e| anyhow::anyhow!(e.public_message()))?;
    builds.sort_by_key(|b| b.created_at);
    if json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
        return Ok(());
    }
    if builds.is_empty() {
        println!("No builds");
        return Ok(());
    }
    for build in &builds {
        let status = match build.status {
            BuildStatus::Completed => style(build.status.to_string()).green(),
            BuildStatus::Failed | BuildStatus::Cancelled => style(build.status.to_string()).red(),
            BuildStatus::Paused => style(build.status.to_string()).yellow(),
            _ => style(build.status.to_string()).cyan(),
        };
        println!(
            "{}  {:<10} {:<20} {}",
            &build.id.to_string()[..8],
            status,
            build.project,
            build.current_phase.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
