//! Restart sweep — `autoforge recover`.

use anyhow::Result;
use console::style;
use std::time::Duration;

use super::super::Cli;
use autoforge::config::AutoforgeConfig;
use autoforge::service::BuildService;

/// Upper bound on waiting for builds the sweep resumed.
const RESUME_WAIT: Duration = Duration::from_secs(6 * 60 * 60);

pub async fn cmd_recover(cli: &Cli, config: AutoforgeConfig) -> Result<()> {
    let service = BuildService::open(&cli.state_dir, config).map_err(|e| anyhow::anyhow!(e.public_message()))?;
    let report = service
        .recover_on_startup()
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))?;

    if report.paused.is_empty() && report.failed.is_empty() && report.resumable.is_empty() {
        println!("Nothing to recover");
        return Ok(());
    }
    for id in &report.paused {
        println!("  {} {} paused, waiting on an operator", style("‖").yellow(), id);
    }
    for id in &report.failed {
        println!("  {} {} failed (interrupted by restart)", style("✗").red(), id);
    }
    for id in &report.resumable {
        println!("  {} {} resumed", style("▶").cyan(), id);
    }

    for id in &report.resumable {
        if !service.wait_idle(*id, RESUME_WAIT).await {
            println!("{} {} still running after {}s", style("!").yellow(), id, RESUME_WAIT.as_secs());
            continue;
        }
        let status = service
            .status(*id)
            .await
            .map_err(|e| anyhow::anyhow!(e.public_message()))?;
        println!("  {} {} {}", style("●").dim(), id, status.status);
    }
    Ok(())
}
