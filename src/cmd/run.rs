//! Driving one build — `autoforge run`.
//!
//! Events are printed as they arrive. Lines on stdin starting with `/` are
//! operator commands; `approve`, `retry`, `skip`, `abort` and
//! `answer <text>` resolve the open gate.

use anyhow::{Result, bail};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use super::super::{Cli, TargetArgs};
use autoforge::build::{BuildId, BuildStatus, BuildTarget, LogLevel};
use autoforge::config::AutoforgeConfig;
use autoforge::events::BuildEvent;
use autoforge::registry::GateResolution;
use autoforge::service::{BuildService, CommandOutcome, StatusReport};

pub fn resolve_target(args: &TargetArgs, branch: &str, remote: Option<&str>) -> Result<BuildTarget> {
    if let Some(path) = &args.target {
        let path = std::fs::canonicalize(path)
            .map_err(|e| anyhow::anyhow!("Target directory {} is not usable: {}", path.display(), e))?;
        return Ok(BuildTarget::LocalPath {
            path,
            branch: branch.to_string(),
        });
    }
    if let Some(url) = &args.repo {
        return Ok(BuildTarget::ExistingRepo {
            url: url.clone(),
            branch: branch.to_string(),
        });
    }
    if let Some(name) = &args.new {
        return Ok(BuildTarget::NewRepo {
            name: name.clone(),
            remote: remote.map(String::from),
        });
    }
    bail!("One of --target, --repo or --new is required")
}

fn default_project(target: &BuildTarget) -> String {
    let raw = match target {
        BuildTarget::LocalPath { path, .. } => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        BuildTarget::ExistingRepo { url, .. } => url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim_end_matches(".git")
            .to_string(),
        BuildTarget::NewRepo { name, .. } => name.clone(),
    };
    if raw.is_empty() { "project".to_string() } else { raw }
}

/// Bare-word gate answers typed at the prompt.
fn parse_resolution(line: &str) -> Option<GateResolution> {
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word.to_lowercase().as_str() {
        "approve" | "yes" | "y" => Some(GateResolution::Approve),
        "retry" => Some(GateResolution::Retry),
        "skip" => Some(GateResolution::Skip),
        "abort" => Some(GateResolution::Abort),
        "answer" => Some(GateResolution::Answer(rest.trim().to_string())),
        _ => None,
    }
}

fn print_event(event: &BuildEvent) {
    match event {
        BuildEvent::StatusChanged { status, detail, .. } => {
            let label = match status {
                BuildStatus::Completed => style(status.to_string()).green().bold(),
                BuildStatus::Failed | BuildStatus::Cancelled => style(status.to_string()).red().bold(),
                BuildStatus::Paused => style(status.to_string()).yellow().bold(),
                _ => style(status.to_string()).cyan(),
            };
            match detail {
                Some(d) => println!("{} {} {}", style("●").dim(), label, style(d).dim()),
                None => println!("{} {}", style("●").dim(), label),
            }
        }
        BuildEvent::PhaseStarted { phase, name, attempt, .. } => {
            println!();
            println!("{} Phase {}: {} (attempt {})", style("▶").cyan(), phase, style(name).bold(), attempt);
        }
        BuildEvent::PlanReady { files, cached, .. } => {
            let source = if *cached { "resumed from cache" } else { "planned" };
            println!("  {} {} files {}", style("≡").dim(), files, source);
        }
        BuildEvent::FileWritten { path, .. } => println!("  {} {}", style("+").green(), path),
        BuildEvent::FileAudited { path, verdict, status, .. } => {
            println!("  {} {} {:?} ({:?})", style("✓").dim(), path, verdict, status);
        }
        BuildEvent::GovernanceReport { passed, failing, .. } => {
            if *passed {
                println!("  {} governance passed", style("✓").green());
            } else {
                println!("  {} governance blocking: {}", style("✗").red(), failing.join(", "));
            }
        }
        BuildEvent::PhaseCompleted { phase, partial, .. } => {
            let note = if *partial { " (partial pass)" } else { "" };
            println!("{} Phase {} complete{}", style("✓").green().bold(), phase, note);
        }
        BuildEvent::GateOpened { kind, payload, .. } => {
            println!("{} {} {}", style("?").yellow().bold(), style(kind.to_string()).yellow(), payload);
            if kind.is_blocking() {
                println!("  answer with: approve | retry | skip | abort | answer <text>");
            }
        }
        BuildEvent::GateResolved { kind, .. } => println!("  {} {} resolved", style("✓").dim(), kind),
        BuildEvent::StallWarning { idle_secs, activity, .. } => {
            println!("{} no progress for {}s during {}", style("!").yellow(), idle_secs, activity);
        }
        BuildEvent::Log { level, message, .. } if *level != LogLevel::Info => {
            println!("  {} {}", style("!").yellow(), message);
        }
        BuildEvent::Cost { .. } | BuildEvent::Heartbeat { .. } | BuildEvent::Log { .. } => {}
    }
}

pub fn print_status(report: &StatusReport) {
    println!("{} {}", style("Build").bold(), report.id);
    println!("  project:   {}", report.project);
    println!("  status:    {}", report.status);
    if let Some(phase) = &report.current_phase {
        println!("  phase:     {}", phase);
    }
    println!("  completed: {}", report.completed_phases);
    println!("  cost:      ${:.4}", report.cost_usd);
    if let Some(gate) = report.pending_gate {
        println!("  gate:      {}", gate);
    }
    if let Some(detail) = &report.detail {
        println!("  detail:    {}", detail);
    }
    if let Some(activity) = &report.activity {
        println!(
            "  activity:  {} ({}s idle)",
            activity,
            report.idle_secs.unwrap_or_default()
        );
    }
    for entry in &report.recent_log {
        println!("  {} [{:?}] {}", style(entry.at.format("%H:%M:%S")).dim(), entry.level, entry.message);
    }
}

async fn handle_line(service: &Arc<BuildService>, id: BuildId, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if !line.starts_with('/')
        && let Some(resolution) = parse_resolution(line)
    {
        match service.resolve_gate(id, resolution).await {
            Ok(kind) => println!("  {} {} resolved", style("→").dim(), kind),
            Err(e) => println!("  {} {}", style("✗").red(), e.public_message()),
        }
        return;
    }
    match service.command(id, line).await {
        Ok(CommandOutcome::Ack(message)) => println!("  {} {}", style("→").dim(), message),
        Ok(CommandOutcome::Status(report)) => print_status(&report),
        Err(e) => println!("  {} {}", style("✗").red(), e.public_message()),
    }
}

pub async fn cmd_run(
    cli: &Cli,
    config: AutoforgeConfig,
    contracts: &Path,
    target: BuildTarget,
    project: Option<&str>,
) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }
    let project = project.map(String::from).unwrap_or_else(|| default_project(&target));
    let contracts: PathBuf = std::fs::canonicalize(contracts)
        .map_err(|e| anyhow::anyhow!("Contracts directory {} is not usable: {}", contracts.display(), e))?;

    let service = BuildService::open(&cli.state_dir, config).map_err(|e| anyhow::anyhow!(e.public_message()))?;
    let swept = service
        .recover_on_startup()
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))?;
    if !swept.paused.is_empty() || !swept.failed.is_empty() {
        println!(
            "{} restart sweep: {} paused, {} failed",
            style("!").yellow(),
            swept.paused.len(),
            swept.failed.len()
        );
    }

    let events = service.engine().registry.events().subscribe();
    let build = service
        .start(&project, target, contracts)
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))?;
    println!("{} build {} for {}", style("autoforge").bold(), build.id, style(&project).cyan());
    println!("  workspace: {}", build.working_dir.display());
    watch(&service, build.id, events).await
}

/// Continue a paused or interrupted build — `autoforge resume`.
pub async fn cmd_resume(
    cli: &Cli,
    config: AutoforgeConfig,
    id: &str,
    phase: Option<u32>,
    decision: Option<&str>,
) -> Result<()> {
    let service = BuildService::open(&cli.state_dir, config).map_err(|e| anyhow::anyhow!(e.public_message()))?;
    service
        .recover_on_startup()
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))?;
    let id = super::phase::find_build(&service, id).await?;
    let events = service.engine().registry.events().subscribe();

    let message = match decision {
        Some(text) => {
            let Some(resolution) = parse_resolution(text) else {
                bail!("Unknown decision '{}'. Use approve, retry, skip, abort or answer <text>", text);
            };
            let kind = service
                .resolve_gate(id, resolution)
                .await
                .map_err(|e| anyhow::anyhow!(e.public_message()))?;
            format!("{} resolved", kind)
        }
        None => service
            .resume(id, phase)
            .await
            .map_err(|e| anyhow::anyhow!(e.public_message()))?,
    };
    println!("{} {}", style("→").dim(), message);
    watch(&service, id, events).await
}

/// Print events and feed stdin to the build until its task ends.
async fn watch(
    service: &Arc<BuildService>,
    id: BuildId,
    mut events: tokio::sync::broadcast::Receiver<BuildEvent>,
) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut idle_check = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.build_id() == id => print_event(&event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_line(service, id, &line).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("{} interrupt, cancelling build", style("!").yellow());
                if let Err(e) = service.cancel(id).await {
                    println!("  {} {}", style("✗").red(), e.public_message());
                }
            }
            _ = idle_check.tick() => {
                if !service.engine().registry.is_active(id) {
                    break;
                }
            }
        }
    }

    let report = service
        .status(id)
        .await
        .map_err(|e| anyhow::anyhow!(e.public_message()))?;
    println!();
    print_status(&report);
    match report.status {
        BuildStatus::Failed => bail!("Build {} failed", id),
        BuildStatus::Paused => {
            println!("\nBuild is paused. Continue with: autoforge resume {}", id);
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("skip"), Some(GateResolution::Skip));
        assert_eq!(
            parse_resolution("answer use sqlite"),
            Some(GateResolution::Answer("use sqlite".into()))
        );
        assert_eq!(parse_resolution("hello"), None);
    }

    #[test]
    fn test_default_project() {
        let target = BuildTarget::ExistingRepo {
            url: "https://example.com/acme/shop.git".into(),
            branch: "main".into(),
        };
        assert_eq!(default_project(&target), "shop");
    }
}
