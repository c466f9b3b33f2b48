//! The phase loop.
//!
//! ```text
//! prepare ─▶ [plan-review] ─▶ for each phase:
//!     plan (or resume cache) ─▶ generate + audit ─▶ drain fix queue
//!       ─▶ governance ─┬─ pass ─▶ verify ─▶ commit ─▶ push ─▶ next
//!                      └─ fail ─▶ recovery ─▶ (retry ≤ cap) ─▶ phase-review gate
//! ```
//!
//! Operator flags and signals are observed at checkpoints between files.

use anyhow::{Context, Result, bail};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::audit::{self, FixQueue, LadderOutcome};
use super::generate::generate_file;
use super::planning::{self, PlanResult};
use super::verify;
use super::{Engine, PhaseManifest, PhaseScope, RunOutcome};
use crate::build::{Build, BuildId, BuildStatus, GateKind, LogLevel};
use crate::commands::ControlSignal;
use crate::contracts::Contracts;
use crate::errors::{BuildError, ProviderError};
use crate::events::BuildEvent;
use crate::governance::{self, GovernanceReport};
use crate::manifest::{AuditResult, FileAction, FileStatus, Verdict, topological_sort};
use crate::phase::Phase;
use crate::provider::ModelTier;
use crate::recovery::planner;
use crate::registry::{BuildRuntime, GateResolution};
use crate::workspace::files::has_content;
use crate::workspace::{SyncError, Workspace, retry_sync, safe_delete, safe_write};

/// Per-run state owned by the build's task.
struct RunCtx {
    id: BuildId,
    runtime: BuildRuntime,
    workspace: Arc<dyn Workspace>,
    contracts: Arc<Contracts>,
    root: PathBuf,
    branch: String,
    has_remote: bool,
    instructions: Vec<String>,
    error_context: Option<String>,
    current: Option<Arc<PhaseManifest>>,
    /// Resolution given to a persisted gate before this task existed
    carried: Option<(GateKind, GateResolution)>,
}

enum PhaseOutcome {
    Passed,
    Skipped,
    Retry,
    Halt(RunOutcome),
}

enum GateWait {
    Resolved(GateResolution),
    Cancelled,
}

enum PushResult {
    Pushed,
    Exhausted(String),
    Rejected(String),
}

fn is_pause_worthy(e: &anyhow::Error) -> Option<&ProviderError> {
    e.downcast_ref::<ProviderError>()
        .filter(|p| !matches!(p, ProviderError::Fatal(_)))
}

fn phase_findings(failures: &[AuditResult], report: &GovernanceReport) -> String {
    let mut out = String::new();
    for failure in failures {
        out.push_str(&format!("### Audit FAIL: {}\n{}\n\n", failure.path, failure.findings));
    }
    let governance = report.render_failures();
    if !governance.is_empty() {
        out.push_str("### Governance\n");
        out.push_str(&governance);
        out.push('\n');
    }
    out
}

impl Engine {
    /// Drive build `runtime.id` until it completes, pauses, is cancelled or
    /// fails. Provider failures other than fatal ones pause the build.
    pub async fn run(
        self: Arc<Self>,
        runtime: BuildRuntime,
        carried: Option<(GateKind, GateResolution)>,
    ) -> Result<RunOutcome> {
        let id = runtime.id;
        match self.drive(runtime, carried).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => match is_pause_worthy(&e) {
                Some(provider) => {
                    tracing::warn!(build_id = %id, error = %provider, "provider failure, pausing build");
                    Ok(RunOutcome::Paused(format!("generation provider error: {}", provider)))
                }
                None => Err(e),
            },
        }
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| BuildError::NotFound { id }.into())
    }

    async fn drive(
        self: Arc<Self>,
        runtime: BuildRuntime,
        carried: Option<(GateKind, GateResolution)>,
    ) -> Result<RunOutcome> {
        let id = runtime.id;
        let build = self.get_build(id).await?;
        if !self
            .registry
            .transition(id, BuildStatus::Running, None)
            .await?
        {
            bail!(BuildError::InvalidState {
                id,
                status: build.status.to_string(),
                action: "run".to_string(),
            });
        }

        let contracts = Arc::new(Contracts::load(&build.contracts_dir)?);
        self.registry.beat(id, "preparing workspace");
        let workspace = match self.workspaces.prepare(&build).await {
            Ok(workspace) => workspace,
            Err(e) => match e.downcast_ref::<SyncError>() {
                Some(SyncError::Retryable(msg)) => {
                    tracing::warn!(build_id = %id, error = %msg, "workspace unavailable, pausing build");
                    return Ok(RunOutcome::Paused(format!("workspace unavailable: {}", msg)));
                }
                Some(SyncError::Fatal(msg)) => {
                    return Ok(RunOutcome::Failed(format!("workspace unreachable: {}", msg)));
                }
                None => return Err(e.context("Failed to prepare workspace")),
            },
        };
        let mut ctx = RunCtx {
            id,
            runtime,
            root: workspace.root().to_path_buf(),
            has_remote: build.target.has_remote() && workspace.has_remote(),
            branch: build.target.branch().to_string(),
            workspace,
            contracts,
            instructions: Vec::new(),
            error_context: None,
            current: None,
            carried,
        };
        if !build.workspace_prepared {
            self.snapshot_contracts(&ctx).await?;
        }

        let phases = ctx.contracts.phases()?;
        if self.config.orchestrator.plan_review
            && build.completed_phases < 0
            && build.counters.generation_calls == 0
        {
            let payload = json!({
                "phases": phases
                    .iter()
                    .map(|p| json!({ "number": p.number, "name": p.name, "objective": p.objective }))
                    .collect::<Vec<_>>(),
            });
            match self.wait_gate(&mut ctx, GateKind::PlanReview, payload).await? {
                GateWait::Cancelled => return Ok(RunOutcome::Cancelled),
                GateWait::Resolved(GateResolution::Abort) => {
                    return Ok(RunOutcome::Failed("plan rejected by operator".to_string()));
                }
                GateWait::Resolved(_) => {}
            }
        }

        for phase in phases {
            let completed = self.get_build(id).await?.completed_phases;
            if i64::from(phase.number) <= completed {
                continue;
            }
            let phase = Arc::new(phase);
            loop {
                match self.run_phase(&mut ctx, &phase).await? {
                    PhaseOutcome::Passed => break,
                    PhaseOutcome::Skipped => {
                        self.mark_phase_done(id, &phase).await?;
                        ctx.current = None;
                        ctx.error_context = None;
                        self.registry
                            .log(id, LogLevel::Warn, format!("{} skipped by operator", phase.label()))
                            .await?;
                        break;
                    }
                    PhaseOutcome::Retry => {
                        tracing::info!(build_id = %id, phase = phase.number, "retrying phase");
                    }
                    PhaseOutcome::Halt(outcome) => return Ok(outcome),
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    async fn snapshot_contracts(&self, ctx: &RunCtx) -> Result<()> {
        let written = ctx.contracts.write_snapshot(&ctx.root)?;
        let hash = ctx.contracts.fingerprint();
        self.commit(ctx, &format!("{}: contract snapshot", self.config.orchestrator.commit_tag))
            .await?;
        let stored = hash.clone();
        self.store
            .update(
                ctx.id,
                Box::new(move |b| {
                    b.workspace_prepared = true;
                    b.contracts_hash = Some(stored);
                }),
            )
            .await?;
        self.registry
            .notify_workspace_ready(
                ctx.id,
                json!({
                    "working_dir": ctx.root.display().to_string(),
                    "contracts": written.len(),
                    "contracts_hash": hash,
                }),
            )
            .await?;
        Ok(())
    }

    fn scope(&self, ctx: &RunCtx, phase: &Arc<Phase>) -> PhaseScope {
        PhaseScope {
            id: ctx.id,
            phase: phase.clone(),
            root: ctx.root.clone(),
            contracts: ctx.contracts.clone(),
            instructions: Arc::new(ctx.instructions.clone()),
        }
    }

    /// Observe cancel and pause flags and apply queued operator signals.
    async fn checkpoint(&self, ctx: &mut RunCtx) -> Result<Option<RunOutcome>> {
        if ctx.runtime.cancel.is_cancelled() {
            return Ok(Some(RunOutcome::Cancelled));
        }
        if ctx.runtime.pause_requested() {
            return Ok(Some(RunOutcome::Paused("paused by operator".to_string())));
        }
        for signal in ctx.runtime.drain_signals() {
            tracing::info!(build_id = %ctx.id, signal = ?signal, "applying operator signal");
            match signal {
                ControlSignal::Instruction(text) => {
                    self.registry
                        .log(ctx.id, LogLevel::Info, format!("operator instruction queued: {}", text))
                        .await?;
                    ctx.instructions.push(text);
                }
                ControlSignal::Compact => ctx.error_context = None,
                ControlSignal::Clear => {
                    ctx.instructions.clear();
                    self.registry
                        .log(ctx.id, LogLevel::Info, "instructions and pending signals cleared")
                        .await?;
                    break;
                }
                ControlSignal::Commit => {
                    let message = format!("{}: operator checkpoint", self.config.orchestrator.commit_tag);
                    self.commit(ctx, &message).await?;
                }
                ControlSignal::Push => {
                    let message = match self.push(ctx).await {
                        PushResult::Pushed => "push complete".to_string(),
                        PushResult::Exhausted(msg) | PushResult::Rejected(msg) => msg,
                    };
                    self.registry.log(ctx.id, LogLevel::Info, message).await?;
                }
                ControlSignal::Pull => {
                    let message = match ctx.workspace.pull(&ctx.branch).await {
                        Ok(()) => "pull complete".to_string(),
                        Err(e) => format!("pull failed: {}", e),
                    };
                    self.registry.log(ctx.id, LogLevel::Info, message).await?;
                }
                ControlSignal::Verify => {
                    let entries = ctx.current.as_ref().map(|m| m.entries()).unwrap_or_default();
                    let result = verify::verify(&ctx.root, &entries, &self.config.verification).await?;
                    let message = if result.passed() {
                        "verification passed".to_string()
                    } else {
                        format!("verification failed:\n{}", result.findings())
                    };
                    self.registry.log(ctx.id, LogLevel::Info, message).await?;
                }
            }
        }
        Ok(None)
    }

    async fn wait_gate(
        &self,
        ctx: &mut RunCtx,
        kind: GateKind,
        payload: serde_json::Value,
    ) -> Result<GateWait> {
        if ctx.carried.as_ref().is_some_and(|(k, _)| *k == kind)
            && let Some((_, resolution)) = ctx.carried.take()
        {
            tracing::info!(build_id = %ctx.id, gate = %kind, "using resolution given before restart");
            return Ok(GateWait::Resolved(resolution));
        }
        let Some(rx) = self.registry.open_gate(ctx.id, kind, payload).await? else {
            bail!("build {} already has an open gate", ctx.id);
        };
        tokio::select! {
            resolution = rx => match resolution {
                Ok(resolution) => Ok(GateWait::Resolved(resolution)),
                Err(_) => bail!("gate mailbox for build {} closed without a resolution", ctx.id),
            },
            _ = ctx.runtime.cancel.cancelled() => {
                self.registry.abandon_gate(ctx.id);
                Ok(GateWait::Cancelled)
            }
        }
    }

    /// Pause on a phase-review gate and turn the operator's decision into
    /// the phase's outcome.
    async fn phase_review(&self, ctx: &mut RunCtx, phase: &Phase, reason: &str) -> Result<PhaseOutcome> {
        let id = ctx.id;
        self.registry
            .transition(id, BuildStatus::Paused, Some(reason.to_string()))
            .await?;
        let payload = json!({
            "phase": phase.number,
            "name": phase.name,
            "reason": reason,
            "options": ["retry", "skip", "abort"],
        });
        let decision = self.wait_gate(ctx, GateKind::PhaseReview, payload).await?;
        let outcome = match decision {
            GateWait::Cancelled => return Ok(PhaseOutcome::Halt(RunOutcome::Cancelled)),
            GateWait::Resolved(GateResolution::Abort) => {
                return Ok(PhaseOutcome::Halt(RunOutcome::Failed(format!(
                    "aborted by operator at {}",
                    phase.label()
                ))));
            }
            GateWait::Resolved(GateResolution::Skip) => PhaseOutcome::Skipped,
            GateWait::Resolved(_) => {
                self.reset_phase(id, phase.number).await?;
                PhaseOutcome::Retry
            }
        };
        self.registry
            .transition(id, BuildStatus::Running, None)
            .await?;
        Ok(outcome)
    }

    async fn reset_phase(&self, id: BuildId, phase: u32) -> Result<()> {
        self.store
            .update(
                id,
                Box::new(|b| {
                    b.counters.phase_attempts = 0;
                    b.counters.recovery_rounds = 0;
                }),
            )
            .await?;
        self.manifest_cache(id).remove(phase)
    }

    async fn mark_phase_done(&self, id: BuildId, phase: &Phase) -> Result<()> {
        let number = i64::from(phase.number);
        self.store
            .update(
                id,
                Box::new(move |b| {
                    b.completed_phases = b.completed_phases.max(number);
                    b.counters.phase_attempts = 0;
                    b.counters.recovery_rounds = 0;
                    b.current_phase = None;
                }),
            )
            .await?;
        self.manifest_cache(id).remove(phase.number)
    }

    async fn run_phase(self: &Arc<Self>, ctx: &mut RunCtx, phase: &Arc<Phase>) -> Result<PhaseOutcome> {
        let id = ctx.id;
        let label = phase.label();
        let current = label.clone();
        let build = self
            .store
            .update(id, Box::new(move |b| b.current_phase = Some(current)))
            .await?
            .ok_or_else(|| BuildError::NotFound { id })?;
        self.registry.beat(id, &format!("{} planning", label));
        self.registry.events().publish(BuildEvent::PhaseStarted {
            build_id: id,
            phase: phase.number,
            name: phase.name.clone(),
            attempt: build.counters.phase_attempts + 1,
        });
        tracing::info!(build_id = %id, phase = phase.number, name = %phase.name, "phase started");

        let manifest = match self.obtain_manifest(ctx, phase).await? {
            Ok(manifest) => manifest,
            Err(outcome) => return Ok(outcome),
        };
        ctx.current = Some(manifest.clone());
        let baseline = ctx.workspace.list_files()?;
        let routes = ctx.contracts.declared_routes();
        let cap = self.config.orchestrator.max_phase_attempts.max(1);
        let mut unaudited_round = None;

        loop {
            let failures = match self.build_files(ctx, phase, &manifest).await? {
                Ok(failures) => failures,
                Err(outcome) => return Ok(PhaseOutcome::Halt(outcome)),
            };
            let report = self.governance(ctx, phase, &manifest, &baseline, &routes)?;
            if failures.is_empty() && report.passed {
                if let Some(round) = unaudited_round {
                    self.commit_recovery(ctx, phase, round).await?;
                }
                break;
            }

            let findings = phase_findings(&failures, &report);
            ctx.error_context = Some(findings.clone());
            let attempts = self
                .store
                .update(id, Box::new(|b| b.counters.phase_attempts += 1))
                .await?
                .map_or(cap, |b| b.counters.phase_attempts);
            let reason = format!(
                "{} failed checks (attempt {}/{}): {} audit failure(s), governance {}",
                label,
                attempts,
                cap,
                failures.len(),
                report.summary()
            );
            self.registry.log(id, LogLevel::Warn, reason.clone()).await?;
            if attempts >= cap {
                return self.phase_review(ctx, phase, &reason).await;
            }
            if let Some(outcome) = self.checkpoint(ctx).await? {
                return Ok(PhaseOutcome::Halt(outcome));
            }
            let failing: Vec<String> = failures.iter().map(|f| f.path.clone()).collect();
            unaudited_round = self.recover(ctx, phase, &manifest, &findings, &failing).await?;
        }

        let partial = match self.verify_phase(ctx, phase, &manifest, &baseline, &routes).await? {
            Ok(partial) => partial,
            Err(outcome) => return Ok(outcome),
        };
        self.complete_phase(ctx, phase, partial).await
    }

    /// Reuse the cached manifest or plan a new one. `Err` carries the
    /// phase outcome when planning could not produce one.
    async fn obtain_manifest(
        &self,
        ctx: &mut RunCtx,
        phase: &Arc<Phase>,
    ) -> Result<Result<Arc<PhaseManifest>, PhaseOutcome>> {
        let id = ctx.id;
        let cache = self.manifest_cache(id);
        if let Some(entries) = cache.load(phase.number)? {
            tracing::info!(build_id = %id, phase = phase.number, files = entries.len(), "resuming cached manifest");
            self.registry.events().publish(BuildEvent::PlanReady {
                build_id: id,
                phase: phase.number,
                files: entries.len(),
                cached: true,
            });
            return Ok(Ok(Arc::new(PhaseManifest::resume(cache, phase.number, entries))));
        }

        let existing = ctx.workspace.list_files()?;
        let mut answers: Vec<String> = Vec::new();
        let mut attempt = 0;
        loop {
            if let Some(outcome) = self.checkpoint(ctx).await? {
                return Ok(Err(PhaseOutcome::Halt(outcome)));
            }
            attempt += 1;
            let scope = self.scope(ctx, phase);
            match planning::plan_manifest(self, &scope, &existing, &answers).await {
                Ok(PlanResult::Manifest(entries)) => {
                    let files = entries.len();
                    let manifest = PhaseManifest::create(cache, phase.number, entries)?;
                    self.registry.events().publish(BuildEvent::PlanReady {
                        build_id: id,
                        phase: phase.number,
                        files,
                        cached: false,
                    });
                    self.registry
                        .log(id, LogLevel::Info, format!("{} planned: {} files", phase.label(), files))
                        .await?;
                    return Ok(Ok(Arc::new(manifest)));
                }
                Ok(PlanResult::Questions(questions)) => {
                    let payload = json!({ "phase": phase.number, "questions": questions });
                    let answer = match self.wait_gate(ctx, GateKind::Clarification, payload).await? {
                        GateWait::Cancelled => {
                            return Ok(Err(PhaseOutcome::Halt(RunOutcome::Cancelled)));
                        }
                        GateWait::Resolved(GateResolution::Abort) => {
                            return Ok(Err(PhaseOutcome::Halt(RunOutcome::Failed(
                                "aborted by operator at clarification".to_string(),
                            ))));
                        }
                        GateWait::Resolved(GateResolution::Answer(text)) if !text.trim().is_empty() => text,
                        GateWait::Resolved(_) => "No preference: use your best judgement.".to_string(),
                    };
                    answers.push(answer);
                    attempt = 0;
                }
                Err(e) => {
                    if matches!(e.downcast_ref::<ProviderError>(), Some(ProviderError::Fatal(_))) {
                        return Err(e);
                    }
                    tracing::warn!(build_id = %id, phase = phase.number, attempt, error = %e, "manifest planning failed");
                    if attempt < 2 {
                        continue;
                    }
                    let reason = format!("manifest planning failed for {}: {}", phase.label(), e);
                    return Ok(Err(self.phase_review(ctx, phase, &reason).await?));
                }
            }
        }
    }

    /// Generate every unsatisfied entry in dependency order, auditing each
    /// as soon as it is written, then drain the fix queue. `Ok` carries the
    /// files still failing.
    async fn build_files(
        self: &Arc<Self>,
        ctx: &mut RunCtx,
        phase: &Arc<Phase>,
        manifest: &Arc<PhaseManifest>,
    ) -> Result<Result<Vec<AuditResult>, RunOutcome>> {
        let id = ctx.id;
        let semaphore = Arc::new(Semaphore::new(self.config.orchestrator.audit_concurrency.max(1)));
        let mut audits: JoinSet<(String, Result<LadderOutcome>)> = JoinSet::new();
        let mut queue = FixQueue::new();

        for entry in topological_sort(&manifest.entries()) {
            if let Some(outcome) = self.checkpoint(ctx).await? {
                audits.abort_all();
                return Ok(Err(outcome));
            }
            let on_disk = has_content(&ctx.root, &entry.path);
            match (entry.action, entry.status) {
                (FileAction::Delete, status) => {
                    if !status.is_settled() {
                        safe_delete(&ctx.root, &entry.path)?;
                        manifest.set_status(&entry.path, FileStatus::Audited, Some(Verdict::Pass))?;
                        tracing::info!(build_id = %id, path = %entry.path, "deleted");
                    }
                    continue;
                }
                (_, status) if status.is_settled() && on_disk => {
                    tracing::debug!(build_id = %id, path = %entry.path, "already audited, skipping");
                    continue;
                }
                (_, FileStatus::FixQueued) if on_disk => {
                    let findings = entry
                        .findings
                        .clone()
                        .unwrap_or_else(|| "previous repairs did not pass audit".to_string());
                    queue.push(&entry.path, findings);
                    continue;
                }
                (_, FileStatus::Fixing) if on_disk => {}
                _ => {
                    let scope = self.scope(ctx, phase);
                    self.registry.beat(id, &format!("generating {}", entry.path));
                    let content =
                        generate_file(self, &scope, &entry, ctx.error_context.as_deref()).await?;
                    safe_write(&ctx.root, &entry.path, &content)?;
                    self.registry.events().publish(BuildEvent::FileWritten {
                        build_id: id,
                        path: entry.path.clone(),
                    });
                    tracing::info!(build_id = %id, path = %entry.path, bytes = content.len(), "file written");
                }
            }

            let engine = Arc::clone(self);
            let scope = self.scope(ctx, phase);
            let manifest = manifest.clone();
            let semaphore = semaphore.clone();
            audits.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = audit::run_ladder(&engine, &scope, &manifest, &entry).await;
                (entry.path, outcome)
            });
        }

        loop {
            let joined = tokio::select! {
                joined = audits.join_next() => joined,
                _ = ctx.runtime.cancel.cancelled() => {
                    audits.abort_all();
                    return Ok(Err(RunOutcome::Cancelled));
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let (path, outcome) = joined.context("audit task panicked")?;
            if let LadderOutcome::Queued(findings) = outcome? {
                queue.push(&path, findings);
            }
        }

        if let Some(outcome) = self.checkpoint(ctx).await? {
            return Ok(Err(outcome));
        }
        if queue.is_empty() {
            return Ok(Ok(Vec::new()));
        }
        tracing::info!(build_id = %id, queued = queue.len(), "draining fix queue");
        let scope = self.scope(ctx, phase);
        let failures = audit::drain_fix_queue(self, &scope, manifest, queue).await?;
        Ok(Ok(failures))
    }

    fn governance(
        &self,
        ctx: &RunCtx,
        phase: &Phase,
        manifest: &PhaseManifest,
        baseline: &[String],
        routes: &[(String, String)],
    ) -> Result<GovernanceReport> {
        let report = governance::evaluate(
            &ctx.root,
            &manifest.entries(),
            baseline,
            routes,
            &self.config.governance,
        )?;
        self.registry.events().publish(BuildEvent::GovernanceReport {
            build_id: ctx.id,
            phase: phase.number,
            passed: report.passed,
            failing: report.blocking.clone(),
        });
        tracing::info!(
            build_id = %ctx.id,
            phase = phase.number,
            passed = report.passed,
            checks = %report.summary(),
            "governance evaluated"
        );
        Ok(report)
    }

    /// One recovery round: plan and apply the fix manifest. Rewritten files
    /// are left `Fixing` for the next audit pass; `Some(round)` means the
    /// round wrote something that still has to pass audit before it is
    /// committed.
    async fn recover(
        &self,
        ctx: &mut RunCtx,
        phase: &Arc<Phase>,
        manifest: &PhaseManifest,
        findings: &str,
        failing: &[String],
    ) -> Result<Option<u32>> {
        let id = ctx.id;
        let round = self
            .store
            .update(id, Box::new(|b| b.counters.recovery_rounds += 1))
            .await?
            .map_or(1, |b| b.counters.recovery_rounds);
        self.registry.beat(id, &format!("recovery round {}", round));
        let scope = self.scope(ctx, phase);
        let plan = match planner::plan(self, &scope, findings, failing).await {
            Ok(plan) => plan,
            Err(e) if e.downcast_ref::<ProviderError>().is_some() => return Err(e),
            Err(e) => {
                self.registry
                    .log(id, LogLevel::Warn, format!("recovery planning failed: {}", e))
                    .await?;
                return Ok(None);
            }
        };
        self.registry
            .log(
                id,
                LogLevel::Info,
                format!("recovery round {}: {} ({} fixes)", round, plan.plan, plan.fixes.len()),
            )
            .await?;

        for fix in &plan.fixes {
            let mut entry = fix.to_manifest_entry(manifest.get(&fix.path))?;
            if fix.action == FileAction::Delete {
                safe_delete(&ctx.root, &fix.path)?;
                entry.status = FileStatus::Audited;
                entry.verdict = Some(Verdict::Pass);
                manifest.upsert(entry)?;
                continue;
            }
            let context = format!("Required fix: {}\n\n{}", fix.instructions, findings);
            let content = generate_file(self, &scope, &entry, Some(&context)).await?;
            safe_write(&ctx.root, &fix.path, &content)?;
            self.registry.events().publish(BuildEvent::FileWritten {
                build_id: id,
                path: fix.path.clone(),
            });
            entry.status = FileStatus::Fixing;
            entry.verdict = None;
            entry.findings = None;
            manifest.upsert(entry)?;
        }
        Ok((!plan.fixes.is_empty()).then_some(round))
    }

    async fn commit_recovery(&self, ctx: &RunCtx, phase: &Phase, round: u32) -> Result<()> {
        let message = format!(
            "{}: Phase {} recovery round {}",
            self.config.orchestrator.commit_tag, phase.number, round
        );
        self.commit(ctx, &message).await?;
        Ok(())
    }

    /// Syntax and test verification with bounded repair rounds. Files a
    /// round rewrites go back through audit and governance before the next
    /// verification. `Ok` carries whether the phase passed only partially.
    async fn verify_phase(
        self: &Arc<Self>,
        ctx: &mut RunCtx,
        phase: &Arc<Phase>,
        manifest: &Arc<PhaseManifest>,
        baseline: &[String],
        routes: &[(String, String)],
    ) -> Result<Result<bool, PhaseOutcome>> {
        let id = ctx.id;
        let rounds = self.config.orchestrator.verification_rounds.max(1);
        let mut last = String::new();
        for round in 1..=rounds {
            self.registry.beat(id, &format!("verifying {} (round {})", phase.label(), round));
            let result = verify::verify(&ctx.root, &manifest.entries(), &self.config.verification).await?;
            if result.passed() {
                tracing::info!(build_id = %id, phase = phase.number, round, "verification passed");
                return Ok(Ok(false));
            }
            last = result.findings();
            tracing::warn!(build_id = %id, phase = phase.number, round, "verification failed");
            if round == rounds {
                break;
            }
            if let Some(outcome) = self.checkpoint(ctx).await? {
                return Ok(Err(PhaseOutcome::Halt(outcome)));
            }
            let scope = self.scope(ctx, phase);
            let recovery_round = if !result.syntax_errors.is_empty() {
                for (path, error) in &result.syntax_errors {
                    if let Some(entry) = manifest.get(path)
                        && audit::repair(self, &scope, ModelTier::Primary, &entry, error, "")
                            .await?
                            .is_some()
                    {
                        manifest.set_status(path, FileStatus::Fixing, None)?;
                    }
                }
                None
            } else {
                self.recover(ctx, phase, manifest, &last, &[]).await?
            };

            let failures = match self.build_files(ctx, phase, manifest).await? {
                Ok(failures) => failures,
                Err(outcome) => return Ok(Err(PhaseOutcome::Halt(outcome))),
            };
            let report = self.governance(ctx, phase, manifest, baseline, routes)?;
            if !failures.is_empty() || !report.passed {
                let findings = phase_findings(&failures, &report);
                ctx.error_context = Some(findings);
                let reason = format!(
                    "{} verification repairs failed checks: {} audit failure(s), governance {}",
                    phase.label(),
                    failures.len(),
                    report.summary()
                );
                self.registry.log(id, LogLevel::Warn, reason.clone()).await?;
                return Ok(Err(self.phase_review(ctx, phase, &reason).await?));
            }
            if let Some(round) = recovery_round {
                self.commit_recovery(ctx, phase, round).await?;
            }
        }

        if self.config.orchestrator.accept_partial_pass {
            self.registry
                .log(
                    id,
                    LogLevel::Warn,
                    format!("{} accepted as partial pass; verification issues remain:\n{}", phase.label(), last),
                )
                .await?;
            return Ok(Ok(true));
        }
        let reason = format!("{} failed verification after {} rounds", phase.label(), rounds);
        Ok(Err(self.phase_review(ctx, phase, &reason).await?))
    }

    async fn complete_phase(&self, ctx: &mut RunCtx, phase: &Arc<Phase>, partial: bool) -> Result<PhaseOutcome> {
        let id = ctx.id;
        let attempts = self.get_build(id).await?.counters.phase_attempts;
        let tag = &self.config.orchestrator.commit_tag;
        let message = if attempts > 0 {
            format!("{}: Phase {} complete ({} audit attempts)", tag, phase.number, attempts)
        } else {
            format!("{}: Phase {} complete", tag, phase.number)
        };
        self.commit(ctx, &message).await?;
        self.mark_phase_done(id, phase).await?;
        ctx.current = None;
        ctx.error_context = None;
        self.registry.events().publish(BuildEvent::PhaseCompleted {
            build_id: id,
            phase: phase.number,
            partial,
        });
        self.registry
            .log(id, LogLevel::Info, format!("{} complete", phase.label()))
            .await?;

        if self.config.workspace.push_each_phase && ctx.has_remote {
            match self.push(ctx).await {
                PushResult::Pushed => {}
                PushResult::Exhausted(reason) => return Ok(PhaseOutcome::Halt(RunOutcome::Paused(reason))),
                PushResult::Rejected(reason) => return Ok(PhaseOutcome::Halt(RunOutcome::Failed(reason))),
            }
        }
        Ok(PhaseOutcome::Passed)
    }

    async fn commit(&self, ctx: &RunCtx, message: &str) -> Result<Option<String>> {
        ctx.workspace.add_all().await?;
        let commit = ctx.workspace.commit(message).await?;
        match &commit {
            Some(sha) => tracing::info!(build_id = %ctx.id, commit = %sha, message, "committed"),
            None => tracing::debug!(build_id = %ctx.id, message, "nothing to commit"),
        }
        Ok(commit)
    }

    /// Push with exponential backoff. Retryable failures go up to
    /// `push_max_retries` attempts; a fatal failure stops immediately.
    async fn push(&self, ctx: &RunCtx) -> PushResult {
        let settings = &self.config.workspace;
        let result = retry_sync(settings.push_max_retries, settings.push_backoff_ms, |_| {
            self.registry.beat(ctx.id, "pushing");
            ctx.workspace.push(&ctx.branch)
        })
        .await;
        match result {
            Ok(()) => {
                tracing::info!(build_id = %ctx.id, branch = %ctx.branch, "pushed");
                PushResult::Pushed
            }
            Err(SyncError::Fatal(msg)) => {
                tracing::error!(build_id = %ctx.id, error = %msg, "push rejected");
                PushResult::Rejected(format!("push rejected by remote: {}", msg))
            }
            Err(SyncError::Retryable(msg)) => PushResult::Exhausted(format!("push {}", msg)),
        }
    }

    /// Persist how a run ended. Cancelled and failed builds lose their gate
    /// marker and, for ephemeral targets, their workspace.
    pub async fn finalize(&self, id: BuildId, outcome: RunOutcome) -> Result<BuildStatus> {
        let (status, detail) = match outcome {
            RunOutcome::Completed => (BuildStatus::Completed, "all phases complete".to_string()),
            RunOutcome::Paused(reason) => (BuildStatus::Paused, reason),
            RunOutcome::Cancelled => (BuildStatus::Cancelled, "cancelled by operator".to_string()),
            RunOutcome::Failed(reason) => (BuildStatus::Failed, reason),
        };
        if !self.registry.transition(id, status, Some(detail)).await? {
            tracing::warn!(build_id = %id, status = %status, "could not record final status");
        }
        if matches!(status, BuildStatus::Cancelled | BuildStatus::Failed) {
            let build = self
                .store
                .update(id, Box::new(|b| b.pending_gate = None))
                .await?;
            if let Some(build) = build
                && build.target.is_ephemeral()
                && let Err(e) = self.workspaces.remove(&build).await
            {
                tracing::warn!(build_id = %id, error = %e, "failed to remove workspace");
            }
        }
        if status == BuildStatus::Completed {
            self.store
                .update(id, Box::new(|b| b.current_phase = None))
                .await?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoforgeConfig;
    use crate::orchestrator::testing::Harness;
    use crate::provider::{GenerationRequest, ScriptedClient};

    fn file_block(path: &str, content: &str) -> String {
        format!("=== FILE: {} ===\n{}\n=== END FILE ===\n", path, content)
    }

    /// Plans one file per phase and writes clean content. Audits fail for
    /// any content containing "broken".
    fn reply(req: &GenerationRequest, content_for: &dyn Fn(&str) -> String) -> Result<String, ProviderError> {
        let mut words = req.label.split_whitespace();
        let step = words.next().unwrap_or("");
        match step {
            "plan" => {
                let path = if req.label.ends_with(" 0") { "app/main.py" } else { "app/core.py" };
                Ok(format!(r#"{{"files": [{{"path": "{}", "purpose": "module"}}]}}"#, path))
            }
            "generate" | "fix" | "repair" => {
                let path = words.next().unwrap_or("");
                Ok(file_block(path, &content_for(path)))
            }
            "audit" if req.prompt.contains("broken") => Ok("VERDICT: FAIL\n- broken".into()),
            "audit" => Ok("VERDICT: PASS".into()),
            "recover" => Ok(r#"{"plan": "nothing to do", "fixes": []}"#.into()),
            _ => Err(ProviderError::Fatal(format!("unexpected call {}", req.label))),
        }
    }

    fn clean_client() -> ScriptedClient {
        ScriptedClient::new(|req| reply(req, &|_| "def run():\n    return 1".to_string()))
    }

    async fn run(harness: &Harness, carried: Option<(GateKind, GateResolution)>) -> RunOutcome {
        let runtime = harness.registry.register(harness.build_id).unwrap();
        harness.engine.clone().run(runtime, carried).await.unwrap()
    }

    #[tokio::test]
    async fn test_two_phase_build_completes() {
        let harness = Harness::new(clean_client(), AutoforgeConfig::default()).await;
        let outcome = run(&harness, None).await;
        assert_eq!(outcome, RunOutcome::Completed);

        let build = harness.build().await;
        assert_eq!(build.completed_phases, 1);
        assert!(build.workspace_prepared);
        assert_eq!(build.contracts_hash.as_deref().map(str::len), Some(12));
        assert!(build.cost_usd > 0.0);
        assert_eq!(
            harness.workspaces.workspace().commits(),
            vec!["forge: contract snapshot", "forge: Phase 0 complete", "forge: Phase 1 complete"]
        );
        assert_eq!(harness.workspaces.workspace().push_calls(), 2);
        assert!(harness.read("app/main.py").unwrap().ends_with("return 1\n"));
        assert!(harness.engine.manifest_cache(harness.build_id).cached_phases().is_empty());
        assert!(harness.ledger_rows().await >= 6);
    }

    #[tokio::test]
    async fn test_cached_manifest_and_audited_files_are_not_redone() {
        let harness = Harness::new(clean_client(), AutoforgeConfig::default()).await;
        let mut entry = crate::manifest::FileManifestEntry::new("app/main.py", FileAction::Create, "m").unwrap();
        entry.status = FileStatus::Audited;
        entry.verdict = Some(Verdict::Pass);
        harness
            .engine
            .manifest_cache(harness.build_id)
            .save(0, &[entry])
            .unwrap();
        harness.write("app/main.py", "def run():\n    return 0\n");

        assert_eq!(run(&harness, None).await, RunOutcome::Completed);
        assert_eq!(harness.client.calls_labelled("plan phase 0"), 0);
        assert_eq!(harness.client.calls_labelled("generate app/main.py"), 0);
        assert_eq!(harness.client.calls_labelled("audit app/main.py"), 0);
        assert_eq!(harness.read("app/main.py").unwrap(), "def run():\n    return 0\n");
        assert_eq!(harness.client.calls_labelled("plan phase 1"), 1);
    }

    #[tokio::test]
    async fn test_resumed_fix_queue_entry_keeps_its_findings() {
        let harness = Harness::new(clean_client(), AutoforgeConfig::default()).await;
        let mut entry = crate::manifest::FileManifestEntry::new("app/main.py", FileAction::Create, "m").unwrap();
        entry.status = FileStatus::FixQueued;
        entry.verdict = Some(Verdict::Fail);
        entry.findings = Some("- missing import os".into());
        harness
            .engine
            .manifest_cache(harness.build_id)
            .save(0, &[entry])
            .unwrap();
        harness.write("app/main.py", "path = os.getcwd()\n");

        assert_eq!(run(&harness, None).await, RunOutcome::Completed);
        assert_eq!(harness.client.calls_labelled("generate app/main.py"), 0);
        assert_eq!(harness.client.calls_labelled("fix app/main.py"), 0);
        let repair = harness
            .client
            .requests()
            .into_iter()
            .find(|r| r.label == "repair app/main.py")
            .unwrap();
        assert!(repair.prompt.contains("- missing import os"));
    }

    #[tokio::test]
    async fn test_push_exhaustion_pauses() {
        let harness = Harness::with_workspace(clean_client(), AutoforgeConfig::default(), |ws| {
            ws.failing_pushes(2)
        })
        .await;
        let outcome = run(&harness, None).await;
        let RunOutcome::Paused(reason) = outcome else {
            panic!("expected pause, got {:?}", outcome);
        };
        assert!(reason.contains("2 attempts"), "{}", reason);
        assert_eq!(harness.build().await.completed_phases, 0);

        let status = harness
            .engine
            .finalize(harness.build_id, RunOutcome::Paused(reason))
            .await
            .unwrap();
        assert_eq!(status, BuildStatus::Paused);
    }

    #[tokio::test]
    async fn test_unreachable_remote_pauses_before_any_work() {
        let harness = Harness::with_provider(clean_client(), AutoforgeConfig::default(), |p| {
            p.failing_prepare(SyncError::Retryable("clone of origin failed after 2 attempts: timed out".into()))
        })
        .await;
        let outcome = run(&harness, None).await;
        let RunOutcome::Paused(reason) = outcome else {
            panic!("expected pause, got {:?}", outcome);
        };
        assert!(reason.starts_with("workspace unavailable"), "{}", reason);
        assert!(reason.contains("2 attempts"), "{}", reason);
        assert_eq!(harness.client.call_count(), 0);
        assert!(!harness.build().await.workspace_prepared);
    }

    #[tokio::test]
    async fn test_rejected_clone_fails() {
        let harness = Harness::with_provider(clean_client(), AutoforgeConfig::default(), |p| {
            p.failing_prepare(SyncError::Fatal("authentication failed".into()))
        })
        .await;
        let outcome = run(&harness, None).await;
        assert!(matches!(outcome, RunOutcome::Failed(ref r) if r.contains("authentication failed")));
        assert_eq!(harness.client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_push_fails() {
        let harness = Harness::with_workspace(clean_client(), AutoforgeConfig::default(), |ws| {
            ws.rejecting_pushes()
        })
        .await;
        assert!(matches!(run(&harness, None).await, RunOutcome::Failed(_)));
        assert_eq!(harness.workspaces.workspace().push_calls(), 1);
    }

    #[tokio::test]
    async fn test_phase_cap_opens_review_gate_and_skip_advances() {
        let client = ScriptedClient::new(|req| {
            reply(req, &|path| {
                if path == "app/main.py" {
                    "broken = True".to_string()
                } else {
                    "ok = True".to_string()
                }
            })
        });
        let mut config = AutoforgeConfig::default();
        config.orchestrator.max_phase_attempts = 2;
        let harness = Harness::new(client, config).await;
        let mut events = harness.registry.events().subscribe();
        let runtime = harness.registry.register(harness.build_id).unwrap();
        let task = tokio::spawn(harness.engine.clone().run(runtime, None));

        loop {
            if let BuildEvent::GateOpened { kind, .. } = events.recv().await.unwrap()
                && kind == GateKind::PhaseReview
            {
                break;
            }
        }
        let build = harness.build().await;
        assert_eq!(build.status, BuildStatus::Paused);
        assert_eq!(build.pending_gate.map(|g| g.kind), Some(GateKind::PhaseReview));
        assert_eq!(build.counters.phase_attempts, 2);
        assert_eq!(harness.client.calls_labelled("recover"), 1);

        harness
            .registry
            .resolve_gate(harness.build_id, GateResolution::Skip)
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), RunOutcome::Completed);
        let build = harness.build().await;
        assert_eq!(build.completed_phases, 1);
        assert!(build.pending_gate.is_none());
        assert!(!harness
            .workspaces
            .workspace()
            .commits()
            .contains(&"forge: Phase 0 complete".to_string()));
    }

    async fn gate_payload(
        events: &mut tokio::sync::broadcast::Receiver<BuildEvent>,
        wanted: GateKind,
    ) -> serde_json::Value {
        loop {
            if let BuildEvent::GateOpened { kind, payload, .. } = events.recv().await.unwrap()
                && kind == wanted
            {
                return payload;
            }
        }
    }

    fn verifying_config(command: &str) -> AutoforgeConfig {
        let mut config = AutoforgeConfig::default();
        config.verification.test_command = Some(command.to_string());
        config.verification.timeout_secs = 10;
        config
    }

    #[tokio::test]
    async fn test_recovery_rewrite_is_audited_before_commit() {
        let client = ScriptedClient::new(|req| {
            if req.label.starts_with("recover") {
                return Ok(r#"{"plan": "add the core module", "fixes": [
                    {"path": "app/core.py", "action": "create",
                     "instructions": "define the fixed marker", "context_files": ["app/main.py"]}
                ]}"#
                .into());
            }
            reply(req, &|path| {
                if path == "app/core.py" {
                    "fixed = 'broken'".to_string()
                } else {
                    "x = 1".to_string()
                }
            })
        });
        let harness = Harness::new(client, verifying_config("grep -q fixed app/core.py")).await;
        let mut events = harness.registry.events().subscribe();
        let runtime = harness.registry.register(harness.build_id).unwrap();
        let task = tokio::spawn(harness.engine.clone().run(runtime, None));

        let payload = gate_payload(&mut events, GateKind::PhaseReview).await;
        assert_eq!(payload["phase"], 0);
        assert!(payload["reason"].as_str().unwrap().contains("audit failure"));
        assert!(harness.client.calls_labelled("audit app/core.py") >= 1);
        assert_eq!(harness.client.calls_labelled("repair app/core.py"), 1);
        let commits = harness.workspaces.workspace().commits();
        assert!(!commits.iter().any(|c| c.contains("recovery round")), "{:?}", commits);
        assert!(!commits.iter().any(|c| c.contains("Phase 0 complete")), "{:?}", commits);
        let entry = harness.engine.manifest_cache(harness.build_id).load(0).unwrap().unwrap();
        let core = entry.iter().find(|e| e.path == "app/core.py").unwrap();
        assert_eq!(core.status, FileStatus::FixQueued);

        harness
            .registry
            .resolve_gate(harness.build_id, GateResolution::Abort)
            .await
            .unwrap();
        assert!(matches!(task.await.unwrap().unwrap(), RunOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_audited_recovery_rewrite_is_committed() {
        let client = ScriptedClient::new(|req| {
            if req.label == "recover phase 0" {
                return Ok(r#"{"plan": "add the core module", "fixes": [
                    {"path": "app/core.py", "action": "create",
                     "instructions": "define the fixed marker", "context_files": ["app/main.py"]}
                ]}"#
                .into());
            }
            reply(req, &|path| {
                if path == "app/core.py" {
                    "fixed = True".to_string()
                } else {
                    "x = 1".to_string()
                }
            })
        });
        let harness = Harness::new(client, verifying_config("test -f app/core.py")).await;
        assert_eq!(run(&harness, None).await, RunOutcome::Completed);
        assert_eq!(harness.client.calls_labelled("audit app/core.py"), 2);
        let commits = harness.workspaces.workspace().commits();
        let recovery = commits.iter().position(|c| c == "forge: Phase 0 recovery round 1").unwrap();
        let complete = commits.iter().position(|c| c == "forge: Phase 0 complete").unwrap();
        assert!(recovery < complete);
    }

    #[tokio::test]
    async fn test_partial_pass_advances_with_warning() {
        let mut config = verifying_config("exit 1");
        config.orchestrator.verification_rounds = 2;
        let harness = Harness::new(clean_client(), config).await;
        let mut events = harness.registry.events().subscribe();
        assert_eq!(run(&harness, None).await, RunOutcome::Completed);

        assert_eq!(harness.build().await.completed_phases, 1);
        assert_eq!(harness.client.calls_labelled("recover phase 0"), 1);
        assert_eq!(harness.client.calls_labelled("recover phase 1"), 1);
        let warnings: Vec<_> = harness
            .logs()
            .await
            .into_iter()
            .filter(|l| l.level == LogLevel::Warn && l.message.contains("accepted as partial pass"))
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("test command failed"));

        let mut partial = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BuildEvent::PhaseCompleted { phase, partial: p, .. } = event {
                partial.push((phase, p));
            }
        }
        assert_eq!(partial, vec![(0, true), (1, true)]);
    }

    #[tokio::test]
    async fn test_verification_rounds_exhausted_open_phase_review() {
        let mut config = verifying_config("exit 1");
        config.orchestrator.verification_rounds = 3;
        config.orchestrator.accept_partial_pass = false;
        let harness = Harness::new(clean_client(), config).await;
        let mut events = harness.registry.events().subscribe();
        let runtime = harness.registry.register(harness.build_id).unwrap();
        let task = tokio::spawn(harness.engine.clone().run(runtime, None));

        let payload = gate_payload(&mut events, GateKind::PhaseReview).await;
        assert!(payload["reason"].as_str().unwrap().ends_with("failed verification after 3 rounds"));
        assert_eq!(harness.client.calls_labelled("recover phase 0"), 2);
        assert_eq!(harness.build().await.status, BuildStatus::Paused);

        harness
            .registry
            .resolve_gate(harness.build_id, GateResolution::Abort)
            .await
            .unwrap();
        assert!(matches!(task.await.unwrap().unwrap(), RunOutcome::Failed(ref r) if r.contains("Phase 0")));
        assert_eq!(harness.build().await.completed_phases, -1);
    }

    #[tokio::test]
    async fn test_clarification_answer_feeds_replan() {
        let asked = std::sync::atomic::AtomicBool::new(false);
        let client = ScriptedClient::new(move |req| {
            if req.label == "plan phase 0"
                && !asked.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                return Ok(r#"{"questions": ["Which database?"], "files": []}"#.into());
            }
            reply(req, &|_| "x = 1".to_string())
        });
        let harness = Harness::new(client, AutoforgeConfig::default()).await;
        let mut events = harness.registry.events().subscribe();
        let runtime = harness.registry.register(harness.build_id).unwrap();
        let task = tokio::spawn(harness.engine.clone().run(runtime, None));

        loop {
            if let BuildEvent::GateOpened { kind, payload, .. } = events.recv().await.unwrap()
                && kind == GateKind::Clarification
            {
                assert_eq!(payload["questions"][0], "Which database?");
                break;
            }
        }
        harness
            .registry
            .resolve_gate(harness.build_id, GateResolution::Answer("SQLite".into()))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), RunOutcome::Completed);
        let plans: Vec<_> = harness
            .client
            .requests()
            .into_iter()
            .filter(|r| r.label == "plan phase 0")
            .collect();
        assert_eq!(plans.len(), 2);
        assert!(plans[1].prompt.contains("SQLite"));
    }

    #[tokio::test]
    async fn test_carried_plan_approval_skips_gate() {
        let mut config = AutoforgeConfig::default();
        config.orchestrator.plan_review = true;
        let harness = Harness::new(clean_client(), config).await;
        let outcome = run(&harness, Some((GateKind::PlanReview, GateResolution::Approve))).await;
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_signals_and_cancel_at_checkpoint() {
        let harness = Harness::new(clean_client(), AutoforgeConfig::default()).await;
        let runtime = harness.registry.register(harness.build_id).unwrap();
        harness
            .registry
            .send_signal(harness.build_id, ControlSignal::Instruction("use type hints".into()));
        assert!(harness.registry.request_cancel(harness.build_id));
        let outcome = harness.engine.clone().run(runtime, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(harness.client.call_count(), 0);

        let status = harness
            .engine
            .finalize(harness.build_id, RunOutcome::Cancelled)
            .await
            .unwrap();
        assert_eq!(status, BuildStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_operator_instruction_reaches_prompts() {
        let harness = Harness::new(clean_client(), AutoforgeConfig::default()).await;
        let runtime = harness.registry.register(harness.build_id).unwrap();
        harness
            .registry
            .send_signal(harness.build_id, ControlSignal::Instruction("use type hints".into()));
        assert_eq!(harness.engine.clone().run(runtime, None).await.unwrap(), RunOutcome::Completed);
        let generate = harness
            .client
            .requests()
            .into_iter()
            .find(|r| r.label == "generate app/main.py")
            .unwrap();
        assert!(generate.prompt.contains("- use type hints"));
    }

    #[tokio::test]
    async fn test_transient_provider_failure_pauses() {
        let client = ScriptedClient::new(|req| {
            if req.label.starts_with("generate") {
                return Err(ProviderError::Transient("503".into()));
            }
            reply(req, &|_| String::new())
        });
        let harness = Harness::new(client, AutoforgeConfig::default()).await;
        let outcome = run(&harness, None).await;
        assert!(matches!(outcome, RunOutcome::Paused(ref r) if r.contains("503")));
    }
}
