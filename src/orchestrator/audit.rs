//! Per-file audit and the fix ladder.
//!
//! A written file is syntax-checked and reviewed by the economy model. A
//! failing file gets up to `fixer_rounds` surgical economy repairs, each
//! followed by a re-audit. Files still failing join the [`FixQueue`], which
//! is drained once the whole phase has been generated: one primary-model
//! repair with sibling context, then a final audit.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use super::generate::clean_output;
use super::prompts::{AUDITOR_SYSTEM_PROMPT, FIXER_SYSTEM_PROMPT, audit_prompt, fix_prompt};
use super::{Engine, PhaseManifest, PhaseScope};
use crate::events::BuildEvent;
use crate::manifest::{AuditResult, FileManifestEntry, FileStatus, Verdict};
use crate::provider::{GenerationRequest, ModelTier};
use crate::syntax;
use crate::workspace::{safe_read, safe_write};

static VERDICT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^[\s*#>]*VERDICT\s*:?\s*\**\s*(PASS|FAIL)\b").unwrap());

static BARE_FAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\**FAIL\**\s*$").unwrap());

const AUDIT_MAX_TOKENS: u32 = 1024;

/// Read a verdict out of an audit reply.
///
/// A reply with no verdict line counts as a pass unless it holds a bare
/// `FAIL` line; the auditor only flags structural problems, so silence is
/// read as having found none.
pub fn parse_verdict(path: &str, text: &str) -> AuditResult {
    let verdict = match VERDICT_LINE.captures(text) {
        Some(caps) if caps[1].eq_ignore_ascii_case("FAIL") => Verdict::Fail,
        Some(_) => Verdict::Pass,
        None if BARE_FAIL.is_match(text) => Verdict::Fail,
        None => {
            tracing::warn!(path, "audit reply carried no verdict, treating as PASS");
            Verdict::Pass
        }
    };
    match verdict {
        Verdict::Pass => AuditResult::pass(path),
        Verdict::Fail => {
            let findings = VERDICT_LINE.replace(text, "").trim().to_string();
            let findings = if findings.is_empty() {
                "auditor reported FAIL without findings".to_string()
            } else {
                findings
            };
            AuditResult::fail(path, findings)
        }
    }
}

/// Audit the file currently on disk for `entry`.
pub async fn review(engine: &Engine, scope: &PhaseScope, entry: &FileManifestEntry) -> Result<AuditResult> {
    let content = match safe_read(&scope.root, &entry.path)? {
        Some(content) => content,
        None => return Ok(AuditResult::fail(&entry.path, "file is missing on disk")),
    };
    if content.trim().is_empty() {
        return Ok(AuditResult::fail(&entry.path, "file is empty"));
    }
    if let Err(e) = syntax::check(&entry.path, &content) {
        return Ok(AuditResult::fail(&entry.path, format!("syntax error: {}", e)));
    }

    let request = GenerationRequest::new(
        ModelTier::Economy,
        format!("audit {}", entry.path),
        audit_prompt(entry, &content),
    )
    .with_system(AUDITOR_SYSTEM_PROMPT)
    .with_max_tokens(AUDIT_MAX_TOKENS);
    let response = engine.call(scope.id, &scope.ledger_label("audit"), request).await?;
    Ok(parse_verdict(&entry.path, &response.text))
}

/// One repair pass. Writes and returns the repaired content, or `None`
/// when the fixer produced nothing usable.
pub async fn repair(
    engine: &Engine,
    scope: &PhaseScope,
    tier: ModelTier,
    entry: &FileManifestEntry,
    findings: &str,
    siblings: &str,
) -> Result<Option<String>> {
    let content = safe_read(&scope.root, &entry.path)?.unwrap_or_default();
    let step = match tier {
        ModelTier::Economy => "fix",
        ModelTier::Primary => "repair",
    };
    let request = GenerationRequest::new(
        tier,
        format!("{} {}", step, entry.path),
        fix_prompt(entry, &content, findings, siblings, &scope.instructions),
    )
    .with_system(FIXER_SYSTEM_PROMPT)
    .with_max_tokens(super::generate::output_budget(entry, &engine.config.generation));
    let response = engine.call(scope.id, &scope.ledger_label(step), request).await?;
    let repaired = clean_output(&response.text, &entry.path);
    if repaired.is_empty() {
        tracing::warn!(path = %entry.path, tier = ?tier, "fixer returned nothing usable");
        return Ok(None);
    }
    safe_write(&scope.root, &entry.path, &repaired)?;
    Ok(Some(repaired))
}

fn record(engine: &Engine, scope: &PhaseScope, manifest: &PhaseManifest, result: &AuditResult, status: FileStatus) -> Result<()> {
    manifest.set_status(&result.path, status, Some(result.verdict))?;
    let findings = (status == FileStatus::FixQueued).then(|| result.findings.clone());
    manifest.set_findings(&result.path, findings)?;
    engine.registry.events().publish(BuildEvent::FileAudited {
        build_id: scope.id,
        path: result.path.clone(),
        verdict: result.verdict,
        status,
    });
    Ok(())
}

/// How the first-tier ladder ended for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderOutcome {
    Passed { fixed: bool },
    /// Still failing; carries the last findings for the fix queue
    Queued(String),
}

/// Audit `entry` and walk the economy fix ladder. Always terminates within
/// `fixer_rounds + 1` audits.
pub async fn run_ladder(
    engine: &Engine,
    scope: &PhaseScope,
    manifest: &PhaseManifest,
    entry: &FileManifestEntry,
) -> Result<LadderOutcome> {
    let rounds = engine.config.orchestrator.fixer_rounds;
    let mut fixed = false;
    let mut round = 0;
    loop {
        let result = review(engine, scope, entry).await?;
        if result.passed() {
            let status = if fixed { FileStatus::Fixed } else { FileStatus::Audited };
            record(engine, scope, manifest, &result, status)?;
            tracing::debug!(build_id = %scope.id, path = %entry.path, round, "audit passed");
            return Ok(LadderOutcome::Passed { fixed });
        }
        if round >= rounds {
            record(engine, scope, manifest, &result, FileStatus::FixQueued)?;
            tracing::info!(build_id = %scope.id, path = %entry.path, "fix ladder exhausted, queued for repair");
            return Ok(LadderOutcome::Queued(result.findings));
        }
        record(engine, scope, manifest, &result, FileStatus::Fixing)?;
        round += 1;
        tracing::info!(build_id = %scope.id, path = %entry.path, round, "audit failed, applying fix");
        if repair(engine, scope, ModelTier::Economy, entry, &result.findings, "")
            .await?
            .is_some()
        {
            fixed = true;
        }
    }
}

/// Files the first-tier ladder could not repair, one entry per path.
#[derive(Debug, Default)]
pub struct FixQueue {
    entries: BTreeMap<String, String>,
}

impl FixQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `path`. Returns false when it was already queued.
    pub fn push(&mut self, path: &str, findings: String) -> bool {
        if self.entries.contains_key(path) {
            return false;
        }
        self.entries.insert(path.to_string(), findings);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Other files of the phase as reference text, within `budget` chars.
pub fn sibling_context(root: &Path, paths: &[String], exclude: &str, budget: usize) -> String {
    let mut text = String::new();
    let mut omitted = Vec::new();
    for path in paths.iter().filter(|p| p.as_str() != exclude) {
        let Ok(Some(content)) = safe_read(root, path) else {
            continue;
        };
        let section = format!("=== {} ===\n{}\n", path, content);
        if text.len() + section.len() <= budget {
            text.push_str(&section);
        } else {
            omitted.push(path.as_str());
        }
    }
    if !omitted.is_empty() {
        text.push_str(&format!("(also in this phase: {})\n", omitted.join(", ")));
    }
    text
}

/// Second-tier repair of every queued file. Returns the files still failing.
pub async fn drain_fix_queue(
    engine: &Engine,
    scope: &PhaseScope,
    manifest: &PhaseManifest,
    queue: FixQueue,
) -> Result<Vec<AuditResult>> {
    let generation = &engine.config.generation;
    let budget = generation.input_token_budget.saturating_mul(generation.chars_per_token) / 2;
    let paths = manifest.paths();
    let mut failures = Vec::new();

    for (path, findings) in queue.entries {
        let Some(entry) = manifest.get(&path) else {
            continue;
        };
        let siblings = sibling_context(&scope.root, &paths, &path, budget);
        engine.registry.beat(scope.id, &format!("repairing {}", path));
        repair(engine, scope, ModelTier::Primary, &entry, &findings, &siblings).await?;
        let result = review(engine, scope, &entry).await?;
        if result.passed() {
            record(engine, scope, manifest, &result, FileStatus::Fixed)?;
            tracing::info!(build_id = %scope.id, path = %path, "queued file repaired");
        } else {
            record(engine, scope, manifest, &result, FileStatus::FixQueued)?;
            tracing::warn!(build_id = %scope.id, path = %path, "queued file still failing after repair");
            failures.push(result);
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoforgeConfig;
    use crate::manifest::FileAction;
    use crate::orchestrator::testing::Harness;
    use crate::provider::ScriptedClient;

    /// Audits fail while the file contains "broken"; fixes write `fixed`.
    fn auditing_client(fix_output: &'static str) -> ScriptedClient {
        ScriptedClient::new(move |req| {
            if req.label.starts_with("audit") {
                if req.prompt.contains("broken") {
                    Ok("VERDICT: FAIL\n- undefined name `helper`".into())
                } else {
                    Ok("VERDICT: PASS".into())
                }
            } else {
                let path = req.label.split_whitespace().nth(1).unwrap_or("a.py");
                Ok(format!("=== FILE: {} ===\n{}\n=== END FILE ===\n", path, fix_output))
            }
        })
    }

    async fn setup(client: ScriptedClient, content: &str) -> (Harness, PhaseManifest, FileManifestEntry) {
        let harness = Harness::new(client, AutoforgeConfig::default()).await;
        harness.write("a.py", content);
        let entry = FileManifestEntry::new("a.py", FileAction::Create, "module a").unwrap();
        let manifest = PhaseManifest::create(
            harness.engine.manifest_cache(harness.build_id),
            1,
            vec![entry.clone()],
        )
        .unwrap();
        (harness, manifest, entry)
    }

    #[test]
    fn test_parse_verdict() {
        assert!(parse_verdict("a.py", "VERDICT: PASS").passed());
        assert!(parse_verdict("a.py", "**VERDICT:** PASS\nlooks fine").passed());
        let fail = parse_verdict("a.py", "VERDICT: FAIL\n- missing import os");
        assert_eq!(fail.verdict, Verdict::Fail);
        assert_eq!(fail.findings, "- missing import os");
        assert!(!parse_verdict("a.py", "Findings:\nFAIL\n").passed());
        assert!(parse_verdict("a.py", "nothing structural to report").passed());
    }

    #[tokio::test]
    async fn test_clean_file_audits_once() {
        let (harness, manifest, entry) = setup(auditing_client("unused"), "x = 1\n").await;
        let outcome = run_ladder(&harness.engine, &harness.scope(), &manifest, &entry)
            .await
            .unwrap();
        assert_eq!(outcome, LadderOutcome::Passed { fixed: false });
        assert_eq!(harness.client.call_count(), 1);
        assert_eq!(manifest.get("a.py").unwrap().status, FileStatus::Audited);
    }

    #[tokio::test]
    async fn test_fix_then_pass_marks_fixed() {
        let (harness, manifest, entry) = setup(auditing_client("x = 2"), "broken = 1\n").await;
        let outcome = run_ladder(&harness.engine, &harness.scope(), &manifest, &entry)
            .await
            .unwrap();
        assert_eq!(outcome, LadderOutcome::Passed { fixed: true });
        assert_eq!(harness.client.calls_labelled("audit"), 2);
        assert_eq!(harness.client.calls_labelled("fix"), 1);
        assert_eq!(harness.read("a.py").unwrap(), "x = 2\n");

        let cached = harness
            .engine
            .manifest_cache(harness.build_id)
            .load(1)
            .unwrap()
            .unwrap();
        assert_eq!(cached[0].status, FileStatus::Fixed);
        assert_eq!(cached[0].verdict, Some(Verdict::Pass));
    }

    #[tokio::test]
    async fn test_exhausted_ladder_queues_exactly_once() {
        let (harness, manifest, entry) = setup(auditing_client("still broken"), "broken\n").await;
        let outcome = run_ladder(&harness.engine, &harness.scope(), &manifest, &entry)
            .await
            .unwrap();
        let LadderOutcome::Queued(findings) = outcome else {
            panic!("expected queued outcome");
        };
        assert!(findings.contains("undefined name"));
        // fixer_rounds = 2: three audits, two economy fixes.
        assert_eq!(harness.client.calls_labelled("audit"), 3);
        assert_eq!(harness.client.calls_labelled("fix"), 2);
        let queued = manifest.get("a.py").unwrap();
        assert_eq!(queued.status, FileStatus::FixQueued);
        assert_eq!(queued.findings.as_deref(), Some(findings.as_str()));

        let mut queue = FixQueue::new();
        assert!(queue.push("a.py", findings.clone()));
        assert!(!queue.push("a.py", findings));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_syntax_error_fails_without_audit_call() {
        let harness = Harness::scripted(vec![]).await;
        harness.write("config.json", "{\"a\": ");
        let entry = FileManifestEntry::new("config.json", FileAction::Create, "config").unwrap();
        let result = review(&harness.engine, &harness.scope(), &entry).await.unwrap();
        assert!(!result.passed());
        assert!(result.findings.starts_with("syntax error"));
        assert_eq!(harness.client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_repairs_with_primary_model() {
        let (harness, manifest, _) = setup(auditing_client("x = 3"), "broken\n").await;
        harness.write("b.py", "y = 1\n");
        let mut queue = FixQueue::new();
        queue.push("a.py", "undefined name".into());

        let failures = drain_fix_queue(&harness.engine, &harness.scope(), &manifest, queue)
            .await
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(harness.client.calls_labelled("repair"), 1);
        let repair = &harness.client.requests()[0];
        assert_eq!(repair.tier, ModelTier::Primary);
        let repaired = manifest.get("a.py").unwrap();
        assert_eq!(repaired.status, FileStatus::Fixed);
        assert!(repaired.findings.is_none());
    }

    #[test]
    fn test_sibling_context_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "a\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "b".repeat(500)).unwrap();
        std::fs::write(dir.path().join("c.py"), "c\n").unwrap();
        let paths = vec!["a.py".to_string(), "b.py".to_string(), "c.py".to_string()];
        let text = sibling_context(dir.path(), &paths, "a.py", 100);
        assert!(text.contains("=== c.py ==="));
        assert!(!text.contains("=== a.py ==="));
        assert!(text.contains("also in this phase: b.py"));
    }
}
