//! Recovery planner: asks for a prose remediation plan and a small fix
//! manifest when a phase fails its checks after per-file fixes ran out.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::manifest::{FileAction, FileManifestEntry, sanitize_path};
use crate::orchestrator::planning::extract_json;
use crate::orchestrator::prompts::{RECOVERY_SYSTEM_PROMPT, recovery_prompt};
use crate::orchestrator::{Engine, PhaseScope};
use crate::provider::{GenerationRequest, ModelTier};
use crate::workspace::safe_read;

/// Largest fix manifest a recovery round may apply.
pub const MAX_FIX_FILES: usize = 5;

const RECOVERY_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct FixEntry {
    pub path: String,
    pub action: FileAction,
    pub instructions: String,
    pub context_files: Vec<String>,
}

impl FixEntry {
    /// Manifest entry for this fix, keeping the planned entry's purpose and
    /// dependencies when the path was already part of the phase.
    pub fn to_manifest_entry(&self, existing: Option<FileManifestEntry>) -> Result<FileManifestEntry> {
        let mut entry = match existing {
            Some(mut entry) => {
                entry.action = self.action;
                entry
            }
            None => FileManifestEntry::new(&self.path, self.action, &self.instructions)?,
        };
        for file in &self.context_files {
            if !entry.context_files.contains(file) {
                entry.context_files.push(file.clone());
            }
        }
        Ok(entry)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryPlan {
    pub plan: String,
    pub fixes: Vec<FixEntry>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    plan: String,
    #[serde(default)]
    fixes: Vec<RawFix>,
}

#[derive(Debug, Deserialize)]
struct RawFix {
    path: String,
    #[serde(default = "default_fix_action")]
    action: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    context_files: Vec<String>,
}

fn default_fix_action() -> String {
    "modify".to_string()
}

fn validate(raw: RawFix) -> Option<FixEntry> {
    let path = match sanitize_path(&raw.path) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(path = %raw.path, error = %e, "dropping recovery fix");
            return None;
        }
    };
    let action = match raw.action.trim().to_lowercase().as_str() {
        "create" | "add" => FileAction::Create,
        "modify" | "update" | "edit" => FileAction::Modify,
        "delete" | "remove" => FileAction::Delete,
        other => {
            tracing::warn!(path = %path, action = other, "dropping recovery fix with unknown action");
            return None;
        }
    };
    if action == FileAction::Delete {
        return Some(FixEntry {
            path,
            action,
            instructions: String::new(),
            context_files: Vec::new(),
        });
    }

    let instructions = raw.instructions.trim().to_string();
    if instructions.is_empty() {
        tracing::warn!(path = %path, "dropping recovery fix without instructions");
        return None;
    }
    let mut context_files: Vec<String> = raw
        .context_files
        .iter()
        .filter_map(|f| sanitize_path(f).ok())
        .collect();
    if context_files.is_empty() {
        if action == FileAction::Create {
            tracing::warn!(path = %path, "dropping create fix without context files");
            return None;
        }
        context_files.push(path.clone());
    }
    Some(FixEntry {
        path,
        action,
        instructions,
        context_files,
    })
}

/// Parse and validate a recovery reply. Invalid fixes are dropped, duplicates
/// keep their first occurrence and the list is capped at [`MAX_FIX_FILES`].
pub fn parse_plan(text: &str) -> Result<RecoveryPlan> {
    let raw: RawPlan =
        serde_json::from_str(extract_json(text)).context("Failed to parse recovery reply as JSON")?;
    let mut seen = HashSet::new();
    let mut fixes: Vec<FixEntry> = raw
        .fixes
        .into_iter()
        .filter_map(validate)
        .filter(|f| seen.insert(f.path.clone()))
        .collect();
    if fixes.len() > MAX_FIX_FILES {
        tracing::warn!(proposed = fixes.len(), kept = MAX_FIX_FILES, "recovery plan truncated");
        fixes.truncate(MAX_FIX_FILES);
    }
    Ok(RecoveryPlan {
        plan: raw.plan.trim().to_string(),
        fixes,
    })
}

/// Current project state as prompt text: the full file list, then file
/// contents (priority files first) until `budget` chars are used.
pub fn project_snapshot(root: &Path, files: &[String], priority: &[String], budget: usize) -> String {
    let mut text = String::from("Files:\n");
    for file in files {
        text.push_str(&format!("- {}\n", file));
    }
    let mut seen = HashSet::new();
    let ordered = priority
        .iter()
        .chain(files.iter())
        .filter(|f| seen.insert(f.as_str()));
    for file in ordered {
        let Ok(Some(content)) = safe_read(root, file) else {
            continue;
        };
        let section = format!("\n=== {} ===\n{}\n", file, content);
        if text.len() + section.len() > budget {
            continue;
        }
        text.push_str(&section);
    }
    text
}

/// Ask for a recovery plan. A reply that does not parse is retried once.
pub async fn plan(
    engine: &Engine,
    scope: &PhaseScope,
    findings: &str,
    failing_files: &[String],
) -> Result<RecoveryPlan> {
    let generation = &engine.config.generation;
    let files = crate::workspace::list_files(&scope.root)?;
    let snapshot = project_snapshot(
        &scope.root,
        &files,
        failing_files,
        generation.snapshot_token_budget.saturating_mul(generation.chars_per_token),
    );
    let prompt = recovery_prompt(
        &scope.phase,
        findings,
        &snapshot,
        &scope.contracts.render_reference(),
        &scope.instructions,
    );

    let mut last_error = None;
    for attempt in 1..=2u32 {
        let request = GenerationRequest::new(
            ModelTier::Primary,
            format!("recover phase {}", scope.phase.number),
            prompt.clone(),
        )
        .with_system(RECOVERY_SYSTEM_PROMPT)
        .with_max_tokens(RECOVERY_MAX_TOKENS);
        let response = engine.call(scope.id, &scope.ledger_label("recovery"), request).await?;
        match parse_plan(&response.text) {
            Ok(plan) => return Ok(plan),
            Err(e) => {
                tracing::warn!(build_id = %scope.id, attempt, error = %e, "unparseable recovery reply");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("recovery planner returned nothing")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::Harness;
    use tempfile::tempdir;

    #[test]
    fn test_parse_plan_validates_fixes() {
        let text = r#"{"plan": "declare httpx and drop the stray file",
          "fixes": [
            {"path": "requirements.txt", "action": "modify", "instructions": "add httpx"},
            {"path": "stray.py", "action": "delete", "instructions": "", "context_files": ["x.py"]},
            {"path": "app/new.py", "action": "create", "instructions": "add client"},
            {"path": "app/other.py", "action": "modify"},
            {"path": "../escape.py", "action": "delete"},
            {"path": "requirements.txt", "action": "delete"}
          ]}"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.plan, "declare httpx and drop the stray file");
        assert_eq!(plan.fixes.len(), 2);
        assert_eq!(plan.fixes[0].context_files, vec!["requirements.txt"]);
        assert_eq!(plan.fixes[1].action, FileAction::Delete);
        assert!(plan.fixes[1].context_files.is_empty());
    }

    #[test]
    fn test_fix_manifest_is_capped() {
        let fixes: Vec<String> = (0..8)
            .map(|i| format!(r#"{{"path": "f{}.py", "action": "delete"}}"#, i))
            .collect();
        let text = format!(r#"{{"plan": "p", "fixes": [{}]}}"#, fixes.join(","));
        let plan = parse_plan(&text).unwrap();
        assert_eq!(plan.fixes.len(), MAX_FIX_FILES);
        assert_eq!(plan.fixes[4].path, "f4.py");
    }

    #[test]
    fn test_snapshot_prioritises_failing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "a".repeat(300)).unwrap();
        std::fs::write(dir.path().join("b.py"), "bad\n").unwrap();
        let files = vec!["a.py".to_string(), "b.py".to_string()];
        let text = project_snapshot(dir.path(), &files, &["b.py".to_string()], 100);
        assert!(text.contains("- a.py"));
        assert!(text.contains("=== b.py ==="));
        assert!(!text.contains("=== a.py ==="));
    }

    #[test]
    fn test_existing_entry_keeps_purpose() {
        let existing = FileManifestEntry::new("app/api.py", FileAction::Create, "routes")
            .unwrap()
            .with_depends_on(&["app/db.py"]);
        let fix = FixEntry {
            path: "app/api.py".into(),
            action: FileAction::Modify,
            instructions: "import Depends".into(),
            context_files: vec!["app/db.py".into()],
        };
        let entry = fix.to_manifest_entry(Some(existing)).unwrap();
        assert_eq!(entry.purpose, "routes");
        assert_eq!(entry.action, FileAction::Modify);
        assert_eq!(entry.depends_on, vec!["app/db.py"]);
        assert_eq!(entry.context_files, vec!["app/db.py"]);
    }

    #[tokio::test]
    async fn test_unparseable_reply_retried_once() {
        let harness = Harness::scripted(vec![
            Ok("I think you should add httpx".into()),
            Ok(r#"{"plan": "add it", "fixes": [{"path": "requirements.txt", "instructions": "add httpx"}]}"#.into()),
        ])
        .await;
        harness.write("requirements.txt", "fastapi\n");
        let plan = plan(&harness.engine, &harness.scope(), "[G3 FAIL] httpx", &[])
            .await
            .unwrap();
        assert_eq!(plan.fixes.len(), 1);
        assert_eq!(harness.client.calls_labelled("recover"), 2);
        assert!(harness.client.requests()[0].prompt.contains("fastapi"));
    }
}
