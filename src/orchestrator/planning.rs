//! Manifest planning: one primary-model call per phase returning the files
//! to create, modify or delete, or clarification questions.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::prompts::{PLANNER_SYSTEM_PROMPT, manifest_prompt};
use super::{Engine, PhaseScope};
use crate::manifest::{FileAction, FileManifestEntry, dedupe};
use crate::provider::{GenerationRequest, ModelTier};

const PLAN_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Deserialize)]
struct PlanReply {
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    files: Vec<PlannedFile>,
}

#[derive(Debug, Deserialize)]
struct PlannedFile {
    path: String,
    #[serde(default = "default_action")]
    action: String,
    #[serde(default)]
    purpose: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    context_files: Vec<String>,
    #[serde(default)]
    estimated_lines: u32,
}

fn default_action() -> String {
    "create".to_string()
}

fn parse_action(raw: &str) -> Option<FileAction> {
    match raw.trim().to_lowercase().as_str() {
        "create" | "add" | "new" => Some(FileAction::Create),
        "modify" | "update" | "edit" => Some(FileAction::Modify),
        "delete" | "remove" => Some(FileAction::Delete),
        _ => None,
    }
}

/// What the planner came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanResult {
    Manifest(Vec<FileManifestEntry>),
    Questions(Vec<String>),
}

/// Extract the JSON object from a reply, tolerating prose or fences around it.
pub fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

/// Parse a planner reply. Entries with an invalid path or unknown action are
/// skipped; questions are only honoured when `allow_questions` is set.
pub fn parse_plan(text: &str, allow_questions: bool) -> Result<PlanResult> {
    let reply: PlanReply =
        serde_json::from_str(extract_json(text)).context("Failed to parse planner reply as JSON")?;

    let questions: Vec<String> = reply
        .questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    if allow_questions && !questions.is_empty() {
        return Ok(PlanResult::Questions(questions));
    }

    let mut entries = Vec::new();
    for file in reply.files {
        let Some(action) = parse_action(&file.action) else {
            tracing::warn!(path = %file.path, action = %file.action, "skipping planned file with unknown action");
            continue;
        };
        match FileManifestEntry::new(&file.path, action, &file.purpose) {
            Ok(mut entry) => {
                entry.depends_on = file.depends_on;
                entry.context_files = file.context_files;
                entry.estimated_lines = file.estimated_lines;
                entries.push(entry);
            }
            Err(e) => tracing::warn!(path = %file.path, error = %e, "skipping planned file"),
        }
    }
    let entries = dedupe(entries);
    if entries.is_empty() {
        bail!("Planner returned no usable files");
    }
    Ok(PlanResult::Manifest(entries))
}

/// Ask the planner for the phase's manifest.
pub async fn plan_manifest(
    engine: &Engine,
    scope: &PhaseScope,
    existing_files: &[String],
    answers: &[String],
) -> Result<PlanResult> {
    let prompt = manifest_prompt(
        &scope.phase,
        &scope.contracts.render_reference(),
        existing_files,
        answers,
        &scope.instructions,
    );
    let request = GenerationRequest::new(
        ModelTier::Primary,
        format!("plan phase {}", scope.phase.number),
        prompt,
    )
    .with_system(PLANNER_SYSTEM_PROMPT)
    .with_max_tokens(PLAN_MAX_TOKENS);
    let response = engine.call(scope.id, &scope.ledger_label("plan"), request).await?;
    parse_plan(&response.text, answers.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::Harness;

    #[test]
    fn test_parse_plan_with_prose_and_bad_entries() {
        let text = r#"Here is the plan:
```json
{"questions": [], "files": [
  {"path": "app/main.py", "action": "create", "purpose": "entry", "depends_on": ["app/config.py"], "estimated_lines": 40},
  {"path": "app/config.py", "action": "add"},
  {"path": "../etc/passwd", "action": "create"},
  {"path": "old.py", "action": "remove"},
  {"path": "x.py", "action": "rename"},
  {"path": "app/main.py", "action": "modify"}
]}
```"#;
        let PlanResult::Manifest(entries) = parse_plan(text, true).unwrap() else {
            panic!("expected manifest");
        };
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["app/main.py", "app/config.py", "old.py"]);
        assert_eq!(entries[0].depends_on, vec!["app/config.py"]);
        assert_eq!(entries[0].estimated_lines, 40);
        assert_eq!(entries[0].action, FileAction::Create);
        assert_eq!(entries[2].action, FileAction::Delete);
    }

    #[test]
    fn test_questions_only_when_allowed() {
        let text = r#"{"questions": ["Postgres or SQLite?"], "files": [{"path": "a.py"}]}"#;
        assert_eq!(
            parse_plan(text, true).unwrap(),
            PlanResult::Questions(vec!["Postgres or SQLite?".into()])
        );
        assert!(matches!(parse_plan(text, false).unwrap(), PlanResult::Manifest(_)));
    }

    #[test]
    fn test_empty_or_garbage_plan_is_an_error() {
        assert!(parse_plan(r#"{"files": []}"#, true).is_err());
        assert!(parse_plan("no json here", true).is_err());
    }

    #[tokio::test]
    async fn test_plan_manifest_sends_answers_and_files() {
        let harness = Harness::scripted(vec![Ok(
            r#"{"files": [{"path": "app/core.py", "purpose": "core"}]}"#.into(),
        )])
        .await;
        let result = plan_manifest(
            &harness.engine,
            &harness.scope(),
            &["app/main.py".to_string()],
            &["Use SQLite".to_string()],
        )
        .await
        .unwrap();
        assert!(matches!(result, PlanResult::Manifest(ref e) if e.len() == 1));
        let request = &harness.client.requests()[0];
        assert_eq!(request.tier, ModelTier::Primary);
        assert!(request.prompt.contains("- app/main.py"));
        assert!(request.prompt.contains("Use SQLite"));
        assert!(request.label.starts_with("plan"));
    }
}
