//! Per-file generation: prompt assembly under a token budget, bounded
//! retries, and output cleanup.

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

use super::prompts::{BUILDER_SYSTEM_PROMPT, FilePrompt, file_prompt};
use super::{Engine, PhaseScope};
use crate::blocks::parse_blocks;
use crate::config::GenerationConfig;
use crate::errors::ProviderError;
use crate::manifest::{FileAction, FileManifestEntry, sanitize_path};
use crate::provider::{GenerationRequest, ModelTier};
use crate::workspace::safe_read;

/// Smallest slice of a reference file worth including once the budget runs low.
const MIN_CONTEXT_CHARS: usize = 400;

/// Prompt overhead assumed for headings and the entry description.
const PROMPT_OVERHEAD_CHARS: usize = 1_000;

/// Output budget for an entry: scales with its estimated size, clamped
/// to the configured floor and ceiling.
pub fn output_budget(entry: &FileManifestEntry, config: &GenerationConfig) -> u32 {
    let estimate = u64::from(entry.estimated_lines.max(1)) * u64::from(config.tokens_per_line);
    let estimate = u32::try_from(estimate).unwrap_or(u32::MAX);
    estimate
        .max(config.min_output_tokens)
        .min(config.max_output_tokens)
}

/// Reference files chosen for a prompt.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContextSelection {
    pub text: String,
    pub included: Vec<String>,
    pub truncated: Vec<String>,
    pub dropped: Vec<String>,
}

/// Pick reference files for `entry` within `budget_chars`: the file's own
/// current content when modifying, then dependencies, then declared context.
pub fn select_context(root: &Path, entry: &FileManifestEntry, budget_chars: usize) -> ContextSelection {
    let mut order: Vec<&str> = Vec::new();
    if entry.action == FileAction::Modify {
        order.push(&entry.path);
    }
    order.extend(entry.depends_on.iter().map(String::as_str));
    order.extend(entry.context_files.iter().map(String::as_str));

    let mut seen = HashSet::new();
    let mut selection = ContextSelection::default();
    let mut remaining = budget_chars;
    for path in order {
        if !seen.insert(path) || (path == entry.path && entry.action != FileAction::Modify) {
            continue;
        }
        let content = match safe_read(root, path) {
            Ok(Some(content)) => content,
            _ => continue,
        };
        let header = format!("=== {} ===\n", path);
        let needed = header.len() + content.len() + 1;
        if needed <= remaining {
            selection.text.push_str(&header);
            selection.text.push_str(&content);
            selection.text.push('\n');
            selection.included.push(path.to_string());
            remaining -= needed;
        } else if remaining >= header.len() + MIN_CONTEXT_CHARS {
            let keep = floor_char_boundary(&content, remaining - header.len() - 20);
            selection.text.push_str(&header);
            selection.text.push_str(&content[..keep]);
            selection.text.push_str("\n... [truncated]\n");
            selection.truncated.push(path.to_string());
            remaining = 0;
        } else {
            selection.dropped.push(path.to_string());
        }
    }
    selection
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Remove one wrapping Markdown code fence, if present.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim_matches('\n');
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.remove(0);
        if lines.last().is_some_and(|l| l.trim() == "```") {
            lines.pop();
        }
    }
    lines.join("\n")
}

/// Turn a raw reply into file content for `path`. Empty when the reply
/// held nothing usable. Non-empty content ends with exactly one newline.
pub fn clean_output(raw: &str, path: &str) -> String {
    let blocks = parse_blocks(raw);
    let body = match blocks
        .iter()
        .find(|(p, _)| sanitize_path(p).ok().as_deref() == Some(path))
    {
        Some((_, content)) => content.clone(),
        None if !blocks.is_empty() => {
            let got: Vec<&str> = blocks.iter().map(|(p, _)| p.as_str()).collect();
            tracing::warn!(path, got = ?got, "no reply block for path");
            return String::new();
        }
        // An opened but unterminated block is a truncated reply.
        None if raw.contains("=== FILE:") => return String::new(),
        None => raw.to_string(),
    };
    let stripped = strip_fences(&body);
    let content = stripped.trim_end();
    if content.trim().is_empty() {
        return String::new();
    }
    format!("{}\n", content)
}

fn request(
    entry: &FileManifestEntry,
    scope: &PhaseScope,
    parts: &FilePrompt<'_>,
    max_tokens: u32,
) -> GenerationRequest {
    GenerationRequest::new(
        ModelTier::Primary,
        format!("generate {}", entry.path),
        file_prompt(entry, &scope.phase, parts),
    )
    .with_system(BUILDER_SYSTEM_PROMPT)
    .with_max_tokens(max_tokens)
}

/// Generate the content of one manifest entry.
///
/// A context overflow is retried once with everything but the entry's own
/// requirements stripped; an empty reply is retried once with a nudge.
pub async fn generate_file(
    engine: &Engine,
    scope: &PhaseScope,
    entry: &FileManifestEntry,
    error_context: Option<&str>,
) -> Result<String> {
    let config = &engine.config.generation;
    let relevant = scope.contracts.relevant_for(&entry.path);
    let contracts = scope.contracts.render(&relevant);
    let deliverables = scope.phase.deliverables_text();
    let budget_chars = config.input_token_budget.saturating_mul(config.chars_per_token.max(1));
    let fixed = contracts.len()
        + deliverables.len()
        + error_context.map_or(0, str::len)
        + PROMPT_OVERHEAD_CHARS;
    let context = select_context(&scope.root, entry, budget_chars.saturating_sub(fixed));
    if !context.dropped.is_empty() || !context.truncated.is_empty() {
        tracing::debug!(
            path = %entry.path,
            dropped = ?context.dropped,
            truncated = ?context.truncated,
            "context trimmed to budget"
        );
    }

    let max_tokens = output_budget(entry, config);
    let ledger_label = scope.ledger_label("generate");
    let mut parts = FilePrompt {
        contracts: &contracts,
        deliverables: &deliverables,
        context: &context.text,
        error_context,
        instructions: &scope.instructions,
        nudge: false,
    };
    let mut stripped = false;
    let mut nudged = false;

    loop {
        let result = engine
            .call(scope.id, &ledger_label, request(entry, scope, &parts, max_tokens))
            .await;
        match result {
            Ok(response) => {
                let content = clean_output(&response.text, &entry.path);
                if !content.is_empty() {
                    return Ok(content);
                }
                if nudged {
                    return Err(ProviderError::EmptyResponse.into());
                }
                tracing::warn!(path = %entry.path, "empty generation reply, retrying with nudge");
                nudged = true;
                parts.nudge = true;
            }
            Err(ProviderError::ContextOverflow) if !stripped => {
                tracing::warn!(path = %entry.path, "context overflow, retrying with bare requirements");
                stripped = true;
                parts.contracts = "";
                parts.deliverables = "";
                parts.context = "";
            }
            Err(ProviderError::EmptyResponse) if !nudged => {
                tracing::warn!(path = %entry.path, "empty generation reply, retrying with nudge");
                nudged = true;
                parts.nudge = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::Harness;
    use tempfile::tempdir;

    fn entry(path: &str) -> FileManifestEntry {
        FileManifestEntry::new(path, FileAction::Create, "test file").unwrap()
    }

    #[test]
    fn test_output_budget_floor_and_ceiling() {
        let config = GenerationConfig::default();
        let mut e = entry("a.py");
        e.estimated_lines = 10;
        assert_eq!(output_budget(&e, &config), 4096);
        e.estimated_lines = 500;
        assert_eq!(output_budget(&e, &config), 6000);
        e.estimated_lines = 100_000;
        assert_eq!(output_budget(&e, &config), 16384);
    }

    #[test]
    fn test_clean_output_variants() {
        assert_eq!(
            clean_output("=== FILE: a.py ===\nx = 1\n\n\n=== END FILE ===\n", "a.py"),
            "x = 1\n"
        );
        assert_eq!(clean_output("```python\nx = 1\n```", "a.py"), "x = 1\n");
        assert_eq!(clean_output("x = 1", "a.py"), "x = 1\n");
        assert_eq!(clean_output("=== FILE: a.py ===\nx = 1\n", "a.py"), "");
        assert_eq!(clean_output("   \n", "a.py"), "");
        assert_eq!(
            clean_output("=== FILE: ./b.py ===\ny = 2\n=== END FILE ===\n", "b.py"),
            "y = 2\n"
        );
    }

    #[test]
    fn test_block_for_another_path_is_rejected() {
        let reply = "=== FILE: app/other.py ===\nz = 3\n=== END FILE ===\n";
        assert_eq!(clean_output(reply, "app/core.py"), "");
    }

    #[tokio::test]
    async fn test_misaddressed_reply_is_retried() {
        let harness = Harness::scripted(vec![
            Ok("=== FILE: b.py ===\nwrong = True\n=== END FILE ===\n".into()),
            Ok("=== FILE: a.py ===\nright = True\n=== END FILE ===\n".into()),
        ])
        .await;
        let scope = harness.scope();
        let content = generate_file(&harness.engine, &scope, &entry("a.py"), None)
            .await
            .unwrap();
        assert_eq!(content, "right = True\n");
        assert_eq!(harness.client.call_count(), 2);
    }

    #[test]
    fn test_context_dependencies_first_and_budgeted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("dep.py"), "d".repeat(100)).unwrap();
        std::fs::write(dir.path().join("ctx.py"), "c".repeat(5_000)).unwrap();
        std::fs::write(dir.path().join("other.py"), "o".repeat(100)).unwrap();
        let mut e = entry("a.py");
        e.depends_on = vec!["dep.py".into()];
        e.context_files = vec!["ctx.py".into(), "other.py".into(), "absent.py".into()];

        let selection = select_context(dir.path(), &e, 1_000);
        assert_eq!(selection.included, vec!["dep.py"]);
        assert_eq!(selection.truncated, vec!["ctx.py"]);
        assert_eq!(selection.dropped, vec!["other.py"]);
        assert!(selection.text.len() <= 1_000);
        assert!(selection.text.starts_with("=== dep.py ==="));
    }

    #[test]
    fn test_modify_includes_current_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "old = True\n").unwrap();
        let e = FileManifestEntry::new("a.py", FileAction::Modify, "update").unwrap();
        let selection = select_context(dir.path(), &e, 10_000);
        assert_eq!(selection.included, vec!["a.py"]);
    }

    #[tokio::test]
    async fn test_context_overflow_then_empty_then_success() {
        let harness = Harness::scripted(vec![
            Err(ProviderError::ContextOverflow),
            Ok(String::new()),
            Ok("=== FILE: a.py ===\nprint('ok')\n=== END FILE ===\n".into()),
        ])
        .await;
        let scope = harness.scope();
        let content = generate_file(&harness.engine, &scope, &entry("a.py"), None)
            .await
            .unwrap();
        assert_eq!(content, "print('ok')\n");

        let requests = harness.client.requests();
        assert_eq!(requests.len(), 3);
        assert!(!requests[1].prompt.contains("### CONTRACT"));
        assert!(requests[2].prompt.contains("previous reply was empty"));
        // Two successful replies, two ledger rows.
        assert_eq!(harness.ledger_rows().await, 2);
    }

    #[tokio::test]
    async fn test_second_empty_reply_is_an_error() {
        let harness = Harness::scripted(vec![Ok(String::new()), Ok("  ".into())]).await;
        let scope = harness.scope();
        let err = generate_file(&harness.engine, &scope, &entry("a.py"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProviderError>(),
            Some(&ProviderError::EmptyResponse)
        );
    }
}
