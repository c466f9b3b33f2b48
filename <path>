<full file content>
=== END FILE ==="#;

pub const RECOVERY_SYSTEM_PROMPT: &str = r#"A build phase failed its checks. Propose how to repair it with as few file changes as possible.

Respond with a single JSON object and nothing else:
{
  "plan": "prose remediation plan",
  "fixes": [
    {
      "path": "requirements.txt",
      "action": "modify",
      "instructions": "add httpx, imported by app/clients/http.py",
      "context_files": ["app/clients/http.py"]
    }
  ]
}

Rules:
- At most 5 fixes.
- "delete" fixes need no instructions or context.
- "create" and "modify" fixes need explicit instructions and at least one context file."#;

/// Prompt asking for the phase's file manifest.
pub fn manifest_prompt(
    phase: &Phase,
    contracts: &str,
    existing_files: &[String],
    answers: &[String],
    instructions: &[String],
) -> String {
    let mut prompt = format!(
        "{contracts}\n## {label}\n\n**Objective:** {objective}\n\n**Deliverables:**\n{deliverables}\n",
        contracts = contracts,
        label = phase.label(),
        objective = phase.objective,
        deliverables = phase.deliverables_text(),
    );
    prompt.push_str("\n## Existing files\n");
    if existing_files.is_empty() {
        prompt.push_str("(empty repository)\n");
    } else {
        for file in existing_files {
            prompt.push_str(&format!("- {}\n", file));
        }
    }
    if !answers.is_empty() {
        prompt.push_str("\n## Answers to your questions\n");
        for answer in answers {
            prompt.push_str(answer);
            prompt.push('\n');
        }
        prompt.push_str("\nDo not ask further questions.\n");
    }
    push_instructions(&mut prompt, instructions);
    prompt
}

/// Pieces of a per-file generation prompt.
#[derive(Debug, Default)]
pub struct FilePrompt<'a> {
    pub contracts: &'a str,
    pub deliverables: &'a str,
    pub context: &'a str,
    pub error_context: Option<&'a str>,
    pub instructions: &'a [String],
    /// Appended when the previous attempt came back empty
    pub nudge: bool,
}

pub fn file_prompt(entry: &FileManifestEntry, phase: &Phase, parts: &FilePrompt<'_>) -> String {
    let mut prompt = String::new();
    if !parts.contracts.is_empty() {
        prompt.push_str(parts.contracts);
        prompt.push('\n');
    }
    prompt.push_str(&format!("## {}\n", phase.label()));
    if !parts.deliverables.is_empty() {
        prompt.push_str(&format!("**Deliverables:**\n{}\n", parts.deliverables));
    }
    if !parts.context.is_empty() {
        prompt.push_str("\n## Reference files\n");
        prompt.push_str(parts.context);
    }
    prompt.push_str(&format!(
        "\n## File to write\nPath: {}\nAction: {}\nLanguage: {}\nPurpose: {}\n",
        entry.path,
        entry.action.as_str(),
        entry.language,
        entry.purpose
    ));
    if !entry.depends_on.is_empty() {
        prompt.push_str(&format!("Depends on: {}\n", entry.depends_on.join(", ")));
    }
    if let Some(errors) = parts.error_context {
        prompt.push_str(&format!(
            "\n## Problems with the previous version\n{}\n",
            errors
        ));
    }
    push_instructions(&mut prompt, parts.instructions);
    if parts.nudge {
        prompt.push_str(&format!(
            "\nYour previous reply was empty. Output the complete content of {} now.\n",
            entry.path
        ));
    }
    prompt
}

pub fn audit_prompt(entry: &FileManifestEntry, content: &str) -> String {
    format!(
        "Path: {}\nPurpose: {}\n\n```{}\n{}```\n",
        entry.path, entry.purpose, entry.language, content
    )
}

pub fn fix_prompt(
    entry: &FileManifestEntry,
    content: &str,
    findings: &str,
    siblings: &str,
    instructions: &[String],
) -> String {
    let mut prompt = String::new();
    if !siblings.is_empty() {
        prompt.push_str("## Other files in this phase\n");
        prompt.push_str(siblings);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "## File to repair\nPath: {}\nPurpose: {}\n\n```{}\n{}```\n\n## Findings\n{}\n",
        entry.path, entry.purpose, entry.language, content, findings
    ));
    push_instructions(&mut prompt, instructions);
    prompt
}

pub fn recovery_prompt(
    phase: &Phase,
    findings: &str,
    snapshot: &str,
    contracts: &str,
    instructions: &[String],
) -> String {
    let mut prompt = format!(
        "{contracts}\n## {label} failed\n\n### Findings\n{findings}\n\n### Current project state\n{snapshot}\n",
        contracts = contracts,
        label = phase.label(),
        findings = findings,
        snapshot = snapshot,
    );
    push_instructions(&mut prompt, instructions);
    prompt
}

fn push_instructions(prompt: &mut String, instructions: &[String]) {
    if instructions.is_empty() {
        return;
    }
    prompt.push_str("\n## Operator instructions\n");
    for instruction in instructions {
        prompt.push_str(&format!("- {}\n", instruction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileAction;

    fn phase() -> Phase {
        Phase::new(1, "Data", "Models", vec!["User model".into()])
    }

    #[test]
    fn test_file_prompt_sections() {
        let entry = FileManifestEntry::new("app/models/user.py", FileAction::Create, "User model")
            .unwrap()
            .with_depends_on(&["app/db.py"]);
        let instructions = vec!["use UUID primary keys".to_string()];
        let prompt = file_prompt(
            &entry,
            &phase(),
            &FilePrompt {
                contracts: "### CONTRACT: schema\nusers table\n",
                deliverables: "- User model",
                context: "",
                error_context: Some("missing import"),
                instructions: &instructions,
                nudge: true,
            },
        );
        assert!(prompt.contains("### CONTRACT: schema"));
        assert!(prompt.contains("Path: app/models/user.py"));
        assert!(prompt.contains("Depends on: app/db.py"));
        assert!(prompt.contains("missing import"));
        assert!(prompt.contains("- use UUID primary keys"));
        assert!(prompt.contains("previous reply was empty"));
        assert!(!prompt.contains("Reference files"));
    }

    #[test]
    fn test_manifest_prompt_lists_files_and_answers() {
        let prompt = manifest_prompt(
            &phase(),
            "",
            &["requirements.txt".to_string()],
            &["Use Postgres".to_string()],
            &[],
        );
        assert!(prompt.contains("- requirements.txt"));
        assert!(prompt.contains("Use Postgres"));
        assert!(prompt.contains("Do not ask further questions"));
        assert!(!prompt.contains("Operator instructions"));
    }
}
