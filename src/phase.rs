//! Phase definitions parsed from the phases contract.
//!
//! The phases contract is markdown with one `##` heading per phase:
//!
//! ```markdown
//! ## Phase 0 — Genesis
//! **Objective:** Project skeleton, configuration, health endpoint.
//!
//! **Deliverables:**
//! - `app/main.py` application factory
//! - health check route
//! ```
//!
//! Headings accept `—`, `-`, `–` or `:` between the number and the name.

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static PHASE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{2,3}\s*Phase\s+(\d+)\s*(?:[—–:\-]\s*)?(.*)$").unwrap()
});

static OBJECTIVE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\**\s*Objective\s*:?\**\s*:?\s*(.*)$").unwrap());

static BULLET_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+\.)\s+(.+)$").unwrap());

/// One planned unit of build work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub objective: String,
    pub deliverables: Vec<String>,
}

impl Phase {
    pub fn new(number: u32, name: &str, objective: &str, deliverables: Vec<String>) -> Self {
        Self {
            number,
            name: name.to_string(),
            objective: objective.to_string(),
            deliverables,
        }
    }

    /// Label used in logs, cost rows and `current_phase`.
    pub fn label(&self) -> String {
        format!("Phase {} — {}", self.number, self.name)
    }

    /// Deliverables rendered as a markdown list for prompts.
    pub fn deliverables_text(&self) -> String {
        self.deliverables
            .iter()
            .map(|d| format!("- {}", d))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse every phase out of the phases contract, sorted by number.
pub fn parse_phases(markdown: &str) -> Result<Vec<Phase>> {
    let mut phases: Vec<Phase> = Vec::new();
    let mut current: Option<Phase> = None;

    for line in markdown.lines() {
        let trimmed = line.trim_end();
        if let Some(caps) = PHASE_HEADING.captures(trimmed.trim_start()) {
            if let Some(done) = current.take() {
                phases.push(done);
            }
            let number: u32 = caps[1].parse()?;
            let name = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("Phase {}", number));
            current = Some(Phase::new(number, &name, "", Vec::new()));
            continue;
        }

        // A new top-level section ends the current phase.
        if trimmed.starts_with("# ") || trimmed.starts_with("## ") {
            if let Some(done) = current.take() {
                phases.push(done);
            }
            continue;
        }

        let Some(phase) = current.as_mut() else {
            continue;
        };

        if phase.objective.is_empty()
            && let Some(caps) = OBJECTIVE_LINE.captures(trimmed.trim_start())
        {
            phase.objective = caps[1].trim().trim_matches('*').trim().to_string();
            continue;
        }

        if let Some(caps) = BULLET_LINE.captures(trimmed) {
            let item = caps[1].trim();
            if !item.is_empty() {
                phase.deliverables.push(item.to_string());
            }
        }
    }
    if let Some(done) = current.take() {
        phases.push(done);
    }

    phases.sort_by_key(|p| p.number);
    for pair in phases.windows(2) {
        if pair[0].number == pair[1].number {
            bail!("Duplicate phase number: {}", pair[0].number);
        }
    }
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHASES_MD: &str = r#"# Build Phases

Intro text that is not part of any phase.

## Phase 0 — Genesis
**Objective:** Skeleton and health endpoint.

**Deliverables:**
- `app/main.py` application factory
- health route returning 200

## Phase 1: Data Layer
Objective: Models and migrations.
- SQLAlchemy models
* Alembic migration
1. Repository classes

## Appendix
- not a deliverable
"#;

    #[test]
    fn test_parse_phases_extracts_all_fields() {
        let phases = parse_phases(PHASES_MD).unwrap();
        assert_eq!(phases.len(), 2);

        assert_eq!(phases[0].number, 0);
        assert_eq!(phases[0].name, "Genesis");
        assert_eq!(phases[0].objective, "Skeleton and health endpoint.");
        assert_eq!(phases[0].deliverables.len(), 2);

        assert_eq!(phases[1].number, 1);
        assert_eq!(phases[1].name, "Data Layer");
        assert_eq!(phases[1].objective, "Models and migrations.");
        assert_eq!(
            phases[1].deliverables,
            vec!["SQLAlchemy models", "Alembic migration", "Repository classes"]
        );
    }

    #[test]
    fn test_parse_phases_sorts_by_number() {
        let md = "## Phase 2 - Later\n- b\n## Phase 1 - Earlier\n- a\n";
        let phases = parse_phases(md).unwrap();
        assert_eq!(phases[0].number, 1);
        assert_eq!(phases[1].number, 2);
    }

    #[test]
    fn test_parse_phases_rejects_duplicates() {
        let md = "## Phase 1 - A\n## Phase 1 - B\n";
        let err = parse_phases(md).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_parse_phases_empty_document() {
        assert!(parse_phases("# Nothing here").unwrap().is_empty());
    }

    #[test]
    fn test_label_and_deliverables_text() {
        let phase = Phase::new(3, "Auth", "Login", vec!["jwt".into(), "routes".into()]);
        assert_eq!(phase.label(), "Phase 3 — Auth");
        assert_eq!(phase.deliverables_text(), "- jwt\n- routes");
    }
}
