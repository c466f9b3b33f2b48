//! The Build record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

pub type BuildId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Failed,
    Completed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }

    /// `pending → running ⇄ paused → {completed | cancelled | failed}`.
    /// A pending or paused build may also be cancelled or failed directly.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        match (self, next) {
            (Pending, Running | Cancelled | Failed) => true,
            (Running, Paused | Completed | Cancelled | Failed) => true,
            (Paused, Running | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Where the build's files end up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildTarget {
    /// A fresh repository created under the builds root.
    NewRepo {
        name: String,
        #[serde(default)]
        remote: Option<String>,
    },
    /// An existing remote repository, cloned into an ephemeral directory.
    ExistingRepo { url: String, branch: String },
    /// A directory on this machine, used in place.
    LocalPath { path: PathBuf, branch: String },
}

impl BuildTarget {
    /// Ephemeral workspaces are deleted when the build is cancelled.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::ExistingRepo { .. })
    }

    pub fn has_remote(&self) -> bool {
        match self {
            Self::NewRepo { remote, .. } => remote.is_some(),
            Self::ExistingRepo { .. } => true,
            Self::LocalPath { .. } => false,
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            Self::NewRepo { .. } => "main",
            Self::ExistingRepo { branch, .. } | Self::LocalPath { branch, .. } => branch,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    WorkspaceReady,
    PlanReview,
    PhaseReview,
    Clarification,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceReady => "workspace_ready",
            Self::PlanReview => "plan_review",
            Self::PhaseReview => "phase_review",
            Self::Clarification => "clarification",
        }
    }

    /// Whether the orchestrator blocks until an operator resolves the gate.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::WorkspaceReady)
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable marker of an unresolved human-interaction point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingGate {
    pub kind: GateKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub registered_at: DateTime<Utc>,
}

/// Loop/retry counters carried across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildCounters {
    /// Phase audit attempts used by the current phase
    pub phase_attempts: u32,
    /// Recovery planner invocations in the current phase
    pub recovery_rounds: u32,
    /// Total generation calls made
    pub generation_calls: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project: String,
    pub status: BuildStatus,
    #[serde(default)]
    pub current_phase: Option<String>,
    /// Highest phase index durably finished, -1 = none
    pub completed_phases: i64,
    pub working_dir: PathBuf,
    pub target: BuildTarget,
    pub contracts_dir: PathBuf,
    #[serde(default)]
    pub contracts_hash: Option<String>,
    #[serde(default)]
    pub counters: BuildCounters,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub pending_gate: Option<PendingGate>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub workspace_prepared: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    pub fn new(
        project: impl Into<String>,
        target: BuildTarget,
        working_dir: PathBuf,
        contracts_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            status: BuildStatus::Pending,
            current_phase: None,
            completed_phases: -1,
            working_dir,
            target,
            contracts_dir,
            contracts_hash: None,
            counters: BuildCounters::default(),
            cost_usd: 0.0,
            pending_gate: None,
            detail: None,
            workspace_prepared: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status transition. Invalid transitions are refused and leave
    /// the record untouched.
    pub fn transition(&mut self, next: BuildStatus, detail: Option<String>) -> bool {
        if self.status == next {
            if detail.is_some() {
                self.detail = detail;
            }
            return true;
        }
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if detail.is_some() {
            self.detail = detail;
        }
        self.updated_at = Utc::now();
        true
    }

    /// Next phase index the orchestrator should run.
    pub fn next_phase(&self) -> u32 {
        (self.completed_phases + 1).max(0) as u32
    }
}

/// One line of the append-only build log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl BuildLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Build {
        Build::new(
            "demo",
            BuildTarget::LocalPath {
                path: PathBuf::from("/tmp/demo"),
                branch: "main".into(),
            },
            PathBuf::from("/tmp/demo"),
            PathBuf::from("/tmp/contracts"),
        )
    }

    #[test]
    fn test_new_build_is_pending_with_no_phases() {
        let b = build();
        assert_eq!(b.status, BuildStatus::Pending);
        assert_eq!(b.completed_phases, -1);
        assert_eq!(b.next_phase(), 0);
        assert!(b.pending_gate.is_none());
    }

    #[test]
    fn test_valid_transitions() {
        let mut b = build();
        assert!(b.transition(BuildStatus::Running, None));
        assert!(b.transition(BuildStatus::Paused, Some("review".into())));
        assert_eq!(b.detail.as_deref(), Some("review"));
        assert!(b.transition(BuildStatus::Running, None));
        assert!(b.transition(BuildStatus::Completed, None));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            BuildStatus::Completed,
            BuildStatus::Failed,
            BuildStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                BuildStatus::Pending,
                BuildStatus::Running,
                BuildStatus::Paused,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        let mut b = build();
        b.transition(BuildStatus::Running, None);
        b.transition(BuildStatus::Failed, Some("boom".into()));
        assert!(!b.transition(BuildStatus::Running, None));
        assert_eq!(b.status, BuildStatus::Failed);
    }

    #[test]
    fn test_paused_is_resumable_but_pending_cannot_pause() {
        assert!(BuildStatus::Paused.can_transition_to(BuildStatus::Running));
        assert!(!BuildStatus::Pending.can_transition_to(BuildStatus::Paused));
    }

    #[test]
    fn test_status_from_str_roundtrip() {
        for s in ["pending", "running", "paused", "cancelled", "failed", "completed"] {
            let status: BuildStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("exploded".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_target_ephemerality() {
        let clone = BuildTarget::ExistingRepo {
            url: "https://example.com/r.git".into(),
            branch: "dev".into(),
        };
        assert!(clone.is_ephemeral());
        assert!(clone.has_remote());
        assert_eq!(clone.branch(), "dev");
        let local = BuildTarget::LocalPath {
            path: "/x".into(),
            branch: "main".into(),
        };
        assert!(!local.is_ephemeral());
        assert!(!local.has_remote());
    }

    #[test]
    fn test_workspace_ready_gate_does_not_block() {
        assert!(!GateKind::WorkspaceReady.is_blocking());
        assert!(GateKind::PhaseReview.is_blocking());
        assert!(GateKind::PlanReview.is_blocking());
        assert!(GateKind::Clarification.is_blocking());
    }

    #[test]
    fn test_build_serializes_pending_gate() {
        let mut b = build();
        b.pending_gate = Some(PendingGate {
            kind: GateKind::PhaseReview,
            payload: serde_json::json!({"phase": 2}),
            registered_at: Utc::now(),
        });
        let json = serde_json::to_string(&b).unwrap();
        let back: Build = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pending_gate.unwrap().kind, GateKind::PhaseReview);
    }
}
