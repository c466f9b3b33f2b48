//! Build events broadcast to listening clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::build::{BuildId, BuildStatus, GateKind, LogLevel};
use crate::manifest::{FileStatus, Verdict};

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum BuildEvent {
    StatusChanged {
        build_id: BuildId,
        status: BuildStatus,
        detail: Option<String>,
    },
    PhaseStarted {
        build_id: BuildId,
        phase: u32,
        name: String,
        attempt: u32,
    },
    PlanReady {
        build_id: BuildId,
        phase: u32,
        files: usize,
        cached: bool,
    },
    FileWritten {
        build_id: BuildId,
        path: String,
    },
    FileAudited {
        build_id: BuildId,
        path: String,
        verdict: Verdict,
        status: FileStatus,
    },
    GovernanceReport {
        build_id: BuildId,
        phase: u32,
        passed: bool,
        failing: Vec<String>,
    },
    PhaseCompleted {
        build_id: BuildId,
        phase: u32,
        partial: bool,
    },
    GateOpened {
        build_id: BuildId,
        kind: GateKind,
        payload: serde_json::Value,
    },
    GateResolved {
        build_id: BuildId,
        kind: GateKind,
    },
    Heartbeat {
        build_id: BuildId,
        idle_secs: u64,
        activity: String,
    },
    StallWarning {
        build_id: BuildId,
        idle_secs: u64,
        activity: String,
    },
    Cost {
        build_id: BuildId,
        phase_label: String,
        cost_usd: f64,
        total_usd: f64,
    },
    Log {
        build_id: BuildId,
        level: LogLevel,
        message: String,
    },
}

impl BuildEvent {
    pub fn build_id(&self) -> BuildId {
        match self {
            Self::StatusChanged { build_id, .. }
            | Self::PhaseStarted { build_id, .. }
            | Self::PlanReady { build_id, .. }
            | Self::FileWritten { build_id, .. }
            | Self::FileAudited { build_id, .. }
            | Self::GovernanceReport { build_id, .. }
            | Self::PhaseCompleted { build_id, .. }
            | Self::GateOpened { build_id, .. }
            | Self::GateResolved { build_id, .. }
            | Self::Heartbeat { build_id, .. }
            | Self::StallWarning { build_id, .. }
            | Self::Cost { build_id, .. }
            | Self::Log { build_id, .. } => *build_id,
        }
    }
}

/// Process-wide fan-out of [`BuildEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BuildEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BuildEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

/// Serialise an event for line-oriented clients.
pub fn to_json(event: &BuildEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize build event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(BuildEvent::FileWritten {
            build_id: id,
            path: "a.py".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.build_id(), id);
    }

    #[test]
    fn test_publish_without_receivers_is_silent() {
        EventBus::new().publish(BuildEvent::GateResolved {
            build_id: Uuid::new_v4(),
            kind: GateKind::PhaseReview,
        });
    }

    #[test]
    fn test_json_shape() {
        let json = to_json(&BuildEvent::StatusChanged {
            build_id: Uuid::nil(),
            status: BuildStatus::Paused,
            detail: Some("review".into()),
        })
        .unwrap();
        assert!(json.contains(r#""type":"StatusChanged""#));
        assert!(json.contains(r#""status":"paused""#));
    }
}
