//! Gate/Task registry: the single owner of every piece of in-process
//! per-build state.
//!
//! One [`BuildSlot`] per active build holds its cancellation tokens, pause
//! flag, control channel, heartbeat, task handle and at most one open gate.
//! Gates are mirrored onto the Build record (`pending_gate`) on open and
//! cleared on resolve, so a restarted process can tell the build was waiting
//! on an operator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::build::{BuildId, BuildLogEntry, BuildStatus, GateKind, LogLevel, PendingGate};
use crate::commands::ControlSignal;
use crate::events::{BuildEvent, EventBus};
use crate::store::BuildStore;

/// Operator decision delivered through a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "text", rename_all = "snake_case")]
pub enum GateResolution {
    /// Redo the gated phase from planning
    Retry,
    /// Mark the gated phase done and move on
    Skip,
    /// Fail the build
    Abort,
    /// Proceed as planned
    Approve,
    /// Free-text answer, e.g. to clarification questions
    Answer(String),
}

#[derive(Debug)]
struct Heartbeat {
    last_progress: Instant,
    activity: String,
    waiting: bool,
    warned: bool,
}

struct BuildSlot {
    cancel: CancellationToken,
    kill: CancellationToken,
    pause: Arc<AtomicBool>,
    control_tx: mpsc::UnboundedSender<ControlSignal>,
    task: Option<JoinHandle<()>>,
    gate: Option<(GateKind, oneshot::Sender<GateResolution>)>,
    heartbeat: Heartbeat,
}

/// Handles given to the task that owns a build.
pub struct BuildRuntime {
    pub id: BuildId,
    /// Cooperative cancellation, observed at checkpoints
    pub cancel: CancellationToken,
    /// Hard stop from the watchdog; the task future is dropped
    pub kill: CancellationToken,
    pub pause: Arc<AtomicBool>,
    pub control_rx: mpsc::UnboundedReceiver<ControlSignal>,
}

impl BuildRuntime {
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Every signal queued since the last checkpoint.
    pub fn drain_signals(&mut self) -> Vec<ControlSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = self.control_rx.try_recv() {
            signals.push(signal);
        }
        signals
    }
}

/// Snapshot of a build's liveness, read by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    pub idle: Duration,
    pub activity: String,
    pub waiting: bool,
    pub warned: bool,
}

pub struct BuildRegistry {
    slots: Mutex<HashMap<BuildId, BuildSlot>>,
    store: Arc<dyn BuildStore>,
    events: EventBus,
}

impl BuildRegistry {
    pub fn new(store: Arc<dyn BuildStore>, events: EventBus) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store,
            events,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<BuildId, BuildSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Claim the slot for `id`. `None` when the build already has one.
    pub fn register(&self, id: BuildId) -> Option<BuildRuntime> {
        let mut slots = self.slots();
        if slots.contains_key(&id) {
            return None;
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let kill = CancellationToken::new();
        let pause = Arc::new(AtomicBool::new(false));
        slots.insert(
            id,
            BuildSlot {
                cancel: cancel.clone(),
                kill: kill.clone(),
                pause: pause.clone(),
                control_tx,
                task: None,
                gate: None,
                heartbeat: Heartbeat {
                    last_progress: Instant::now(),
                    activity: "starting".to_string(),
                    waiting: false,
                    warned: false,
                },
            },
        );
        Some(BuildRuntime {
            id,
            cancel,
            kill,
            pause,
            control_rx,
        })
    }

    pub fn attach_task(&self, id: BuildId, task: JoinHandle<()>) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.task = Some(task);
        }
    }

    pub fn is_active(&self, id: BuildId) -> bool {
        self.slots().contains_key(&id)
    }

    /// Request cooperative cancellation. Also unblocks any gate wait.
    pub fn request_cancel(&self, id: BuildId) -> bool {
        match self.slots().get(&id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn request_pause(&self, id: BuildId) -> bool {
        match self.slots().get(&id) {
            Some(slot) => {
                slot.pause.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Force-stop the build's task. Used by the watchdog.
    pub fn kill(&self, id: BuildId) -> bool {
        match self.slots().get(&id) {
            Some(slot) => {
                slot.kill.cancel();
                true
            }
            None => false,
        }
    }

    pub fn send_signal(&self, id: BuildId, signal: ControlSignal) -> bool {
        self.slots()
            .get(&id)
            .map(|slot| slot.control_tx.send(signal).is_ok())
            .unwrap_or(false)
    }

    /// Record progress on `activity` and reset the stall clock.
    pub fn beat(&self, id: BuildId, activity: &str) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.heartbeat.last_progress = Instant::now();
            slot.heartbeat.activity = activity.to_string();
            slot.heartbeat.warned = false;
        }
    }

    pub fn liveness(&self, id: BuildId) -> Option<Liveness> {
        self.slots().get(&id).map(|slot| Liveness {
            idle: slot.heartbeat.last_progress.elapsed(),
            activity: slot.heartbeat.activity.clone(),
            waiting: slot.heartbeat.waiting,
            warned: slot.heartbeat.warned,
        })
    }

    pub fn mark_warned(&self, id: BuildId) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.heartbeat.warned = true;
        }
    }

    pub fn open_gate_kind(&self, id: BuildId) -> Option<GateKind> {
        self.slots()
            .get(&id)
            .and_then(|slot| slot.gate.as_ref().map(|(kind, _)| *kind))
    }

    /// Open a blocking gate: persist the marker, then hand back the mailbox.
    /// `None` when the build has no slot or already has an open gate.
    pub async fn open_gate(
        &self,
        id: BuildId,
        kind: GateKind,
        payload: serde_json::Value,
    ) -> anyhow::Result<Option<oneshot::Receiver<GateResolution>>> {
        let rx = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&id) else {
                return Ok(None);
            };
            if slot.gate.is_some() {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            slot.gate = Some((kind, tx));
            slot.heartbeat.waiting = true;
            rx
        };

        let marker = PendingGate {
            kind,
            payload: payload.clone(),
            registered_at: Utc::now(),
        };
        self.store
            .update(id, Box::new(move |b| b.pending_gate = Some(marker)))
            .await?;
        self.store
            .append_log(
                id,
                BuildLogEntry::new(LogLevel::Info, format!("gate opened: {}", kind)),
            )
            .await?;
        self.events.publish(BuildEvent::GateOpened {
            build_id: id,
            kind,
            payload,
        });
        tracing::info!(build_id = %id, gate = %kind, "gate opened");
        Ok(Some(rx))
    }

    /// Fire-and-forget notification; never blocks and is not persisted.
    pub async fn notify_workspace_ready(
        &self,
        id: BuildId,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.store
            .append_log(
                id,
                BuildLogEntry::new(LogLevel::Info, format!("workspace ready: {}", payload)),
            )
            .await?;
        self.events.publish(BuildEvent::GateOpened {
            build_id: id,
            kind: GateKind::WorkspaceReady,
            payload,
        });
        Ok(())
    }

    /// Deliver `resolution` to the open in-memory gate and clear the
    /// persisted marker. Returns the gate kind, or `None` when no live gate
    /// exists. A gate is resolved at most once.
    pub async fn resolve_gate(
        &self,
        id: BuildId,
        resolution: GateResolution,
    ) -> anyhow::Result<Option<GateKind>> {
        let taken = {
            let mut slots = self.slots();
            slots.get_mut(&id).and_then(|slot| {
                let gate = slot.gate.take();
                if gate.is_some() {
                    slot.heartbeat.waiting = false;
                    slot.heartbeat.last_progress = Instant::now();
                }
                gate
            })
        };
        let Some((kind, tx)) = taken else {
            return Ok(None);
        };
        if tx.send(resolution.clone()).is_err() {
            tracing::warn!(build_id = %id, gate = %kind, "gate receiver dropped before resolution");
        }
        self.clear_marker(id, kind, &resolution).await?;
        Ok(Some(kind))
    }

    /// Clear the persisted marker for a gate resolved without a live waiter.
    pub async fn clear_marker(
        &self,
        id: BuildId,
        kind: GateKind,
        resolution: &GateResolution,
    ) -> anyhow::Result<()> {
        self.store
            .update(id, Box::new(|b| b.pending_gate = None))
            .await?;
        self.store
            .append_log(
                id,
                BuildLogEntry::new(
                    LogLevel::Info,
                    format!("gate resolved: {} ({:?})", kind, resolution),
                ),
            )
            .await?;
        self.events.publish(BuildEvent::GateResolved { build_id: id, kind });
        tracing::info!(build_id = %id, gate = %kind, "gate resolved");
        Ok(())
    }

    /// Drop the gate sender without resolving (the waiter sees a closed
    /// mailbox). The persisted marker stays on the build.
    pub fn abandon_gate(&self, id: BuildId) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.gate = None;
            slot.heartbeat.waiting = false;
        }
    }

    /// Evict every trace of the build. Returns its task handle, if any.
    pub fn cleanup(&self, id: BuildId) -> Option<JoinHandle<()>> {
        self.slots().remove(&id).and_then(|slot| slot.task)
    }

    /// Apply a status transition, append its reason to the build log and
    /// broadcast it. Returns false when the transition was refused.
    pub async fn transition(
        &self,
        id: BuildId,
        status: BuildStatus,
        detail: Option<String>,
    ) -> anyhow::Result<bool> {
        let next_detail = detail.clone();
        let updated = self
            .store
            .update(
                id,
                Box::new(move |b| {
                    b.transition(status, next_detail);
                }),
            )
            .await?;
        let Some(build) = updated else {
            return Ok(false);
        };
        if build.status != status {
            tracing::warn!(build_id = %id, from = %build.status, to = %status, "status transition refused");
            return Ok(false);
        }
        let level = match status {
            BuildStatus::Failed => LogLevel::Error,
            BuildStatus::Paused | BuildStatus::Cancelled => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        let message = match &detail {
            Some(d) => format!("status → {}: {}", status, d),
            None => format!("status → {}", status),
        };
        self.store
            .append_log(id, BuildLogEntry::new(level, message))
            .await?;
        self.events.publish(BuildEvent::StatusChanged {
            build_id: id,
            status,
            detail,
        });
        tracing::info!(build_id = %id, status = %status, "build status changed");
        Ok(true)
    }

    /// Append to the build log and mirror the line to listeners.
    pub async fn log(
        &self,
        id: BuildId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> anyhow::Result<()> {
        let message = message.into();
        self.store
            .append_log(id, BuildLogEntry::new(level, message.clone()))
            .await?;
        self.events.publish(BuildEvent::Log {
            build_id: id,
            level,
            message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Build, BuildTarget};
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<BuildRegistry>, Arc<MemoryStore>, BuildId) {
        let store = Arc::new(MemoryStore::new());
        let build = Build::new(
            "p",
            BuildTarget::NewRepo {
                name: "p".into(),
                remote: None,
            },
            "/tmp/p".into(),
            "/tmp/c".into(),
        );
        store.create(&build).await.unwrap();
        let registry = Arc::new(BuildRegistry::new(store.clone(), EventBus::new()));
        (registry, store, build.id)
    }

    #[tokio::test]
    async fn test_exactly_one_slot_per_build() {
        let (registry, _, id) = setup().await;
        assert!(registry.register(id).is_some());
        assert!(registry.register(id).is_none());
        assert!(registry.is_active(id));
        registry.cleanup(id);
        assert!(!registry.is_active(id));
        assert!(registry.register(id).is_some());
    }

    #[tokio::test]
    async fn test_gate_persists_marker_and_resolves_once() {
        let (registry, store, id) = setup().await;
        let _rt = registry.register(id).unwrap();
        let rx = registry
            .open_gate(id, GateKind::PhaseReview, serde_json::json!({"phase": 1}))
            .await
            .unwrap()
            .unwrap();
        // Only one outstanding gate.
        assert!(registry
            .open_gate(id, GateKind::Clarification, serde_json::Value::Null)
            .await
            .unwrap()
            .is_none());
        let persisted = store.get(id).await.unwrap().unwrap();
        assert_eq!(persisted.pending_gate.unwrap().kind, GateKind::PhaseReview);
        assert!(registry.liveness(id).unwrap().waiting);

        let kind = registry.resolve_gate(id, GateResolution::Skip).await.unwrap();
        assert_eq!(kind, Some(GateKind::PhaseReview));
        assert_eq!(rx.await.unwrap(), GateResolution::Skip);
        assert!(store.get(id).await.unwrap().unwrap().pending_gate.is_none());

        assert_eq!(
            registry.resolve_gate(id, GateResolution::Retry).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_workspace_ready_is_not_persisted() {
        let (registry, store, id) = setup().await;
        let mut events = registry.events().subscribe();
        registry
            .notify_workspace_ready(id, serde_json::json!({"dir": "/tmp/p"}))
            .await
            .unwrap();
        assert!(store.get(id).await.unwrap().unwrap().pending_gate.is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            BuildEvent::GateOpened {
                kind: GateKind::WorkspaceReady,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_signals_and_flags_reach_runtime() {
        let (registry, _, id) = setup().await;
        let mut rt = registry.register(id).unwrap();
        assert!(registry.send_signal(id, ControlSignal::Commit));
        assert!(registry.send_signal(id, ControlSignal::Instruction("x".into())));
        assert_eq!(rt.drain_signals().len(), 2);
        assert!(rt.drain_signals().is_empty());

        assert!(registry.request_pause(id));
        assert!(rt.pause_requested());
        assert!(registry.request_cancel(id));
        assert!(rt.cancel.is_cancelled());
        assert!(!rt.kill.is_cancelled());
        assert!(registry.kill(id));
        assert!(rt.kill.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_beat_resets_idle_clock() {
        let (registry, _, id) = setup().await;
        let _rt = registry.register(id).unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(registry.liveness(id).unwrap().idle >= Duration::from_secs(40));
        registry.mark_warned(id);
        registry.beat(id, "generating a.py");
        let live = registry.liveness(id).unwrap();
        assert!(live.idle < Duration::from_secs(1));
        assert_eq!(live.activity, "generating a.py");
        assert!(!live.warned);
    }

    #[tokio::test]
    async fn test_transition_logs_and_refuses_invalid() {
        let (registry, store, id) = setup().await;
        let mut events = registry.events().subscribe();
        assert!(registry
            .transition(id, BuildStatus::Running, None)
            .await
            .unwrap());
        assert!(registry
            .transition(id, BuildStatus::Failed, Some("boom".into()))
            .await
            .unwrap());
        assert!(!registry
            .transition(id, BuildStatus::Running, None)
            .await
            .unwrap());

        let build = store.get(id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        let logs = store.logs(id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert!(logs[1].message.contains("boom"));
        assert!(matches!(
            events.recv().await.unwrap(),
            BuildEvent::StatusChanged {
                status: BuildStatus::Running,
                ..
            }
        ));
    }
}
