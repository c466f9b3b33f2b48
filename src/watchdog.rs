//! Per-build stall detection.
//!
//! Emits a heartbeat every interval, warns once per stall after
//! `warn_after`, and kills the build's task after `fail_after`. Time spent
//! waiting on a gate never counts as a stall.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::build::{BuildId, BuildLogEntry, LogLevel};
use crate::config::WatchdogConfig;
use crate::events::BuildEvent;
use crate::registry::BuildRegistry;
use crate::store::BuildStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub heartbeat: Duration,
    pub warn_after: Duration,
    pub fail_after: Duration,
}

impl From<&WatchdogConfig> for Thresholds {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
            warn_after: Duration::from_secs(config.warn_after_secs),
            fail_after: Duration::from_secs(config.fail_after_secs),
        }
    }
}

/// What one watchdog tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Healthy,
    Waiting,
    Warned,
    Killed,
    /// The build has no slot any more
    Gone,
}

pub fn spawn(
    registry: Arc<BuildRegistry>,
    store: Arc<dyn BuildStore>,
    id: BuildId,
    thresholds: Thresholds,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(thresholds.heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            match check(&registry, store.as_ref(), id, &thresholds).await {
                Tick::Killed | Tick::Gone => break,
                _ => {}
            }
        }
    })
}

/// Evaluate one build once.
pub async fn check(
    registry: &BuildRegistry,
    store: &dyn BuildStore,
    id: BuildId,
    thresholds: &Thresholds,
) -> Tick {
    let Some(live) = registry.liveness(id) else {
        return Tick::Gone;
    };
    let idle_secs = live.idle.as_secs();
    registry.events().publish(BuildEvent::Heartbeat {
        build_id: id,
        idle_secs,
        activity: live.activity.clone(),
    });
    if live.waiting {
        return Tick::Waiting;
    }

    if live.idle >= thresholds.fail_after {
        tracing::error!(build_id = %id, idle_secs, activity = %live.activity, "build stalled, killing task");
        registry.kill(id);
        return Tick::Killed;
    }

    if live.idle >= thresholds.warn_after && !live.warned {
        let message = format!(
            "no progress for {}s during '{}'",
            idle_secs, live.activity
        );
        tracing::warn!(build_id = %id, idle_secs, activity = %live.activity, "build stall warning");
        registry.mark_warned(id);
        if let Err(e) = store
            .append_log(id, BuildLogEntry::new(LogLevel::Warn, message))
            .await
        {
            tracing::warn!(build_id = %id, error = %e, "failed to log stall warning");
        }
        registry.events().publish(BuildEvent::StallWarning {
            build_id: id,
            idle_secs,
            activity: live.activity,
        });
        return Tick::Warned;
    }
    Tick::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Build, BuildTarget, GateKind};
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    fn thresholds() -> Thresholds {
        Thresholds {
            heartbeat: Duration::from_secs(10),
            warn_after: Duration::from_secs(30),
            fail_after: Duration::from_secs(60),
        }
    }

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

    #[tokio::test(start_paused = true)]
    async fn test_escalates_warn_then_kill() {
        let (registry, store, id) = setup().await;
        let rt = registry.register(id).unwrap();
        let t = thresholds();

        assert_eq!(check(&registry, store.as_ref(), id, &t).await, Tick::Healthy);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(check(&registry, store.as_ref(), id, &t).await, Tick::Warned);
        // Warn only once per stall.
        assert_eq!(check(&registry, store.as_ref(), id, &t).await, Tick::Healthy);
        assert_eq!(store.logs(id).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(check(&registry, store.as_ref(), id, &t).await, Tick::Killed);
        assert!(rt.kill.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_wait_is_not_a_stall() {
        let (registry, store, id) = setup().await;
        let rt = registry.register(id).unwrap();
        let _gate = registry
            .open_gate(id, GateKind::PhaseReview, serde_json::Value::Null)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(
            check(&registry, store.as_ref(), id, &thresholds()).await,
            Tick::Waiting
        );
        assert!(!rt.kill.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_watchdog_kills_and_exits() {
        let (registry, store, id) = setup().await;
        let rt = registry.register(id).unwrap();
        let handle = spawn(registry.clone(), store.clone(), id, thresholds());
        tokio::time::timeout(Duration::from_secs(120), rt.kill.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gone_when_slot_removed() {
        let (registry, store, id) = setup().await;
        assert_eq!(
            check(&registry, store.as_ref(), id, &thresholds()).await,
            Tick::Gone
        );
    }
}
