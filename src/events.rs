//! Typed publish/subscribe event bus.
//!
//! Generalizes `goose-conductor::message_bus::MessageBus`'s use of
//! `tokio::sync::broadcast` for real-time fan-out: instead of one bus keyed
//! by a string topic carrying an untyped JSON payload, each component gets
//! its own [`EventBus<E>`] over a typed event enum. Events are fire-and-forget
//! publish calls; a lagging or absent subscriber never blocks or affects the
//! emitter's control flow (spec §9).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity; generous enough that a UI consumer polling at
/// human speed never lags a whole session's worth of events.
const DEFAULT_CAPACITY: usize = 4096;

/// A typed, multi-subscriber event bus. Cloning shares the same
/// underlying channel — every clone publishes to, and can subscribe
/// from, the same stream.
#[derive(Clone)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers notified; `0` is
    /// not an error — it just means nobody is currently listening.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get a fresh receiver. Each receiver sees only events published after
    /// it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every event the core emits, per spec §6. A consumer (UI, history
/// recorder) subscribes to one bus carrying this enum rather than one bus
/// per component, since most external consumers want the merged stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AidosEvent {
    SessionStarted { session_id: String, objective: String, at: chrono::DateTime<chrono::Utc> },
    SessionPaused { session_id: String, at: chrono::DateTime<chrono::Utc> },
    SessionResumed { session_id: String, at: chrono::DateTime<chrono::Utc> },
    SessionCompleted { session_id: String, at: chrono::DateTime<chrono::Utc> },
    SessionFailed { session_id: String, reason: String, at: chrono::DateTime<chrono::Utc> },

    PhaseChanged { session_id: String, from: String, to: String },

    TaskScheduled { task_id: String, worker_id: Option<String>, scheduled_time_ms: u64 },
    TaskStarted { task_id: String, agent_id: String },
    TaskProgress { task_id: String, progress: u8 },
    TaskCompleted { task_id: String, output: String },
    TaskFailed { task_id: String, reason: String },

    AgentSpawned { agent_id: String, role: String, parent: Option<String> },
    AgentDestroyed { agent_id: String },
    AgentStatusChanged { agent_id: String, from: String, to: String },
    AgentThinking { agent_id: String },
    AgentExecuting { agent_id: String, tool: String },
    AgentOutput { agent_id: String, text: String },
    AgentProgress { agent_id: String, percent: u8 },
    AgentCompleted { agent_id: String },
    AgentError { agent_id: String, message: String },

    LogMessage { level: String, message: String },

    InterventionRequested { reason: String },

    BudgetWarning { session_id: String, ratio: f64 },
    BudgetExceeded { session_id: String, reason: String },

    ScheduleCreated { total_estimated_time_ms: u64, parallelism: f64 },
    ScheduleUpdated { task_id: String },

    WorkerOverloaded { worker_id: String },
    WorkerCompleted { worker_id: String, task_id: String },
    WorkerTimeout { worker_id: String, task_id: String },

    DecomposeStart { objective: String },
    DecomposeProgress { percent: u8 },
    DecomposeComplete { task_count: usize },
    DecomposeError { reason: String },

    InvalidDependency { task_id: String, missing_dependency: String },
    CycleDetected { task_id: String, dependency: String },

    ManagerLimitReached { requested_role: String, active: usize, max: usize },

    CommandBlocked { command: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus: EventBus<AidosEvent> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(AidosEvent::LogMessage { level: "info".into(), message: "hi".into() });
        let got = rx.recv().await.unwrap();
        matches!(got, AidosEvent::LogMessage { .. });
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus: EventBus<AidosEvent> = EventBus::new();
        let n = bus.publish(AidosEvent::LogMessage { level: "info".into(), message: "hi".into() });
        assert_eq!(n, 0);
    }
}
