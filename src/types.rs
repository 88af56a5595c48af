//! Shared domain types for the orchestration engine.
//!
//! Kept in one module (rather than duplicated per-component) because the
//! Graph, Scheduler, Agent Manager and Orchestrator all read and write the
//! same `Task` record at different points in its lifecycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A task's functional category, assigned by the Decomposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Design,
    Implement,
    Test,
    Document,
    Other,
}

/// Coarse complexity tag driving both scheduling duration and critical-path
/// unit duration (kept as two separate constant tables, see
/// [`estimated_duration`] and [`critical_path_units`] — conflating them
/// would silently couple the Scheduler to the Graph's unit system).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Scheduling-facing estimated duration for a task of the given complexity.
pub fn estimated_duration(c: Complexity) -> Duration {
    match c {
        Complexity::Low => Duration::from_secs(30),
        Complexity::Medium => Duration::from_secs(60),
        Complexity::High => Duration::from_secs(180),
    }
}

/// Critical-path unit duration (dimensionless) for a task of the given
/// complexity, per spec §4.2.
pub fn critical_path_units(c: Complexity) -> u64 {
    match c {
        Complexity::Low => 1,
        Complexity::Medium => 2,
        Complexity::High => 4,
    }
}

/// A task as produced by the Decomposer: identity + static attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub category: TaskCategory,
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub complexity: Complexity,
}

/// Runtime lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A [`Task`] extended with runtime lifecycle fields, owned exclusively by
/// the Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeTask {
    pub task: Task,
    pub status: TaskStatus,
    pub progress: u8,
    pub output: String,
    pub assigned_agent: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RuntimeTask {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            progress: 0,
            output: String::new(),
            assigned_agent: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    /// Apply the "task started" update rule from spec §4.6.
    pub fn mark_started(&mut self, agent_id: impl Into<String>) {
        self.status = TaskStatus::InProgress;
        self.progress = 50;
        self.assigned_agent = Some(agent_id.into());
    }

    /// Apply the "task succeeded" update rule from spec §4.6.
    pub fn mark_completed(&mut self, output: impl Into<String>) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(chrono::Utc::now());
        self.output = output.into();
    }

    /// Apply the "task failed" update rule from spec §4.6.
    pub fn mark_failed(&mut self, output: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.output = output.into();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// `completed`/`failed` are absorbing per spec §3.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// One end-to-end run, from objective to completion or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub objective: String,
    pub status: SessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, objective: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            objective: objective.into(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = chrono::Utc::now();
    }
}

/// An agent's role within the spawned tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[serde(rename = "PM")]
    Pm,
    #[serde(rename = "PL")]
    Pl,
    Member,
}

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Executing,
    Blocked,
    Done,
    Error,
}

impl AgentStatus {
    /// "active" per spec §4.4: counts against `maxConcurrent`.
    pub fn is_active(self) -> bool {
        matches!(self, AgentStatus::Thinking | AgentStatus::Executing)
    }
}

/// Cumulative metrics carried by one agent instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tokens_used: u64,
    pub execution_time_ms: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub children_spawned: u64,
}

impl AgentMetrics {
    pub fn add(&mut self, other: &AgentMetrics) {
        self.tokens_used += other.tokens_used;
        self.execution_time_ms += other.execution_time_ms;
        self.tasks_completed += other.tasks_completed;
        self.tasks_failed += other.tasks_failed;
        self.children_spawned += other.children_spawned;
    }
}

/// An autonomous executor of one instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: AgentRole,
    pub mission: String,
    pub status: AgentStatus,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub metrics: AgentMetrics,
}

impl Agent {
    pub fn new(id: impl Into<String>, role: AgentRole, mission: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            mission: mission.into(),
            status: AgentStatus::Idle,
            parent: None,
            children: Vec::new(),
            metrics: AgentMetrics::default(),
        }
    }
}

/// A scheduler-level slot that can hold at most one running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub load: f64,
    pub completed_tasks: u64,
    pub total_execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
}

impl WorkerState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            load: 0.0,
            completed_tasks: 0,
            total_execution_time_ms: 0,
        }
    }

    /// Invariant from spec §8: busy iff `current_task_id` is set.
    pub fn check_invariant(&self) -> bool {
        (self.status == WorkerStatus::Busy) == self.current_task_id.is_some()
    }
}

/// Schedule-level status of a task, distinct from [`TaskStatus`] — a task
/// can be `scheduled` (has a slot and start time) before the Orchestrator
/// has actually started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

/// A runtime task placed on the schedule's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub worker_id: Option<String>,
    pub scheduled_time_ms: u64,
    pub estimated_duration_ms: u64,
    pub adjusted_priority: i32,
    pub status: ScheduleStatus,
}

/// Generates random 8-character session ids the way a `Uuid` is truncated
/// for display purposes elsewhere in the corpus — here built directly from
/// an RNG to keep the id alphabet constrained to lowercase alphanumerics.
pub fn random_id(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_invariant_holds_on_fresh_state() {
        let w = WorkerState::new("w1");
        assert!(w.check_invariant());
    }

    #[test]
    fn runtime_task_lifecycle() {
        let task = Task {
            id: "t1".into(),
            description: "do a thing".into(),
            category: TaskCategory::Implement,
            dependencies: vec![],
            priority: 1,
            complexity: Complexity::Medium,
        };
        let mut rt = RuntimeTask::new(task);
        assert_eq!(rt.status, TaskStatus::Pending);
        rt.mark_started("agent-1");
        assert_eq!(rt.status, TaskStatus::InProgress);
        assert_eq!(rt.progress, 50);
        rt.mark_completed("done");
        assert_eq!(rt.status, TaskStatus::Completed);
        assert_eq!(rt.progress, 100);
        assert!(rt.is_terminal());
        assert!(rt.completed_at.is_some());
    }

    #[test]
    fn session_terminal_states_absorbing() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn random_id_has_requested_length() {
        let id = random_id(8);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
