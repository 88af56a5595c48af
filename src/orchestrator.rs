//! Orchestrator (C6): top-level state machine binding C1–C5.
//!
//! The phase state machine is a plain enum with a guarded
//! `transition(&mut self, to)`, in the style of
//! `health_checker::CircuitState` (closed/open/half-open tracked via an
//! atomic plus explicit allowed-transition checks, here simplified to a
//! `&mut self` check since the Orchestrator is already behind its own
//! lock at the call site). The budget gate is its own small, pure,
//! independently-tested struct, following the `RestartTracker` pattern.
//!
//! Open Question (a) is resolved here: the Orchestrator drives execution
//! from its own parallel-group iteration and uses the Scheduler's
//! `create_schedule` only for reporting (the schedule's timeline,
//! utilization and parallelism numbers are attached to `session:started`
//! via `schedule:created`, never used to gate execution order).

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent_manager::{AgentManager, SpawnOptions};
use crate::decomposer::{self, DecomposeOptions};
use crate::error::{AidosError, AidosResult};
use crate::events::{AidosEvent, EventBus};
use crate::graph::DependencyGraph;
use crate::scheduler::{Optimizer, RoutingStrategy, SchedulableTask};
use crate::subprocess_agent::SpawnConfig;
use crate::types::{random_id, AgentRole, RuntimeTask, Session, SessionStatus, Task, TaskStatus};

/// Orchestrator phases, per spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Decomposing,
    Planning,
    Executing,
    Paused,
    Completed,
    Failed,
}

fn allowed_phase_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    matches!(
        (from, to),
        (Idle, Decomposing)
            | (Decomposing, Planning)
            | (Planning, Executing)
            | (Executing, Paused)
            | (Paused, Executing)
            | (Executing, Completed)
            | (Executing, Failed)
            | (Decomposing, Failed)
            | (Planning, Failed)
    )
}

/// Budget configuration evaluated before each parallel group.
#[derive(Debug, Clone, Copy)]
pub struct BudgetLimits {
    pub max_total_tokens: u64,
    pub max_session_duration: Duration,
    pub warning_threshold: f64,
}

/// Pure, independently-tested budget accounting, following the
/// `RestartTracker` pattern: small, time-aware, no orchestrator state.
pub struct BudgetGate {
    limits: BudgetLimits,
    started_at: Instant,
    tokens_used: u64,
}

impl BudgetGate {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            started_at: Instant::now(),
            tokens_used: 0,
        }
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        self.tokens_used += tokens;
    }

    /// Returns `Ok(Some(ratio))` carrying the warning ratio when it
    /// crosses the threshold but the hard cap is not yet hit, `Ok(None)`
    /// when well under budget, and `Err` when a cap has been exceeded.
    pub fn check(&self) -> AidosResult<Option<f64>> {
        let elapsed = self.started_at.elapsed();
        if self.tokens_used >= self.limits.max_total_tokens {
            return Err(AidosError::Budget(format!(
                "cumulative tokens {} >= max {}",
                self.tokens_used, self.limits.max_total_tokens
            )));
        }
        if elapsed >= self.limits.max_session_duration {
            return Err(AidosError::Budget(format!(
                "wall time {:?} >= max {:?}",
                elapsed, self.limits.max_session_duration
            )));
        }

        let token_ratio = self.tokens_used as f64 / self.limits.max_total_tokens.max(1) as f64;
        let time_ratio = elapsed.as_secs_f64() / self.limits.max_session_duration.as_secs_f64().max(1.0);
        let ratio = token_ratio.max(time_ratio);
        if ratio >= self.limits.warning_threshold {
            Ok(Some(ratio))
        } else {
            Ok(None)
        }
    }
}

/// Outcome of driving one task through [`Orchestrator::run_task`],
/// collected back by the caller once a whole parallel group's worth of
/// these have resolved concurrently.
struct TaskRunResult {
    task_id: String,
    agent_id: Option<String>,
    tokens_used: u64,
    outcome: Result<String, String>,
}

/// A JSON-serializable snapshot of a session, used to resume a
/// paused/active session across process restarts. Supplements the
/// externally-owned history file with an internal convenience the core
/// controls end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub tasks: Vec<RuntimeTask>,
}

/// Options controlling one orchestrator session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_concurrent_agents: usize,
    pub max_workers: usize,
    pub routing_strategy: RoutingStrategy,
    pub critical_path_boost: i32,
    pub budget: BudgetLimits,
    pub max_retries: u32,
    pub auto_start: bool,
    /// When set, every spawned agent runs the real external assistant
    /// process under this config instead of the mock lifecycle.
    pub subprocess: Option<SpawnConfig>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 4,
            max_workers: 4,
            routing_strategy: RoutingStrategy::LeastLoaded,
            critical_path_boost: 1,
            budget: BudgetLimits {
                max_total_tokens: 2_000_000,
                max_session_duration: Duration::from_secs(3600),
                warning_threshold: 0.8,
            },
            max_retries: 3,
            auto_start: true,
            subprocess: None,
        }
    }
}

/// Top-level state machine binding the Decomposer, Graph, Scheduler,
/// Agent Manager and Subprocess Agent into one session lifecycle.
pub struct Orchestrator {
    events: EventBus<AidosEvent>,
    phase: Phase,
    session: Option<Session>,
    tasks: Vec<RuntimeTask>,
    agent_manager: Option<AgentManager>,
    budget: Option<BudgetGate>,
    options: SessionOptions,
    /// Cooperative, top-down cancellation per spec §5: `stop()` cancels
    /// this token; `execute()` checks it between parallel groups instead
    /// of tearing anything down mid-group, mirroring how
    /// `goose-conductor::main` cancels a shared token and lets each
    /// subsystem's loop observe it at its own `tokio::select!` point.
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(events: EventBus<AidosEvent>, options: SessionOptions) -> Self {
        Self {
            events,
            phase: Phase::Idle,
            session: None,
            tasks: Vec::new(),
            agent_manager: None,
            budget: None,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn tasks(&self) -> &[RuntimeTask] {
        &self.tasks
    }

    fn transition(&mut self, to: Phase) -> AidosResult<()> {
        if !allowed_phase_transition(self.phase, to) {
            return Err(AidosError::InvalidState(format!(
                "illegal phase transition {:?} -> {:?}",
                self.phase, to
            )));
        }
        self.events.publish(AidosEvent::PhaseChanged {
            session_id: self.session.as_ref().map(|s| s.id.clone()).unwrap_or_default(),
            from: format!("{:?}", self.phase),
            to: format!("{:?}", to),
        });
        self.phase = to;
        Ok(())
    }

    /// Allocate a session, decompose the objective, and (if configured)
    /// fall into `execute`. Fails with `InvalidState` if a session is
    /// already active.
    pub async fn start_session(&mut self, objective: &str) -> AidosResult<()> {
        if let Some(session) = &self.session {
            if !session.status.is_terminal() {
                return Err(AidosError::InvalidState(
                    "a session is already active on this orchestrator".to_string(),
                ));
            }
        }

        let session = Session::new(random_id(8), objective.to_string());
        self.events.publish(AidosEvent::SessionStarted {
            session_id: session.id.clone(),
            objective: session.objective.clone(),
            at: chrono::Utc::now(),
        });
        self.session = Some(session);
        let mut manager = AgentManager::new(self.options.max_concurrent_agents, self.events.clone());
        if let Some(config) = &self.options.subprocess {
            manager = manager.with_spawn_config(config.clone());
        }
        self.agent_manager = Some(manager);
        self.budget = Some(BudgetGate::new(self.options.budget));

        self.transition(Phase::Decomposing)?;
        let decomposition = decomposer::decompose(&self.events, objective, &DecomposeOptions::default());
        let validation = decomposer::validate_dependencies(&decomposition.tasks);
        if !validation.valid {
            self.transition(Phase::Failed)?;
            self.fail_session(&validation.errors.join("; ")).await;
            return Err(AidosError::Validation(validation.errors.join("; ")));
        }

        self.tasks = decomposition
            .tasks
            .into_iter()
            .map(RuntimeTask::new)
            .collect();

        self.transition(Phase::Planning)?;

        // Report-only schedule per Open Question (a): the scheduler's
        // output is surfaced on the event bus but never consulted by
        // `execute`, which drives strictly off the graph's parallel
        // groups and the agent manager's admission control.
        let graph_tasks: Vec<Task> = self.tasks.iter().map(|t| t.task.clone()).collect();
        let graph = DependencyGraph::build_from_tasks(self.events.clone(), graph_tasks.clone());
        let schedulable: Vec<SchedulableTask> = graph_tasks
            .iter()
            .map(|t| SchedulableTask::from_runtime(&RuntimeTask::new(t.clone()), false, 0))
            .collect();
        let mut optimizer = Optimizer::new(
            self.options.max_workers,
            self.options.routing_strategy,
            self.options.critical_path_boost,
            self.events.clone(),
        );
        let _report_only_schedule = optimizer.create_schedule(&schedulable);
        let _ = graph;

        if self.options.auto_start {
            self.execute().await?;
        }

        Ok(())
    }

    /// Drive the session to completion: spawn a root PM agent, then for
    /// each parallel group (from the Graph) run the budget gate and
    /// spawn a PL agent per task, per spec §4.6.
    pub async fn execute(&mut self) -> AidosResult<()> {
        let Some(session) = self.session.clone() else {
            return Err(AidosError::InvalidState("no active session".to_string()));
        };
        if session.status == SessionStatus::Paused {
            self.transition(Phase::Executing)?;
            self.events.publish(AidosEvent::SessionResumed {
                session_id: session.id.clone(),
                at: chrono::Utc::now(),
            });
        } else if self.phase == Phase::Planning {
            self.transition(Phase::Executing)?;
        }

        let manager = self
            .agent_manager
            .as_ref()
            .ok_or_else(|| AidosError::InvalidState("agent manager not initialized".to_string()))?;

        manager
            .spawn(SpawnOptions {
                role: AgentRole::Pm,
                mission: session.objective.clone(),
                parent: None,
            })
            .await?;

        let graph_tasks: Vec<Task> = self.tasks.iter().map(|t| t.task.clone()).collect();
        let graph = DependencyGraph::build_from_tasks(self.events.clone(), graph_tasks);
        let groups = graph.parallel_groups();

        for group in groups {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if let Err(e) = self.check_budget() {
                self.transition(Phase::Failed)?;
                self.fail_session(&e.to_string()).await;
                return Err(e);
            }

            let manager = self
                .agent_manager
                .as_ref()
                .ok_or_else(|| AidosError::InvalidState("agent manager not initialized".to_string()))?;

            let group_tasks: Vec<Task> = group
                .iter()
                .filter_map(|id| self.tasks.iter().find(|t| &t.task.id == id).map(|t| t.task.clone()))
                .collect();

            // All tasks in the group are started concurrently (spec §5):
            // each `run_task` call races its own spawn+assign against the
            // others, so `AgentManager::spawn`'s `maxConcurrent` admission
            // control sees the real contention instead of one task at a
            // time. Only the bookkeeping below — local task status and
            // budget accounting — is applied sequentially once the whole
            // group has settled.
            let results = futures::future::join_all(
                group_tasks
                    .into_iter()
                    .map(|task| Self::run_task(manager, self.options.max_retries, task)),
            )
            .await;

            for result in results {
                if let Some(agent_id) = &result.agent_id {
                    self.mark_task_started(&result.task_id, agent_id);
                }
                match result.outcome {
                    Ok(output) => {
                        if let Some(budget) = &mut self.budget {
                            budget.record_tokens(result.tokens_used);
                        }
                        self.mark_task_completed(&result.task_id, &output);
                    }
                    Err(reason) => self.mark_task_failed(&result.task_id, &reason),
                }
            }

            let Some(session) = &self.session else {
                break;
            };
            if session.status != SessionStatus::Active {
                return Ok(());
            }

            if self.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
                self.transition(Phase::Failed)?;
                self.fail_session("a task failed").await;
                return Ok(());
            }
        }

        self.transition(Phase::Completed)?;
        if let Some(session) = &mut self.session {
            session.set_status(SessionStatus::Completed);
        }
        self.events.publish(AidosEvent::SessionCompleted {
            session_id: session.id.clone(),
            at: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Spawn an agent and run one task to completion (or terminal
    /// failure). Takes no `self` so the caller can drive every task in a
    /// parallel group through this concurrently via `join_all` — a plain
    /// `&AgentManager` is `Sync` (it guards its registry behind its own
    /// `Arc<Mutex<_>>`), so several calls can be in flight against the
    /// same manager at once.
    async fn run_task(manager: &AgentManager, max_retries: u32, task: Task) -> TaskRunResult {
        let mut attempts = 0;
        loop {
            let spawn_result = manager
                .spawn(SpawnOptions {
                    role: AgentRole::Pl,
                    mission: task.description.clone(),
                    parent: None,
                })
                .await;

            let agent = match spawn_result {
                Ok(agent) => agent,
                Err(AidosError::ResourceLimit(_)) if attempts < max_retries => {
                    attempts += 1;
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => {
                    return TaskRunResult {
                        task_id: task.id.clone(),
                        agent_id: None,
                        tokens_used: 0,
                        outcome: Err(e.to_string()),
                    };
                }
            };

            return match manager.assign_task(&agent.id, &task).await {
                Ok(run_outcome) => TaskRunResult {
                    task_id: task.id.clone(),
                    agent_id: Some(agent.id),
                    tokens_used: run_outcome.tokens_used,
                    outcome: Ok(run_outcome.output),
                },
                Err(e) => TaskRunResult {
                    task_id: task.id.clone(),
                    agent_id: Some(agent.id),
                    tokens_used: 0,
                    outcome: Err(e.to_string()),
                },
            };
        }
    }

    fn mark_task_started(&mut self, task_id: &str, agent_id: &str) {
        if let Some(t) = self.tasks.iter_mut().find(|t| t.task.id == task_id) {
            t.mark_started(agent_id);
            self.events.publish(AidosEvent::TaskProgress {
                task_id: task_id.to_string(),
                progress: t.progress,
            });
        }
    }

    fn mark_task_completed(&mut self, task_id: &str, output: &str) {
        if let Some(t) = self.tasks.iter_mut().find(|t| t.task.id == task_id) {
            t.mark_completed(output);
            self.events.publish(AidosEvent::TaskProgress {
                task_id: task_id.to_string(),
                progress: t.progress,
            });
        }
    }

    fn mark_task_failed(&mut self, task_id: &str, reason: &str) {
        if let Some(t) = self.tasks.iter_mut().find(|t| t.task.id == task_id) {
            t.mark_failed(reason);
        }
        self.events.publish(AidosEvent::TaskFailed {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn check_budget(&self) -> AidosResult<()> {
        let Some(budget) = &self.budget else {
            return Ok(());
        };
        match budget.check() {
            Ok(Some(ratio)) => {
                if let Some(session) = &self.session {
                    self.events.publish(AidosEvent::BudgetWarning {
                        session_id: session.id.clone(),
                        ratio,
                    });
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fail_session(&mut self, reason: &str) {
        if let Some(session) = &mut self.session {
            session.set_status(SessionStatus::Failed);
            self.events.publish(AidosEvent::SessionFailed {
                session_id: session.id.clone(),
                reason: reason.to_string(),
                at: chrono::Utc::now(),
            });
        }
        if let Some(manager) = &self.agent_manager {
            manager.destroy_all().await;
        }
    }

    /// Cooperative, top-down cancellation (spec §5): fires the shared
    /// token so any in-flight `execute()` bails out between parallel
    /// groups, then tears down every agent leaf-first and marks the
    /// session `failed` if it was not already in a terminal state.
    pub async fn stop(&mut self) -> AidosResult<()> {
        self.cancel.cancel();
        let already_terminal = self.session.as_ref().map(|s| s.status.is_terminal()).unwrap_or(true);
        if already_terminal {
            if let Some(manager) = &self.agent_manager {
                manager.destroy_all().await;
            }
            return Ok(());
        }
        if allowed_phase_transition(self.phase, Phase::Failed) {
            self.transition(Phase::Failed)?;
        }
        self.fail_session("session stopped").await;
        Ok(())
    }

    /// Stop every agent, set the session `paused`, and leave tasks in
    /// their current persistent status.
    pub async fn pause(&mut self) -> AidosResult<()> {
        self.transition(Phase::Paused)?;
        if let Some(session) = &mut self.session {
            session.set_status(SessionStatus::Paused);
            self.events.publish(AidosEvent::SessionPaused {
                session_id: session.id.clone(),
                at: chrono::Utc::now(),
            });
        }
        if let Some(manager) = &self.agent_manager {
            manager.stop_all().await;
        }
        Ok(())
    }

    /// Resolves Open Question (b): non-terminal tasks are re-startable
    /// without first resetting their status to `pending` — `execute`
    /// re-spawns a fresh agent for any task that is not yet terminal.
    pub async fn resume(&mut self) -> AidosResult<()> {
        let Some(session) = &self.session else {
            return Err(AidosError::InvalidState("no session to resume".to_string()));
        };
        if session.status != SessionStatus::Paused {
            return Err(AidosError::InvalidState("resume requires a paused session".to_string()));
        }
        self.execute().await
    }

    pub fn save_session_snapshot(&self, path: &Path) -> AidosResult<()> {
        let Some(session) = &self.session else {
            return Err(AidosError::InvalidState("no session to snapshot".to_string()));
        };
        let snapshot = SessionSnapshot {
            session: session.clone(),
            tasks: self.tasks.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| AidosError::InvalidState(format!("failed to serialize snapshot: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| AidosError::InvalidState(format!("failed to write snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load_session_snapshot(&mut self, path: &Path) -> AidosResult<()> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AidosError::InvalidState(format!("failed to read snapshot: {}", e)))?;
        let snapshot: SessionSnapshot = serde_json::from_str(&json)
            .map_err(|e| AidosError::InvalidState(format!("failed to parse snapshot: {}", e)))?;
        self.session = Some(snapshot.session);
        self.tasks = snapshot.tasks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_options(max_total_tokens: u64) -> SessionOptions {
        SessionOptions {
            budget: BudgetLimits {
                max_total_tokens,
                max_session_duration: Duration::from_secs(3600),
                warning_threshold: 0.8,
            },
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn full_session_reaches_completed() {
        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events, session_options(1_000_000));
        orchestrator.start_session("add login").await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Completed);
        assert!(orchestrator.tasks().iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn stop_on_completed_session_is_a_harmless_noop() {
        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events, session_options(1_000_000));
        orchestrator.start_session("add login").await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Completed);
        orchestrator.stop().await.unwrap();
        // Already-terminal session is left alone by stop().
        assert_eq!(orchestrator.session().unwrap().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn stop_on_active_session_cancels_and_fails() {
        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events, session_options(1_000_000));
        orchestrator.phase = Phase::Executing;
        orchestrator.session = Some(Session::new("s1", "add login"));
        orchestrator.agent_manager = Some(AgentManager::new(4, orchestrator.events.clone()));

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Failed);
        assert_eq!(orchestrator.session().unwrap().status, SessionStatus::Failed);
        assert!(orchestrator.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn double_start_session_is_rejected() {
        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events, session_options(1_000_000));
        orchestrator.start_session("add login").await.unwrap();
        // Session completed (terminal), so a second start is allowed by spec
        // ("at most one session is active"); force phase back to exercise
        // the active-session rejection path directly instead.
        orchestrator.phase = Phase::Idle;
        orchestrator.session.as_mut().unwrap().status = SessionStatus::Active;
        let result = orchestrator.start_session("add profile").await;
        assert!(matches!(result, Err(AidosError::InvalidState(_))));
    }

    #[tokio::test]
    async fn budget_exceeded_fails_session() {
        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events, session_options(1));
        let result = orchestrator.start_session("add login").await;
        assert!(result.is_err());
        assert_eq!(orchestrator.phase(), Phase::Failed);
        assert_eq!(orchestrator.session().unwrap().status, SessionStatus::Failed);
    }

    #[test]
    fn budget_gate_warns_then_errors() {
        let gate = BudgetGate {
            limits: BudgetLimits {
                max_total_tokens: 100,
                max_session_duration: Duration::from_secs(3600),
                warning_threshold: 0.8,
            },
            started_at: Instant::now(),
            tokens_used: 85,
        };
        assert!(matches!(gate.check(), Ok(Some(_))));

        let mut exceeded = gate;
        exceeded.tokens_used = 100;
        assert!(exceeded.check().is_err());
    }

    #[test]
    fn illegal_phase_transition_rejected() {
        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events, SessionOptions::default());
        assert!(orchestrator.transition(Phase::Executing).is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let events = EventBus::new();
        let mut orchestrator = Orchestrator::new(events.clone(), session_options(1_000_000));
        orchestrator.start_session("add login").await.unwrap();
        orchestrator.save_session_snapshot(&path).unwrap();

        let mut reloaded = Orchestrator::new(events, session_options(1_000_000));
        reloaded.load_session_snapshot(&path).unwrap();
        assert_eq!(reloaded.session().unwrap().objective, "add login");
        assert_eq!(reloaded.tasks().len(), orchestrator.tasks().len());
    }
}
