//! Agent Manager (C4): lifecycle, parent/child tree, and per-agent
//! metrics for one session.
//!
//! Parent/child bookkeeping (ids, not references) and leaf-first
//! `destroy` mirror `goose-conductor::child_manager::ChildManager::stop_all`
//! (collect ids first, then recurse, to avoid holding a lock across the
//! recursive teardown). The `activeAgentCount < maxConcurrent` gate
//! follows the restart-budget shape in `child_manager::RestartTracker` —
//! a bounded counter that refuses once a ceiling is hit and reports the
//! current count — generalized from a time-windowed counter to a live
//! concurrent-count gate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{AidosError, AidosResult};
use crate::events::{AidosEvent, EventBus};
use crate::subprocess_agent::{RunOutcome, SpawnConfig, SubprocessAgent};
use crate::types::{random_id, Agent, AgentRole, AgentStatus, Task};

/// Instruction priority derived from `task.priority`, per spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionPriority {
    High,
    Normal,
    Low,
}

pub fn instruction_priority(task_priority: i32) -> InstructionPriority {
    if task_priority <= 1 {
        InstructionPriority::High
    } else if task_priority <= 2 {
        InstructionPriority::Normal
    } else {
        InstructionPriority::Low
    }
}

/// Options for [`AgentManager::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub role: AgentRole,
    pub mission: String,
    pub parent: Option<String>,
}

/// One node in the forest returned by [`AgentManager::build_agent_tree`].
#[derive(Debug, Clone)]
pub struct AgentTreeNode {
    pub agent: Agent,
    pub children: Vec<AgentTreeNode>,
    pub depth: usize,
}

struct ManagedAgent {
    record: Agent,
    runner: Arc<SubprocessAgent>,
}

/// Per-session agent registry. Owns every [`Agent`] instance and the
/// parent→children index for the session it was constructed with.
pub struct AgentManager {
    max_concurrent: usize,
    agents: Arc<Mutex<HashMap<String, ManagedAgent>>>,
    events: EventBus<AidosEvent>,
    spawn_config: Option<SpawnConfig>,
}

impl AgentManager {
    pub fn new(max_concurrent: usize, events: EventBus<AidosEvent>) -> Self {
        Self {
            max_concurrent,
            agents: Arc::new(Mutex::new(HashMap::new())),
            events,
            spawn_config: None,
        }
    }

    /// Every agent this manager spawns from here on runs the real
    /// `SubprocessAgent::subprocess` variant under `config` instead of
    /// the mock lifecycle.
    pub fn with_spawn_config(mut self, config: SpawnConfig) -> Self {
        self.spawn_config = Some(config);
        self
    }

    async fn active_count(&self) -> usize {
        let agents = self.agents.lock().await;
        agents.values().filter(|a| a.record.status.is_active()).count()
    }

    /// Enforces `activeAgentCount < maxConcurrent`. On rejection, emits
    /// `manager:limit_reached` and returns a `ResourceLimit` error (the
    /// only recoverable kind — the orchestrator retries once a slot
    /// frees).
    pub async fn spawn(&self, options: SpawnOptions) -> AidosResult<Agent> {
        let active = self.active_count().await;
        if active >= self.max_concurrent {
            self.events.publish(AidosEvent::ManagerLimitReached {
                requested_role: format!("{:?}", options.role),
                active,
                max: self.max_concurrent,
            });
            return Err(AidosError::ResourceLimit(format!(
                "activeAgentCount {} >= maxConcurrent {}",
                active, self.max_concurrent
            )));
        }

        let id = format!("agent-{}", random_id(8));
        let mut record = Agent::new(id.clone(), options.role, options.mission.clone());
        record.parent = options.parent.clone();

        let runner = match &self.spawn_config {
            Some(config) => SubprocessAgent::subprocess(config.clone(), options.mission),
            None => SubprocessAgent::mock(options.mission),
        };

        {
            let mut agents = self.agents.lock().await;
            if let Some(parent_id) = &options.parent {
                if let Some(parent) = agents.get_mut(parent_id) {
                    parent.record.children.push(id.clone());
                    parent.record.metrics.children_spawned += 1;
                }
            }
            agents.insert(
                id.clone(),
                ManagedAgent {
                    record: record.clone(),
                    runner: Arc::new(runner),
                },
            );
        }

        self.events.publish(AidosEvent::AgentSpawned {
            agent_id: id,
            role: format!("{:?}", record.role),
            parent: record.parent.clone(),
        });

        Ok(record)
    }

    /// Transition an agent's status, logging (not rejecting) invalid
    /// transitions to preserve liveness on recovery, per spec §4.4.
    pub async fn set_status(&self, id: &str, to: AgentStatus) -> AidosResult<()> {
        let mut agents = self.agents.lock().await;
        let managed = agents
            .get_mut(id)
            .ok_or_else(|| AidosError::InvalidState(format!("unknown agent '{}'", id)))?;

        let from = managed.record.status;
        if !is_allowed_transition(from, to) {
            tracing::warn!(agent_id = id, ?from, ?to, "non-standard agent status transition permitted");
        }
        managed.record.status = to;
        self.events.publish(AidosEvent::AgentStatusChanged {
            agent_id: id.to_string(),
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        });
        Ok(())
    }

    /// Build the instruction, run the agent, and translate the outcome
    /// into `task_assigned`/`task_completed`/`error`, per spec §4.4.
    pub async fn assign_task(&self, agent_id: &str, task: &Task) -> AidosResult<RunOutcome> {
        let priority = instruction_priority(task.priority);
        tracing::debug!(agent_id, task_id = %task.id, ?priority, "assigning task to agent");

        self.set_status(agent_id, AgentStatus::Thinking).await?;
        self.events.publish(AidosEvent::TaskStarted {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
        });

        let runner = {
            let agents = self.agents.lock().await;
            agents
                .get(agent_id)
                .map(|a| a.runner.clone())
                .ok_or_else(|| AidosError::InvalidState(format!("unknown agent '{}'", agent_id)))?
        };

        self.set_status(agent_id, AgentStatus::Executing).await?;
        let result = runner.run(agent_id, &self.events).await;

        match &result {
            Ok(outcome) => {
                self.set_status(agent_id, AgentStatus::Done).await?;
                let mut agents = self.agents.lock().await;
                if let Some(managed) = agents.get_mut(agent_id) {
                    managed.record.metrics.tokens_used += outcome.tokens_used;
                    managed.record.metrics.execution_time_ms += outcome.execution_time_ms;
                    managed.record.metrics.tasks_completed += 1;
                }
                self.events.publish(AidosEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    output: outcome.output.clone(),
                });
            }
            Err(e) => {
                self.set_status(agent_id, AgentStatus::Error).await?;
                let mut agents = self.agents.lock().await;
                if let Some(managed) = agents.get_mut(agent_id) {
                    managed.record.metrics.tasks_failed += 1;
                }
                drop(agents);
                // The Subprocess Agent's own timeout is reported here, not
                // there, since this is the first point that has both the
                // agent (standing in for `worker_id` — this crate has no
                // separate live worker concept, per Open Question (a)) and
                // the task id the spec's `worker:timeout` event pairs.
                if matches!(&e, AidosError::AgentExecution(msg) if msg.contains("timed out")) {
                    self.events.publish(AidosEvent::WorkerTimeout {
                        worker_id: agent_id.to_string(),
                        task_id: task.id.clone(),
                    });
                }
                self.events.publish(AidosEvent::TaskFailed {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        result
    }

    /// Recursive leaf-first destroy: children first, then the agent
    /// itself. Idempotent on an already-destroyed id — returns `Ok(())`
    /// without error.
    pub async fn destroy(&self, id: &str) -> AidosResult<()> {
        let children = {
            let agents = self.agents.lock().await;
            match agents.get(id) {
                Some(a) => a.record.children.clone(),
                None => return Ok(()),
            }
        };

        for child in children {
            Box::pin(self.destroy(&child)).await?;
        }

        let parent = {
            let mut agents = self.agents.lock().await;
            let Some(removed) = agents.remove(id) else {
                return Ok(());
            };
            removed.record.parent
        };

        if let Some(parent_id) = parent {
            let mut agents = self.agents.lock().await;
            if let Some(parent) = agents.get_mut(&parent_id) {
                parent.record.children.retain(|c| c != id);
            }
        }

        self.events.publish(AidosEvent::AgentDestroyed { agent_id: id.to_string() });
        Ok(())
    }

    /// Stop every agent without tearing down the registry (used by the
    /// orchestrator's `pause`). Leaves each agent's current status intact
    /// apart from terminal agents, which are left alone.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let agents = self.agents.lock().await;
            agents.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.set_status(&id, AgentStatus::Idle).await;
        }
    }

    pub async fn destroy_all(&self) {
        let roots: Vec<String> = {
            let agents = self.agents.lock().await;
            agents
                .values()
                .filter(|a| a.record.parent.is_none())
                .map(|a| a.record.id.clone())
                .collect()
        };
        for id in roots {
            let _ = self.destroy(&id).await;
        }
    }

    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.agents.lock().await.get(id).map(|a| a.record.clone())
    }

    pub async fn aggregated_metrics(&self) -> crate::types::AgentMetrics {
        let agents = self.agents.lock().await;
        let mut total = crate::types::AgentMetrics::default();
        for a in agents.values() {
            total.add(&a.record.metrics);
        }
        total
    }

    pub async fn build_agent_tree(&self) -> Vec<AgentTreeNode> {
        let agents = self.agents.lock().await;
        let roots: Vec<&Agent> = agents.values().filter(|a| a.record.parent.is_none()).map(|a| &a.record).collect();

        fn build(agent: &Agent, all: &HashMap<String, ManagedAgent>, depth: usize) -> AgentTreeNode {
            let children = agent
                .children
                .iter()
                .filter_map(|id| all.get(id).map(|m| build(&m.record, all, depth + 1)))
                .collect();
            AgentTreeNode {
                agent: agent.clone(),
                children,
                depth,
            }
        }

        roots.into_iter().map(|a| build(a, &agents, 0)).collect()
    }

    pub async fn summaries(&self) -> Vec<Agent> {
        self.agents.lock().await.values().map(|a| a.record.clone()).collect()
    }

    pub async fn by_role(&self, role: AgentRole) -> Vec<Agent> {
        self.agents
            .lock()
            .await
            .values()
            .filter(|a| a.record.role == role)
            .map(|a| a.record.clone())
            .collect()
    }

    pub async fn by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.agents
            .lock()
            .await
            .values()
            .filter(|a| a.record.status == status)
            .map(|a| a.record.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }
}

/// Allowed edges per spec §4.4: `idle → thinking → executing → done →
/// idle`, plus `* → error`, `* → idle`, and `executing → blocked`.
fn is_allowed_transition(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;
    matches!(
        (from, to),
        (Idle, Thinking)
            | (Thinking, Executing)
            | (Executing, Done)
            | (Done, Idle)
            | (Executing, Blocked)
            | (_, Error)
            | (_, Idle)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: i32) -> Task {
        Task {
            id: id.to_string(),
            description: "do it".to_string(),
            category: crate::types::TaskCategory::Implement,
            dependencies: vec![],
            priority,
            complexity: crate::types::Complexity::Low,
        }
    }

    #[tokio::test]
    async fn spawn_respects_max_concurrent_and_emits_limit_reached() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = AgentManager::new(1, events);

        let a1 = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "m1".into(), parent: None })
            .await
            .unwrap();
        manager.set_status(&a1.id, AgentStatus::Thinking).await.unwrap();

        let rejected = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "m2".into(), parent: None })
            .await;
        assert!(rejected.is_err());

        let mut saw_limit = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, AidosEvent::ManagerLimitReached { .. }) {
                saw_limit = true;
            }
        }
        assert!(saw_limit);
    }

    #[tokio::test]
    async fn destroy_is_recursive_leaf_first_and_idempotent() {
        let events = EventBus::new();
        let manager = AgentManager::new(10, events);
        let parent = manager
            .spawn(SpawnOptions { role: AgentRole::Pl, mission: "parent".into(), parent: None })
            .await
            .unwrap();
        let child = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "child".into(), parent: Some(parent.id.clone()) })
            .await
            .unwrap();

        manager.destroy(&parent.id).await.unwrap();
        assert!(manager.get(&parent.id).await.is_none());
        assert!(manager.get(&child.id).await.is_none());

        // Idempotent: destroying an already-destroyed id is a no-op, not an error.
        assert!(manager.destroy(&parent.id).await.is_ok());
    }

    #[tokio::test]
    async fn parent_child_mirror_invariant_holds_after_spawn() {
        let events = EventBus::new();
        let manager = AgentManager::new(10, events);
        let parent = manager
            .spawn(SpawnOptions { role: AgentRole::Pl, mission: "parent".into(), parent: None })
            .await
            .unwrap();
        let child = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "child".into(), parent: Some(parent.id.clone()) })
            .await
            .unwrap();

        let parent_now = manager.get(&parent.id).await.unwrap();
        assert!(parent_now.children.contains(&child.id));
        assert_eq!(child.parent, Some(parent.id));
    }

    #[tokio::test]
    async fn assign_task_completes_with_mock_runner() {
        let events = EventBus::new();
        let manager = AgentManager::new(10, events);
        let agent = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "do it".into(), parent: None })
            .await
            .unwrap();
        let outcome = manager.assign_task(&agent.id, &task("t1", 1)).await.unwrap();
        assert!(outcome.success);
        let updated = manager.get(&agent.id).await.unwrap();
        assert_eq!(updated.status, AgentStatus::Done);
        assert_eq!(updated.metrics.tasks_completed, 1);
    }

    #[test]
    fn instruction_priority_mapping_matches_spec() {
        assert!(matches!(instruction_priority(1), InstructionPriority::High));
        assert!(matches!(instruction_priority(2), InstructionPriority::Normal));
        assert!(matches!(instruction_priority(3), InstructionPriority::Low));
    }

    #[tokio::test]
    async fn aggregated_metrics_sum_across_agents() {
        let events = EventBus::new();
        let manager = AgentManager::new(10, events);
        let a = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "a".into(), parent: None })
            .await
            .unwrap();
        let b = manager
            .spawn(SpawnOptions { role: AgentRole::Member, mission: "b".into(), parent: None })
            .await
            .unwrap();
        manager.assign_task(&a.id, &task("t1", 1)).await.unwrap();
        manager.assign_task(&b.id, &task("t2", 1)).await.unwrap();

        let totals = manager.aggregated_metrics().await;
        assert_eq!(totals.tasks_completed, 2);
    }
}
