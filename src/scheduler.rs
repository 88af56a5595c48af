//! Resource Optimizer / Scheduler (C3).
//!
//! Worker-state bookkeeping and routing strategies generalize
//! `goose::agents::swarm::Swarm`'s `RoutingStrategy` (round-robin,
//! least-busy, performance-based, hybrid) from agent routing to the
//! spec's worker routing, renamed to `round_robin | least_loaded |
//! complexity_aware | category_aware`.

use std::collections::HashMap;

use crate::events::{AidosEvent, EventBus};
use crate::types::{estimated_duration, Complexity, RuntimeTask, ScheduleStatus, ScheduledTask, WorkerState, WorkerStatus};

/// Worker-selection strategy, per spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    ComplexityAware,
    /// Reserved for worker-tagging; currently aliased to `LeastLoaded`.
    CategoryAware,
}

/// Result of [`Optimizer::create_schedule`].
#[derive(Debug, Clone)]
pub struct Schedule {
    pub scheduled_tasks: Vec<ScheduledTask>,
    pub total_estimated_time_ms: u64,
    pub worker_utilization: HashMap<String, f64>,
    pub parallelism: f64,
}

/// A single item to be scheduled: the minimal slice of [`RuntimeTask`]
/// the optimizer needs (id, priority, complexity, dependency ids, whether
/// it lies on the critical path).
#[derive(Debug, Clone)]
pub struct SchedulableTask {
    pub id: String,
    pub priority: i32,
    pub complexity: Complexity,
    pub dependencies: Vec<String>,
    pub on_critical_path: bool,
    pub dependent_count: usize,
}

impl SchedulableTask {
    pub fn from_runtime(rt: &RuntimeTask, on_critical_path: bool, dependent_count: usize) -> Self {
        Self {
            id: rt.task.id.clone(),
            priority: rt.task.priority,
            complexity: rt.task.complexity,
            dependencies: rt.task.dependencies.clone(),
            on_critical_path,
            dependent_count,
        }
    }
}

/// Owns the worker pool and computes schedules / routes tasks to workers.
pub struct Optimizer {
    max_workers: usize,
    strategy: RoutingStrategy,
    critical_path_boost: i32,
    workers: HashMap<String, WorkerState>,
    round_robin_cursor: usize,
    events: EventBus<AidosEvent>,
}

impl Optimizer {
    pub fn new(max_workers: usize, strategy: RoutingStrategy, critical_path_boost: i32, events: EventBus<AidosEvent>) -> Self {
        let mut workers = HashMap::new();
        for i in 0..max_workers {
            let id = format!("worker-{}", i);
            workers.insert(id.clone(), WorkerState::new(id));
        }
        Self {
            max_workers,
            strategy,
            critical_path_boost,
            workers,
            round_robin_cursor: 0,
            events,
        }
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values()
    }

    fn adjusted_priority(&self, task: &SchedulableTask) -> i32 {
        let mut p = task.priority;
        if task.on_critical_path {
            p -= self.critical_path_boost;
        }
        if task.complexity == Complexity::High {
            p -= 1;
        }
        if task.dependent_count >= 2 {
            p -= 1;
        }
        p.max(1)
    }

    /// Compute a full schedule from a task list, per spec §4.3.
    pub fn create_schedule(&mut self, tasks: &[SchedulableTask]) -> Schedule {
        if tasks.is_empty() {
            self.events.publish(AidosEvent::ScheduleCreated {
                total_estimated_time_ms: 0,
                parallelism: 0.0,
            });
            return Schedule {
                scheduled_tasks: Vec::new(),
                total_estimated_time_ms: 0,
                worker_utilization: HashMap::new(),
                parallelism: 0.0,
            };
        }

        let mut ordered: Vec<&SchedulableTask> = tasks.iter().collect();
        ordered.sort_by_key(|t| self.adjusted_priority(t));

        let mut worker_ids: Vec<String> = self.workers.keys().cloned().collect();
        worker_ids.sort();

        let mut worker_timeline: HashMap<String, u64> =
            worker_ids.iter().map(|w| (w.clone(), 0u64)).collect();
        let mut task_start: HashMap<String, u64> = HashMap::new();
        let mut task_duration: HashMap<String, u64> = HashMap::new();
        let mut scheduled = Vec::with_capacity(ordered.len());
        let mut intervals: Vec<(u64, u64)> = Vec::new();

        for task in ordered {
            let worker = self.select_worker(&worker_ids, &worker_timeline, task.complexity);
            let duration = estimated_duration(task.complexity).as_millis() as u64;
            let dep_ready = task
                .dependencies
                .iter()
                .filter_map(|d| {
                    task_start
                        .get(d)
                        .zip(task_duration.get(d))
                        .map(|(s, d)| s + d)
                })
                .max()
                .unwrap_or(0);
            let start = worker_timeline[&worker].max(dep_ready);

            task_start.insert(task.id.clone(), start);
            task_duration.insert(task.id.clone(), duration);
            worker_timeline.insert(worker.clone(), start + duration);
            intervals.push((start, start + duration));

            scheduled.push(ScheduledTask {
                task_id: task.id.clone(),
                worker_id: Some(worker),
                scheduled_time_ms: start,
                estimated_duration_ms: duration,
                adjusted_priority: self.adjusted_priority(task),
                status: ScheduleStatus::Scheduled,
            });
        }

        let total_estimated_time_ms = worker_timeline.values().copied().max().unwrap_or(0);

        let worker_utilization: HashMap<String, f64> = worker_ids
            .iter()
            .map(|w| {
                let busy: u64 = scheduled
                    .iter()
                    .filter(|s| s.worker_id.as_deref() == Some(w.as_str()))
                    .map(|s| s.estimated_duration_ms)
                    .sum();
                let util = if total_estimated_time_ms == 0 {
                    0.0
                } else {
                    busy as f64 / total_estimated_time_ms as f64
                };
                (w.clone(), util)
            })
            .collect();

        let parallelism = sample_parallelism(&intervals, total_estimated_time_ms);

        self.events.publish(AidosEvent::ScheduleCreated {
            total_estimated_time_ms,
            parallelism,
        });

        Schedule {
            scheduled_tasks: scheduled,
            total_estimated_time_ms,
            worker_utilization,
            parallelism,
        }
    }

    fn select_worker(
        &mut self,
        worker_ids: &[String],
        timeline: &HashMap<String, u64>,
        complexity: Complexity,
    ) -> String {
        let effective = match self.strategy {
            RoutingStrategy::RoundRobin => RoutingStrategy::RoundRobin,
            RoutingStrategy::LeastLoaded => RoutingStrategy::LeastLoaded,
            RoutingStrategy::CategoryAware => RoutingStrategy::LeastLoaded,
            RoutingStrategy::ComplexityAware => match complexity {
                Complexity::High => RoutingStrategy::LeastLoaded,
                Complexity::Low => RoutingStrategy::RoundRobin,
                Complexity::Medium => RoutingStrategy::LeastLoaded,
            },
        };

        match effective {
            RoutingStrategy::RoundRobin => {
                let id = worker_ids[self.round_robin_cursor % worker_ids.len()].clone();
                self.round_robin_cursor += 1;
                id
            }
            _ => worker_ids
                .iter()
                .min_by_key(|w| timeline[*w])
                .cloned()
                .unwrap_or_else(|| worker_ids[0].clone()),
        }
    }

    /// Succeeds iff both the task and worker exist and the worker is idle.
    pub fn assign_task(&mut self, task_id: &str, worker_id: &str) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.status != WorkerStatus::Idle {
            return false;
        }
        worker.status = WorkerStatus::Busy;
        worker.current_task_id = Some(task_id.to_string());
        self.events.publish(AidosEvent::TaskScheduled {
            task_id: task_id.to_string(),
            worker_id: Some(worker_id.to_string()),
            scheduled_time_ms: 0,
        });
        true
    }

    pub fn complete_task(&mut self, worker_id: &str, duration_ms: u64) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        let Some(task_id) = worker.current_task_id.take() else {
            return false;
        };
        worker.status = WorkerStatus::Idle;
        worker.load = 0.0;
        worker.completed_tasks += 1;
        worker.total_execution_time_ms += duration_ms;
        self.events.publish(AidosEvent::WorkerCompleted {
            worker_id: worker_id.to_string(),
            task_id: task_id.clone(),
        });
        self.events.publish(AidosEvent::ScheduleUpdated { task_id });
        if self.is_load_imbalanced(LOAD_IMBALANCE_THRESHOLD) {
            if let Some(busiest) = self.workers.values().max_by_key(|w| w.total_execution_time_ms) {
                self.events.publish(AidosEvent::WorkerOverloaded { worker_id: busiest.id.clone() });
            }
        }
        true
    }

    pub fn fail_task(&mut self, worker_id: &str) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        let Some(task_id) = worker.current_task_id.take() else {
            return false;
        };
        worker.status = WorkerStatus::Idle;
        worker.load = 0.0;
        self.events.publish(AidosEvent::ScheduleUpdated { task_id });
        true
    }

    /// Ready tasks capped by the number of currently idle workers.
    pub fn next_tasks<'a>(&self, ready: &'a [String]) -> &'a [String] {
        let idle = self.workers.values().filter(|w| w.status == WorkerStatus::Idle).count();
        &ready[..ready.len().min(idle)]
    }

    /// Upsizing is unconditional; downsizing removes only idle workers
    /// from the tail, never evicting a busy one.
    pub fn set_worker_count(&mut self, n: usize) {
        if n >= self.workers.len() {
            for i in self.workers.len()..n {
                let id = format!("worker-{}", i);
                self.workers.insert(id.clone(), WorkerState::new(id));
            }
            self.max_workers = n;
            return;
        }

        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        let mut remaining = self.workers.len();
        for id in ids.into_iter().rev() {
            if remaining <= n {
                break;
            }
            if self.workers[&id].status == WorkerStatus::Idle {
                self.workers.remove(&id);
                remaining -= 1;
            }
        }
        self.max_workers = self.workers.len();
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// True iff `(max−min)/max > threshold` across cumulative execution
    /// times. No mid-flight rebalancing is performed; `complete_task`
    /// consults this after each completion and publishes
    /// `worker:overloaded` for the busiest worker when it trips, relying
    /// on the next scheduling pass to even things back out.
    pub fn is_load_imbalanced(&self, threshold: f64) -> bool {
        let times: Vec<u64> = self.workers.values().map(|w| w.total_execution_time_ms).collect();
        let Some(&max) = times.iter().max() else {
            return false;
        };
        if max == 0 {
            return false;
        }
        let min = times.iter().min().copied().unwrap_or(0);
        (max - min) as f64 / max as f64 > threshold
    }
}

/// Skew ratio beyond which `complete_task` reports the busiest worker as
/// overloaded.
const LOAD_IMBALANCE_THRESHOLD: f64 = 0.5;

/// Average number of in-flight intervals, sampled at 100 uniformly spaced
/// points across `[0, total]`.
fn sample_parallelism(intervals: &[(u64, u64)], total: u64) -> f64 {
    if total == 0 || intervals.is_empty() {
        return 0.0;
    }
    const SAMPLES: u64 = 100;
    let mut sum = 0u64;
    for i in 0..SAMPLES {
        let t = total * i / SAMPLES;
        let count = intervals.iter().filter(|(s, e)| *s <= t && t < *e).count();
        sum += count as u64;
    }
    sum as f64 / SAMPLES as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str], complexity: Complexity) -> SchedulableTask {
        SchedulableTask {
            id: id.to_string(),
            priority: 1,
            complexity,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            on_critical_path: false,
            dependent_count: 0,
        }
    }

    #[test]
    fn empty_schedule_has_zero_time_and_creates_event() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(4, RoutingStrategy::LeastLoaded, 1, events);
        let schedule = opt.create_schedule(&[]);
        assert!(schedule.scheduled_tasks.is_empty());
        assert_eq!(schedule.total_estimated_time_ms, 0);
    }

    #[test]
    fn single_task_schedules_at_zero() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(4, RoutingStrategy::LeastLoaded, 1, events);
        let schedule = opt.create_schedule(&[task("t1", &[], Complexity::Medium)]);
        assert_eq!(schedule.scheduled_tasks.len(), 1);
        assert_eq!(schedule.scheduled_tasks[0].scheduled_time_ms, 0);
    }

    #[test]
    fn diamond_schedule_totals_three_medium_durations() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(4, RoutingStrategy::LeastLoaded, 1, events);
        let tasks = vec![
            task("t1", &[], Complexity::Medium),
            task("t2", &["t1"], Complexity::Medium),
            task("t3", &["t1"], Complexity::Medium),
            task("t4", &["t2", "t3"], Complexity::Medium),
        ];
        let schedule = opt.create_schedule(&tasks);
        let one_duration = estimated_duration(Complexity::Medium).as_millis() as u64;
        assert_eq!(schedule.total_estimated_time_ms, one_duration * 3);
    }

    #[test]
    fn single_worker_serializes_parallel_ready_tasks() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(1, RoutingStrategy::RoundRobin, 1, events);
        let tasks = vec![
            task("a", &[], Complexity::Low),
            task("b", &[], Complexity::Low),
            task("c", &[], Complexity::Low),
        ];
        let schedule = opt.create_schedule(&tasks);
        let worker = schedule.scheduled_tasks[0].worker_id.clone();
        assert!(schedule.scheduled_tasks.iter().all(|s| s.worker_id == worker));
        let mut starts: Vec<u64> = schedule.scheduled_tasks.iter().map(|s| s.scheduled_time_ms).collect();
        starts.sort();
        assert_eq!(starts, vec![0, 30_000, 60_000]);
    }

    #[test]
    fn assign_task_requires_idle_worker() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(1, RoutingStrategy::RoundRobin, 1, events);
        assert!(opt.assign_task("t1", "worker-0"));
        assert!(!opt.assign_task("t2", "worker-0"));
    }

    #[test]
    fn complete_task_frees_worker_and_accumulates_metrics() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(1, RoutingStrategy::RoundRobin, 1, events);
        opt.assign_task("t1", "worker-0");
        assert!(opt.complete_task("worker-0", 500));
        let w = opt.workers().find(|w| w.id == "worker-0").unwrap();
        assert_eq!(w.status, WorkerStatus::Idle);
        assert_eq!(w.completed_tasks, 1);
        assert_eq!(w.total_execution_time_ms, 500);
    }

    #[test]
    fn set_worker_count_cannot_evict_busy_worker() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(2, RoutingStrategy::RoundRobin, 1, events);
        opt.assign_task("t1", "worker-0");
        opt.set_worker_count(1);
        assert_eq!(opt.max_workers(), 2);
        assert!(opt.workers().any(|w| w.id == "worker-0" && w.status == WorkerStatus::Busy));
    }

    #[test]
    fn set_worker_count_upsizes_freely() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(1, RoutingStrategy::RoundRobin, 1, events);
        opt.set_worker_count(3);
        assert_eq!(opt.max_workers(), 3);
    }

    #[test]
    fn load_imbalance_detects_skew() {
        let events = EventBus::new();
        let mut opt = Optimizer::new(2, RoutingStrategy::RoundRobin, 1, events);
        opt.assign_task("t1", "worker-0");
        opt.complete_task("worker-0", 1000);
        assert!(opt.is_load_imbalanced(0.3));
    }

    #[test]
    fn next_tasks_capped_by_idle_worker_count() {
        let events = EventBus::new();
        let opt = Optimizer::new(2, RoutingStrategy::RoundRobin, 1, events);
        let ready = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(opt.next_tasks(&ready).len(), 2);
    }
}
