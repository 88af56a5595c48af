//! Dependency Graph (C2): DAG model over [`crate::types::Task`].
//!
//! Generalizes `goose::agents::graph::TaskGraph` — a node/edge map with
//! `add_node`/`add_edge`, DFS cycle detection, and Kahn's-algorithm
//! topological sort — from the teacher's generic workflow `NodeType` to
//! this crate's `Task` nodes, and adds priority-ordered tie-breaking,
//! critical path, parallel groups and bottleneck analysis per spec.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::events::{AidosEvent, EventBus};
use crate::types::{critical_path_units, Task};

/// One node's position in the graph: the task plus its two edge sets,
/// kept as exact inverses of each other at all times.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub task: Task,
    pub dependencies: HashSet<String>,
    pub dependents: HashSet<String>,
}

impl GraphNode {
    fn new(task: Task) -> Self {
        Self {
            task,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
        }
    }
}

/// Validation result from [`DependencyGraph::validate`] (mirrors the
/// decomposer's `validateDependencies` shape, reused here since the graph
/// is the authority on cycles once edges are actually built).
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Output of [`DependencyGraph::analyze`].
#[derive(Debug, Clone)]
pub struct GraphAnalysis {
    pub node_count: usize,
    pub edge_count: usize,
    pub bottlenecks: Vec<String>,
    pub isolated: Vec<String>,
}

/// Output of [`DependencyGraph::critical_path`].
#[derive(Debug, Clone)]
pub struct CriticalPath {
    pub task_ids: Vec<String>,
    pub duration_units: u64,
}

/// Dependents threshold above which a node counts as a bottleneck in
/// [`DependencyGraph::analyze`].
const BOTTLENECK_THRESHOLD: usize = 2;

/// A directed acyclic graph of tasks.
pub struct DependencyGraph {
    nodes: HashMap<String, GraphNode>,
    events: EventBus<AidosEvent>,
}

impl DependencyGraph {
    pub fn new(events: EventBus<AidosEvent>) -> Self {
        Self {
            nodes: HashMap::new(),
            events,
        }
    }

    /// Build a graph from a flat task list, per spec §4.2. Edges to a
    /// nonexistent target are dropped with an `invalid_dependency` event;
    /// edges that would close a cycle are dropped with `cycle_detected`.
    pub fn build_from_tasks(events: EventBus<AidosEvent>, tasks: Vec<Task>) -> Self {
        let mut graph = Self::new(events);
        for task in &tasks {
            graph.add_node(task.clone());
        }
        for task in tasks {
            let deps = task.dependencies.clone();
            for dep in deps {
                graph.add_edge(&dep, &task.id);
            }
        }
        graph
    }

    pub fn add_node(&mut self, task: Task) {
        self.nodes
            .entry(task.id.clone())
            .or_insert_with(|| GraphNode::new(task));
    }

    /// Add an edge `from -> to` (`to` depends on `from`). Returns `false`
    /// and emits an event if the edge is missing a target, or would
    /// introduce a cycle (self-loops included).
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        if !self.nodes.contains_key(from) {
            self.events.publish(AidosEvent::InvalidDependency {
                task_id: to.to_string(),
                missing_dependency: from.to_string(),
            });
            return false;
        }
        if !self.nodes.contains_key(to) {
            self.events.publish(AidosEvent::InvalidDependency {
                task_id: to.to_string(),
                missing_dependency: from.to_string(),
            });
            return false;
        }

        if from == to || self.would_create_cycle(from, to) {
            self.events.publish(AidosEvent::CycleDetected {
                task_id: to.to_string(),
                dependency: from.to_string(),
            });
            return false;
        }

        self.nodes.get_mut(to).unwrap().dependencies.insert(from.to_string());
        self.nodes.get_mut(from).unwrap().dependents.insert(to.to_string());
        true
    }

    /// Would adding `from -> to` create a cycle? True iff `to` can already
    /// reach `from` via existing dependents edges.
    fn would_create_cycle(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![to.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.dependents.iter().cloned());
            }
        }
        false
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// DFS-based cycle check over the currently stored edges. Since
    /// `add_edge` already refuses cycle-forming edges, this should always
    /// return `false` for a graph built only through this API; exposed for
    /// [`validate`] to assert the invariant independently.
    pub fn has_cycle(&self) -> bool {
        #[derive(PartialEq)]
        enum Mark {
            Gray,
            Black,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            id: &'a str,
            nodes: &'a HashMap<String, GraphNode>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> bool {
            match marks.get(id) {
                Some(Mark::Gray) => return true,
                Some(Mark::Black) => return false,
                None => {}
            }
            marks.insert(id, Mark::Gray);
            if let Some(node) = nodes.get(id) {
                for dep in &node.dependents {
                    if visit(dep, nodes, marks) {
                        return true;
                    }
                }
            }
            marks.insert(id, Mark::Black);
            false
        }

        for id in self.nodes.keys() {
            if visit(id, &self.nodes, &mut marks) {
                return true;
            }
        }
        false
    }

    /// Kahn's algorithm: ready nodes (in-degree 0) are emitted in
    /// ascending-priority order, then their dependents' in-degree is
    /// decremented.
    pub fn topological_sort(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id.as_str(), n.dependencies.len()))
            .collect();

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_by_key(|id| self.nodes[*id].task.priority);

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue: VecDeque<&str> = ready.into();

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            let mut newly_ready: Vec<&str> = Vec::new();
            if let Some(node) = self.nodes.get(id) {
                for dep in &node.dependents {
                    let entry = in_degree.get_mut(dep.as_str()).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        newly_ready.push(dep.as_str());
                    }
                }
            }
            newly_ready.sort_by_key(|id| self.nodes[*id].task.priority);
            for id in newly_ready {
                queue.push_back(id);
            }
            // Re-sort the whole remaining frontier so ties across batches
            // introduced in the same pop are still broken by priority.
            let mut rest: Vec<&str> = queue.into_iter().collect();
            rest.sort_by_key(|id| self.nodes[*id].task.priority);
            queue = rest.into();
        }

        order
    }

    /// Longest path (by complexity-derived duration units) ending at each
    /// node; returns the argmax path and its total duration.
    pub fn critical_path(&self) -> CriticalPath {
        let order = self.topological_sort();
        let mut best_duration: HashMap<&str, u64> = HashMap::new();
        let mut best_pred: HashMap<&str, Option<&str>> = HashMap::new();

        for id in &order {
            let node = &self.nodes[id];
            let own = critical_path_units(node.task.complexity);
            let mut best = own;
            let mut pred: Option<&str> = None;
            for dep in &node.dependencies {
                if let Some(&d) = best_duration.get(dep.as_str()) {
                    if d + own > best {
                        best = d + own;
                        pred = Some(dep.as_str());
                    }
                }
            }
            best_duration.insert(id.as_str(), best);
            best_pred.insert(id.as_str(), pred);
        }

        let Some((&end, &duration)) = best_duration.iter().max_by_key(|(_, &d)| d) else {
            return CriticalPath {
                task_ids: Vec::new(),
                duration_units: 0,
            };
        };

        let mut path = vec![end.to_string()];
        let mut cursor = end;
        while let Some(Some(pred)) = best_pred.get(cursor) {
            path.push(pred.to_string());
            cursor = pred;
        }
        path.reverse();

        CriticalPath {
            task_ids: path,
            duration_units: duration,
        }
    }

    /// Level-set parallel groups: level = `1 + max(level of deps)`, each
    /// group sorted by ascending priority.
    pub fn parallel_groups(&self) -> Vec<Vec<String>> {
        let order = self.topological_sort();
        let mut level: HashMap<&str, usize> = HashMap::new();

        for id in &order {
            let node = &self.nodes[id];
            let l = node
                .dependencies
                .iter()
                .map(|d| level.get(d.as_str()).copied().unwrap_or(0))
                .max()
                .map(|m| m + 1)
                .unwrap_or(1);
            level.insert(id.as_str(), l);
        }

        let max_level = level.values().copied().max().unwrap_or(0);
        let mut groups = vec![Vec::new(); max_level];
        for id in &order {
            let l = level[id.as_str()];
            groups[l - 1].push(id.clone());
        }
        for group in &mut groups {
            group.sort_by_key(|id| self.nodes[id].task.priority);
        }
        groups
    }

    /// Chunk any group larger than `max_workers` into consecutive slices,
    /// preserving within-group priority order.
    pub fn optimized_groups(&self, max_workers: usize) -> Vec<Vec<String>> {
        let max_workers = max_workers.max(1);
        let mut out = Vec::new();
        for group in self.parallel_groups() {
            if group.len() <= max_workers {
                out.push(group);
            } else {
                for chunk in group.chunks(max_workers) {
                    out.push(chunk.to_vec());
                }
            }
        }
        out
    }

    pub fn dependencies_satisfied(&self, id: &str, completed: &HashSet<String>) -> bool {
        match self.nodes.get(id) {
            Some(node) => node.dependencies.iter().all(|d| completed.contains(d)),
            None => false,
        }
    }

    /// Tasks whose dependencies are all in `completed` and that are not
    /// themselves already completed.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| !completed.contains(*id))
            .filter(|id| self.dependencies_satisfied(id, completed))
            .cloned()
            .collect()
    }

    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for d in &node.dependents {
                    if out.insert(d.clone()) {
                        stack.push(d.clone());
                    }
                }
            }
        }
        out
    }

    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for d in &node.dependencies {
                    if out.insert(d.clone()) {
                        stack.push(d.clone());
                    }
                }
            }
        }
        out
    }

    pub fn analyze(&self) -> GraphAnalysis {
        let edge_count: usize = self.nodes.values().map(|n| n.dependencies.len()).sum();
        let bottlenecks = self
            .nodes
            .values()
            .filter(|n| n.dependents.len() >= BOTTLENECK_THRESHOLD)
            .map(|n| n.task.id.clone())
            .collect();
        let isolated = self
            .nodes
            .values()
            .filter(|n| n.dependencies.is_empty() && n.dependents.is_empty())
            .map(|n| n.task.id.clone())
            .collect();

        GraphAnalysis {
            node_count: self.nodes.len(),
            edge_count,
            bottlenecks,
            isolated,
        }
    }

    /// Full dependency-id validation independent of the edges actually
    /// stored (catches dangling ids and cycles even if the graph quietly
    /// dropped the offending edges already).
    pub fn validate(&self, tasks: &[Task]) -> ValidationReport {
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for task in tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    ));
                }
            }
        }

        if self.has_cycle() {
            errors.push("dependency graph contains a cycle".to_string());
        }

        if tasks.len() >= 2 {
            for task in tasks {
                let has_deps = !task.dependencies.is_empty();
                let has_dependents = tasks.iter().any(|t| t.dependencies.contains(&task.id));
                if !has_deps && !has_dependents {
                    warnings.push(format!("task '{}' is isolated", task.id));
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Complexity, TaskCategory};

    fn task(id: &str, deps: &[&str], priority: i32) -> Task {
        Task {
            id: id.to_string(),
            description: format!("task {}", id),
            category: TaskCategory::Implement,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            priority,
            complexity: Complexity::Medium,
        }
    }

    fn diamond() -> Vec<Task> {
        vec![
            task("t1", &[], 1),
            task("t2", &["t1"], 1),
            task("t3", &["t1"], 1),
            task("t4", &["t2", "t3"], 1),
        ]
    }

    #[test]
    fn builds_diamond_and_orders_topologically() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, diamond());
        assert_eq!(graph.len(), 4);

        let order = graph.topological_sort();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("t1") < pos("t2"));
        assert!(pos("t1") < pos("t3"));
        assert!(pos("t2") < pos("t4"));
        assert!(pos("t3") < pos("t4"));
    }

    #[test]
    fn diamond_parallel_groups_match_spec_scenario() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, diamond());
        let groups = graph.parallel_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec!["t1".to_string()]);
        let mut g1 = groups[1].clone();
        g1.sort();
        assert_eq!(g1, vec!["t2".to_string(), "t3".to_string()]);
        assert_eq!(groups[2], vec!["t4".to_string()]);
    }

    #[test]
    fn self_loop_is_rejected_as_cycle() {
        let events = EventBus::new();
        let mut graph = DependencyGraph::new(events);
        graph.add_node(task("t1", &[], 1));
        let added = graph.add_edge("t1", "t1");
        assert!(!added);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn cycle_forming_edge_is_dropped() {
        let events = EventBus::new();
        let mut graph = DependencyGraph::new(events);
        graph.add_node(task("t1", &[], 1));
        graph.add_node(task("t2", &[], 1));
        assert!(graph.add_edge("t1", "t2"));
        assert!(!graph.add_edge("t2", "t1"));
        assert!(!graph.has_cycle());
    }

    #[test]
    fn edge_to_missing_target_is_dropped() {
        let events = EventBus::new();
        let mut graph = DependencyGraph::new(events);
        graph.add_node(task("t1", &[], 1));
        assert!(!graph.add_edge("t1", "ghost"));
    }

    #[test]
    fn critical_path_covers_longest_chain() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, diamond());
        let cp = graph.critical_path();
        assert_eq!(cp.duration_units, 6); // 2 + 2 + 2 medium-complexity units
        assert_eq!(cp.task_ids.first().unwrap(), "t1");
        assert_eq!(cp.task_ids.last().unwrap(), "t4");
    }

    #[test]
    fn optimized_groups_chunk_oversized_level() {
        let events = EventBus::new();
        let tasks = vec![
            task("a", &[], 1),
            task("b", &[], 2),
            task("c", &[], 3),
            task("d", &[], 4),
        ];
        let graph = DependencyGraph::build_from_tasks(events, tasks);
        let groups = graph.optimized_groups(2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn ready_tasks_respects_completed_set() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, diamond());
        let mut completed = HashSet::new();
        assert_eq!(graph.ready_tasks(&completed), vec!["t1".to_string()]);
        completed.insert("t1".to_string());
        let mut ready = graph.ready_tasks(&completed);
        ready.sort();
        assert_eq!(ready, vec!["t2".to_string(), "t3".to_string()]);
    }

    #[test]
    fn descendants_and_ancestors_are_transitive() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, diamond());
        let mut desc = graph.descendants("t1").into_iter().collect::<Vec<_>>();
        desc.sort();
        assert_eq!(desc, vec!["t2".to_string(), "t3".to_string(), "t4".to_string()]);

        let mut anc = graph.ancestors("t4").into_iter().collect::<Vec<_>>();
        anc.sort();
        assert_eq!(anc, vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]);
    }

    #[test]
    fn analyze_flags_bottleneck_and_isolated() {
        let events = EventBus::new();
        let mut tasks = diamond();
        tasks.push(task("lonely", &[], 1));
        let graph = DependencyGraph::build_from_tasks(events, tasks);
        let analysis = graph.analyze();
        assert_eq!(analysis.node_count, 5);
        assert_eq!(analysis.bottlenecks, vec!["t1".to_string()]);
        assert_eq!(analysis.isolated, vec!["lonely".to_string()]);
    }

    #[test]
    fn validate_reports_dangling_dependency() {
        let events = EventBus::new();
        let tasks = vec![task("t1", &["ghost"], 1)];
        let graph = DependencyGraph::build_from_tasks(events, tasks.clone());
        let report = graph.validate(&tasks);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn empty_graph_has_no_groups_or_cycle() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, vec![]);
        assert!(graph.is_empty());
        assert!(graph.parallel_groups().is_empty());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn single_task_is_its_own_critical_path() {
        let events = EventBus::new();
        let graph = DependencyGraph::build_from_tasks(events, vec![task("solo", &[], 1)]);
        let groups = graph.parallel_groups();
        assert_eq!(groups, vec![vec!["solo".to_string()]]);
        let cp = graph.critical_path();
        assert_eq!(cp.task_ids, vec!["solo".to_string()]);
    }
}
