//! Task Decomposer (C1): objective string → task list.
//!
//! Generalizes `orchestrator_core::decompose_task`'s keyword-predicate
//! approach — a `Vec<(&[&str], TemplateId)>` table instead of an
//! if/else chain — extended to emit full [`Task`] records (id,
//! description, category, dependencies, priority, complexity) and to
//! rewrite each template's internal ids to session-scoped ones.

use std::collections::HashSet;

use crate::events::{AidosEvent, EventBus};
use crate::types::{random_id, Complexity, Task, TaskCategory};

/// Options controlling one [`decompose`] call.
#[derive(Debug, Clone)]
pub struct DecomposeOptions {
    /// When false (the default), decomposition is fully deterministic:
    /// templated by keyword match, or the generic triad fallback. A
    /// `true` value is reserved for a future API-backed decomposer and is
    /// currently treated identically to `false` — no network calls are
    /// made from this crate.
    pub use_api: bool,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self { use_api: false }
    }
}

/// Result of a decomposition call.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub tasks: Vec<Task>,
    pub reasoning: String,
    pub template: &'static str,
}

/// Result of [`validate_dependencies`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// A decomposition template: task skeletons with template-local ids that
/// get rewritten to session-scoped ids at decompose time.
struct Template {
    name: &'static str,
    keywords: &'static [&'static str],
    tasks: fn() -> Vec<TemplateTask>,
}

struct TemplateTask {
    local_id: &'static str,
    description: &'static str,
    category: TaskCategory,
    dependencies: &'static [&'static str],
    priority: i32,
    complexity: Complexity,
}

fn login_template_tasks() -> Vec<TemplateTask> {
    vec![
        TemplateTask {
            local_id: "design",
            description: "Design the login/auth flow and data model",
            category: TaskCategory::Design,
            dependencies: &[],
            priority: 1,
            complexity: Complexity::Medium,
        },
        TemplateTask {
            local_id: "implement",
            description: "Implement login/authentication endpoints",
            category: TaskCategory::Implement,
            dependencies: &["design"],
            priority: 1,
            complexity: Complexity::High,
        },
        TemplateTask {
            local_id: "test",
            description: "Write tests for the login/auth flow",
            category: TaskCategory::Test,
            dependencies: &["implement"],
            priority: 2,
            complexity: Complexity::Medium,
        },
    ]
}

fn pagination_template_tasks() -> Vec<TemplateTask> {
    vec![
        TemplateTask {
            local_id: "design",
            description: "Design the pagination scheme (cursor or offset)",
            category: TaskCategory::Design,
            dependencies: &[],
            priority: 1,
            complexity: Complexity::Low,
        },
        TemplateTask {
            local_id: "implement",
            description: "Implement paginated listing endpoints",
            category: TaskCategory::Implement,
            dependencies: &["design"],
            priority: 1,
            complexity: Complexity::Medium,
        },
        TemplateTask {
            local_id: "test",
            description: "Write tests for pagination boundary cases",
            category: TaskCategory::Test,
            dependencies: &["implement"],
            priority: 2,
            complexity: Complexity::Low,
        },
    ]
}

fn profile_template_tasks() -> Vec<TemplateTask> {
    vec![
        TemplateTask {
            local_id: "design",
            description: "Design the user profile schema",
            category: TaskCategory::Design,
            dependencies: &[],
            priority: 1,
            complexity: Complexity::Low,
        },
        TemplateTask {
            local_id: "implement",
            description: "Implement profile read/update endpoints",
            category: TaskCategory::Implement,
            dependencies: &["design"],
            priority: 1,
            complexity: Complexity::Medium,
        },
        TemplateTask {
            local_id: "docs",
            description: "Document the profile API",
            category: TaskCategory::Document,
            dependencies: &["implement"],
            priority: 3,
            complexity: Complexity::Low,
        },
        TemplateTask {
            local_id: "test",
            description: "Write tests for the profile API",
            category: TaskCategory::Test,
            dependencies: &["implement"],
            priority: 2,
            complexity: Complexity::Low,
        },
    ]
}

fn generic_triad_tasks() -> Vec<TemplateTask> {
    vec![
        TemplateTask {
            local_id: "design",
            description: "Design the approach",
            category: TaskCategory::Design,
            dependencies: &[],
            priority: 1,
            complexity: Complexity::Medium,
        },
        TemplateTask {
            local_id: "implement",
            description: "Implement the objective",
            category: TaskCategory::Implement,
            dependencies: &["design"],
            priority: 1,
            complexity: Complexity::Medium,
        },
        TemplateTask {
            local_id: "test",
            description: "Test the implementation",
            category: TaskCategory::Test,
            dependencies: &["implement"],
            priority: 2,
            complexity: Complexity::Medium,
        },
    ]
}

/// Keyword tables are data, not branches — matches English and Japanese
/// tokens the way the teacher's decomposer matches keyword sets per
/// domain template.
const TEMPLATES: &[Template] = &[
    Template {
        name: "login",
        keywords: &["login", "auth", "authentication", "ログイン", "認証"],
        tasks: login_template_tasks,
    },
    Template {
        name: "pagination",
        keywords: &["pagination", "paginate", "ページネーション", "ページ送り"],
        tasks: pagination_template_tasks,
    },
    Template {
        name: "profile",
        keywords: &["profile", "プロフィール"],
        tasks: profile_template_tasks,
    },
];

fn select_template(objective: &str) -> &'static Template {
    let lower = objective.to_lowercase();
    TEMPLATES
        .iter()
        .find(|t| t.keywords.iter().any(|k| lower.contains(&k.to_lowercase())))
        .unwrap_or(&GENERIC_TEMPLATE)
}

const GENERIC_TEMPLATE: Template = Template {
    name: "generic_triad",
    keywords: &[],
    tasks: generic_triad_tasks,
};

/// Turn an objective into a concrete task list, emitting
/// `decompose:{start,progress,complete,error}` on the given bus.
pub fn decompose(
    events: &EventBus<AidosEvent>,
    objective: &str,
    _options: &DecomposeOptions,
) -> Decomposition {
    events.publish(AidosEvent::DecomposeStart {
        objective: objective.to_string(),
    });

    if objective.trim().is_empty() {
        events.publish(AidosEvent::DecomposeError {
            reason: "objective must not be empty".to_string(),
        });
        return Decomposition {
            tasks: Vec::new(),
            reasoning: "empty objective".to_string(),
            template: "none",
        };
    }

    let template = select_template(objective);
    let template_tasks = (template.tasks)();
    events.publish(AidosEvent::DecomposeProgress { percent: 50 });

    // Rewrite template-local ids to session-scoped unique ids, keeping a
    // stable mapping so intra-template dependency references still
    // resolve after the rename.
    let mut id_map = std::collections::HashMap::new();
    for t in &template_tasks {
        id_map.insert(t.local_id, format!("task-{}", random_id(8)));
    }

    let tasks: Vec<Task> = template_tasks
        .iter()
        .map(|t| Task {
            id: id_map[t.local_id].clone(),
            description: t.description.to_string(),
            category: t.category,
            dependencies: t
                .dependencies
                .iter()
                .map(|d| id_map[d].clone())
                .collect(),
            priority: t.priority,
            complexity: t.complexity,
        })
        .collect();

    events.publish(AidosEvent::DecomposeComplete {
        task_count: tasks.len(),
    });

    Decomposition {
        reasoning: format!(
            "matched template '{}' for objective '{}'",
            template.name, objective
        ),
        template: template.name,
        tasks,
    }
}

/// Errors: dangling dependency id, or a dependency cycle found by DFS
/// over the stated `dependencies`. Warnings: a task isolated (no
/// dependencies, no dependents) when the set has ≥2 tasks.
pub fn validate_dependencies(tasks: &[Task]) -> ValidationResult {
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

    if let Some(cycle_task) = find_cycle(tasks) {
        errors.push(format!(
            "dependency cycle detected involving task '{}'",
            cycle_task
        ));
    }

    if tasks.len() >= 2 {
        for task in tasks {
            let has_dependents = tasks.iter().any(|t| t.dependencies.contains(&task.id));
            if task.dependencies.is_empty() && !has_dependents {
                warnings.push(format!("task '{}' is isolated", task.id));
            }
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn find_cycle(tasks: &[Task]) -> Option<String> {
    #[derive(PartialEq)]
    enum Mark {
        Gray,
        Black,
    }
    use std::collections::HashMap;

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(id) {
            Some(Mark::Gray) => return true,
            Some(Mark::Black) => return false,
            None => {}
        }
        marks.insert(id, Mark::Gray);
        if let Some(task) = by_id.get(id) {
            for dep in &task.dependencies {
                if by_id.contains_key(dep.as_str()) && visit(dep, by_id, marks) {
                    return true;
                }
            }
        }
        marks.insert(id, Mark::Black);
        false
    }

    for task in tasks {
        if visit(&task.id, &by_id, &mut marks) {
            return Some(task.id.clone());
        }
    }
    None
}

/// Linear order consistent with the DAG, ties broken by ascending
/// priority. Assumes `tasks` is already acyclic (call
/// [`validate_dependencies`] first).
pub fn topological_sort(tasks: &[Task]) -> Vec<String> {
    use std::collections::HashMap;

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.iter().filter(|d| by_id.contains_key(d.as_str())).count()))
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for t in tasks {
        for dep in &t.dependencies {
            if by_id.contains_key(dep.as_str()) {
                dependents.entry(dep.as_str()).or_default().push(t.id.as_str());
            }
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| by_id[id].priority);

    let mut order = Vec::with_capacity(tasks.len());
    let mut queue: std::collections::VecDeque<&str> = ready.into();

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        let mut newly_ready = Vec::new();
        if let Some(deps) = dependents.get(id) {
            for &d in deps {
                let e = in_degree.get_mut(d).unwrap();
                *e -= 1;
                if *e == 0 {
                    newly_ready.push(d);
                }
            }
        }
        let mut rest: Vec<&str> = queue.into_iter().chain(newly_ready).collect();
        rest.sort_by_key(|id| by_id[id].priority);
        queue = rest.into();
    }

    order
}

/// Level-set parallel groups: level = `1 + max(level of deps)`, each
/// group sorted by priority.
pub fn parallel_groups(tasks: &[Task]) -> Vec<Vec<String>> {
    use std::collections::HashMap;

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let order = topological_sort(tasks);
    let mut level: HashMap<&str, usize> = HashMap::new();

    for id in &order {
        let task = by_id[id.as_str()];
        let l = task
            .dependencies
            .iter()
            .filter_map(|d| level.get(d.as_str()).copied())
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
        group.sort_by_key(|id| by_id[id.as_str()].priority);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_keyword_produces_design_implement_test() {
        let events = EventBus::new();
        let result = decompose(
            &events,
            "Webアプリのログイン機能を作成する",
            &DecomposeOptions::default(),
        );
        assert!(!result.tasks.is_empty());
        assert!(result.tasks.iter().any(|t| t.category == TaskCategory::Design));
        assert!(result.tasks.iter().any(|t| t.category == TaskCategory::Implement));
        assert!(result.tasks.iter().any(|t| t.category == TaskCategory::Test));
        let validated = validate_dependencies(&result.tasks);
        assert!(validated.valid);
    }

    #[test]
    fn successive_calls_produce_unique_ids() {
        let events = EventBus::new();
        let a = decompose(&events, "add login", &DecomposeOptions::default());
        let b = decompose(&events, "add login", &DecomposeOptions::default());
        let a_ids: HashSet<&str> = a.tasks.iter().map(|t| t.id.as_str()).collect();
        let b_ids: HashSet<&str> = b.tasks.iter().map(|t| t.id.as_str()).collect();
        assert!(a_ids.is_disjoint(&b_ids));
    }

    #[test]
    fn unrecognized_objective_falls_back_to_generic_triad() {
        let events = EventBus::new();
        let result = decompose(&events, "do something unusual", &DecomposeOptions::default());
        assert_eq!(result.template, "generic_triad");
        assert_eq!(result.tasks.len(), 3);
    }

    #[test]
    fn empty_objective_is_rejected() {
        let events = EventBus::new();
        let result = decompose(&events, "   ", &DecomposeOptions::default());
        assert!(result.tasks.is_empty());
    }

    #[test]
    fn validate_flags_dangling_dependency() {
        let tasks = vec![Task {
            id: "t1".into(),
            description: "x".into(),
            category: TaskCategory::Implement,
            dependencies: vec!["ghost".into()],
            priority: 1,
            complexity: Complexity::Low,
        }];
        let result = validate_dependencies(&tasks);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn validate_flags_cycle() {
        let tasks = vec![
            Task {
                id: "a".into(),
                description: "a".into(),
                category: TaskCategory::Implement,
                dependencies: vec!["b".into()],
                priority: 1,
                complexity: Complexity::Low,
            },
            Task {
                id: "b".into(),
                description: "b".into(),
                category: TaskCategory::Implement,
                dependencies: vec!["a".into()],
                priority: 1,
                complexity: Complexity::Low,
            },
        ];
        let result = validate_dependencies(&tasks);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn validate_warns_on_isolated_task() {
        let tasks = vec![
            Task {
                id: "a".into(),
                description: "a".into(),
                category: TaskCategory::Implement,
                dependencies: vec![],
                priority: 1,
                complexity: Complexity::Low,
            },
            Task {
                id: "b".into(),
                description: "b".into(),
                category: TaskCategory::Implement,
                dependencies: vec![],
                priority: 1,
                complexity: Complexity::Low,
            },
        ];
        let result = validate_dependencies(&tasks);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn topo_sort_respects_edges_and_priority_ties() {
        let tasks = vec![
            Task {
                id: "a".into(),
                description: "a".into(),
                category: TaskCategory::Implement,
                dependencies: vec![],
                priority: 2,
                complexity: Complexity::Low,
            },
            Task {
                id: "b".into(),
                description: "b".into(),
                category: TaskCategory::Implement,
                dependencies: vec![],
                priority: 1,
                complexity: Complexity::Low,
            },
        ];
        let order = topological_sort(&tasks);
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn parallel_groups_level_is_one_plus_max_dep_level() {
        let tasks = vec![
            Task {
                id: "a".into(),
                description: "a".into(),
                category: TaskCategory::Implement,
                dependencies: vec![],
                priority: 1,
                complexity: Complexity::Low,
            },
            Task {
                id: "b".into(),
                description: "b".into(),
                category: TaskCategory::Implement,
                dependencies: vec!["a".into()],
                priority: 1,
                complexity: Complexity::Low,
            },
        ];
        let groups = parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }
}
