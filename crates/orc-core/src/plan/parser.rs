//! Plan TOML parsing and validation: unique names, valid enum fields,
//! resolvable `depends_on` references, and an acyclic dependency graph
//! checked via Kahn's algorithm (I5). Grounded in the teacher's
//! `plan/parser.rs`, generalized from its `gate`/`scope` enums onto this
//! spec's task fields.

use std::collections::{HashMap, HashSet, VecDeque};

use orc_store::models::{Engine, Priority, RiskLevel, SlaTier, TaskType};
use thiserror::Error;

use super::toml_format::PlanToml;

#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("plan must contain at least one task")]
    NoTasks,

    #[error("duplicate task name: {0:?}")]
    DuplicateTaskName(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("invalid task_type {value:?} on task {task:?}")]
    InvalidTaskType { task: String, value: String },

    #[error("invalid priority {value:?} on task {task:?}")]
    InvalidPriority { task: String, value: String },

    #[error("invalid sla_tier {value:?} on task {task:?}")]
    InvalidSlaTier { task: String, value: String },

    #[error("invalid risk_level {value:?} on task {task:?}")]
    InvalidRiskLevel { task: String, value: String },

    #[error("invalid engine {value:?} on task {task:?}")]
    InvalidEngine { task: String, value: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

pub fn parse_plan_toml(content: &str) -> Result<PlanToml, PlanParseError> {
    let plan: PlanToml = toml::from_str(content)?;
    validate(&plan)?;
    Ok(plan)
}

fn validate(plan: &PlanToml) -> Result<(), PlanParseError> {
    if plan.tasks.is_empty() {
        return Err(PlanParseError::NoTasks);
    }

    let mut seen = HashSet::new();
    for task in &plan.tasks {
        if !seen.insert(&task.name) {
            return Err(PlanParseError::DuplicateTaskName(task.name.clone()));
        }
    }

    for task in &plan.tasks {
        if let Some(task_type) = &task.task_type {
            if task_type.parse::<TaskType>().is_err() {
                return Err(PlanParseError::InvalidTaskType {
                    task: task.name.clone(),
                    value: task_type.clone(),
                });
            }
        }
        if task.priority.parse::<Priority>().is_err() {
            return Err(PlanParseError::InvalidPriority {
                task: task.name.clone(),
                value: task.priority.clone(),
            });
        }
        if task.sla_tier.parse::<SlaTier>().is_err() {
            return Err(PlanParseError::InvalidSlaTier {
                task: task.name.clone(),
                value: task.sla_tier.clone(),
            });
        }
        if task.risk_level.parse::<RiskLevel>().is_err() {
            return Err(PlanParseError::InvalidRiskLevel {
                task: task.name.clone(),
                value: task.risk_level.clone(),
            });
        }
        if task.engine.parse::<Engine>().is_err() {
            return Err(PlanParseError::InvalidEngine {
                task: task.name.clone(),
                value: task.engine.clone(),
            });
        }
        for dep in &task.depends_on {
            if !seen.contains(dep) {
                return Err(PlanParseError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(plan)?;
    Ok(())
}

/// Kahn's algorithm: if every node can be peeled off by repeatedly
/// removing zero-in-degree nodes, the graph is a DAG.
fn check_for_cycles(plan: &PlanToml) -> Result<(), PlanParseError> {
    let names: Vec<&str> = plan.tasks.iter().map(|t| t.name.as_str()).collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in &plan.tasks {
        let task_idx = index[task.name.as_str()];
        for dep_name in &task.depends_on {
            let dep_idx = index[dep_name.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let stuck: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| names[i])
            .collect();
        return Err(PlanParseError::CycleDetected(stuck.join(", ")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(tasks_toml: &str) -> String {
        format!("[plan]\nname = \"p\"\n{tasks_toml}")
    }

    #[test]
    fn parses_valid_plan() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"

[[tasks]]
name = "b"
title = "B"
depends_on = ["a"]
"#,
        );
        let plan = parse_plan_toml(&toml_str).unwrap();
        assert_eq!(plan.tasks.len(), 2);
    }

    #[test]
    fn rejects_empty_tasks() {
        let err = parse_plan_toml("[plan]\nname = \"p\"\n").unwrap_err();
        assert!(matches!(err, PlanParseError::NoTasks));
    }

    #[test]
    fn rejects_duplicate_names() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"

[[tasks]]
name = "a"
title = "A again"
"#,
        );
        let err = parse_plan_toml(&toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::DuplicateTaskName(_)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"
depends_on = ["ghost"]
"#,
        );
        let err = parse_plan_toml(&toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_invalid_priority() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"
priority = "urgent"
"#,
        );
        let err = parse_plan_toml(&toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::InvalidPriority { .. }));
    }

    #[test]
    fn rejects_direct_cycle() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"
depends_on = ["b"]

[[tasks]]
name = "b"
title = "B"
depends_on = ["a"]
"#,
        );
        let err = parse_plan_toml(&toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::CycleDetected(_)));
    }

    #[test]
    fn rejects_transitive_cycle() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"
depends_on = ["c"]

[[tasks]]
name = "b"
title = "B"
depends_on = ["a"]

[[tasks]]
name = "c"
title = "C"
depends_on = ["b"]
"#,
        );
        let err = parse_plan_toml(&toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::CycleDetected(_)));
    }

    #[test]
    fn accepts_diamond_dag() {
        let toml_str = plan_with(
            r#"
[[tasks]]
name = "a"
title = "A"

[[tasks]]
name = "b"
title = "B"
depends_on = ["a"]

[[tasks]]
name = "c"
title = "C"
depends_on = ["a"]

[[tasks]]
name = "d"
title = "D"
depends_on = ["b", "c"]
"#,
        );
        assert!(parse_plan_toml(&toml_str).is_ok());
    }
}
