//! Turn a validated [`PlanToml`] into persisted [`Task`]s inside a
//! project's document: mint fresh task ids, resolve `name -> id`
//! `depends_on` references, and fall back to the keyword classifier for
//! any task that left `task_type` unset.

use chrono::Utc;
use orc_store::models::{Engine, Priority, ProjectDocument, RiskLevel, SlaTier, Task, TaskType};
use std::collections::HashMap;

use super::toml_format::PlanToml;
use crate::router;

fn next_task_id(doc: &ProjectDocument, minted_so_far: usize) -> String {
    let max = doc
        .tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix("task-").and_then(|n| n.parse::<u64>().ok()))
        .max()
        .unwrap_or(0);
    format!("task-{:03}", max + 1 + minted_so_far as u64)
}

/// Append every task in `plan` to `doc`, returning the minted task ids in
/// plan-file order. Assumes `plan` already passed
/// [`super::parser::parse_plan_toml`]'s validation (unique names,
/// resolvable dependencies, acyclic graph).
pub fn materialize_plan(doc: &mut ProjectDocument, plan: &PlanToml) -> Vec<String> {
    let mut name_to_id: HashMap<String, String> = HashMap::new();
    let mut minted_ids = Vec::with_capacity(plan.tasks.len());

    for (i, task_toml) in plan.tasks.iter().enumerate() {
        let id = next_task_id(doc, i);
        name_to_id.insert(task_toml.name.clone(), id.clone());
        minted_ids.push(id);
    }

    let now = Utc::now();
    for (task_toml, id) in plan.tasks.iter().zip(minted_ids.iter()) {
        let task_type = task_toml
            .task_type
            .as_deref()
            .and_then(|s| s.parse::<TaskType>().ok())
            .unwrap_or_else(|| router::classify(&task_toml.title, &task_toml.description));

        let depends_on = task_toml
            .depends_on
            .iter()
            .filter_map(|name| name_to_id.get(name).cloned())
            .collect();

        let task = Task {
            id: id.clone(),
            parent_task_id: None,
            sub_tasks: vec![],
            depends_on,
            title: task_toml.title.clone(),
            description: task_toml.description.clone(),
            task_type,
            priority: task_toml.priority.parse::<Priority>().unwrap_or(Priority::Medium),
            sla_tier: task_toml.sla_tier.parse::<SlaTier>().unwrap_or(SlaTier::Standard),
            risk_level: task_toml.risk_level.parse::<RiskLevel>().unwrap_or(RiskLevel::Medium),
            acceptance_criteria: task_toml.acceptance_criteria.clone(),
            rollback_plan: task_toml.rollback_plan.clone(),
            engine: task_toml.engine.parse::<Engine>().unwrap_or(Engine::Auto),
            routed_engine: None,
            fallback_reason: None,
            status: orc_store::models::TaskStatus::Pending,
            assigned_worker: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: task_toml.max_retries,
            retry_after: None,
            last_exit_code: None,
            commit_ids: vec![],
            error_log: None,
            plan_mode: task_toml.plan_mode,
            plan_content: None,
            plan_questions: vec![],
            review_status: None,
            review_engine: None,
            review_result: None,
            review_round: 0,
            _review_feedback: None,
            attempts: vec![],
            timeline: vec![orc_store::models::TimelineEntry {
                at: now,
                event: "task_created".to_string(),
                detail: serde_json::json!({"plan_name": plan.plan.name}),
            }],
            blocked_reason: None,
            created_at: now,
            updated_at: now,
        };
        doc.tasks.push(task);
    }

    minted_ids
}
