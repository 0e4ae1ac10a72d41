//! `orc plan {create, show, approve, reject}` (§4.9). Two creation
//! paths share one task document: `--from-toml` materializes a whole
//! batch of tasks from a validated plan file (reusing the teacher's
//! `plan/parser.rs` + `plan/toml_format.rs` cycle-detection idiom),
//! while a bare `create` mints a single plan-mode task that follows the
//! ordinary plan_review -> approve/reject -> decompose flow (§4.2).

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use orc_core::bus::EventBus;
use orc_core::plan::{materialize_plan, parse_plan_toml};
use orc_core::router;
use orc_core::state_machine;
use orc_store::document::Store;
use orc_store::models::{Engine, Priority, RiskLevel, SlaTier, Task, TaskType};

pub fn create_from_toml(store: &Store, project_id: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read plan file {}", file.display()))?;
    let plan = parse_plan_toml(&content).map_err(|e| anyhow::anyhow!("invalid plan file: {e}"))?;

    let task_ids = store.with_tasks(project_id, |doc| Ok(materialize_plan(doc, &plan)))?;

    println!("Materialized {} task(s) from plan {:?}:", task_ids.len(), plan.plan.name);
    for id in &task_ids {
        println!("  {id}");
    }
    Ok(())
}

fn next_task_id(doc: &orc_store::models::ProjectDocument) -> String {
    let max = doc
        .tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix("task-").and_then(|n| n.parse::<u64>().ok()))
        .max()
        .unwrap_or(0);
    format!("task-{:03}", max + 1)
}

/// Mint a single plan-mode task awaiting a plan-generation run; the
/// dispatch loop will route it to `RunMode::Plan` (§4.4 `run_mode_for`).
pub fn create(store: &Store, project_id: &str, title: &str, description: &str) -> Result<()> {
    if title.trim().is_empty() {
        bail!("title must not be empty");
    }
    let task_type = router::classify(title, description);
    let task_id = store.with_tasks(project_id, |doc| {
        let id = next_task_id(doc);
        let now = Utc::now();
        doc.tasks.push(Task {
            id: id.clone(),
            parent_task_id: None,
            sub_tasks: vec![],
            depends_on: vec![],
            title: title.to_string(),
            description: description.to_string(),
            task_type,
            priority: Priority::Medium,
            sla_tier: SlaTier::Standard,
            risk_level: RiskLevel::Medium,
            acceptance_criteria: vec![],
            rollback_plan: None,
            engine: Engine::Auto,
            routed_engine: None,
            fallback_reason: None,
            status: orc_store::models::TaskStatus::Pending,
            assigned_worker: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            retry_after: None,
            last_exit_code: None,
            commit_ids: vec![],
            error_log: None,
            plan_mode: true,
            plan_content: None,
            plan_questions: vec![],
            review_status: None,
            review_engine: None,
            review_result: None,
            review_round: 0,
            _review_feedback: None,
            attempts: vec![],
            timeline: vec![],
            blocked_reason: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    })?;
    println!("Created plan task {task_id}");
    Ok(())
}

pub fn show(store: &Store, project_id: &str, task_id: &str) -> Result<()> {
    let doc = store.read_tasks(project_id)?;
    let task = doc
        .find_task(task_id)
        .ok_or_else(|| anyhow::anyhow!("task {task_id:?} not found"))?;
    println!("id:          {}", task.id);
    println!("title:       {}", task.title);
    println!("status:      {}", task.status);
    println!("plan_mode:   {}", task.plan_mode);
    println!("sub_tasks:   {}", task.sub_tasks.len());
    if let Some(content) = &task.plan_content {
        println!("--- plan_content ---\n{content}");
    }
    Ok(())
}

pub fn approve(store: &Store, project_id: &str, task_id: &str) -> Result<()> {
    let bus = EventBus::new();
    store.with_tasks(project_id, |doc| {
        state_machine::approve_plan(doc, &bus, project_id, task_id)
            .map_err(|e| orc_store::error::StoreError::InvalidInput(e.to_string()))
    })?;
    println!("Plan {task_id} approved.");
    Ok(())
}

pub fn reject(store: &Store, project_id: &str, task_id: &str, feedback: &str) -> Result<()> {
    let bus = EventBus::new();
    store.with_tasks(project_id, |doc| {
        state_machine::reject_plan(doc, &bus, project_id, task_id, feedback)
            .map_err(|e| orc_store::error::StoreError::InvalidInput(e.to_string()))
    })?;
    println!("Plan {task_id} rejected.");
    Ok(())
}
