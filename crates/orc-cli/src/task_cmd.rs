//! `orc task {list, show, retry, cancel}` (§4.9): inspection and the two
//! manual recovery actions named in §7's error taxonomy (`failed ->
//! pending` bypassing the retry cap, `* -> cancelled` for anything
//! non-terminal).

use anyhow::{Context, Result};
use orc_core::state_machine;
use orc_store::document::Store;

pub fn list(store: &Store, project_id: &str) -> Result<()> {
    let doc = store.read_tasks(project_id).context("failed to read tasks")?;
    if doc.tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for t in &doc.tasks {
        println!(
            "{}  {:<20}  {:<9}  {:<8}  {}",
            t.id, t.status, t.task_type, t.priority, t.title
        );
    }
    Ok(())
}

pub fn show(store: &Store, project_id: &str, task_id: &str) -> Result<()> {
    let doc = store.read_tasks(project_id).context("failed to read tasks")?;
    let task = doc
        .find_task(task_id)
        .ok_or_else(|| anyhow::anyhow!("task {task_id:?} not found"))?;
    println!("id:            {}", task.id);
    println!("title:         {}", task.title);
    println!("status:        {}", task.status);
    println!("task_type:     {}", task.task_type);
    println!("engine:        {} (routed: {:?})", task.engine, task.routed_engine);
    println!("priority/sla:  {} / {}", task.priority, task.sla_tier);
    println!("depends_on:    {:?}", task.depends_on);
    println!("retry_count:   {}/{}", task.retry_count, task.max_retries);
    println!("commit_ids:    {:?}", task.commit_ids);
    if let Some(log) = &task.error_log {
        println!("error_log:     {log}");
    }
    println!("attempts:      {}", task.attempts.len());
    for entry in &task.timeline {
        println!("  [{}] {}", entry.at, entry.event);
    }
    Ok(())
}

pub fn retry(store: &Store, project_id: &str, task_id: &str) -> Result<()> {
    store.with_tasks(project_id, |doc| {
        state_machine::manual_retry(doc, task_id)
            .map_err(|e| orc_store::error::StoreError::InvalidInput(e.to_string()))
    })?;
    println!("Task {task_id} reset to pending.");
    Ok(())
}

pub fn cancel(store: &Store, project_id: &str, task_id: &str) -> Result<()> {
    store.with_tasks(project_id, |doc| {
        state_machine::cancel_task(doc, task_id)
            .map_err(|e| orc_store::error::StoreError::InvalidInput(e.to_string()))
    })?;
    println!("Task {task_id} cancelled.");
    Ok(())
}
