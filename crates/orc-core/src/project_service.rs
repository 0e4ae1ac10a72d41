//! Project CRUD and lifecycle transitions (§4.7a). Projects are the unit
//! of isolation for the document store (`projects/<id>/tasks.json`) and
//! for worktree checkouts; this module enforces the status state machine
//! and the invariants around activation/completion/archival.

use chrono::Utc;
use orc_store::document::Store;
use orc_store::error::{Result, StoreError};
use orc_store::models::{Project, ProjectStatus, TaskStatus};
use uuid::Uuid;

fn next_project_id() -> String {
    format!("proj-{}", Uuid::new_v4().simple())
}

/// `draft` created for a validated, non-empty, absolute repo path whose
/// name is unique among non-archived projects (§4.7a).
pub fn create_project(store: &Store, name: &str, description: &str, repo_path: &std::path::Path) -> Result<Project> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput("project name must not be empty".to_string()));
    }
    if !repo_path.is_absolute() {
        return Err(StoreError::InvalidInput(format!("repo path {repo_path:?} must be absolute")));
    }

    store.with_projects(|reg| {
        if reg
            .projects
            .iter()
            .any(|p| p.name == name && p.status != ProjectStatus::Archived)
        {
            return Err(StoreError::InvalidInput(format!("project named {name:?} already exists")));
        }
        let now = Utc::now();
        let project = Project {
            id: next_project_id(),
            name: name.to_string(),
            description: description.to_string(),
            repo_path: repo_path.to_string_lossy().to_string(),
            status: ProjectStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        reg.projects.push(project.clone());
        Ok(project)
    })
}

pub fn list_projects(store: &Store) -> Result<Vec<Project>> {
    Ok(store.read_projects()?.projects)
}

pub fn get_project(store: &Store, project_id: &str) -> Result<Project> {
    store
        .read_projects()?
        .projects
        .into_iter()
        .find(|p| p.id == project_id)
        .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))
}

fn allowed_transition(from: ProjectStatus, to: ProjectStatus) -> bool {
    use ProjectStatus::*;
    matches!(
        (from, to),
        (Draft, Active)
            | (Draft, Archived)
            | (Active, OnHold)
            | (Active, Completed)
            | (Active, Archived)
            | (OnHold, Active)
            | (OnHold, Archived)
            | (Completed, Archived)
    )
}

/// Count tasks in a status that counts as "active" for the completion
/// and archival gates (anything that isn't terminal).
fn active_task_count(doc: &orc_store::models::ProjectDocument) -> usize {
    doc.tasks
        .iter()
        .filter(|t| {
            !matches!(
                t.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            )
        })
        .count()
}

/// Apply a project status transition, enforcing §4.7a's guards:
/// activation requires at least one task; completion and archival from
/// `active`/`on_hold` require zero tasks left in a non-terminal status.
pub fn set_project_status(store: &Store, project_id: &str, to: ProjectStatus) -> Result<Project> {
    let doc = store.read_tasks(project_id)?;

    store.with_projects(|reg| {
        let project = reg
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;

        if !allowed_transition(project.status, to) {
            return Err(StoreError::InvalidInput(format!(
                "cannot transition project from {} to {}",
                project.status, to
            )));
        }

        if to == ProjectStatus::Active && project.status == ProjectStatus::Draft && doc.tasks.is_empty() {
            return Err(StoreError::InvalidInput("cannot activate a project with no tasks".to_string()));
        }

        if matches!(to, ProjectStatus::Completed | ProjectStatus::Archived) && active_task_count(&doc) > 0 {
            return Err(StoreError::InvalidInput(format!(
                "project has {} active task(s); finish or cancel them first",
                active_task_count(&doc)
            )));
        }

        project.status = to;
        project.updated_at = Utc::now();
        Ok(project.clone())
    })
}

/// Delete a project outright: only permitted from `archived`, and only
/// when no tasks remain active (redundant with the archival gate, kept
/// here as a defense against a project archived before a task was added
/// back by a concurrent writer).
pub fn delete_project(store: &Store, project_id: &str) -> Result<()> {
    let doc = store.read_tasks(project_id)?;
    if active_task_count(&doc) > 0 {
        return Err(StoreError::InvalidInput("cannot delete a project with active tasks".to_string()));
    }

    store.with_projects(|reg| {
        let project = reg
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;
        if project.status != ProjectStatus::Archived {
            return Err(StoreError::InvalidInput("only archived projects can be deleted".to_string()));
        }
        reg.projects.retain(|p| p.id != project_id);
        Ok(())
    })?;

    store.delete_project_dir(project_id)
}
