//! `orc project {create, list, show, set-status}` (§4.9).

use std::path::Path;

use anyhow::{Context, Result};
use orc_store::document::Store;
use orc_store::models::ProjectStatus;

pub fn create(store: &Store, name: &str, description: &str, repo_path: &Path) -> Result<()> {
    let project = orc_core::project_service::create_project(store, name, description, repo_path)
        .context("failed to create project")?;
    println!("Created project {} ({})", project.id, project.name);
    Ok(())
}

pub fn list(store: &Store) -> Result<()> {
    let projects = orc_core::project_service::list_projects(store).context("failed to list projects")?;
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }
    for p in projects {
        println!("{}  {:<10}  {:<24}  {}", p.id, p.status, p.name, p.repo_path);
    }
    Ok(())
}

pub fn show(store: &Store, project_id: &str) -> Result<()> {
    let project = orc_core::project_service::get_project(store, project_id).context("failed to read project")?;
    println!("id:          {}", project.id);
    println!("name:        {}", project.name);
    println!("description: {}", project.description);
    println!("status:      {}", project.status);
    println!("repo_path:   {}", project.repo_path);
    println!("created_at:  {}", project.created_at);
    println!("updated_at:  {}", project.updated_at);

    let doc = store.read_tasks(project_id).context("failed to read tasks")?;
    println!("tasks:       {}", doc.tasks.len());
    println!("events:      {}", doc.events.len());
    Ok(())
}

pub fn set_status(store: &Store, project_id: &str, status: &str) -> Result<()> {
    let to: ProjectStatus = status
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid status {status:?}: {e}"))?;
    let project =
        orc_core::project_service::set_project_status(store, project_id, to).context("failed to set project status")?;
    println!("Project {} is now {}", project.id, project.status);
    Ok(())
}
