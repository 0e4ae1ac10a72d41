//! Read-modify-write access to the JSON document store.
//!
//! Every public method here follows the same shape: acquire the exclusive
//! lock on the file's `.lock` sibling, read and shape-normalize the current
//! contents, hand a mutable view to the caller (or apply a pure mutation),
//! recompute derived counters, write the whole document back, and release
//! the lock. There is no in-memory cache kept across calls: the file on
//! disk is the only source of truth, matching the `filelock.FileLock`
//! discipline the source tooling relies on.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::lockfile::LockFile;
use crate::models::{ProjectDocument, ProjectsRegistry};

/// Handle onto the on-disk store. Cheap to construct; holds no file
/// descriptors between calls.
#[derive(Debug, Clone)]
pub struct Store {
    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn ensure_data_root(&self) -> Result<()> {
        if self.config.data_root.is_file() {
            return Err(StoreError::NotADirectory(self.config.data_root.clone()));
        }
        if !self.config.data_root.exists() {
            fs::create_dir_all(&self.config.data_root).map_err(|source| {
                StoreError::CreateDataRoot {
                    path: self.config.data_root.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    // -- projects.json --------------------------------------------------

    /// Read the project registry, creating an empty one on first use.
    pub fn read_projects(&self) -> Result<ProjectsRegistry> {
        self.ensure_data_root()?;
        let path = self.config.registry_path();
        let mut lock = LockFile::open(self.config.registry_lock_path())?;
        let _guard = lock.lock()?;
        read_json_or_default(&path)
    }

    pub fn write_projects(&self, registry: &ProjectsRegistry) -> Result<()> {
        self.ensure_data_root()?;
        let path = self.config.registry_path();
        let mut lock = LockFile::open(self.config.registry_lock_path())?;
        let _guard = lock.lock()?;
        write_json(&path, registry)
    }

    /// Read-modify-write the registry under a single lock acquisition.
    pub fn with_projects<T>(&self, f: impl FnOnce(&mut ProjectsRegistry) -> Result<T>) -> Result<T> {
        self.ensure_data_root()?;
        let path = self.config.registry_path();
        let mut lock = LockFile::open(self.config.registry_lock_path())?;
        let _guard = lock.lock()?;
        let mut registry: ProjectsRegistry = read_json_or_default(&path)?;
        let out = f(&mut registry)?;
        write_json(&path, &registry)?;
        Ok(out)
    }

    // -- projects/<id>/tasks.json ----------------------------------------

    fn ensure_project_dir(&self, project_id: &str) -> Result<()> {
        let dir = self.config.project_dir(project_id);
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDataRoot {
                path: dir,
                source,
            })?;
        }
        Ok(())
    }

    /// Read a project's task document, shape-normalizing it (filling
    /// defaults for fields absent due to schema drift) and creating an
    /// empty document on first use.
    pub fn read_tasks(&self, project_id: &str) -> Result<ProjectDocument> {
        self.ensure_project_dir(project_id)?;
        let path = self.config.project_doc_path(project_id);
        let mut lock = LockFile::open(self.config.project_lock_path(project_id))?;
        let _guard = lock.lock()?;
        read_json_or_default(&path)
    }

    pub fn write_tasks(&self, project_id: &str, mut doc: ProjectDocument) -> Result<()> {
        self.ensure_project_dir(project_id)?;
        let path = self.config.project_doc_path(project_id);
        let mut lock = LockFile::open(self.config.project_lock_path(project_id))?;
        let _guard = lock.lock()?;
        doc.recompute_meta();
        write_json(&path, &doc)
    }

    /// Read-modify-write a project's task document under a single lock
    /// acquisition. `f` may mutate the document freely; `meta` is
    /// recomputed and the event ring is capped before the write.
    pub fn with_tasks<T>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut ProjectDocument) -> Result<T>,
    ) -> Result<T> {
        self.ensure_project_dir(project_id)?;
        let path = self.config.project_doc_path(project_id);
        let mut lock = LockFile::open(self.config.project_lock_path(project_id))?;
        let _guard = lock.lock()?;
        let mut doc: ProjectDocument = read_json_or_default(&path)?;
        let out = f(&mut doc)?;
        doc.recompute_meta();
        write_json(&path, &doc)?;
        Ok(out)
    }

    /// Delete a project's document directory entirely. Caller is
    /// responsible for having verified there are no active tasks first.
    pub fn delete_project_dir(&self, project_id: &str) -> Result<()> {
        let dir = self.config.project_dir(project_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|source| StoreError::Io {
                path: dir,
                source,
            })?;
        }
        Ok(())
    }

    /// One-time migration of legacy `<data_root>/tasks.json` (the
    /// single-project predecessor layout) into `projects/proj-default/`,
    /// seeding a registry entry for it. No-op if the legacy file is
    /// absent or the default project already exists.
    pub fn migrate_legacy_layout(&self, default_repo_path: &str) -> Result<bool> {
        self.ensure_data_root()?;
        let legacy_path = self.config.data_root.join("tasks.json");
        if !legacy_path.exists() {
            return Ok(false);
        }

        let already_migrated = self.with_projects(|reg| {
            Ok(reg.projects.iter().any(|p| p.id == "proj-default"))
        })?;
        if already_migrated {
            return Ok(false);
        }

        let mut file = fs::File::open(&legacy_path).map_err(|source| StoreError::Io {
            path: legacy_path.clone(),
            source,
        })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|source| StoreError::Io {
                path: legacy_path.clone(),
                source,
            })?;
        let doc: ProjectDocument = if contents.trim().is_empty() {
            ProjectDocument::default()
        } else {
            serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                path: legacy_path.clone(),
                source,
            })?
        };

        self.write_tasks("proj-default", doc)?;

        let now = chrono::Utc::now();
        self.with_projects(|reg| {
            reg.projects.push(crate::models::Project {
                id: "proj-default".to_string(),
                name: "default".to_string(),
                description: "Migrated from legacy single-project layout".to_string(),
                repo_path: default_repo_path.to_string(),
                status: crate::models::ProjectStatus::Active,
                created_at: now,
                updated_at: now,
            });
            Ok(())
        })?;

        Ok(true)
    }
}

fn read_json_or_default<T>(path: &std::path::Path) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let mut file = fs::File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let pretty = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.seek(SeekFrom::Start(0))
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(pretty.as_bytes())
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(b"\n").map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
