//! Resolution of the on-disk data root: the directory holding
//! `projects.json` and one `projects/<id>/tasks.json` per project.

use std::path::PathBuf;

/// Where persisted state lives on disk.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_root: PathBuf,
}

impl StoreConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// `$ORC_DATA_DIR`, falling back to the XDG data directory
    /// (`~/.local/share/orc` on Linux) when unset.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("ORC_DATA_DIR") {
            return Self::new(dir);
        }
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("orc"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root.join("projects.json")
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.data_root.join("projects.json.lock")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.data_root.join("projects").join(project_id)
    }

    pub fn project_doc_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("tasks.json")
    }

    pub fn project_lock_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("tasks.json.lock")
    }
}
