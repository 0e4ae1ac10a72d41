//! Runtime-only state: the worker pool and engine health. Neither is part
//! of the persisted task document (§3, §5) — it lives in process memory,
//! is mutated in place by the dispatch and health loops, and is rebuilt
//! from configuration on every process start.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use orc_store::models::Engine;
use serde::{Deserialize, Serialize};

use crate::lease::LeaseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub last_heartbeat: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub avg_task_duration_ms: u64,
}

impl WorkerHealth {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat: now,
            consecutive_failures: 0,
            avg_task_duration_ms: 0,
        }
    }

    /// Exponential moving average update on release (§4.5 supplement):
    /// the first sample seeds the average outright, subsequent samples
    /// blend 80% history / 20% latest.
    pub fn record_duration(&mut self, sample_ms: u64) {
        self.avg_task_duration_ms = if self.avg_task_duration_ms == 0 {
            sample_ms
        } else {
            ((self.avg_task_duration_ms as f64) * 0.8 + (sample_ms as f64) * 0.2) as u64
        };
    }
}

/// One member of the fixed worker pool loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub engine: Engine,
    pub port: u16,
    pub capabilities: Vec<String>,
    pub worktree_path: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub current_project_id: Option<String>,
    pub lease_id: Option<LeaseId>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub total_tasks_completed: u64,
    pub cli_available: bool,
    pub health: WorkerHealth,
    /// Set when the worker transitions to `error`; used to gate cooldown
    /// recovery (§4.6 step 3).
    pub error_at: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(id: impl Into<String>, engine: Engine, port: u16, capabilities: Vec<String>, worktree_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            engine,
            port,
            capabilities,
            worktree_path: worktree_path.into(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            current_project_id: None,
            lease_id: None,
            pid: None,
            started_at: None,
            last_seen_at: now,
            total_tasks_completed: 0,
            cli_available: true,
            health: WorkerHealth::new(now),
            error_at: None,
        }
    }

    pub fn is_idle_and_available(&self) -> bool {
        self.status == WorkerStatus::Idle && self.cli_available
    }

    pub fn claim(&mut self, task_id: &str, project_id: &str, lease: LeaseId) {
        self.status = WorkerStatus::Busy;
        self.current_task_id = Some(task_id.to_string());
        self.current_project_id = Some(project_id.to_string());
        self.lease_id = Some(lease);
        self.started_at = Some(Utc::now());
        self.last_seen_at = Utc::now();
    }

    /// Release the worker back to `idle`, updating health bookkeeping.
    /// `success` resets `consecutive_failures`; failure increments it.
    pub fn release(&mut self, success: bool) {
        let duration_ms = self
            .started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        if success {
            self.total_tasks_completed += 1;
            self.health.consecutive_failures = 0;
            self.health.record_duration(duration_ms);
        } else {
            self.health.consecutive_failures += 1;
        }
        self.status = WorkerStatus::Idle;
        self.current_task_id = None;
        self.current_project_id = None;
        self.lease_id = None;
        self.pid = None;
        self.started_at = None;
        self.health.last_heartbeat = Utc::now();
    }

    pub fn heartbeat(&mut self) {
        self.health.last_heartbeat = Utc::now();
        self.last_seen_at = Utc::now();
    }

    /// Transition to `error`: clear task binding and lease, stamp
    /// `error_at`, bump the failure counter (§4.6 step 2).
    pub fn mark_errored(&mut self) {
        self.status = WorkerStatus::Error;
        self.current_task_id = None;
        self.current_project_id = None;
        self.lease_id = None;
        self.health.consecutive_failures += 1;
        self.error_at = Some(Utc::now());
    }

    pub fn recover(&mut self) {
        self.status = WorkerStatus::Idle;
        self.error_at = None;
        self.health.last_heartbeat = Utc::now();
    }
}

/// Configuration-loaded shape for a single worker; deserialized from the
/// orchestrator's config file or init defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub engine: Engine,
    pub port: u16,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct WorkerSpecsFile {
    #[serde(default)]
    worker: Vec<WorkerSpec>,
}

/// Four workers split evenly across both engines — the pool `orc init`
/// writes out when no `workers.toml` is supplied.
pub fn default_worker_specs() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec { id: "worker-a0".to_string(), engine: Engine::A, port: 5100, capabilities: vec![] },
        WorkerSpec { id: "worker-a1".to_string(), engine: Engine::A, port: 5101, capabilities: vec![] },
        WorkerSpec { id: "worker-b0".to_string(), engine: Engine::B, port: 5200, capabilities: vec![] },
        WorkerSpec { id: "worker-b1".to_string(), engine: Engine::B, port: 5201, capabilities: vec![] },
    ]
}

/// Load the fixed worker pool from `<config dir>/workers.toml`, falling
/// back to [`default_worker_specs`] when absent (§3 "fixed pool loaded
/// from configuration").
pub fn load_worker_specs(path: &std::path::Path) -> anyhow::Result<Vec<WorkerSpec>> {
    if !path.exists() {
        return Ok(default_worker_specs());
    }
    let text = std::fs::read_to_string(path)?;
    let parsed: WorkerSpecsFile = toml::from_str(&text)?;
    if parsed.worker.is_empty() {
        Ok(default_worker_specs())
    } else {
        Ok(parsed.worker)
    }
}

/// In-memory worker pool. Owned exclusively by the scheduling kernel
/// (dispatch loop, health probe, completion callbacks) and never leaked
/// into request handlers except via method calls (§9 design notes).
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<String, Worker>,
}

impl WorkerPool {
    pub fn from_specs(specs: &[WorkerSpec], worktree_root: &std::path::Path) -> Self {
        let mut workers = HashMap::new();
        for spec in specs {
            let worktree_path = worktree_root.join(&spec.id).to_string_lossy().to_string();
            workers.insert(
                spec.id.clone(),
                Worker::new(spec.id.clone(), spec.engine, spec.port, spec.capabilities.clone(), worktree_path),
            );
        }
        Self { workers }
    }

    pub fn get(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.values_mut()
    }

    /// Among idle, available workers of `engine`, prefer the one with the
    /// fewest consecutive failures (mirrors the source's
    /// `get_idle_worker`), tie-broken by id for determinism.
    pub fn find_idle(&self, engine: Engine) -> Option<&Worker> {
        self.workers
            .values()
            .filter(|w| w.engine == engine && w.is_idle_and_available())
            .min_by(|a, b| {
                a.health
                    .consecutive_failures
                    .cmp(&b.health.consecutive_failures)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    pub fn any_idle_available(&self) -> bool {
        self.workers.values().any(|w| w.is_idle_and_available())
    }

    pub fn engine_has_idle(&self, engine: Engine) -> bool {
        self.workers
            .values()
            .any(|w| w.engine == engine && w.is_idle_and_available())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
