//! The kernel: wires the persistence store, worker pool, event bus,
//! worktree provider, and engine-CLI runner into the two background
//! timers (dispatch, health) plus one execution task per dispatched
//! assignment. Grounded in the teacher's `orchestrator/mod.rs` main loop
//! (semaphore-bounded spawn, `mpsc` completion channel, cancellation
//! drain) and `original_source/backend/main.py`'s four lease-checked
//! RPCs (§6 "Worker protocol").

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orc_store::document::Store;
use orc_store::models::{Engine, EventLevel, ProjectStatus};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::KernelConfig;
use crate::dispatch::{self, Assignment};
use crate::domain::WorkerPool;
use crate::health;
use crate::lease::LeaseId;
use crate::notification::NotificationSink;
use crate::runner::{self, RunMode, RunOutcome, WorkerRunner};
use crate::state_machine::{self, CompletionOutcome};
use crate::worktree::{MergeOutcome, WorktreeProvider};

/// Plan generation is read/search-only and bounded tighter than a normal
/// edit-and-commit run (§5 timeouts).
const PLAN_TASK_TIMEOUT: Duration = Duration::from_secs(45);
/// Normal/review runs may touch the tree and run tests; no explicit
/// ceiling is named in the source beyond "bounded", so this mirrors the
/// teacher's own per-task wall clock default.
const NORMAL_TASK_TIMEOUT: Duration = Duration::from_secs(1800);

/// Owns every piece of runtime state the background loops and the
/// lease-checked RPCs need. Cheap to clone (every field is an `Arc`);
/// clone it into each spawned task instead of threading references.
#[derive(Clone)]
pub struct Kernel {
    store: Arc<Store>,
    pool: Arc<AsyncMutex<WorkerPool>>,
    bus: EventBus,
    config: Arc<KernelConfig>,
    notifier: Arc<dyn NotificationSink>,
    worktree: Arc<dyn WorktreeProvider>,
    runner: Arc<WorkerRunner>,
}

impl Kernel {
    pub fn new(
        store: Store,
        pool: WorkerPool,
        config: KernelConfig,
        notifier: Arc<dyn NotificationSink>,
        worktree: Arc<dyn WorktreeProvider>,
    ) -> Self {
        let bus = EventBus::new();
        let runner = Arc::new(WorkerRunner::new(config.exec_mode, bus.clone()));
        Self {
            store: Arc::new(store),
            pool: Arc::new(AsyncMutex::new(pool)),
            bus,
            config: Arc::new(config),
            notifier,
            worktree,
            runner,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn cli_path(&self, engine: Engine) -> &str {
        match engine {
            Engine::A => &self.config.engine_a_cli,
            Engine::B | Engine::Auto => &self.config.engine_b_cli,
        }
    }

    // -----------------------------------------------------------------
    // Worker protocol (§6): plain async functions over the store and the
    // in-memory pool, lease-checked throughout. An external HTTP layer
    // can wrap these directly; the kernel's own background execution
    // task (below) also calls them, so in-process and out-of-process
    // workers share one code path.
    // -----------------------------------------------------------------

    /// `claim(task_id, worker_id) -> lease_id`. Used by the dispatch loop
    /// internally (via [`dispatch::dispatch_cycle`], which re-probes
    /// engine health itself so a total outage short-circuits the cycle)
    /// and available to an external caller that wants to claim a specific
    /// ready task onto a specific idle worker outside the normal ranking
    /// pass.
    pub async fn claim(&self, project_id: &str, task_id: &str, worker_id: &str) -> Result<LeaseId> {
        let mut pool = self.pool.lock().await;
        let worker_engine = pool
            .get(worker_id)
            .filter(|w| w.is_idle_and_available())
            .map(|w| w.engine)
            .context("worker not idle or not found")?;

        let lease = self
            .store
            .with_tasks(project_id, |doc| {
                let now = chrono::Utc::now();
                let ready = doc
                    .find_task(task_id)
                    .map(|t| state_machine::is_ready(doc, t, now))
                    .unwrap_or(false);
                if !ready {
                    return Err(orc_store::error::StoreError::InvalidInput(format!(
                        "task {task_id} is not ready to claim"
                    )));
                }
                let lease = LeaseId::generate();
                let task = doc.find_task_mut(task_id).expect("checked above");
                state_machine::claim_task(task, worker_id, worker_engine, &lease);
                Ok(lease)
            })
            .context("claim_task")?;

        pool.get_mut(worker_id)
            .expect("checked idle above")
            .claim(task_id, project_id, lease.clone());
        self.bus.task_updated(project_id, task_id);
        self.bus.worker_updated(worker_id);
        Ok(lease)
    }

    pub async fn heartbeat(&self, worker_id: &str, lease_id: &str) -> Result<()> {
        let mut pool = self.pool.lock().await;
        let worker = pool.get_mut(worker_id).context("worker not found")?;
        if worker.lease_id.as_ref().map(|l| l.as_str()) != Some(lease_id) {
            anyhow::bail!("lease mismatch for worker {worker_id}");
        }
        worker.heartbeat();
        self.bus.worker_updated(worker_id);
        Ok(())
    }

    pub async fn complete(
        &self,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
        lease_id: &str,
        commit_ids: &[String],
        stdout_tail: &str,
    ) -> Result<CompletionOutcome> {
        let outcome = self
            .store
            .with_tasks(project_id, |doc| {
                Ok(state_machine::complete_task(
                    doc,
                    &self.bus,
                    project_id,
                    task_id,
                    worker_id,
                    Some(lease_id),
                    commit_ids,
                    stdout_tail,
                    &self.config,
                ))
            })
            .context("complete_task")?;

        let mut pool = self.pool.lock().await;
        if let Some(worker) = pool.get_mut(worker_id) {
            if worker.current_task_id.as_deref() == Some(task_id) {
                worker.release(outcome.accepted);
            }
        }
        self.bus.worker_updated(worker_id);
        Ok(outcome)
    }

    pub async fn fail(
        &self,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
        lease_id: &str,
        error_log: &str,
        exit_code: Option<i32>,
    ) -> Result<CompletionOutcome> {
        let outcome = self
            .store
            .with_tasks(project_id, |doc| {
                Ok(state_machine::fail_task(
                    doc,
                    &self.bus,
                    project_id,
                    task_id,
                    worker_id,
                    Some(lease_id),
                    error_log,
                    exit_code,
                    &self.config,
                ))
            })
            .context("fail_task")?;

        let mut pool = self.pool.lock().await;
        if let Some(worker) = pool.get_mut(worker_id) {
            if worker.current_task_id.as_deref() == Some(task_id) {
                worker.release(false);
            }
        }
        self.bus.worker_updated(worker_id);
        Ok(outcome)
    }

    /// Apply a parsed review verdict once the reviewer's run has been
    /// completed and its stdout scanned for the fenced JSON block (§4.2).
    pub async fn apply_review(&self, project_id: &str, review_task_id: &str, stdout: &str) -> Result<()> {
        let parsed = runner::parse_review_block(stdout);
        self.store
            .with_tasks(project_id, |doc| {
                state_machine::apply_review_verdict(doc, &self.bus, project_id, review_task_id, parsed, &self.config);
                Ok(())
            })
            .context("apply_review_verdict")
    }

    // -----------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------

    /// Run a single dispatch cycle across every active project, spawning
    /// one execution task per [`Assignment`]. Used both by `orc dispatch
    /// --once` and by [`Self::run_forever`]'s timer.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let registry = self.store.read_projects()?;
        let active: Vec<_> = registry
            .projects
            .into_iter()
            .filter(|p| p.status == ProjectStatus::Active)
            .collect();

        let engine_health = health::probe_engines(&self.config);

        let mut total = 0;
        let mut pool = self.pool.lock().await;
        for project in &active {
            let assignments: Vec<Assignment> = self
                .store
                .with_tasks(&project.id, |doc| {
                    Ok(dispatch::dispatch_cycle(doc, &mut pool, &self.bus, &project.id, &engine_health))
                })
                .with_context(|| format!("dispatch cycle for project {}", project.id))?;

            total += assignments.len();
            for assignment in assignments {
                let kernel = self.clone();
                let project_id = project.id.clone();
                let repo_path = std::path::PathBuf::from(&project.repo_path);
                tokio::spawn(async move {
                    if let Err(e) = kernel.run_assignment(&project_id, &repo_path, assignment).await {
                        tracing::error!(project_id = %project_id, error = %e, "assignment execution failed");
                    }
                });
            }
        }
        Ok(total)
    }

    /// Execute one dispatched assignment end-to-end: prepare the
    /// worktree, run the engine CLI, finalize the merge, and report the
    /// outcome back through the lease-checked RPCs (§4.5).
    async fn run_assignment(&self, project_id: &str, repo_path: &std::path::Path, assignment: Assignment) -> Result<()> {
        let task = self
            .store
            .read_tasks(project_id)?
            .find_task(&assignment.task_id)
            .cloned()
            .context("assigned task vanished before execution")?;

        let workspace = self
            .worktree
            .prepare(repo_path, &assignment.worker_id, &assignment.task_id)
            .await
            .context("prepare worktree")?;

        let prompt = runner::build_prompt(&task, assignment.mode);
        let timeout = if assignment.mode == RunMode::Plan {
            PLAN_TASK_TIMEOUT
        } else {
            NORMAL_TASK_TIMEOUT
        };

        let outcome = self
            .runner
            .run(
                self.cli_path(assignment.engine),
                assignment.mode,
                &prompt,
                &workspace.path,
                &assignment.worker_id,
                timeout,
            )
            .await;

        match outcome {
            RunOutcome::Success { commit_ids, stdout_tail } => {
                if assignment.mode != RunMode::Plan {
                    match self.worktree.finalize(repo_path, &workspace.branch).await {
                        Ok(MergeOutcome::Conflict) => {
                            self.store.with_tasks(project_id, |doc| {
                                self.bus.emit(
                                    doc,
                                    project_id,
                                    "merge_conflict",
                                    EventLevel::Warning,
                                    Some(&assignment.task_id),
                                    Some(&assignment.worker_id),
                                    format!("merge conflict integrating {}", workspace.branch),
                                    serde_json::Value::Null,
                                );
                                Ok(())
                            })?;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(task_id = %assignment.task_id, error = %e, "worktree finalize failed"),
                    }
                }

                self.complete(
                    project_id,
                    &assignment.task_id,
                    &assignment.worker_id,
                    assignment.lease.as_str(),
                    &commit_ids,
                    &stdout_tail,
                )
                .await?;

                if assignment.mode == RunMode::Review {
                    self.apply_review(project_id, &assignment.task_id, &stdout_tail).await?;
                }
            }
            RunOutcome::Failure { stderr_tail, exit_code } => {
                if runner::is_rate_limit_signature(&stderr_tail) && self.config.max_consecutive_failures > 0 {
                    self.notifier
                        .notify(
                            "engine rate limited",
                            &format!("task {} hit a rate limit", assignment.task_id),
                            serde_json::json!({"task_id": assignment.task_id}),
                        )
                        .await;
                }
                self.fail(
                    project_id,
                    &assignment.task_id,
                    &assignment.worker_id,
                    assignment.lease.as_str(),
                    &stderr_tail,
                    exit_code,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// One health-probe tick: re-probe CLI availability, mark stalled
    /// workers errored, recover cooled-down ones. Project-agnostic except
    /// for emitting `worker_recovered` events, which it does per active
    /// project so every subscriber sees them (§4.6).
    pub async fn health_once(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;
        let recovered_before: Vec<String> = pool
            .iter()
            .filter(|w| w.status == crate::domain::WorkerStatus::Error)
            .map(|w| w.id.clone())
            .collect();

        health::health_tick(&mut pool, &self.config, self.notifier.as_ref()).await;

        let recovered: Vec<String> = recovered_before
            .into_iter()
            .filter(|id| pool.get(id).map(|w| w.status == crate::domain::WorkerStatus::Idle).unwrap_or(false))
            .collect();
        drop(pool);

        if recovered.is_empty() {
            return Ok(());
        }
        let registry = self.store.read_projects()?;
        for project in registry.projects.iter().filter(|p| p.status == ProjectStatus::Active) {
            self.store.with_tasks(&project.id, |doc| {
                health::emit_recovery_events(&self.bus, doc, &project.id, &recovered);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Run both background timers until `cancel` fires. Each tick catches
    /// and logs its own errors rather than unwinding the loop (§7
    /// propagation policy: background loops never die).
    pub async fn run_forever(self: Arc<Self>, cancel: CancellationToken) {
        let mut dispatch_ticker = tokio::time::interval(self.config.dispatch_interval());
        let mut health_ticker = tokio::time::interval(self.config.health_interval());

        loop {
            tokio::select! {
                _ = dispatch_ticker.tick() => {
                    if let Err(e) = self.dispatch_once().await {
                        tracing::error!(cycle = "dispatch", error = %e, "dispatch cycle failed");
                    }
                }
                _ = health_ticker.tick() => {
                    if let Err(e) = self.health_once().await {
                        tracing::error!(cycle = "health", error = %e, "health tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("kernel shutting down, leaving in-flight workers to drain");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecMode;
    use crate::domain::{default_worker_specs, WorkerPool};
    use crate::notification::LoggingSink;
    use crate::worktree::NativeWorktreeProvider;
    use orc_store::config::StoreConfig;
    use orc_test_utils::{init_git_repo, sample_task};

    fn test_kernel(data_dir: &std::path::Path) -> Kernel {
        let store = Store::new(StoreConfig::new(data_dir));
        let pool = WorkerPool::from_specs(&default_worker_specs(), data_dir);
        let mut config = KernelConfig::default();
        config.exec_mode = ExecMode::DryRun;
        Kernel::new(
            store,
            pool,
            config,
            Arc::new(LoggingSink),
            Arc::new(NativeWorktreeProvider::new()),
        )
    }

    #[tokio::test]
    async fn dispatch_once_assigns_and_dry_run_completes_task() {
        let data_dir = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let repo_path = repo_dir.path().canonicalize().unwrap();

        let kernel = test_kernel(data_dir.path());
        kernel
            .store
            .with_projects(|reg| {
                reg.projects.push(orc_store::models::Project {
                    id: "proj-1".to_string(),
                    name: "demo".to_string(),
                    description: String::new(),
                    repo_path: repo_path.to_string_lossy().to_string(),
                    status: ProjectStatus::Active,
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                });
                Ok(())
            })
            .unwrap();

        kernel
            .store
            .with_tasks("proj-1", |doc| {
                doc.tasks.push(sample_task("task-001"));
                Ok(())
            })
            .unwrap();

        let assigned = kernel.dispatch_once().await.unwrap();
        assert_eq!(assigned, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let doc = kernel.store.read_tasks("proj-1").unwrap();
        let task = doc.find_task("task-001").unwrap();
        // Feature tasks auto-spawn an adversarial review child on
        // completion, which flips the parent into `reviewing` rather
        // than leaving it `completed` (§4.2).
        assert_eq!(task.status, orc_store::models::TaskStatus::Reviewing);
        assert!(!task.commit_ids.is_empty());
        assert_eq!(task.sub_tasks.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_rejects_lease_mismatch() {
        let data_dir = tempfile::tempdir().unwrap();
        let kernel = test_kernel(data_dir.path());
        let err = kernel.heartbeat("worker-a0", "lease-000000000000").await.unwrap_err();
        assert!(err.to_string().contains("lease mismatch"));
    }
}
