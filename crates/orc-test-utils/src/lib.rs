//! Shared fixtures for `orc` integration tests: a temp-backed store, a
//! sample project/task pair, and a scripted stand-in for an engine CLI.
//!
//! Grounded in the teacher's `gator-test-utils` (a crate every other
//! workspace member pulls in as a dev-dependency) and in
//! `harness/claude_code.rs`'s own test module, which fakes a CLI by
//! writing an executable shell script to a tempdir rather than shelling
//! out to a real agent binary. No clock abstraction exists anywhere in
//! `orc-core`/`orc-store` (every call site uses `chrono::Utc::now()`
//! directly), so unlike the teacher's Postgres container this crate has
//! no state to share across tests and offers no clock shim.

use std::path::{Path, PathBuf};
use std::process::Command;

use orc_core::domain::{default_worker_specs, WorkerPool};
use orc_store::config::StoreConfig;
use orc_store::document::Store;
use orc_store::models::{
    Engine, Priority, Project, ProjectStatus, RiskLevel, SlaTier, Task, TaskStatus, TaskType,
};

/// A `Store` rooted in a fresh temp directory. Keep the `TempDir` alive
/// for as long as the `Store` is used; it removes the directory on drop.
pub fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("create temp data root");
    let store = Store::new(StoreConfig::new(dir.path()));
    (dir, store)
}

/// A minimal active project pointing at `repo_path`.
pub fn sample_project(id: &str, repo_path: &Path) -> Project {
    let now = chrono::Utc::now();
    Project {
        id: id.to_string(),
        name: format!("project {id}"),
        description: String::new(),
        repo_path: repo_path.to_string_lossy().to_string(),
        status: ProjectStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

/// A minimal pending feature task, fields zeroed/defaulted except for
/// `id`. Callers override whatever fields their test cares about.
pub fn sample_task(id: &str) -> Task {
    let now = chrono::Utc::now();
    Task {
        id: id.to_string(),
        parent_task_id: None,
        sub_tasks: vec![],
        depends_on: vec![],
        title: "sample task".into(),
        description: "exercise the orchestrator".into(),
        task_type: TaskType::Feature,
        priority: Priority::Medium,
        sla_tier: SlaTier::Standard,
        risk_level: RiskLevel::Medium,
        acceptance_criteria: vec![],
        rollback_plan: None,
        engine: Engine::Auto,
        routed_engine: None,
        fallback_reason: None,
        status: TaskStatus::Pending,
        assigned_worker: None,
        started_at: None,
        completed_at: None,
        retry_count: 0,
        max_retries: 3,
        retry_after: None,
        last_exit_code: None,
        commit_ids: vec![],
        error_log: None,
        plan_mode: false,
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
    }
}

/// The default 4-worker (2 per engine) pool, rooted at `worktree_root`.
/// Matches what a kernel built from `orc init` defaults would load.
pub fn default_pool(worktree_root: &Path) -> WorkerPool {
    WorkerPool::from_specs(&default_worker_specs(), worktree_root)
}

/// Initialize `dir` as a git repo with one commit, for tests that exercise
/// worktree preparation/merge.
pub fn init_git_repo(dir: &Path) {
    let run = |args: &[&str]| {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git")
    };
    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "test"]);
    std::fs::write(dir.join("README.md"), "hello\n").expect("write seed file");
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "init"]);
}

/// Write an executable shell script to `dir` that echoes `stdout_lines`
/// (joined with newlines) and exits with `exit_code`. Returns the script's
/// path, usable as `KernelConfig.engine_a_cli`/`engine_b_cli` or directly as
/// a `WorkerRunner::run` `cli_path`.
pub fn fake_engine_script(dir: &Path, name: &str, stdout_lines: &[&str], exit_code: i32) -> PathBuf {
    let script_path = dir.join(name);
    let mut body = String::from("#!/bin/sh\n");
    for line in stdout_lines {
        body.push_str("echo '");
        body.push_str(&line.replace('\'', "'\\''"));
        body.push_str("'\n");
    }
    body.push_str(&format!("exit {exit_code}\n"));
    std::fs::write(&script_path, body).expect("write fake engine script");
    make_executable(&script_path);
    script_path
}

/// A fake engine CLI that never returns, for exercising timeout handling.
pub fn fake_hanging_script(dir: &Path, name: &str, sleep_secs: u64) -> PathBuf {
    let script_path = dir.join(name);
    std::fs::write(&script_path, format!("#!/bin/sh\nsleep {sleep_secs}\n")).expect("write hanging script");
    make_executable(&script_path);
    script_path
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod fake script");
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_store_reads_default_on_absent_project() {
        let (_dir, store) = temp_store();
        let doc = store.read_tasks("no-such-project").unwrap();
        assert!(doc.tasks.is_empty());
    }

    #[test]
    fn fake_engine_script_is_executable_and_echoes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_engine_script(dir.path(), "fake.sh", &["hello", "committed abc1234"], 0);
        let output = Command::new(&path).output().unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert!(stdout.contains("committed abc1234"));
    }

    #[test]
    fn default_pool_has_four_workers_two_per_engine() {
        let dir = tempfile::tempdir().unwrap();
        let pool = default_pool(dir.path());
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn fake_engine_script_can_report_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_engine_script(dir.path(), "fail.sh", &["boom"], 1);
        let output = Command::new(&path).output().unwrap();
        assert!(!output.status.success());
        assert_eq!(output.status.code(), Some(1));
    }
}
