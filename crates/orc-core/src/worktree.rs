//! Git worktree provider (§4.7): materializes an isolated checkout per
//! worker, resets it to mainline HEAD before each task, checks out the
//! task branch, and merges completed work back. Structure grounded in
//! the teacher's `WorktreeManager` (shell-outs serialized behind a
//! mutex, typed `WorktreeError`); the reset-per-task / external-provider
//! contract is grounded in `original_source/backend/worktree_provider.py`.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("repo path {0:?} is not absolute")]
    NotAbsolute(PathBuf),
    #[error("repo path {0:?} does not exist")]
    MissingDir(PathBuf),
    #[error("repo path {0:?} is not a git working tree")]
    NotAGitRepo(PathBuf),
    #[error("git command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit { command: String, code: i32, stderr: String },
    #[error("git operation timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Outcome of the success-path merge attempt (§4.5, §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The task branch had no commits mainline lacked; nothing to merge.
    Trivial,
    Merged,
    Conflict,
}

/// A materialized, ready-to-use working directory for one worker/task.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub host_path: PathBuf,
    pub branch: String,
}

/// Validate a repo path per §4.7: absolute, existing, a git working tree.
pub fn validate_repo(repo_path: &Path) -> Result<()> {
    if !repo_path.is_absolute() {
        return Err(WorktreeError::NotAbsolute(repo_path.to_path_buf()));
    }
    if !repo_path.exists() {
        return Err(WorktreeError::MissingDir(repo_path.to_path_buf()));
    }
    if !repo_path.join(".git").exists() {
        return Err(WorktreeError::NotAGitRepo(repo_path.to_path_buf()));
    }
    Ok(())
}

async fn run_git(repo: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
    let fut = Command::new("git")
        .args(args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .output();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(WorktreeError::Command {
            message: format!("git {}", args.join(" ")),
            source,
        }),
        Err(_) => Err(WorktreeError::Timeout(args.join(" "))),
    }
}

fn ensure_success(command: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(WorktreeError::Exit {
        command: command.to_string(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Pluggable provider abstraction (§4.7, §9): the kernel depends on this
/// trait, not on git directly, so an external command template can stand
/// in for the native implementation.
#[async_trait::async_trait]
pub trait WorktreeProvider: Send + Sync {
    async fn prepare(&self, repo_path: &Path, worker_id: &str, task_id: &str) -> Result<Workspace>;
    async fn finalize(&self, repo_path: &Path, task_branch: &str) -> Result<MergeOutcome>;
}

/// Native git implementation: one worktree per worker under
/// `<repo>/.agent-worktrees/<worker_id>` on branch `worker/<worker_id>`,
/// reset and re-pointed at `task/<task_id>` before each run.
pub struct NativeWorktreeProvider {
    git_lock: Arc<Mutex<()>>,
    fetch_timeout: Duration,
    checkout_timeout: Duration,
    merge_timeout: Duration,
}

impl NativeWorktreeProvider {
    pub fn new() -> Self {
        Self {
            git_lock: Arc::new(Mutex::new(())),
            fetch_timeout: Duration::from_secs(30),
            checkout_timeout: Duration::from_secs(15),
            merge_timeout: Duration::from_secs(30),
        }
    }

    fn worktree_dir(repo_path: &Path, worker_id: &str) -> PathBuf {
        repo_path.join(".agent-worktrees").join(worker_id)
    }

    async fn mainline_branch(&self, repo_path: &Path) -> Result<String> {
        let output = run_git(
            repo_path,
            &["rev-parse", "--abbrev-ref", "HEAD"],
            self.checkout_timeout,
        )
        .await?;
        ensure_success("rev-parse HEAD", &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for NativeWorktreeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WorktreeProvider for NativeWorktreeProvider {
    async fn prepare(&self, repo_path: &Path, worker_id: &str, task_id: &str) -> Result<Workspace> {
        validate_repo(repo_path)?;
        let _lock = self.git_lock.lock().await;

        let worker_branch = format!("worker/{worker_id}");
        let task_branch = format!("task/{task_id}");
        let worktree_path = Self::worktree_dir(repo_path, worker_id);

        // Best-effort fetch; failures are ignored per §4.7.
        let _ = run_git(repo_path, &["fetch", "origin"], self.fetch_timeout).await;

        if !worktree_path.exists() {
            let output = run_git(
                repo_path,
                &[
                    "worktree",
                    "add",
                    "-B",
                    &worker_branch,
                    worktree_path.to_str().unwrap_or_default(),
                    "HEAD",
                ],
                self.checkout_timeout,
            )
            .await?;
            ensure_success("worktree add", &output)?;
        }

        let mainline = self.mainline_branch(repo_path).await?;

        // Hard-reset the worktree to mainline HEAD.
        let reset = run_git(
            &worktree_path,
            &["reset", "--hard", &format!("origin/{mainline}").to_string()],
            self.checkout_timeout,
        )
        .await;
        if reset.is_err() || !reset.as_ref().map(|o| o.status.success()).unwrap_or(false) {
            // Fall back to local mainline if there's no origin remote.
            let output = run_git(&worktree_path, &["reset", "--hard", &mainline], self.checkout_timeout).await?;
            ensure_success("reset --hard", &output)?;
        }

        // Create-or-reuse the task branch.
        let branch_exists = run_git(
            &worktree_path,
            &["rev-parse", "--verify", &task_branch],
            self.checkout_timeout,
        )
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);

        let checkout_args: Vec<&str> = if branch_exists {
            vec!["checkout", &task_branch]
        } else {
            vec!["checkout", "-b", &task_branch]
        };
        let output = run_git(&worktree_path, &checkout_args, self.checkout_timeout).await?;
        ensure_success("checkout task branch", &output)?;

        Ok(Workspace {
            path: worktree_path.clone(),
            host_path: worktree_path,
            branch: task_branch,
        })
    }

    async fn finalize(&self, repo_path: &Path, task_branch: &str) -> Result<MergeOutcome> {
        validate_repo(repo_path)?;
        let _lock = self.git_lock.lock().await;

        let mainline = self.mainline_branch(repo_path).await?;
        let range = format!("{mainline}..{task_branch}");
        let log = run_git(repo_path, &["log", "--oneline", &range], self.merge_timeout).await?;
        if String::from_utf8_lossy(&log.stdout).trim().is_empty() {
            return Ok(MergeOutcome::Trivial);
        }

        let output = run_git(repo_path, &["merge", "--no-ff", task_branch], self.merge_timeout).await?;
        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stderr.contains("CONFLICT") || stdout.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = run_git(repo_path, &["merge", "--abort"], self.merge_timeout).await;
            return Ok(MergeOutcome::Conflict);
        }

        Err(WorktreeError::Exit {
            command: "merge --no-ff".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.to_string(),
        })
    }
}

/// External-command-backed provider: substitutes `{repo}`, `{path}`,
/// `{branch}` into a configured template, shell-word-splits it, and runs
/// it with the repo as the working directory. Any failure (missing
/// placeholder, binary absent, non-zero exit) falls back to
/// [`NativeWorktreeProvider`] with a warning, per §4.7 supplement.
pub struct ExternalOrNativeProvider {
    template: Option<String>,
    native: NativeWorktreeProvider,
}

impl ExternalOrNativeProvider {
    pub fn new(template: Option<String>) -> Self {
        Self {
            template,
            native: NativeWorktreeProvider::new(),
        }
    }

    fn render(template: &str, repo: &Path, path: &Path, branch: &str) -> Option<Vec<String>> {
        if !(template.contains("{repo}") && template.contains("{path}") && template.contains("{branch}")) {
            return None;
        }
        let rendered = template
            .replace("{repo}", &repo.to_string_lossy())
            .replace("{path}", &path.to_string_lossy())
            .replace("{branch}", branch);
        let words: Vec<String> = rendered.split_whitespace().map(|s| s.to_string()).collect();
        if words.is_empty() {
            return None;
        }
        Some(words)
    }

    async fn try_external(&self, repo_path: &Path, worker_id: &str, task_id: &str) -> Option<Workspace> {
        let template = self.template.as_ref()?;
        let worktree_path = NativeWorktreeProvider::worktree_dir(repo_path, worker_id);
        let task_branch = format!("task/{task_id}");
        let words = Self::render(template, repo_path, &worktree_path, &task_branch)?;

        let output = Command::new(&words[0])
            .args(&words[1..])
            .current_dir(repo_path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            tracing::warn!(worker_id, task_id, "external worktree provider failed, falling back to native");
            return None;
        }
        Some(Workspace {
            path: worktree_path.clone(),
            host_path: worktree_path,
            branch: task_branch,
        })
    }
}

#[async_trait::async_trait]
impl WorktreeProvider for ExternalOrNativeProvider {
    async fn prepare(&self, repo_path: &Path, worker_id: &str, task_id: &str) -> Result<Workspace> {
        if let Some(ws) = self.try_external(repo_path, worker_id, task_id).await {
            return Ok(ws);
        }
        self.native.prepare(repo_path, worker_id, task_id).await
    }

    async fn finalize(&self, repo_path: &Path, task_branch: &str) -> Result<MergeOutcome> {
        self.native.finalize(repo_path, task_branch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_test_utils::init_git_repo as init_repo;
    use std::process::Command as StdCommand;

    #[test]
    fn validate_rejects_relative_path() {
        let err = validate_repo(Path::new("relative/path")).unwrap_err();
        assert!(matches!(err, WorktreeError::NotAbsolute(_)));
    }

    #[test]
    fn validate_rejects_missing_dir() {
        let err = validate_repo(Path::new("/definitely/not/here/xyz")).unwrap_err();
        assert!(matches!(err, WorktreeError::MissingDir(_)));
    }

    #[tokio::test]
    async fn prepare_creates_worktree_and_task_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo_path = dir.path().canonicalize().unwrap();

        let provider = NativeWorktreeProvider::new();
        let ws = provider.prepare(&repo_path, "worker-0", "task-1").await.unwrap();
        assert!(ws.path.exists());
        assert_eq!(ws.branch, "task/task-1");
    }

    #[tokio::test]
    async fn finalize_reports_trivial_when_no_commits() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo_path = dir.path().canonicalize().unwrap();

        let provider = NativeWorktreeProvider::new();
        let ws = provider.prepare(&repo_path, "worker-0", "task-1").await.unwrap();
        let outcome = provider.finalize(&repo_path, &ws.branch).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Trivial);
    }

    #[tokio::test]
    async fn finalize_merges_new_commits() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo_path = dir.path().canonicalize().unwrap();

        let provider = NativeWorktreeProvider::new();
        let ws = provider.prepare(&repo_path, "worker-0", "task-1").await.unwrap();

        std::fs::write(ws.path.join("feature.txt"), "new stuff\n").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(&ws.path).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-q", "-m", "add feature"])
            .current_dir(&ws.path)
            .output()
            .unwrap();

        let outcome = provider.finalize(&repo_path, &ws.branch).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn external_template_render_requires_all_placeholders() {
        let rendered = ExternalOrNativeProvider::render("cmd {repo} only", Path::new("/r"), Path::new("/p"), "b");
        assert!(rendered.is_none());
    }

    #[test]
    fn external_template_render_substitutes_placeholders() {
        let rendered = ExternalOrNativeProvider::render(
            "my-provisioner --repo {repo} --path {path} --branch {branch}",
            Path::new("/r"),
            Path::new("/p"),
            "task/task-1",
        )
        .unwrap();
        assert_eq!(rendered[0], "my-provisioner");
        assert!(rendered.contains(&"/r".to_string()));
        assert!(rendered.contains(&"task/task-1".to_string()));
    }
}
