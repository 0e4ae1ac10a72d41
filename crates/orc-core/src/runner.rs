//! Worker Runner (§4.5): spawns the engine CLI in a prepared workspace,
//! streams stdout line-by-line to a per-worker ring buffer and the event
//! bus, extracts commit hashes on clean exit, and reports a typed
//! outcome. Grounded in the teacher's `harness/claude_code.rs` subprocess
//! + streaming idiom and `original_source/backend/worker_runner.py`'s
//! prompt construction / commit-hash harvesting.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use std::sync::OnceLock;

use chrono::Utc;
use orc_store::models::{Engine, ReviewIssue, Task, TaskType};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::bus::EventBus;
use crate::config::ExecMode;

/// The orchestrator never shells out to a real agent CLI nested inside
/// another orchestrator invocation; this marker is stripped from the
/// child's environment before spawning (§6).
pub const NESTED_INVOCATION_MARKER: &str = "ORC_NESTED_RUN";

const COMMIT_HASH_CAP: usize = 20;
const LOG_BUFFER_CAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full read/write tool access, streamed JSON output.
    Normal,
    /// Read/search tools only, plain text output (§4.5).
    Plan,
    /// Like `Normal`, but the prompt demands the fenced review JSON block.
    Review,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success {
        commit_ids: Vec<String>,
        stdout_tail: String,
    },
    Failure {
        stderr_tail: String,
        exit_code: Option<i32>,
    },
}

fn commit_hash_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b[0-9a-f]{7,40}\b").expect("valid regex"))
}

/// Extract up to [`COMMIT_HASH_CAP`] hex commit hashes from stdout,
/// keeping the first occurrence of each in order of appearance (§4.5, §6).
pub fn extract_commit_hashes(stdout: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in commit_hash_regex().find_iter(stdout) {
        let hash = m.as_str().to_lowercase();
        if seen.insert(hash.clone()) {
            out.push(hash);
            if out.len() >= COMMIT_HASH_CAP {
                break;
            }
        }
    }
    out
}

/// Case-insensitive substring match against a small fixed set of
/// rate-limit markers (§4.2 auto-retry policy).
pub fn is_rate_limit_signature(error_log: &str) -> bool {
    let lower = error_log.to_lowercase();
    const MARKERS: &[&str] = &["rate_limit", "rate limit", "429", "too many requests"];
    MARKERS.iter().any(|m| lower.contains(m))
}

fn tail(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().rev().take(max_chars).collect::<Vec<_>>().into_iter().rev().collect()
}

/// Build the prompt sent to the engine CLI for a given task and mode.
/// `_review_feedback` (if present) is consumed here and should be cleared
/// by the caller on successful dispatch (§4.2).
pub fn build_prompt(task: &Task, mode: RunMode) -> String {
    match mode {
        RunMode::Plan => format!(
            "Produce an implementation plan (no code changes) for the following task. \
             Respond as a numbered or bulleted list of concrete steps.\n\n\
             Title: {title}\nDescription: {description}\nAcceptance criteria:\n{criteria}",
            title = task.title,
            description = task.description,
            criteria = task
                .acceptance_criteria
                .iter()
                .map(|c| format!("  - {c}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        RunMode::Review => format!(
            "Perform an adversarial code review of the working tree's uncommitted/committed \
             changes for task {id}: {title}\n{description}\n\n\
             Respond with a summary followed by a single fenced JSON code block of the exact form:\n\
             {{\"issues\":[{{\"severity\":\"critical|high|medium|low\",\"file\":\"...\",\"line\":0,\"description\":\"...\",\"suggestion\":\"...\"}}],\"summary\":\"...\"}}",
            id = task.id,
            title = task.title,
            description = task.description,
        ),
        RunMode::Normal => {
            let mut prompt = format!(
                "Task {id}: {title}\n\n{description}\n\nAcceptance criteria:\n{criteria}\nRollback plan: {rollback}",
                id = task.id,
                title = task.title,
                description = task.description,
                criteria = task
                    .acceptance_criteria
                    .iter()
                    .map(|c| format!("  - {c}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
                rollback = task.rollback_plan.clone().unwrap_or_else(|| "none specified".to_string()),
            );
            if let Some(feedback) = &task._review_feedback {
                prompt.push_str("\n\nAddress the following review feedback from the previous round:\n");
                prompt.push_str(feedback);
            }
            prompt
        }
    }
}

/// Spawns engine CLIs and streams their output.
pub struct WorkerRunner {
    exec_mode: ExecMode,
    bus: EventBus,
    log_buffers: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl WorkerRunner {
    pub fn new(exec_mode: ExecMode, bus: EventBus) -> Self {
        Self {
            exec_mode,
            bus,
            log_buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn recent_log(&self, worker_id: &str) -> Vec<String> {
        let buffers = self.log_buffers.lock().await;
        buffers
            .get(worker_id)
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn push_line(&self, worker_id: &str, line: String) {
        let mut buffers = self.log_buffers.lock().await;
        let buf = buffers.entry(worker_id.to_string()).or_default();
        buf.push_back(line);
        while buf.len() > LOG_BUFFER_CAP {
            buf.pop_front();
        }
    }

    /// Run the engine CLI for a task inside `workspace`, streaming stdout
    /// lines into the per-worker ring buffer and publishing each as a
    /// `worker_log` bus event.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        cli_path: &str,
        mode: RunMode,
        prompt: &str,
        workspace: &Path,
        worker_id: &str,
        timeout: Duration,
    ) -> RunOutcome {
        if self.exec_mode == ExecMode::DryRun {
            let synthetic = format!("{:x}", md5_like_hash(prompt));
            self.push_line(worker_id, format!("[dry-run] synthetic commit {synthetic}")).await;
            return RunOutcome::Success {
                commit_ids: vec![synthetic],
                stdout_tail: "[dry-run]".to_string(),
            };
        }

        let mut cmd = Command::new(cli_path);
        match mode {
            RunMode::Normal | RunMode::Review => {
                cmd.arg("-p")
                    .arg("--output-format")
                    .arg("stream-json")
                    .arg("--permission-skip")
                    .arg("--prompt")
                    .arg(prompt);
            }
            RunMode::Plan => {
                cmd.arg("-p")
                    .arg("--output-format")
                    .arg("text")
                    .arg("--allowedTools")
                    .arg("Read,Glob,Grep")
                    .arg("--prompt")
                    .arg(prompt);
            }
        }
        cmd.current_dir(workspace);
        cmd.env_remove(NESTED_INVOCATION_MARKER);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return RunOutcome::Failure {
                    stderr_tail: format!("failed to spawn {cli_path}: {e}"),
                    exit_code: None,
                };
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let mut full_stdout = String::new();
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        full_stdout.push_str(&line);
                        full_stdout.push('\n');
                        self.push_line(worker_id, line).await;
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            full_stdout
        };

        let stderr_task = async {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        };

        let wait_result = tokio::time::timeout(timeout, async {
            let (stdout_collected, stderr_collected) = tokio::join!(stdout_task, stderr_task);
            let status = child.wait().await;
            (status, stdout_collected, stderr_collected)
        })
        .await;

        let (status, stdout_collected, stderr_collected) = match wait_result {
            Ok(v) => v,
            Err(_) => {
                let _ = child.kill().await;
                return RunOutcome::Failure {
                    stderr_tail: "engine CLI timed out".to_string(),
                    exit_code: None,
                };
            }
        };

        match status {
            Ok(status) if status.success() => RunOutcome::Success {
                commit_ids: extract_commit_hashes(&stdout_collected),
                stdout_tail: tail(&stdout_collected, 4000),
            },
            Ok(status) => RunOutcome::Failure {
                stderr_tail: tail(&stderr_collected, 4000),
                exit_code: status.code(),
            },
            Err(e) => RunOutcome::Failure {
                stderr_tail: format!("failed to wait on child: {e}"),
                exit_code: None,
            },
        }
    }
}

/// Cheap deterministic fingerprint used only to mint plausible-looking
/// synthetic commit ids in dry-run mode (not a real hash function).
fn md5_like_hash(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    Utc::now().timestamp_nanos_opt().unwrap_or(0).hash(&mut hasher);
    hasher.finish()
}

/// Parse the **last** fenced JSON code block in reviewer stdout into the
/// structured review result (§4.2). Returns `None` if no block parses.
pub fn parse_review_block(stdout: &str) -> Option<(Vec<ReviewIssue>, Option<String>)> {
    let fence_re = fence_regex();
    let last_block = fence_re.captures_iter(stdout).last()?;
    let json_text = last_block.get(1)?.as_str();
    let value: serde_json::Value = serde_json::from_str(json_text).ok()?;
    let issues: Vec<ReviewIssue> = serde_json::from_value(value.get("issues")?.clone()).ok()?;
    let summary = value.get("summary").and_then(|s| s.as_str()).map(|s| s.to_string());
    Some((issues, summary))
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"))
}

/// Task types for which an adversarial review is auto-spawned on
/// completion (§4.2).
pub fn reviewable_task_type(task_type: TaskType) -> bool {
    matches!(task_type, TaskType::Feature | TaskType::Bugfix | TaskType::Refactor)
}

/// Engine that actually ran a task, as recorded on its latest attempt —
/// distinct from `routed_engine` when a fallback occurred (§4.2a, P2).
pub fn review_engine_for(parent_actual_engine: Engine) -> Engine {
    crate::router::opposite_engine(parent_actual_engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_commit_hashes_dedupes_in_order() {
        let stdout = "committed abc1234 then also abc1234 and def5678extra";
        let hashes = extract_commit_hashes(stdout);
        assert_eq!(hashes, vec!["abc1234".to_string(), "def5678extra".to_string()]);
    }

    #[test]
    fn extract_commit_hashes_caps_at_twenty() {
        let mut stdout = String::new();
        for i in 0..30 {
            stdout.push_str(&format!("{i:07x}commit "));
        }
        let hashes = extract_commit_hashes(&stdout);
        assert_eq!(hashes.len(), COMMIT_HASH_CAP);
    }

    #[test]
    fn rate_limit_signature_matches_known_markers() {
        assert!(is_rate_limit_signature("Error: rate_limit exceeded"));
        assert!(is_rate_limit_signature("HTTP 429 too many requests"));
        assert!(!is_rate_limit_signature("generic compile error"));
    }

    #[test]
    fn parse_review_block_picks_last_fence() {
        let stdout = r#"
First attempt, ignore this:
```json
{"issues": [], "summary": "stale"}
```

Final answer:
```json
{"issues": [{"severity": "high", "file": "a.rs", "line": 10, "description": "bug", "suggestion": "fix it"}], "summary": "one issue"}
```
"#;
        let (issues, summary) = parse_review_block(stdout).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, "high");
        assert_eq!(summary.as_deref(), Some("one issue"));
    }

    #[test]
    fn parse_review_block_returns_none_without_fence() {
        assert!(parse_review_block("no fenced block here").is_none());
    }

    #[tokio::test]
    async fn dry_run_returns_synthetic_success() {
        let runner = WorkerRunner::new(ExecMode::DryRun, EventBus::new());
        let outcome = runner
            .run("A-cli", RunMode::Normal, "do the thing", Path::new("/tmp"), "worker-0", Duration::from_secs(5))
            .await;
        match outcome {
            RunOutcome::Success { commit_ids, .. } => assert_eq!(commit_ids.len(), 1),
            RunOutcome::Failure { .. } => panic!("dry-run should succeed"),
        }
    }

    #[tokio::test]
    async fn real_mode_reports_spawn_failure_for_missing_binary() {
        let runner = WorkerRunner::new(ExecMode::Real, EventBus::new());
        let outcome = runner
            .run(
                "/definitely/not/a/real/binary-xyz",
                RunMode::Normal,
                "prompt",
                Path::new("/tmp"),
                "worker-0",
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(outcome, RunOutcome::Failure { exit_code: None, .. }));
    }
}
