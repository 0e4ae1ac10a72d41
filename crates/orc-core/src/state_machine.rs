//! Task State Machine (§4.2, C7): status transitions, dependency gating,
//! plan approval and decomposition, the adversarial review fix-verify
//! loop, and auto-retry with rate-limit-aware backoff. Grounded in
//! `original_source/backend/main.py` (`_complete_task_internal`,
//! `_fail_task_internal`, `maybe_trigger_adversarial_review`,
//! `_decompose_from_plan`) and `review_manager.py`.

use chrono::Utc;
use orc_store::models::{
    Attempt, Engine, Event, EventLevel, ProjectDocument, ReviewResult, ReviewStatus, Task,
    TaskStatus, TaskType, TimelineEntry,
};

use crate::bus::EventBus;
use crate::config::KernelConfig;
use crate::lease::LeaseId;
use crate::router;
use crate::runner::{is_rate_limit_signature, reviewable_task_type, review_engine_for};

fn now_json(detail: serde_json::Value) -> TimelineEntry {
    TimelineEntry {
        at: Utc::now(),
        event: String::new(),
        detail,
    }
}

fn push_timeline(task: &mut Task, event: &str, detail: serde_json::Value) {
    let mut entry = now_json(detail);
    entry.event = event.to_string();
    task.timeline.push(entry);
}

/// A non-review task is ready when every dependency is `completed`; a
/// review task is ready as soon as each dependency is `reviewing` or
/// `completed` (§4.2 dependency gating).
pub fn dependencies_satisfied(doc: &ProjectDocument, task: &Task) -> bool {
    task.depends_on.iter().all(|dep_id| {
        let Some(dep) = doc.find_task(dep_id) else {
            return false;
        };
        if task.task_type == TaskType::Review {
            matches!(dep.status, TaskStatus::Reviewing | TaskStatus::Completed)
        } else {
            dep.status == TaskStatus::Completed
        }
    })
}

pub fn is_ready(doc: &ProjectDocument, task: &Task, now: chrono::DateTime<Utc>) -> bool {
    task.status == TaskStatus::Pending
        && task.assigned_worker.is_none()
        && task.retry_after.map(|t| t <= now).unwrap_or(true)
        && dependencies_satisfied(doc, task)
}

// ---------------------------------------------------------------------------
// Dispatch-time mutation: lease issuance
// ---------------------------------------------------------------------------

/// Move a task from `pending` to `in_progress`, binding it to a worker
/// under a fresh lease. Consumes `_review_feedback` into the attempt's
/// prompt context (the caller builds the actual prompt text separately);
/// clears it here since it is folded into this attempt.
pub fn claim_task(
    task: &mut Task,
    worker_id: &str,
    engine_actually_used: Engine,
    lease: &LeaseId,
) -> u32 {
    task.status = TaskStatus::InProgress;
    task.assigned_worker = Some(worker_id.to_string());
    task.started_at = Some(Utc::now());
    task.updated_at = Utc::now();

    let attempt_number = task.attempts.len() as u32 + 1;
    task.attempts.push(Attempt {
        attempt: attempt_number,
        worker_id: worker_id.to_string(),
        engine: engine_actually_used,
        lease_id: lease.as_str().to_string(),
        started_at: Utc::now(),
        completed_at: None,
        status: None,
        exit_code: None,
        error_tail: None,
        commit_ids: vec![],
    });
    push_timeline(task, "task_claimed", serde_json::json!({"worker_id": worker_id, "attempt": attempt_number}));
    attempt_number
}

fn lease_matches(task: &Task, worker_id: &str, lease_id: Option<&str>) -> bool {
    if task.assigned_worker.as_deref() != Some(worker_id) {
        return false;
    }
    match (lease_id, task.attempts.last()) {
        (Some(submitted), Some(attempt)) => attempt.lease_id == submitted,
        (None, _) => true,
        (Some(_), None) => false,
    }
}

fn current_attempt_mut(task: &mut Task) -> Option<&mut Attempt> {
    task.attempts.last_mut()
}

fn dedup_commit_ids(existing: &mut Vec<String>, new_ids: &[String]) {
    for id in new_ids {
        if !existing.contains(id) {
            existing.push(id.clone());
        }
    }
}

/// Outcome of a completion/failure callback, used by the caller to decide
/// whether to release the worker in the in-memory pool and whether a
/// review child was spawned that also needs dispatching.
pub struct CompletionOutcome {
    pub accepted: bool,
    pub spawned_review_task_id: Option<String>,
}

/// `in_progress -> completed` (§4.2) on worker completion with a matching
/// lease. Auto-spawns an adversarial review child for reviewable task
/// types while `review_round < MAX_REVIEW_ROUNDS`. A mismatched lease (or
/// worker id) is a silent no-op (§5 lease discipline, P6).
pub fn complete_task(
    doc: &mut ProjectDocument,
    bus: &EventBus,
    project_id: &str,
    task_id: &str,
    worker_id: &str,
    lease_id: Option<&str>,
    commit_ids: &[String],
    stdout_tail: &str,
    config: &KernelConfig,
) -> CompletionOutcome {
    let Some(task) = doc.find_task_mut(task_id) else {
        return CompletionOutcome { accepted: false, spawned_review_task_id: None };
    };
    if task.status != TaskStatus::InProgress || !lease_matches(task, worker_id, lease_id) {
        return CompletionOutcome { accepted: false, spawned_review_task_id: None };
    }

    dedup_commit_ids(&mut task.commit_ids, commit_ids);
    task.error_log = None;
    task.last_exit_code = Some(0);
    task.completed_at = Some(Utc::now());
    task.updated_at = Utc::now();
    task._review_feedback = None;

    if let Some(attempt) = current_attempt_mut(task) {
        attempt.completed_at = Some(Utc::now());
        attempt.status = Some(TaskStatus::Completed);
        attempt.exit_code = Some(0);
        dedup_commit_ids(&mut attempt.commit_ids, commit_ids);
    }

    if task.plan_mode && task.plan_content.is_none() {
        // The worker ran in plan mode: stdout *is* the plan, not a diff.
        // Route straight to human review instead of the review-loop path.
        task.plan_content = Some(stdout_tail.to_string());
        task.status = TaskStatus::PlanReview;
        push_timeline(task, "plan_generated", serde_json::Value::Null);
        bus.emit(
            doc,
            project_id,
            "plan_generated",
            EventLevel::Info,
            Some(task_id),
            Some(worker_id),
            format!("plan for {task_id} ready for review"),
            serde_json::Value::Null,
        );
        bus.task_updated(project_id, task_id);
        return CompletionOutcome { accepted: true, spawned_review_task_id: None };
    }

    let task_type = task.task_type;
    let review_round = task.review_round;
    let actual_engine = task
        .attempts
        .last()
        .map(|a| a.engine)
        .unwrap_or(Engine::A);
    let is_review_child = task_type == TaskType::Review;

    task.status = TaskStatus::Completed;
    push_timeline(task, "task_completed", serde_json::json!({"worker_id": worker_id}));

    let event = bus.emit(
        doc,
        project_id,
        "task_completed",
        EventLevel::Info,
        Some(task_id),
        Some(worker_id),
        format!("task {task_id} completed"),
        serde_json::json!({"commit_ids": commit_ids, "stdout_tail": stdout_tail}),
    );
    let _ = event;
    bus.task_updated(project_id, task_id);

    let mut spawned_review_task_id = None;

    if is_review_child {
        // A review child's "completion" means its reviewer ran; the
        // verdict application happens in apply_review_verdict, invoked
        // by the caller once stdout has been parsed.
    } else if reviewable_task_type(task_type) && review_round < config.max_review_rounds {
        let review_id = spawn_review_child(doc, bus, project_id, task_id, actual_engine);
        spawned_review_task_id = Some(review_id);
    }

    roll_up_parents(doc, bus, project_id);

    CompletionOutcome {
        accepted: true,
        spawned_review_task_id,
    }
}

fn next_task_id(doc: &ProjectDocument) -> String {
    let max = doc
        .tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix("task-").and_then(|n| n.parse::<u64>().ok()))
        .max()
        .unwrap_or(0);
    format!("task-{:03}", max + 1)
}

/// Spawn an adversarial review child routed to the opposite engine of
/// the parent's actual execution engine (I4, §4.2 transition into
/// `reviewing`).
fn spawn_review_child(
    doc: &mut ProjectDocument,
    bus: &EventBus,
    project_id: &str,
    parent_id: &str,
    parent_engine: Engine,
) -> String {
    let now = Utc::now();
    let review_engine = review_engine_for(parent_engine);
    let child_id = next_task_id(doc);

    let parent_title = doc
        .find_task(parent_id)
        .map(|t| t.title.clone())
        .unwrap_or_default();

    let child = Task {
        id: child_id.clone(),
        parent_task_id: Some(parent_id.to_string()),
        sub_tasks: vec![],
        depends_on: vec![parent_id.to_string()],
        title: format!("Review: {parent_title}"),
        description: format!("Adversarial review of task {parent_id}"),
        task_type: TaskType::Review,
        priority: orc_store::models::Priority::High,
        sla_tier: orc_store::models::SlaTier::Expedite,
        risk_level: orc_store::models::RiskLevel::Medium,
        acceptance_criteria: vec![],
        rollback_plan: None,
        engine: Engine::Auto,
        routed_engine: Some(review_engine),
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
        review_status: Some(ReviewStatus::Pending),
        review_engine: Some(review_engine),
        review_result: None,
        review_round: 0,
        _review_feedback: None,
        attempts: vec![],
        timeline: vec![now_json(serde_json::json!({"parent_id": parent_id}))],
        blocked_reason: None,
        created_at: now,
        updated_at: now,
    };
    if let Some(entry) = child.timeline.last() {
        let _ = entry;
    }
    doc.tasks.push(child);
    if let Some(t) = doc.tasks.last_mut() {
        if let Some(entry) = t.timeline.last_mut() {
            entry.event = "task_created".to_string();
        }
    }

    if let Some(parent) = doc.find_task_mut(parent_id) {
        parent.sub_tasks.push(child_id.clone());
        parent.review_status = Some(ReviewStatus::Pending);
        parent.status = TaskStatus::Reviewing;
    }

    bus.emit(
        doc,
        project_id,
        "review_requested",
        EventLevel::Info,
        Some(&child_id),
        None,
        format!("adversarial review {child_id} requested for {parent_id}"),
        serde_json::json!({"parent_id": parent_id, "routed_engine": review_engine.to_string()}),
    );

    child_id
}

/// `in_progress -> pending` (auto-retry) or `-> failed` on the cap
/// (§4.2 auto-retry policy).
pub fn fail_task(
    doc: &mut ProjectDocument,
    bus: &EventBus,
    project_id: &str,
    task_id: &str,
    worker_id: &str,
    lease_id: Option<&str>,
    error_log: &str,
    exit_code: Option<i32>,
    config: &KernelConfig,
) -> CompletionOutcome {
    let Some(task) = doc.find_task_mut(task_id) else {
        return CompletionOutcome { accepted: false, spawned_review_task_id: None };
    };
    if task.status != TaskStatus::InProgress || !lease_matches(task, worker_id, lease_id) {
        return CompletionOutcome { accepted: false, spawned_review_task_id: None };
    }

    task.error_log = Some(error_log.to_string());
    task.last_exit_code = exit_code;
    task.updated_at = Utc::now();

    if let Some(attempt) = current_attempt_mut(task) {
        attempt.completed_at = Some(Utc::now());
        attempt.status = Some(TaskStatus::Failed);
        attempt.exit_code = exit_code;
        attempt.error_tail = Some(error_log.to_string());
    }

    let retry_count = task.retry_count + 1;
    task.retry_count = retry_count.min(task.max_retries);

    if retry_count < task.max_retries {
        let delay = if is_rate_limit_signature(error_log) {
            config.rate_limit_retry_delay()
        } else {
            config.auto_retry_delay()
        };
        let retry_after = Utc::now() + delay;
        task.status = TaskStatus::Pending;
        task.assigned_worker = None;
        task.started_at = None;
        task.retry_after = Some(retry_after);
        push_timeline(
            task,
            "auto_retry_scheduled",
            serde_json::json!({"worker_id": worker_id, "exit_code": exit_code, "retry_count": retry_count, "retry_after": retry_after}),
        );
        bus.emit(
            doc,
            project_id,
            "auto_retry_scheduled",
            EventLevel::Warning,
            Some(task_id),
            Some(worker_id),
            format!("task {task_id} auto-retry #{retry_count} scheduled"),
            serde_json::json!({"exit_code": exit_code, "retry_count": retry_count, "retry_after": retry_after}),
        );
    } else {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        push_timeline(task, "task_failed", serde_json::json!({"worker_id": worker_id, "exit_code": exit_code}));
        bus.emit(
            doc,
            project_id,
            "task_failed",
            EventLevel::Error,
            Some(task_id),
            Some(worker_id),
            format!("task {task_id} failed after {retry_count} attempts"),
            serde_json::json!({"exit_code": exit_code}),
        );
    }

    bus.task_updated(project_id, task_id);

    CompletionOutcome {
        accepted: true,
        spawned_review_task_id: None,
    }
}

/// `failed -> pending` manual retry (§4.2): resets `retry_count` to 0,
/// bypassing the auto-retry cap. Operator override, not lease-checked.
pub fn manual_retry(doc: &mut ProjectDocument, task_id: &str) -> Result<(), &'static str> {
    let Some(task) = doc.find_task_mut(task_id) else {
        return Err("task not found");
    };
    if task.status != TaskStatus::Failed {
        return Err("task is not in failed status");
    }
    task.status = TaskStatus::Pending;
    task.retry_count = 0;
    task.retry_after = None;
    task.assigned_worker = None;
    task.updated_at = Utc::now();
    push_timeline(task, "manual_retry", serde_json::Value::Null);
    Ok(())
}

/// `* -> cancelled` for any non-terminal task (§4.9 `orc task cancel`).
pub fn cancel_task(doc: &mut ProjectDocument, task_id: &str) -> Result<(), &'static str> {
    let Some(task) = doc.find_task_mut(task_id) else {
        return Err("task not found");
    };
    if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled) {
        return Err("task is already terminal");
    }
    task.status = TaskStatus::Cancelled;
    task.assigned_worker = None;
    task.completed_at = Some(Utc::now());
    task.updated_at = Utc::now();
    push_timeline(task, "task_cancelled", serde_json::Value::Null);
    Ok(())
}

// ---------------------------------------------------------------------------
// Review fix-verify loop
// ---------------------------------------------------------------------------

/// Severities that force changes-requested rather than approval (§4.2).
fn has_blocking_issue(issues: &[orc_store::models::ReviewIssue]) -> bool {
    issues.iter().any(|i| matches!(i.severity.to_lowercase().as_str(), "critical" | "high"))
}

/// Apply a parsed review verdict (or its absence, on parse failure) to
/// the parent task (§4.2 review loop). `issues`/`summary` are `None` when
/// the reviewer's stdout had no parseable fenced JSON block.
pub fn apply_review_verdict(
    doc: &mut ProjectDocument,
    bus: &EventBus,
    project_id: &str,
    review_task_id: &str,
    parsed: Option<(Vec<orc_store::models::ReviewIssue>, Option<String>)>,
    config: &KernelConfig,
) {
    let Some(review_task) = doc.find_task(review_task_id) else { return };
    let Some(parent_id) = review_task.parent_task_id.clone() else { return };
    let review_round_on_entry = doc.find_task(&parent_id).map(|p| p.review_round).unwrap_or(0);

    match parsed {
        None => {
            if let Some(parent) = doc.find_task_mut(&parent_id) {
                parent.status = TaskStatus::PlanReview;
                parent.blocked_reason = Some("review_parse_failed".to_string());
                push_timeline(parent, "review_failed", serde_json::Value::Null);
            }
            if let Some(rt) = doc.find_task_mut(review_task_id) {
                rt.review_status = Some(ReviewStatus::Completed);
            }
            bus.emit(
                doc,
                project_id,
                "review_failed",
                EventLevel::Error,
                Some(&parent_id),
                None,
                format!("review output for {parent_id} could not be parsed; escalating to plan_review"),
                serde_json::Value::Null,
            );
        }
        Some((issues, summary)) => {
            let blocking = has_blocking_issue(&issues);
            let result = ReviewResult {
                issues: issues.clone(),
                summary: summary.clone(),
                reviewed_at: Utc::now(),
                round: review_round_on_entry,
            };
            if let Some(rt) = doc.find_task_mut(review_task_id) {
                rt.review_result = Some(result.clone());
                rt.review_status = Some(if blocking {
                    ReviewStatus::ChangesRequested
                } else {
                    ReviewStatus::Approved
                });
            }

            if !blocking {
                if let Some(parent) = doc.find_task_mut(&parent_id) {
                    parent.status = TaskStatus::Completed;
                    parent.review_status = Some(ReviewStatus::Approved);
                    parent.review_result = Some(result);
                    push_timeline(parent, "review_approved", serde_json::Value::Null);
                }
                bus.emit(
                    doc,
                    project_id,
                    "review_approved",
                    EventLevel::Info,
                    Some(&parent_id),
                    None,
                    format!("review for {parent_id} approved"),
                    serde_json::Value::Null,
                );
            } else {
                let feedback = render_feedback(&issues, summary.as_deref());
                let next_round = review_round_on_entry + 1;
                if next_round >= config.max_review_rounds {
                    if let Some(parent) = doc.find_task_mut(&parent_id) {
                        parent.status = TaskStatus::PlanReview;
                        parent.review_round = next_round;
                        parent.blocked_reason = Some("max_review_rounds_exceeded".to_string());
                        parent.review_result = Some(result);
                        push_timeline(parent, "max_review_rounds_exceeded", serde_json::Value::Null);
                    }
                } else if let Some(parent) = doc.find_task_mut(&parent_id) {
                    parent.status = TaskStatus::Pending;
                    parent.review_round = next_round;
                    parent._review_feedback = Some(feedback);
                    parent.review_result = Some(result);
                    parent.assigned_worker = None;
                    parent.retry_after = None;
                    push_timeline(parent, "review_changes_requested", serde_json::Value::Null);
                }
                bus.emit(
                    doc,
                    project_id,
                    "review_failed",
                    EventLevel::Warning,
                    Some(&parent_id),
                    None,
                    format!("review for {parent_id} requested changes"),
                    serde_json::json!({"issue_count": issues.len()}),
                );
            }
        }
    }
    bus.task_updated(project_id, &parent_id);
}

fn render_feedback(issues: &[orc_store::models::ReviewIssue], summary: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(s) = summary {
        out.push_str(s);
        out.push_str("\n\n");
    }
    for issue in issues {
        out.push_str(&format!(
            "- [{}] {}{}: {}\n",
            issue.severity,
            issue.file.clone().unwrap_or_default(),
            issue.line.map(|l| format!(":{l}")).unwrap_or_default(),
            issue.description,
        ));
        if let Some(s) = &issue.suggestion {
            out.push_str(&format!("  suggestion: {s}\n"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Plan approval and decomposition
// ---------------------------------------------------------------------------

/// Strip a leading bullet/ordinal marker from a plan line
/// (`^(?:[-*]|\d+[.)、])\s*`, §4.2 decomposition).
fn strip_marker(line: &str) -> &str {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('-').or_else(|| trimmed.strip_prefix('*')) {
        return rest.trim_start();
    }
    let digits_end = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(0);
    if digits_end > 0 {
        let rest = &trimmed[digits_end..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')).or_else(|| rest.strip_prefix('、')) {
            return rest.trim_start();
        }
    }
    trimmed
}

/// `plan_review -> pending` on approval (no decomposition), or
/// `plan_review -> blocked_by_subtasks` via [`decompose_plan`] when the
/// task has `plan_mode` set (§4.2).
pub fn approve_plan(doc: &mut ProjectDocument, bus: &EventBus, project_id: &str, task_id: &str) -> Result<(), &'static str> {
    let plan_mode = {
        let Some(task) = doc.find_task(task_id) else { return Err("task not found") };
        if task.status != TaskStatus::PlanReview {
            return Err("task is not awaiting plan review");
        }
        task.plan_mode
    };

    if plan_mode {
        decompose_plan(doc, task_id)?;
    } else if let Some(task) = doc.find_task_mut(task_id) {
        task.status = TaskStatus::Pending;
        task.blocked_reason = None;
        push_timeline(task, "plan_approved", serde_json::Value::Null);
    }

    bus.emit(
        doc,
        project_id,
        "plan_approved",
        EventLevel::Info,
        Some(task_id),
        None,
        format!("plan for {task_id} approved"),
        serde_json::Value::Null,
    );
    Ok(())
}

/// `plan_review -> plan_review` on rejection: feedback is appended to
/// `plan_content` for a future regeneration pass (§4.2).
pub fn reject_plan(doc: &mut ProjectDocument, bus: &EventBus, project_id: &str, task_id: &str, feedback: &str) -> Result<(), &'static str> {
    let Some(task) = doc.find_task_mut(task_id) else { return Err("task not found") };
    if task.status != TaskStatus::PlanReview {
        return Err("task is not awaiting plan review");
    }
    let mut content = task.plan_content.clone().unwrap_or_default();
    content.push_str("\n\n--- rejection feedback ---\n");
    content.push_str(feedback);
    task.plan_content = Some(content);
    push_timeline(task, "plan_rejected", serde_json::json!({"feedback": feedback}));

    bus.emit(
        doc,
        project_id,
        "plan_rejected",
        EventLevel::Warning,
        Some(task_id),
        None,
        format!("plan for {task_id} rejected"),
        serde_json::Value::Null,
    );
    Ok(())
}

/// Synthesize sub-tasks from `plan_content` line scanning (§4.2
/// decomposition). Up to 8 surviving lines (length >= 3 after stripping
/// markers) each become a sub-task, re-classified via the router. If no
/// line survives, a single fallback sub-task is synthesized from the
/// parent's title.
pub fn decompose_plan(doc: &mut ProjectDocument, parent_id: &str) -> Result<Vec<String>, &'static str> {
    let (plan_content, parent_title) = {
        let Some(task) = doc.find_task(parent_id) else { return Err("task not found") };
        (task.plan_content.clone().unwrap_or_default(), task.title.clone())
    };

    let mut lines: Vec<String> = plan_content
        .lines()
        .map(strip_marker)
        .map(|l| l.trim().to_string())
        .filter(|l| l.chars().count() >= 3)
        .take(8)
        .collect();

    if lines.is_empty() {
        lines.push(parent_title.clone());
    }

    let mut child_ids = Vec::new();
    let now = Utc::now();
    for line in lines {
        let task_type = router::classify(&line, "");
        let child_id = next_task_id_avoiding(doc, &child_ids);
        let child = Task {
            id: child_id.clone(),
            parent_task_id: Some(parent_id.to_string()),
            sub_tasks: vec![],
            depends_on: vec![],
            title: line.clone(),
            description: line,
            task_type,
            priority: orc_store::models::Priority::Medium,
            sla_tier: orc_store::models::SlaTier::Standard,
            risk_level: orc_store::models::RiskLevel::Medium,
            acceptance_criteria: vec![],
            rollback_plan: None,
            engine: orc_store::models::Engine::Auto,
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
        };
        doc.tasks.push(child);
        child_ids.push(child_id);
    }

    if let Some(parent) = doc.find_task_mut(parent_id) {
        parent.sub_tasks.extend(child_ids.iter().cloned());
        parent.status = TaskStatus::BlockedBySubtasks;
        push_timeline(parent, "plan_approved", serde_json::json!({"sub_task_count": child_ids.len()}));
    }

    Ok(child_ids)
}

fn next_task_id_avoiding(doc: &ProjectDocument, already_minted: &[String]) -> String {
    let mut max = doc
        .tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix("task-").and_then(|n| n.parse::<u64>().ok()))
        .max()
        .unwrap_or(0);
    for id in already_minted {
        if let Some(n) = id.strip_prefix("task-").and_then(|n| n.parse::<u64>().ok()) {
            max = max.max(n);
        }
    }
    format!("task-{:03}", max + 1)
}

/// `blocked_by_subtasks -> completed` roll-up (§4.2, P4): run every
/// dispatch cycle (and after any completion) so a parent transitions the
/// moment its last child finishes.
pub fn roll_up_parents(doc: &mut ProjectDocument, bus: &EventBus, project_id: &str) {
    let candidates: Vec<String> = doc
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::BlockedBySubtasks)
        .map(|t| t.id.clone())
        .collect();

    for parent_id in candidates {
        let Some(parent) = doc.find_task(&parent_id) else { continue };
        let sub_tasks = parent.sub_tasks.clone();
        if sub_tasks.is_empty() {
            continue;
        }
        let all_done = sub_tasks.iter().all(|child_id| {
            doc.find_task(child_id).map(|c| c.status == TaskStatus::Completed).unwrap_or(false)
        });
        if !all_done {
            continue;
        }
        if let Some(parent) = doc.find_task_mut(&parent_id) {
            parent.status = TaskStatus::Completed;
            parent.completed_at = Some(Utc::now());
            push_timeline(parent, "subtasks_all_completed", serde_json::Value::Null);
        }
        bus.emit(
            doc,
            project_id,
            "subtasks_all_completed",
            EventLevel::Info,
            Some(&parent_id),
            None,
            format!("all sub-tasks of {parent_id} completed"),
            serde_json::Value::Null,
        );
        bus.task_updated(project_id, &parent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_store::models::*;

    fn base_task(id: &str, task_type: TaskType, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            parent_task_id: None,
            sub_tasks: vec![],
            depends_on: vec![],
            title: "t".into(),
            description: String::new(),
            task_type,
            priority: Priority::Medium,
            sla_tier: SlaTier::Standard,
            risk_level: RiskLevel::Medium,
            acceptance_criteria: vec![],
            rollback_plan: None,
            engine: Engine::Auto,
            routed_engine: None,
            fallback_reason: None,
            status,
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

    fn config() -> KernelConfig {
        KernelConfig::default()
    }

    #[test]
    fn complete_task_spawns_review_for_feature() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Feature, TaskStatus::InProgress);
        let lease = LeaseId::generate();
        task.attempts.push(Attempt {
            attempt: 1,
            worker_id: "w-0".into(),
            engine: Engine::A,
            lease_id: lease.as_str().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            exit_code: None,
            error_tail: None,
            commit_ids: vec![],
        });
        task.assigned_worker = Some("w-0".into());
        doc.tasks.push(task);

        let bus = EventBus::new();
        let outcome = complete_task(
            &mut doc,
            &bus,
            "proj-1",
            "task-001",
            "w-0",
            Some(lease.as_str()),
            &["abc1234".to_string()],
            "done",
            &config(),
        );
        assert!(outcome.accepted);
        assert!(outcome.spawned_review_task_id.is_some());

        let parent = doc.find_task("task-001").unwrap();
        assert_eq!(parent.status, TaskStatus::Reviewing);
        assert_eq!(parent.commit_ids, vec!["abc1234".to_string()]);

        let review = doc.find_task(outcome.spawned_review_task_id.as_ref().unwrap()).unwrap();
        assert_eq!(review.task_type, TaskType::Review);
        assert_eq!(review.routed_engine, Some(Engine::B));
    }

    #[test]
    fn complete_task_routes_plan_mode_to_plan_review() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Plan, TaskStatus::InProgress);
        task.plan_mode = true;
        task.assigned_worker = Some("w-0".into());
        let lease = LeaseId::generate();
        task.attempts.push(Attempt {
            attempt: 1,
            worker_id: "w-0".into(),
            engine: Engine::A,
            lease_id: lease.as_str().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            exit_code: None,
            error_tail: None,
            commit_ids: vec![],
        });
        doc.tasks.push(task);

        let bus = EventBus::new();
        let outcome = complete_task(
            &mut doc,
            &bus,
            "proj-1",
            "task-001",
            "w-0",
            Some(lease.as_str()),
            &[],
            "1. do x\n2. do y",
            &config(),
        );
        assert!(outcome.accepted);
        assert!(outcome.spawned_review_task_id.is_none());
        let t = doc.find_task("task-001").unwrap();
        assert_eq!(t.status, TaskStatus::PlanReview);
        assert_eq!(t.plan_content.as_deref(), Some("1. do x\n2. do y"));
    }

    #[test]
    fn complete_task_rejects_lease_mismatch() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Analysis, TaskStatus::InProgress);
        task.assigned_worker = Some("w-0".into());
        task.attempts.push(Attempt {
            attempt: 1,
            worker_id: "w-0".into(),
            engine: Engine::A,
            lease_id: "lease-aaaaaaaaaaaa".into(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            exit_code: None,
            error_tail: None,
            commit_ids: vec![],
        });
        doc.tasks.push(task);

        let bus = EventBus::new();
        let outcome = complete_task(
            &mut doc,
            &bus,
            "proj-1",
            "task-001",
            "w-0",
            Some("lease-bbbbbbbbbbbb"),
            &[],
            "",
            &config(),
        );
        assert!(!outcome.accepted);
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn fail_task_schedules_auto_retry_under_cap() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Feature, TaskStatus::InProgress);
        task.assigned_worker = Some("w-0".into());
        task.max_retries = 3;
        task.attempts.push(Attempt {
            attempt: 1,
            worker_id: "w-0".into(),
            engine: Engine::A,
            lease_id: "lease-aaaaaaaaaaaa".into(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            exit_code: None,
            error_tail: None,
            commit_ids: vec![],
        });
        doc.tasks.push(task);

        let bus = EventBus::new();
        let outcome = fail_task(
            &mut doc,
            &bus,
            "proj-1",
            "task-001",
            "w-0",
            Some("lease-aaaaaaaaaaaa"),
            "boom",
            Some(1),
            &config(),
        );
        assert!(outcome.accepted);
        let t = doc.find_task("task-001").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert!(t.retry_after.is_some());
    }

    #[test]
    fn fail_task_rate_limit_uses_longer_delay() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Feature, TaskStatus::InProgress);
        task.assigned_worker = Some("w-0".into());
        task.attempts.push(Attempt {
            attempt: 1,
            worker_id: "w-0".into(),
            engine: Engine::A,
            lease_id: "lease-aaaaaaaaaaaa".into(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            exit_code: None,
            error_tail: None,
            commit_ids: vec![],
        });
        doc.tasks.push(task);

        let bus = EventBus::new();
        let cfg = config();
        fail_task(&mut doc, &bus, "proj-1", "task-001", "w-0", Some("lease-aaaaaaaaaaaa"), "rate_limit exceeded", Some(1), &cfg);
        let t = doc.find_task("task-001").unwrap();
        let delay = t.retry_after.unwrap() - Utc::now();
        assert!(delay.num_seconds() > (cfg.auto_retry_delay_secs as i64));
    }

    #[test]
    fn fail_task_exhausts_retries_to_failed() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Feature, TaskStatus::InProgress);
        task.assigned_worker = Some("w-0".into());
        task.retry_count = 2;
        task.max_retries = 3;
        task.attempts.push(Attempt {
            attempt: 3,
            worker_id: "w-0".into(),
            engine: Engine::A,
            lease_id: "lease-aaaaaaaaaaaa".into(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            exit_code: None,
            error_tail: None,
            commit_ids: vec![],
        });
        doc.tasks.push(task);

        let bus = EventBus::new();
        fail_task(&mut doc, &bus, "proj-1", "task-001", "w-0", Some("lease-aaaaaaaaaaaa"), "boom", Some(1), &config());
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn decompose_plan_synthesizes_subtasks_from_numbered_lines() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Plan, TaskStatus::PlanReview);
        parent.plan_mode = true;
        parent.plan_content = Some(
            "1. implement the login form\n2. fix the crash on logout\n3. review the auth module"
                .to_string(),
        );
        doc.tasks.push(parent);

        let children = decompose_plan(&mut doc, "task-001").unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::BlockedBySubtasks);
        assert_eq!(doc.find_task(&children[0]).unwrap().task_type, TaskType::Feature);
        assert_eq!(doc.find_task(&children[1]).unwrap().task_type, TaskType::Bugfix);
        assert_eq!(doc.find_task(&children[2]).unwrap().task_type, TaskType::Review);
    }

    #[test]
    fn decompose_plan_falls_back_to_title_when_no_lines_survive() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Plan, TaskStatus::PlanReview);
        parent.plan_mode = true;
        parent.plan_content = Some("  \n- \n".to_string());
        parent.title = "do the thing".to_string();
        doc.tasks.push(parent);

        let children = decompose_plan(&mut doc, "task-001").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(doc.find_task(&children[0]).unwrap().title, "do the thing");
    }

    #[test]
    fn roll_up_parents_completes_when_all_children_done() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Plan, TaskStatus::BlockedBySubtasks);
        parent.sub_tasks = vec!["task-002".to_string(), "task-003".to_string()];
        doc.tasks.push(parent);
        doc.tasks.push(base_task("task-002", TaskType::Feature, TaskStatus::Completed));
        doc.tasks.push(base_task("task-003", TaskType::Bugfix, TaskStatus::Completed));

        let bus = EventBus::new();
        roll_up_parents(&mut doc, &bus, "proj-1");
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn roll_up_parents_leaves_incomplete_children_blocked() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Plan, TaskStatus::BlockedBySubtasks);
        parent.sub_tasks = vec!["task-002".to_string()];
        doc.tasks.push(parent);
        doc.tasks.push(base_task("task-002", TaskType::Feature, TaskStatus::Pending));

        let bus = EventBus::new();
        roll_up_parents(&mut doc, &bus, "proj-1");
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::BlockedBySubtasks);
    }

    #[test]
    fn apply_review_verdict_approves_without_blocking_issues() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Feature, TaskStatus::Reviewing);
        parent.sub_tasks = vec!["task-002".to_string()];
        doc.tasks.push(parent);
        let mut review = base_task("task-002", TaskType::Review, TaskStatus::Completed);
        review.parent_task_id = Some("task-001".to_string());
        doc.tasks.push(review);

        let bus = EventBus::new();
        apply_review_verdict(
            &mut doc,
            &bus,
            "proj-1",
            "task-002",
            Some((vec![], Some("looks good".to_string()))),
            &config(),
        );
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn apply_review_verdict_requests_changes_on_high_severity() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Feature, TaskStatus::Reviewing);
        parent.sub_tasks = vec!["task-002".to_string()];
        doc.tasks.push(parent);
        let mut review = base_task("task-002", TaskType::Review, TaskStatus::Completed);
        review.parent_task_id = Some("task-001".to_string());
        doc.tasks.push(review);

        let bus = EventBus::new();
        let issue = ReviewIssue {
            severity: "high".to_string(),
            file: Some("a.rs".to_string()),
            line: Some(10),
            description: "bug".to_string(),
            suggestion: None,
        };
        apply_review_verdict(&mut doc, &bus, "proj-1", "task-002", Some((vec![issue], None)), &config());

        let parent = doc.find_task("task-001").unwrap();
        assert_eq!(parent.status, TaskStatus::Pending);
        assert_eq!(parent.review_round, 1);
        assert!(parent._review_feedback.is_some());
    }

    #[test]
    fn apply_review_verdict_escalates_past_max_rounds() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Feature, TaskStatus::Reviewing);
        parent.sub_tasks = vec!["task-002".to_string()];
        parent.review_round = 2;
        doc.tasks.push(parent);
        let mut review = base_task("task-002", TaskType::Review, TaskStatus::Completed);
        review.parent_task_id = Some("task-001".to_string());
        doc.tasks.push(review);

        let bus = EventBus::new();
        let issue = ReviewIssue {
            severity: "critical".to_string(),
            file: None,
            line: None,
            description: "bug".to_string(),
            suggestion: None,
        };
        apply_review_verdict(&mut doc, &bus, "proj-1", "task-002", Some((vec![issue], None)), &config());

        let parent = doc.find_task("task-001").unwrap();
        assert_eq!(parent.status, TaskStatus::PlanReview);
        assert_eq!(parent.blocked_reason.as_deref(), Some("max_review_rounds_exceeded"));
    }

    #[test]
    fn apply_review_verdict_escalates_on_parse_failure() {
        let mut doc = ProjectDocument::default();
        let mut parent = base_task("task-001", TaskType::Feature, TaskStatus::Reviewing);
        parent.sub_tasks = vec!["task-002".to_string()];
        doc.tasks.push(parent);
        let mut review = base_task("task-002", TaskType::Review, TaskStatus::Completed);
        review.parent_task_id = Some("task-001".to_string());
        doc.tasks.push(review);

        let bus = EventBus::new();
        apply_review_verdict(&mut doc, &bus, "proj-1", "task-002", None, &config());

        let parent = doc.find_task("task-001").unwrap();
        assert_eq!(parent.status, TaskStatus::PlanReview);
        assert_eq!(parent.blocked_reason.as_deref(), Some("review_parse_failed"));
    }

    #[test]
    fn manual_retry_resets_retry_count_bypassing_cap() {
        let mut doc = ProjectDocument::default();
        let mut task = base_task("task-001", TaskType::Feature, TaskStatus::Failed);
        task.retry_count = 3;
        task.max_retries = 3;
        doc.tasks.push(task);
        manual_retry(&mut doc, "task-001").unwrap();
        let t = doc.find_task("task-001").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn dependencies_satisfied_requires_completed_for_non_review() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(base_task("task-001", TaskType::Feature, TaskStatus::InProgress));
        let mut dependant = base_task("task-002", TaskType::Feature, TaskStatus::Pending);
        dependant.depends_on = vec!["task-001".to_string()];
        assert!(!dependencies_satisfied(&doc, &dependant));

        doc.find_task_mut("task-001").unwrap().status = TaskStatus::Completed;
        assert!(dependencies_satisfied(&doc, &dependant));
    }

    #[test]
    fn dependencies_satisfied_accepts_reviewing_for_review_tasks() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(base_task("task-001", TaskType::Feature, TaskStatus::Reviewing));
        let mut review = base_task("task-002", TaskType::Review, TaskStatus::Pending);
        review.depends_on = vec!["task-001".to_string()];
        assert!(dependencies_satisfied(&doc, &review));
    }
}
