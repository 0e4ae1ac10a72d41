//! Dispatch Loop (§4.4): each cycle rolls up completed parents, picks the
//! highest-priority ready tasks per project, matches them to idle workers,
//! and binds a fresh lease. Pure and synchronous — no I/O, no subprocess
//! spawning — so the kernel can hold both the document and the worker
//! pool lock for the whole cycle and persist once. Grounded in the
//! teacher's `orchestrator/mod.rs` dispatch-tick structure and
//! `original_source/backend/dispatcher.py::dispatch_tick`.

use chrono::{DateTime, Utc};
use orc_store::models::{Engine, EventLevel, ProjectDocument, SlaTier, Priority, TaskType};

use crate::bus::EventBus;
use crate::config::KernelConfig;
use crate::domain::WorkerPool;
use crate::health::EngineHealth;
use crate::lease::LeaseId;
use crate::router;
use crate::runner::RunMode;
use crate::state_machine;

/// A task bound to a worker this cycle, ready for the kernel to launch a
/// [`crate::runner::WorkerRunner`] against.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: String,
    pub worker_id: String,
    pub engine: Engine,
    pub lease: LeaseId,
    pub attempt: u32,
    pub mode: RunMode,
}

fn sla_rank(tier: SlaTier) -> u8 {
    match tier {
        SlaTier::Urgent => 0,
        SlaTier::Expedite => 1,
        SlaTier::Standard => 2,
    }
}

fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

/// Ready tasks, ordered by `(sla_rank, priority_rank, created_at)` with a
/// task-id tiebreak for determinism across identical timestamps (P7).
fn ranked_candidates(doc: &ProjectDocument, now: DateTime<Utc>) -> Vec<String> {
    let mut candidates: Vec<&orc_store::models::Task> = doc
        .tasks
        .iter()
        .filter(|t| state_machine::is_ready(doc, t, now))
        .collect();

    candidates.sort_by(|a, b| {
        sla_rank(a.sla_tier)
            .cmp(&sla_rank(b.sla_tier))
            .then_with(|| priority_rank(a.priority).cmp(&priority_rank(b.priority)))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    candidates.into_iter().map(|t| t.id.clone()).collect()
}

fn run_mode_for(task: &orc_store::models::Task) -> RunMode {
    if task.task_type == TaskType::Review {
        RunMode::Review
    } else if task.plan_mode && task.plan_content.is_none() {
        RunMode::Plan
    } else {
        RunMode::Normal
    }
}

/// Run one dispatch cycle against a single project's document and the
/// shared worker pool. Mutates both in place; the caller is responsible
/// for persisting `doc` (one write per project per cycle, §5) and for
/// actually launching the returned [`Assignment`]s.
///
/// `engine_health` is the last engine probe (from [`crate::health::health_tick`]
/// or [`crate::health::probe_engines`]); a total outage — no idle worker
/// with `cli_available` and both engines unhealthy — short-circuits
/// before any ranking or assignment is attempted.
pub fn dispatch_cycle(
    doc: &mut ProjectDocument,
    pool: &mut WorkerPool,
    bus: &EventBus,
    project_id: &str,
    engine_health: &EngineHealth,
) -> Vec<Assignment> {
    state_machine::roll_up_parents(doc, bus, project_id);

    if pool.is_empty() {
        return Vec::new();
    }

    if !pool.any_idle_available() && engine_health.both_unhealthy() {
        bus.emit(
            doc,
            project_id,
            "alert_triggered",
            EventLevel::Critical,
            None,
            None,
            "no idle workers available and both engines are unhealthy".to_string(),
            serde_json::Value::Null,
        );
        return Vec::new();
    }

    let now = Utc::now();
    let candidates = ranked_candidates(doc, now);
    let mut assignments = Vec::new();

    for task_id in &candidates {
        let Some(task) = doc.find_task(task_id) else { continue };
        let task_type = task.task_type;
        let engine_hint = task.engine;
        let preferred = task
            .routed_engine
            .unwrap_or_else(|| router::route(task_type, engine_hint));

        // Review tasks never fall back to the non-reviewing engine (P3):
        // the whole point is an opposite-engine adversarial pass.
        let (worker_id, engine_used, fallback_reason) = if task_type == TaskType::Review {
            match pool.find_idle(preferred) {
                Some(w) => (w.id.clone(), preferred, None),
                None => continue,
            }
        } else {
            match pool.find_idle(preferred) {
                Some(w) => (w.id.clone(), preferred, None),
                None => {
                    let opposite = router::opposite_engine(preferred);
                    match pool.find_idle(opposite) {
                        Some(w) => (w.id.clone(), opposite, Some("preferred_engine_unavailable".to_string())),
                        None => continue,
                    }
                }
            }
        };

        let lease = LeaseId::generate();
        pool.get_mut(&worker_id)
            .expect("worker_id came from this pool")
            .claim(task_id, project_id, lease.clone());

        let mode = run_mode_for(task);

        let Some(task_mut) = doc.find_task_mut(task_id) else { continue };
        task_mut.routed_engine = Some(engine_used);
        if fallback_reason.is_some() {
            task_mut.fallback_reason = fallback_reason.clone();
        }
        let attempt = state_machine::claim_task(task_mut, &worker_id, engine_used, &lease);

        if let Some(reason) = &fallback_reason {
            bus.emit(
                doc,
                project_id,
                "engine_fallback",
                EventLevel::Warning,
                Some(task_id),
                Some(&worker_id),
                format!("task {task_id} fell back to {engine_used} ({reason})"),
                serde_json::json!({"reason": reason}),
            );
        }
        bus.emit(
            doc,
            project_id,
            "task_dispatched",
            EventLevel::Info,
            Some(task_id),
            Some(&worker_id),
            format!("task {task_id} dispatched to {worker_id}"),
            serde_json::json!({"engine": engine_used.to_string(), "attempt": attempt}),
        );
        bus.emit(
            doc,
            project_id,
            "worker_claimed",
            EventLevel::Info,
            Some(task_id),
            Some(&worker_id),
            format!("worker {worker_id} claimed {task_id}"),
            serde_json::Value::Null,
        );
        bus.task_updated(project_id, task_id);

        assignments.push(Assignment {
            task_id: task_id.clone(),
            worker_id,
            engine: engine_used,
            lease,
            attempt,
            mode,
        });
    }

    assignments
}

/// Used by `orc serve`'s background loop to pick dispatch cadence when
/// `config.dispatch_interval_secs` would otherwise leave workers idle
/// right after a burst of completions (not currently exercised by the
/// synchronous cycle above, kept for the async caller).
pub fn should_dispatch_immediately(assignments_last_cycle: usize, _config: &KernelConfig) -> bool {
    assignments_last_cycle > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_store::models::*;
    use std::path::Path;

    fn task(id: &str, task_type: TaskType, sla: SlaTier, priority: Priority) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            parent_task_id: None,
            sub_tasks: vec![],
            depends_on: vec![],
            title: "t".into(),
            description: String::new(),
            task_type,
            priority,
            sla_tier: sla,
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

    fn pool_with(specs: &[(&str, Engine)]) -> WorkerPool {
        let specs: Vec<WorkerSpec> = specs
            .iter()
            .map(|(id, engine)| WorkerSpec {
                id: id.to_string(),
                engine: *engine,
                port: 5000,
                capabilities: vec![],
            })
            .collect();
        WorkerPool::from_specs(&specs, Path::new("/tmp"))
    }

    fn both_healthy() -> EngineHealth {
        EngineHealth { a_available: true, b_available: true }
    }

    fn both_down() -> EngineHealth {
        EngineHealth { a_available: false, b_available: false }
    }

    #[test]
    fn dispatch_assigns_urgent_before_standard() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(task("task-001", TaskType::Feature, SlaTier::Standard, Priority::High));
        doc.tasks.push(task("task-002", TaskType::Feature, SlaTier::Urgent, Priority::Low));
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].task_id, "task-002");
    }

    #[test]
    fn dispatch_falls_back_to_opposite_engine_for_non_review() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(task("task-001", TaskType::Feature, SlaTier::Standard, Priority::Medium));
        let mut pool = pool_with(&[("w-0", Engine::B)]);
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].engine, Engine::B);
        assert_eq!(doc.find_task("task-001").unwrap().fallback_reason.as_deref(), Some("preferred_engine_unavailable"));
    }

    #[test]
    fn dispatch_never_falls_back_for_review_tasks() {
        let mut doc = ProjectDocument::default();
        let mut t = task("task-001", TaskType::Review, SlaTier::Standard, Priority::Medium);
        t.routed_engine = Some(Engine::B);
        doc.tasks.push(t);
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert!(assignments.is_empty());
        assert_eq!(doc.find_task("task-001").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn dispatch_respects_dependencies() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(task("task-001", TaskType::Feature, SlaTier::Standard, Priority::Medium));
        let mut dependant = task("task-002", TaskType::Feature, SlaTier::Urgent, Priority::High);
        dependant.depends_on = vec!["task-001".to_string()];
        doc.tasks.push(dependant);

        let mut pool = pool_with(&[("w-0", Engine::A)]);
        let bus = EventBus::new();
        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].task_id, "task-001");
    }

    #[test]
    fn dispatch_emits_alert_when_no_idle_workers_and_both_engines_unhealthy() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(task("task-001", TaskType::Feature, SlaTier::Standard, Priority::Medium));
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        pool.get_mut("w-0").unwrap().claim("other-task", "proj-1", LeaseId::generate());
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_down());
        assert!(assignments.is_empty());
        assert!(doc.events.iter().any(|e| e.event_type == "alert_triggered"));
    }

    #[test]
    fn dispatch_does_not_alert_when_pool_merely_busy_but_engines_healthy() {
        let mut doc = ProjectDocument::default();
        doc.tasks.push(task("task-001", TaskType::Feature, SlaTier::Standard, Priority::Medium));
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        pool.get_mut("w-0").unwrap().claim("other-task", "proj-1", LeaseId::generate());
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert!(assignments.is_empty());
        assert!(!doc.events.iter().any(|e| e.event_type == "alert_triggered"));
    }

    #[test]
    fn dispatch_alerts_on_total_outage_even_with_no_ready_tasks() {
        let mut doc = ProjectDocument::default();
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        pool.get_mut("w-0").unwrap().claim("other-task", "proj-1", LeaseId::generate());
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_down());
        assert!(assignments.is_empty());
        assert!(doc.events.iter().any(|e| e.event_type == "alert_triggered"));
    }

    #[test]
    fn dispatch_skips_tasks_with_future_retry_after() {
        let mut doc = ProjectDocument::default();
        let mut t = task("task-001", TaskType::Feature, SlaTier::Standard, Priority::Medium);
        t.retry_after = Some(Utc::now() + chrono::Duration::seconds(60));
        doc.tasks.push(t);
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert!(assignments.is_empty());
    }

    #[test]
    fn dispatch_selects_plan_mode_run_mode() {
        let mut doc = ProjectDocument::default();
        let mut t = task("task-001", TaskType::Plan, SlaTier::Standard, Priority::Medium);
        t.plan_mode = true;
        doc.tasks.push(t);
        let mut pool = pool_with(&[("w-0", Engine::A)]);
        let bus = EventBus::new();

        let assignments = dispatch_cycle(&mut doc, &mut pool, &bus, "proj-1", &both_healthy());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].mode, RunMode::Plan);
    }
}
