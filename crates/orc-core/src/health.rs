//! Engine Health Probe (§4.6): on its own timer, checks CLI availability
//! per engine, detects stalled busy workers via heartbeat timeout, and
//! recovers errored workers after a cooldown unless they have hit the
//! consecutive-failure ceiling. Grounded in
//! `original_source/backend/engine_manager.py::health_check_loop`.

use std::path::Path;

use chrono::Utc;
use orc_store::models::{Engine, EventLevel};

use crate::bus::EventBus;
use crate::config::KernelConfig;
use crate::domain::WorkerPool;
use crate::notification::NotificationSink;

/// Check whether `binary` is resolvable on `$PATH`, mirroring
/// `shutil.which`. No `which`/`shell-words` crate is pulled in for this —
/// a plain split-and-join over `PATH` is all `shutil.which` itself does.
pub fn cli_available_on_path(binary: &str) -> bool {
    if Path::new(binary).is_absolute() {
        return Path::new(binary).exists();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).is_file())
}

/// Result of probing both engines' CLI availability.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineHealth {
    pub a_available: bool,
    pub b_available: bool,
}

impl EngineHealth {
    pub fn for_engine(&self, engine: Engine) -> bool {
        match engine {
            Engine::A => self.a_available,
            Engine::B => self.b_available,
            Engine::Auto => self.a_available || self.b_available,
        }
    }

    pub fn both_unhealthy(&self) -> bool {
        !self.a_available && !self.b_available
    }
}

pub fn probe_engines(config: &KernelConfig) -> EngineHealth {
    EngineHealth {
        a_available: cli_available_on_path(&config.engine_a_cli),
        b_available: cli_available_on_path(&config.engine_b_cli),
    }
}

/// Run one health tick against the in-memory worker pool. Returns the
/// freshly probed engine health so the dispatch loop can reuse it without
/// re-probing `$PATH` within the same cycle.
pub async fn health_tick(
    pool: &mut WorkerPool,
    config: &KernelConfig,
    notifier: &dyn NotificationSink,
) -> EngineHealth {
    let health = probe_engines(config);
    let now = Utc::now();

    for worker in pool.iter_mut() {
        worker.cli_available = health.for_engine(worker.engine);
    }

    // Stalled busy workers (§4.6 step 2).
    let timeout = config.heartbeat_timeout();
    let mut stalled = Vec::new();
    for worker in pool.iter_mut() {
        if worker.status == crate::domain::WorkerStatus::Busy
            && now.signed_duration_since(worker.health.last_heartbeat) > timeout
        {
            worker.mark_errored();
            stalled.push(worker.id.clone());
        }
    }
    for worker_id in &stalled {
        tracing::warn!(worker_id, "worker heartbeat timeout, marking as error");
        if pool.get(worker_id).map(|w| w.health.consecutive_failures).unwrap_or(0) >= 3 {
            notifier
                .notify(
                    "worker heartbeat timeout",
                    &format!("worker {worker_id} missed its heartbeat window"),
                    serde_json::json!({"worker_id": worker_id}),
                )
                .await;
        }
    }

    // Cooldown recovery for errored workers (§4.6 step 3).
    let cooldown = config.worker_cooldown();
    let mut recovered = Vec::new();
    for worker in pool.iter_mut() {
        if worker.status != crate::domain::WorkerStatus::Error {
            continue;
        }
        let Some(error_at) = worker.error_at else { continue };
        if worker.health.consecutive_failures < config.max_consecutive_failures
            && now.signed_duration_since(error_at) >= cooldown
        {
            worker.recover();
            recovered.push(worker.id.clone());
        }
    }
    for worker_id in &recovered {
        tracing::info!(worker_id, "worker recovered after cooldown");
    }

    health
}

/// Emit the bus-level `worker_recovered` events for a health tick; kept
/// separate from [`health_tick`] since it needs a project document +
/// event bus, while the pool mutation itself is project-agnostic.
pub fn emit_recovery_events(
    bus: &EventBus,
    doc: &mut orc_store::models::ProjectDocument,
    project_id: &str,
    recovered_worker_ids: &[String],
) {
    for worker_id in recovered_worker_ids {
        bus.emit(
            doc,
            project_id,
            "worker_recovered",
            EventLevel::Info,
            None,
            Some(worker_id),
            format!("worker {worker_id} recovered after cooldown"),
            serde_json::Value::Null,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{WorkerSpec, WorkerStatus};
    use crate::notification::LoggingSink;

    fn spec(id: &str, engine: Engine) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            engine,
            port: 5000,
            capabilities: vec!["feature".into()],
        }
    }

    #[test]
    fn cli_available_on_path_finds_a_known_binary() {
        assert!(cli_available_on_path("sh"));
    }

    #[test]
    fn cli_available_on_path_rejects_unknown_binary() {
        assert!(!cli_available_on_path("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn health_tick_marks_stalled_busy_worker_errored() {
        let mut pool = crate::domain::WorkerPool::from_specs(&[spec("w-0", Engine::A)], Path::new("/tmp"));
        let w = pool.get_mut("w-0").unwrap();
        w.claim("task-1", "proj-1", crate::lease::LeaseId::generate());
        w.health.last_heartbeat = Utc::now() - chrono::Duration::seconds(200);

        let mut config = KernelConfig::default();
        config.engine_a_cli = "sh".to_string();
        config.heartbeat_timeout_secs = 120;

        health_tick(&mut pool, &config, &LoggingSink).await;
        assert_eq!(pool.get("w-0").unwrap().status, WorkerStatus::Error);
    }

    #[tokio::test]
    async fn health_tick_recovers_after_cooldown_under_ceiling() {
        let mut pool = crate::domain::WorkerPool::from_specs(&[spec("w-0", Engine::A)], Path::new("/tmp"));
        let w = pool.get_mut("w-0").unwrap();
        w.mark_errored();
        w.error_at = Some(Utc::now() - chrono::Duration::seconds(120));

        let mut config = KernelConfig::default();
        config.engine_a_cli = "sh".to_string();
        config.worker_cooldown_secs = 60;

        health_tick(&mut pool, &config, &LoggingSink).await;
        assert_eq!(pool.get("w-0").unwrap().status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn health_tick_leaves_worker_disabled_past_failure_ceiling() {
        let mut pool = crate::domain::WorkerPool::from_specs(&[spec("w-0", Engine::A)], Path::new("/tmp"));
        let w = pool.get_mut("w-0").unwrap();
        w.mark_errored();
        w.health.consecutive_failures = 5;
        w.error_at = Some(Utc::now() - chrono::Duration::seconds(500));

        let mut config = KernelConfig::default();
        config.engine_a_cli = "sh".to_string();
        config.max_consecutive_failures = 5;

        health_tick(&mut pool, &config, &LoggingSink).await;
        assert_eq!(pool.get("w-0").unwrap().status, WorkerStatus::Error);
    }
}
