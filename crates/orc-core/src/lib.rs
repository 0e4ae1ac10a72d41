//! Orchestration kernel: task state machine, dispatch loop, health probe,
//! worker pool, worktree isolation, and the engine-CLI runner. Persistence
//! lives in `orc-store`; this crate owns everything that runs on top of it.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod health;
pub mod kernel;
pub mod lease;
pub mod notification;
pub mod plan;
pub mod project_service;
pub mod router;
pub mod runner;
pub mod state_machine;
pub mod worktree;
