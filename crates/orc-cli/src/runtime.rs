//! Shared kernel construction for the two long-running commands
//! (`dispatch --once`, `serve`). Real execution only — the CLI has no
//! reason to run in dry-run mode, unlike the in-process kernel tests.

use std::sync::Arc;

use anyhow::Result;
use orc_core::config::KernelConfig;
use orc_core::domain::{load_worker_specs, WorkerPool};
use orc_core::kernel::Kernel;
use orc_core::notification::LoggingSink;
use orc_core::worktree::NativeWorktreeProvider;
use orc_store::config::StoreConfig;
use orc_store::document::Store;

pub fn build_kernel(config: KernelConfig, workers_toml: &std::path::Path) -> Result<Kernel> {
    let store = Store::new(StoreConfig::new(&config.data_root));
    let specs = load_worker_specs(workers_toml)?;
    let pool = WorkerPool::from_specs(&specs, &config.data_root.join("worktrees"));
    Ok(Kernel::new(
        store,
        pool,
        config,
        Arc::new(LoggingSink),
        Arc::new(NativeWorktreeProvider::new()),
    ))
}
