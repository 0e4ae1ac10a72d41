//! `orc worker {list, show}` (§4.9). Worker state lives in the kernel
//! process's memory only (§3, `orc-core::domain`); a standalone CLI
//! invocation has no running kernel to query, so these commands report
//! the *configured* pool (`workers.toml` or the compiled defaults) and
//! its static shape, not live status. Live status is only observable
//! through the event/change stream a running `orc serve` publishes.

use anyhow::{Context, Result};
use orc_core::domain::load_worker_specs;

pub fn list(workers_toml: &std::path::Path) -> Result<()> {
    let specs = load_worker_specs(workers_toml).context("failed to load worker specs")?;
    for spec in &specs {
        println!("{}  engine={}  port={}  capabilities={:?}", spec.id, spec.engine, spec.port, spec.capabilities);
    }
    Ok(())
}

pub fn show(workers_toml: &std::path::Path, worker_id: &str) -> Result<()> {
    let specs = load_worker_specs(workers_toml).context("failed to load worker specs")?;
    let spec = specs
        .iter()
        .find(|s| s.id == worker_id)
        .ok_or_else(|| anyhow::anyhow!("worker {worker_id:?} not found in configured pool"))?;
    println!("id:           {}", spec.id);
    println!("engine:       {}", spec.engine);
    println!("port:         {}", spec.port);
    println!("capabilities: {:?}", spec.capabilities);
    Ok(())
}
