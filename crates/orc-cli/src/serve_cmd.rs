//! `orc serve` (§4.9): the persistent process. Runs both background
//! timers until a shutdown signal arrives, grounded in the teacher's own
//! `orchestrator/mod.rs` cancellation-token drain (the HTTP surface the
//! teacher's `serve_cmd.rs` also stood up is out of scope here; see
//! DESIGN.md).

use std::sync::Arc;

use anyhow::Result;
use orc_core::kernel::Kernel;
use tokio_util::sync::CancellationToken;

pub async fn run(kernel: Kernel) -> Result<()> {
    let kernel = Arc::new(kernel);
    let cancel = CancellationToken::new();

    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { kernel.run_forever(run_cancel).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    handle.await?;
    Ok(())
}
