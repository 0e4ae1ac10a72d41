//! `orc dispatch --once` (§4.9): run a single dispatch cycle against
//! every active project and print what was assigned, without starting
//! the background timers. Execution of each assignment still proceeds
//! as a spawned background task exactly as it would under `orc serve`;
//! this command is for scripting and smoke tests, not for draining a
//! queue to completion.

use anyhow::Result;
use orc_core::kernel::Kernel;

pub async fn run_once(kernel: &Kernel) -> Result<()> {
    let assigned = kernel.dispatch_once().await?;
    println!("Dispatched {assigned} task(s).");
    if assigned > 0 {
        println!("Execution continues in the background; check `orc task show` for results.");
    }
    Ok(())
}
