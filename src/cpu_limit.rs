//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftocairo` and
/// `tesseract` processes. One permit per core.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core.
///
/// You don't need to do this for in-process CPU-bound tasks, as long as you're
/// using [`crate::async_utils::run_blocking`]. But you should use it for
/// expensive external processes.
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    with_cpu_permits(1, f).await
}

/// Like [`with_cpu_semaphore`], but for external commands that may use
/// `threads` cores at once.
#[instrument(level = "trace", skip_all, fields(threads = threads))]
pub async fn with_cpu_permits<Func, Fut, R>(threads: usize, f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    // Never ask for more permits than exist, or we'd wait forever.
    let wanted = threads.clamp(1, num_cpus::get());
    let permits = u32::try_from(wanted).context("too many CPU permits requested")?;
    let permit = CPU_SEMAPHORE
        .acquire_many(permits)
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}
