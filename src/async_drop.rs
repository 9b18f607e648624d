use std::future::Future;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Enables executing async teardown within synchronous `Drop` implementations.
///
/// `block_on` alone must not be called from within the runtime, it could deadlock when the
/// current thread is needed to drive the very task we are waiting on. `block_in_place` first
/// hands the other tasks of this worker thread to the rest of the pool, then lets us block.
/// That hand-off only exists on the multithreaded runtime, so use
/// `#[tokio::test(flavor = "multi_thread")]` in tests relying on drop-time teardown.
///
/// Returns `false`, without polling `future`, when there is no runtime or the current runtime is
/// single threaded. The caller must then fall back to a synchronous cleanup.
pub(crate) fn run_future(future: impl Future<Output = ()>) -> bool {
    let Ok(handle) = Handle::try_current() else {
        return false;
    };
    if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
        return false;
    }
    tokio::task::block_in_place(|| handle.block_on(future));
    true
}
