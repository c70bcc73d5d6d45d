//! Deferred callbacks for storage-consistency delays.
//!
//! The coordinator schedules fire-and-forget tasks that run after the
//! backing store's replicas have had time to catch up (for example,
//! releasing an in-progress slot a few seconds after a reclaim).  Handlers
//! must tolerate being cancelled by instance teardown, so they re-check
//! state membership before mutating anything.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Run `task` after `delay` on the runtime, detached from the caller.
///
/// The returned handle can be used to cancel or await the callback; most
/// call sites drop it.
pub fn defer<F>(delay: Duration, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runs_after_the_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        defer(Duration::from_secs(3), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_the_handle_cancels_the_callback() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = defer(Duration::from_secs(1), async move {
            flag.store(true, Ordering::SeqCst);
        });
        handle.abort();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
