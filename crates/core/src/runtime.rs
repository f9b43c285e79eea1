//! Event-loop adapter: timers, detached tasks and the blocking pool.
//!
//! The toolkit runs on the ambient tokio runtime; this module carries the
//! few loop-level operations the protocol engines need. Nothing here adds
//! parallelism to request handling; [`offload`] is the only escape to
//! another thread, and its result is always consumed back on the runtime.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sleeps for `duration`, or fails with [`Error::Cancelled`] as soon as the
/// stop token fires.
pub async fn sleep(duration: Duration, stop: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = stop.cancelled() => Err(Error::Cancelled),
    }
}

/// Spawns a fire-and-forget task.
///
/// Detached tasks swallow [`Error::Cancelled`] and [`Error::Aborted`]
/// quietly; any other failure is logged at error level. A detached task
/// never takes the process down.
pub fn detach<F>(task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(()) => {}
            Err(error) if error.is_disconnect() => {
                tracing::trace!(%error, "detached task stopped");
            }
            Err(error) => {
                tracing::error!(%error, "detached task failed");
            }
        }
    });
}

/// Runs a blocking closure on the blocking pool and resumes the caller on
/// the async runtime with its result.
pub async fn offload<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(func)
        .await
        .map_err(|error| Error::runtime(format!("blocking task failed: {error}")))
}

/// A cloneable handle onto the running runtime for code living on foreign
/// threads.
#[derive(Debug, Clone)]
pub struct Remote {
    handle: tokio::runtime::Handle,
}

impl Remote {
    /// Captures the current runtime. Must be called from async context.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Enqueues a future onto the runtime and returns immediately.
    pub fn run<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }

    /// Runs a future on the runtime and blocks the calling thread until it
    /// completes, propagating its result.
    ///
    /// Must not be called from the runtime itself: that would block the
    /// thread the future needs.
    pub fn call<F, R>(&self, task: F) -> Result<R>
    where
        F: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let _ = tx.send(task.await);
        });
        rx.recv()
            .map_err(|_| Error::runtime("runtime dropped the call"))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let stop = CancellationToken::new();
        sleep(Duration::from_millis(1), &stop).await.unwrap();
    }

    #[tokio::test]
    async fn sleep_observes_cancellation() {
        let stop = CancellationToken::new();
        stop.cancel();
        let result = sleep(Duration::from_secs(60), &stop).await;
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn offload_runs_off_the_runtime_and_returns() {
        let value = offload(|| 2 + 2).await.unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn detached_cancellation_is_silent() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        detach(async move {
            flag.store(true, Ordering::SeqCst);
            Err(Error::Cancelled)
        });
        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn remote_call_round_trips_from_a_foreign_thread() {
        let remote = Remote::current();
        let result = offload(move || remote.call(async { Ok::<_, Error>(21 * 2) }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, 42);
    }
}
