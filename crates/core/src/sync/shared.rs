use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// A single-flight cell: many consumers, one producer execution.
///
/// The producer starts on the first [`get`](Self::get) and runs detached; a
/// consumer cancelling its own wait does not cancel the producer or the
/// other consumers. Every consumer observes a clone of the same outcome.
pub struct SharedPromise<T: Clone> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Clone> {
    producer: Mutex<Option<BoxFuture<'static, Result<T>>>>,
    tx: watch::Sender<Option<Result<T>>>,
    rx: watch::Receiver<Option<Result<T>>>,
}

impl<T: Clone> Clone for SharedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> std::fmt::Debug for SharedPromise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPromise").finish_non_exhaustive()
    }
}

impl<T> SharedPromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wraps `producer` without starting it.
    pub fn new<F>(producer: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                producer: Mutex::new(Some(Box::pin(producer))),
                tx,
                rx,
            }),
        }
    }

    /// Waits for the shared outcome, starting the producer if this is the
    /// first caller. Fails with [`Error::Cancelled`] when `stop` fires,
    /// leaving the producer and the other waiters untouched.
    pub async fn get(&self, stop: &CancellationToken) -> Result<T> {
        if let Some(producer) = self.inner.producer.lock().take() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let result = producer.await;
                let _ = inner.tx.send(Some(result));
            });
        }
        let mut rx = self.inner.rx.clone();
        tokio::select! {
            changed = rx.wait_for(|slot| slot.is_some()) => match changed {
                Ok(slot) => (*slot).clone().unwrap_or_else(|| Err(Error::runtime("shared producer lost"))),
                Err(_) => Err(Error::runtime("shared producer lost")),
            },
            _ = stop.cancelled() => Err(Error::Cancelled),
        }
    }
}
