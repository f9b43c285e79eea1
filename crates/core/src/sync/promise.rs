use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Creates a connected [`Resolver`]/[`Promise`] pair.
///
/// The resolver side assigns the cell exactly once, with either a value or
/// an error; the promise side waits for the assignment. Dropping the
/// resolver unresolved fails the waiter.
///
/// ```
/// # use strand_core::sync::{promise, CancellationToken};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (resolver, promise) = promise::<u32>();
/// resolver.resolve(7);
/// assert_eq!(promise.wait(&CancellationToken::new()).await.unwrap(), 7);
/// # }
/// ```
pub fn promise<T>() -> (Resolver<T>, Promise<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Promise { rx })
}

/// The producer side of a [`promise`]: assigns the cell at most once.
#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Resolver<T> {
    /// Resolves the promise with a value.
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    /// Rejects the promise with an error.
    pub fn reject(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    /// Whether the consumer is still waiting.
    pub fn has_waiter(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The consumer side of a [`promise`].
#[derive(Debug)]
pub struct Promise<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Promise<T> {
    /// Waits for the resolver, or fails with [`Error::Cancelled`] when the
    /// stop token fires first.
    pub async fn wait(self, stop: &CancellationToken) -> Result<T> {
        tokio::select! {
            result = self.rx => result.map_err(|_| Error::runtime("promise abandoned"))?,
            _ = stop.cancelled() => Err(Error::Cancelled),
        }
    }
}

impl<T> IntoFuture for Promise<T>
where
    T: Send + 'static,
{
    type Output = Result<T>;
    type IntoFuture = futures_util::future::BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.rx
                .await
                .map_err(|_| Error::runtime("promise abandoned"))?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_value() {
        let (resolver, promise) = promise::<&str>();
        resolver.resolve("done");
        assert_eq!(promise.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn rejects_with_error() {
        let (resolver, promise) = promise::<()>();
        resolver.reject(Error::Aborted);
        assert_eq!(promise.await.unwrap_err(), Error::Aborted);
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let (resolver, promise) = promise::<()>();
        let stop = CancellationToken::new();
        stop.cancel();
        assert_eq!(promise.wait(&stop).await.unwrap_err(), Error::Cancelled);
        assert!(!resolver.has_waiter());
    }

    #[tokio::test]
    async fn abandoned_resolver_fails_the_waiter() {
        let (resolver, promise) = promise::<()>();
        drop(resolver);
        assert!(matches!(promise.await.unwrap_err(), Error::Runtime(_)));
    }
}
