//! Cooperative synchronization primitives.
//!
//! Tasks in this toolkit interleave only at explicit suspension points, so
//! these primitives exist to order cooperative tasks, not threads:
//!
//! - [`promise`]: a single-assignment cell bridging one producer and one
//!   consumer, with cancellable waiting.
//! - [`SharedPromise`]: coalesces any number of consumers onto a single
//!   producer execution (the single-flight building block).
//! - [`Mutex`] / [`RwLock`]: re-exported tokio locks. The tokio mutex wakes
//!   waiters in FIFO order, and the tokio rwlock queues fairly, so a
//!   pending writer blocks later readers while active readers drain:
//!   exactly the disciplines this toolkit relies on; the tests below pin
//!   them.
//! - [`stop`]: stop-token helpers (merging, deadline sources).

mod promise;
mod shared;
pub mod stop;

pub use promise::{Promise, Resolver, promise};
pub use shared::SharedPromise;
pub use stop::CancellationToken;
pub use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn mutex_wakes_waiters_in_fifo_order() {
        let mutex = Arc::new(Mutex::new(()));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let held = mutex.clone().lock_owned().await;
        let mut waiters = Vec::new();
        for i in 0..4 {
            let mutex = mutex.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let _guard = mutex.lock().await;
                order.lock().unwrap().push(i);
            }));
            // Give each waiter time to enqueue before the next one.
            tokio::task::yield_now().await;
        }
        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn rwlock_prefers_pending_writers() {
        let lock = Arc::new(RwLock::new(0u32));
        let reader = lock.clone().read_owned().await;

        let writer = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let mut value = lock.write().await;
                *value = 1;
            })
        };
        tokio::task::yield_now().await;

        // A reader arriving behind the queued writer must not jump it.
        let late_reads = Arc::new(AtomicUsize::new(0));
        let late = {
            let lock = lock.clone();
            let late_reads = late_reads.clone();
            tokio::spawn(async move {
                let value = lock.read().await;
                late_reads.store(1, Ordering::SeqCst);
                assert_eq!(*value, 1);
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(late_reads.load(Ordering::SeqCst), 0);

        drop(reader);
        writer.await.unwrap();
        late.await.unwrap();
        assert_eq!(late_reads.load(Ordering::SeqCst), 1);
    }
}
