//! Stop-token helpers.
//!
//! A [`CancellationToken`] is the observer/controller pair of the toolkit:
//! the holder of the token requests stop at most once, observers either
//! poll [`is_cancelled`](CancellationToken::is_cancelled) or await
//! [`cancelled`](CancellationToken::cancelled) inside a `select!`.
//! Server-wide → per-connection linkage uses
//! [`child_token`](CancellationToken::child_token).

use std::ops::Deref;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// A token that fires when *either* input token fires.
///
/// Holds a forwarding task; dropping the [`MergedToken`] unlinks it from
/// its inputs.
#[derive(Debug)]
pub struct MergedToken {
    token: CancellationToken,
    watcher: tokio::task::JoinHandle<()>,
}

impl Deref for MergedToken {
    type Target = CancellationToken;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl Drop for MergedToken {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl MergedToken {
    /// The merged token itself, detachable from the guard's lifetime only
    /// in the fired state.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Merges two stop tokens into one that fires when either input fires.
pub fn merged(a: &CancellationToken, b: &CancellationToken) -> MergedToken {
    let token = CancellationToken::new();
    let fused = token.clone();
    let (a, b) = (a.clone(), b.clone());
    let watcher = tokio::spawn(async move {
        tokio::select! {
            _ = a.cancelled() => {}
            _ = b.cancelled() => {}
        }
        fused.cancel();
    });
    MergedToken { token, watcher }
}

/// A token that fires after `delay`, the toolkit's timeout idiom: link the
/// returned token (or a [`merged`] combination) to the operation to bound.
pub fn stop_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}
