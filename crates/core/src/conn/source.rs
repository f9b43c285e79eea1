use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::MAX_BUFFER_SIZE;
use crate::{Error, Result};

/// The pull side of a connection: a cloneable handle onto the connection's
/// read buffer.
///
/// The buffer is filled by the connection's pump task and capped at
/// [`MAX_BUFFER_SIZE`]; readers waiting for bytes are woken as data
/// arrives. Peer EOF cancels the connection token, so a read that can no
/// longer be satisfied fails with [`Error::Aborted`].
#[derive(Clone)]
pub struct ByteSource {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    stop: CancellationToken,
}

struct State {
    buffer: BytesMut,
    eof: bool,
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ByteSource")
            .field("buffered", &state.buffer.len())
            .field("eof", &state.eof)
            .finish()
    }
}

impl ByteSource {
    pub(crate) fn new(stop: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: BytesMut::new(),
                    eof: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                stop,
            }),
        }
    }

    /// Reads from the connection.
    ///
    /// - `count == u32::MAX`: returns whatever is buffered (at most
    ///   [`MAX_BUFFER_SIZE`] bytes), waiting for at least one byte; an
    ///   empty result means the peer closed after everything buffered was
    ///   consumed.
    /// - `count == 0`: returns an empty buffer immediately.
    /// - otherwise: returns exactly `count` bytes, suspending until they
    ///   arrived, or fails with [`Error::Aborted`] if the peer closed
    ///   first. Asking for more than [`MAX_BUFFER_SIZE`] is a programming
    ///   error.
    pub async fn read(&self, count: u32) -> Result<Bytes> {
        if count == 0 {
            return Ok(Bytes::new());
        }
        if count != u32::MAX && count as usize > MAX_BUFFER_SIZE {
            return Err(Error::invalid_argument(
                "requested chunk exceeds the read watermark",
            ));
        }
        if count == u32::MAX {
            self.read_any().await
        } else {
            self.read_exact(count as usize).await
        }
    }

    /// Pushes parsed-but-unconsumed bytes back to the front of the buffer.
    pub fn unread(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            let mut merged = BytesMut::with_capacity(data.len() + state.buffer.len());
            merged.extend_from_slice(&data);
            merged.extend_from_slice(&state.buffer);
            state.buffer = merged;
        }
        self.shared.readable.notify_one();
    }

    /// Consumes and discards everything until the peer closes.
    pub async fn drain(&self) -> Result<()> {
        loop {
            if self.read(u32::MAX).await?.is_empty() {
                return Ok(());
            }
        }
    }

    async fn read_any(&self) -> Result<Bytes> {
        loop {
            let wait = {
                let mut state = self.shared.state.lock();
                if !state.buffer.is_empty() {
                    let len = state.buffer.len().min(MAX_BUFFER_SIZE);
                    let data = state.buffer.split_to(len).freeze();
                    drop(state);
                    self.shared.writable.notify_one();
                    return Ok(data);
                }
                if state.eof {
                    return Ok(Bytes::new());
                }
                self.shared.readable.notified()
            };
            self.wait_readable(wait).await?;
        }
    }

    async fn read_exact(&self, count: usize) -> Result<Bytes> {
        loop {
            let wait = {
                let mut state = self.shared.state.lock();
                if state.buffer.len() >= count {
                    let data = state.buffer.split_to(count).freeze();
                    drop(state);
                    self.shared.writable.notify_one();
                    return Ok(data);
                }
                if state.eof {
                    return Err(Error::Aborted);
                }
                self.shared.readable.notified()
            };
            self.wait_readable(wait).await?;
        }
    }

    async fn wait_readable(&self, wait: tokio::sync::futures::Notified<'_>) -> Result<()> {
        if self.shared.stop.is_cancelled() {
            return Err(Error::Aborted);
        }
        tokio::select! {
            _ = wait => Ok(()),
            _ = self.shared.stop.cancelled() => Err(Error::Aborted),
        }
    }

    /// Appends bytes received from the socket. Pump side.
    pub(crate) fn push(&self, data: Bytes) {
        {
            let mut state = self.shared.state.lock();
            state.buffer.extend_from_slice(&data);
        }
        self.shared.readable.notify_one();
    }

    /// Marks end of input and cancels the connection token. Pump side.
    pub(crate) fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.eof = true;
        }
        self.shared.readable.notify_waiters();
        self.shared.stop.cancel();
    }

    /// Waits until the buffer is below the watermark; `false` once the
    /// connection token fired. Pump side.
    pub(crate) async fn wait_capacity(&self) -> bool {
        loop {
            let wait = {
                let state = self.shared.state.lock();
                if state.buffer.len() < MAX_BUFFER_SIZE {
                    return true;
                }
                self.shared.writable.notified()
            };
            if self.shared.stop.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = wait => {}
                _ = self.shared.stop.cancelled() => return false,
            }
        }
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.shared.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ByteSource {
        ByteSource::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn zero_read_is_empty() {
        assert!(source().read(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_read_is_rejected() {
        let result = source().read(MAX_BUFFER_SIZE as u32 + 1).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn exact_read_waits_for_enough_bytes() {
        let source = source();
        let reader = {
            let source = source.clone();
            tokio::spawn(async move { source.read(5).await })
        };
        source.push(Bytes::from("he"));
        tokio::task::yield_now().await;
        source.push(Bytes::from("llo!"));
        assert_eq!(reader.await.unwrap().unwrap(), Bytes::from("hello"));
        assert_eq!(source.read(u32::MAX).await.unwrap(), Bytes::from("!"));
    }

    #[tokio::test]
    async fn exact_read_fails_when_peer_closes_short() {
        let source = source();
        source.push(Bytes::from("hi"));
        source.close();
        assert_eq!(source.read(4).await.unwrap_err(), Error::Aborted);
    }

    #[tokio::test]
    async fn any_read_returns_empty_at_eof() {
        let source = source();
        source.push(Bytes::from("data"));
        source.close();
        assert_eq!(source.read(u32::MAX).await.unwrap(), Bytes::from("data"));
        assert!(source.read(u32::MAX).await.unwrap().is_empty());
        source.drain().await.unwrap();
    }

    #[tokio::test]
    async fn unread_bytes_come_back_first() {
        let source = source();
        source.push(Bytes::from("world"));
        source.unread(Bytes::from("hello "));
        assert_eq!(source.read(11).await.unwrap(), Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn pending_read_aborts_on_stop() {
        let stop = CancellationToken::new();
        let source = ByteSource::new(stop.clone());
        let reader = {
            let source = source.clone();
            tokio::spawn(async move { source.read(1).await })
        };
        tokio::task::yield_now().await;
        stop.cancel();
        assert_eq!(reader.await.unwrap().unwrap_err(), Error::Aborted);
    }
}
