use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{ByteSource, ConnectionHandler, MAX_BUFFER_SIZE};
use crate::{Error, Result};

/// Listener configuration. `port` 0 binds an ephemeral port; both IPv4 and
/// IPv6 addresses are accepted.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `"127.0.0.1"` or `"::1"`.
    pub address: String,
    /// Port to bind; 0 for an ephemeral port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_owned(),
            port: 0,
        }
    }
}

/// A TCP server feeding every accepted connection to a
/// [`ConnectionHandler`].
///
/// The server accepts until [`quit`](Self::quit) is called; `quit` stops
/// accepting, cancels every connection's stop token through the shared
/// server token, and waits for all connection tasks to release their
/// resources.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl TcpServer {
    /// Binds the listener and starts accepting.
    pub async fn bind<H: ConnectionHandler>(handler: H, config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        tokio::spawn(accept_loop(
            listener,
            Arc::new(handler),
            stop.clone(),
            tracker.clone(),
        ));
        tracing::debug!(%local_addr, "listening");
        Ok(Self {
            local_addr,
            stop,
            tracker,
        })
    }

    /// The bound address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops accepting, aborts pending connection I/O and waits until every
    /// in-flight connection has drained. Idempotent.
    pub async fn quit(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(local_addr = %self.local_addr, "server stopped");
    }
}

async fn accept_loop<H: ConnectionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let handler = Arc::clone(&handler);
                let conn_stop = stop.child_token();
                tracker.spawn(serve_connection(stream, peer, handler, conn_stop));
            }
            Err(error) => {
                tracing::error!(%error, "accept failed");
            }
        }
    }
    // Dropping the listener here releases the socket once quit is requested.
}

async fn serve_connection<H: ConnectionHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    stop: CancellationToken,
) {
    tracing::trace!(%peer, "connection opened");
    let (read_half, mut write_half) = stream.into_split();
    let source = ByteSource::new(stop.clone());
    let pump = tokio::spawn(pump_loop(read_half, source.clone()));

    let result = drive(handler.as_ref(), &source, &mut write_half, &stop).await;
    stop.cancel();
    pump.abort();
    match result {
        Ok(()) => {}
        Err(error) if error.is_disconnect() => tracing::trace!(%peer, "connection closed"),
        Err(error) => tracing::error!(%peer, %error, "connection failed"),
    }
}

/// Socket → buffer pump. Pauses at the watermark; peer EOF or a transport
/// error marks the source closed, which also cancels the connection token.
async fn pump_loop(mut read_half: OwnedReadHalf, source: ByteSource) {
    let stop = source.stop_token();
    loop {
        if !source.wait_capacity().await {
            break;
        }
        let mut chunk = BytesMut::with_capacity(MAX_BUFFER_SIZE);
        let received = tokio::select! {
            received = read_half.read_buf(&mut chunk) => received,
            _ = stop.cancelled() => break,
        };
        match received {
            Ok(0) | Err(_) => break,
            Ok(_) => source.push(chunk.freeze()),
        }
    }
    source.close();
}

async fn drive<H: ConnectionHandler>(
    handler: &H,
    source: &ByteSource,
    write_half: &mut OwnedWriteHalf,
    stop: &CancellationToken,
) -> Result<()> {
    loop {
        if stop.is_cancelled() {
            return Err(Error::Aborted);
        }
        let mut chunks = handler.handle(source.clone(), stop.clone());
        loop {
            let next = tokio::select! {
                next = chunks.next() => next,
                _ = stop.cancelled() => return Err(Error::Aborted),
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let written = tokio::select! {
                written = write_half.write_all(chunk.as_bytes()) => written,
                _ = stop.cancelled() => return Err(Error::Aborted),
            };
            written.map_err(|_| Error::Aborted)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_stream::try_stream;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::conn::{Chunk, ChunkStream};

    struct Echo;

    impl ConnectionHandler for Echo {
        fn handle(&self, source: ByteSource, _stop: CancellationToken) -> ChunkStream {
            Box::pin(try_stream! {
                loop {
                    let data = source.read(u32::MAX).await?;
                    if data.is_empty() {
                        break;
                    }
                    yield Chunk::Bytes(data);
                }
            })
        }
    }

    /// Replies with a fixed-size frame: 4 bytes of length-free payload.
    struct FixedFrame;

    impl ConnectionHandler for FixedFrame {
        fn handle(&self, source: ByteSource, _stop: CancellationToken) -> ChunkStream {
            Box::pin(try_stream! {
                let payload = source.read(4).await?;
                yield Chunk::Bytes(payload);
            })
        }
    }

    async fn connect(server: &TcpServer) -> TcpStream {
        TcpStream::connect(server.local_addr()).await.unwrap()
    }

    #[tokio::test]
    async fn echoes_bytes_back() {
        let server = TcpServer::bind(Echo, &ServerConfig::default()).await.unwrap();
        let mut client = connect(&server).await;
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        drop(client);
        server.quit().await;
    }

    #[tokio::test]
    async fn exact_reads_span_socket_writes() {
        let server = TcpServer::bind(FixedFrame, &ServerConfig::default())
            .await
            .unwrap();
        let mut client = connect(&server).await;
        client.write_all(b"ab").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"cd").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"abcd");
        server.quit().await;
    }

    #[tokio::test]
    async fn handler_is_reinvoked_per_message() {
        let server = TcpServer::bind(FixedFrame, &ServerConfig::default())
            .await
            .unwrap();
        let mut client = connect(&server).await;
        client.write_all(b"firstnext").await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"firstnex");
        server.quit().await;
    }

    #[tokio::test]
    async fn quit_aborts_open_connections() {
        let server = TcpServer::bind(Echo, &ServerConfig::default()).await.unwrap();
        let mut client = connect(&server).await;
        client.write_all(b"hi").await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), server.quit())
            .await
            .expect("quit must drain connections");
        // The peer observes the close.
        assert_eq!(client.read(&mut reply).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn binds_ipv6_when_asked() {
        let config = ServerConfig {
            address: "::1".to_owned(),
            port: 0,
        };
        if let Ok(server) = TcpServer::bind(Echo, &config).await {
            let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
            client.write_all(b"6").await.unwrap();
            let mut reply = [0u8; 1];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"6");
            server.quit().await;
        }
    }
}
