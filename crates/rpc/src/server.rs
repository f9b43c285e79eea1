//! The record-marking RPC server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_stream::try_stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use strand_core::body::ByteStream;
use strand_core::conn::{ByteSource, Chunk, ChunkStream, ConnectionHandler, ServerConfig, TcpServer};
use strand_core::sync::CancellationToken;
use strand_core::{Error, Result};

use crate::record::RecordSource;
use crate::xdr::{XdrEncoder, padded_len};

/// Maximum credential/verifier body length.
pub const MAX_AUTH_SIZE: u32 = 400;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const REPLY_ACCEPTED: u32 = 0;
const LAST_FRAGMENT: u32 = 1 << 31;

/// Why an accepted call did or did not produce results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    /// The call succeeded; results follow.
    Success,
    /// The program is not served here.
    ProgUnavail,
    /// The program version is not served here.
    ProgMismatch,
    /// The procedure is unknown.
    ProcUnavail,
    /// The arguments could not be decoded.
    GarbageArgs,
    /// The server failed internally.
    SystemErr,
}

impl From<AcceptStat> for u32 {
    fn from(stat: AcceptStat) -> Self {
        match stat {
            AcceptStat::Success => 0,
            AcceptStat::ProgUnavail => 1,
            AcceptStat::ProgMismatch => 2,
            AcceptStat::ProcUnavail => 3,
            AcceptStat::GarbageArgs => 4,
            AcceptStat::SystemErr => 5,
        }
    }
}

/// Why a call was denied outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStat {
    /// The RPC version is unsupported.
    RpcMismatch,
    /// Authentication failed.
    AuthError,
}

/// An authentication blob: flavor plus at most [`MAX_AUTH_SIZE`] opaque
/// bytes.
#[derive(Debug, Clone, Default)]
pub struct OpaqueAuth {
    /// Authentication flavor (0 = none).
    pub flavor: u32,
    /// Flavor-specific payload.
    pub body: Bytes,
}

/// The decoded call header plus the still-streaming argument payload.
#[derive(Debug)]
pub struct RpcCall {
    /// RPC protocol version; always 2 once dispatched.
    pub rpcvers: u32,
    /// Program number.
    pub prog: u32,
    /// Program version.
    pub vers: u32,
    /// Procedure number.
    pub proc: u32,
    /// Caller credentials.
    pub cred: OpaqueAuth,
    /// Caller verifier.
    pub verf: OpaqueAuth,
    /// The procedure arguments. Handlers must consume this fully or call
    /// [`RecordSource::drain`] before returning.
    pub data: RecordSource,
}

/// One inbound call.
#[derive(Debug)]
pub struct RpcRequest {
    /// Transaction id, echoed into the reply.
    pub xid: u32,
    /// The call body.
    pub body: RpcCall,
}

/// The reply body.
pub enum RpcReply {
    /// The call was accepted; `data` streams the results.
    Accepted {
        /// Server verifier; non-empty bodies are not implemented.
        verf: OpaqueAuth,
        /// Accept status.
        stat: AcceptStat,
        /// Result payload.
        data: ByteStream,
    },
    /// The call was denied. Emission is not implemented; producing this
    /// closes the connection.
    Denied {
        /// Denial status.
        stat: RejectStat,
    },
}

impl std::fmt::Debug for RpcReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted { stat, .. } => {
                f.debug_struct("Accepted").field("stat", stat).finish_non_exhaustive()
            }
            Self::Denied { stat } => f.debug_struct("Denied").field("stat", stat).finish(),
        }
    }
}

/// One outbound reply.
#[derive(Debug)]
pub struct RpcResponse {
    /// Transaction id; must match the call.
    pub xid: u32,
    /// The reply body.
    pub body: RpcReply,
}

impl RpcResponse {
    /// A successful accepted reply with a null verifier.
    pub fn success(xid: u32, data: ByteStream) -> Self {
        Self {
            xid,
            body: RpcReply::Accepted {
                verf: OpaqueAuth::default(),
                stat: AcceptStat::Success,
                data,
            },
        }
    }
}

/// The dispatcher invoked once per decoded call.
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles one call.
    fn handle(
        &self,
        request: RpcRequest,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<RpcResponse>> + Send;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcResponse>> + Send + 'static,
{
    fn handle(
        &self,
        request: RpcRequest,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<RpcResponse>> + Send {
        self(request, stop)
    }
}

/// An ONC-RPC server bound to one listener.
#[derive(Debug)]
pub struct RpcServer {
    inner: TcpServer,
}

impl RpcServer {
    /// Binds the listener and starts serving.
    pub async fn bind<H: RpcHandler>(handler: H, config: &ServerConfig) -> Result<Self> {
        let inner = TcpServer::bind(
            RpcConnection {
                handler: Arc::new(handler),
            },
            config,
        )
        .await?;
        Ok(Self { inner })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.inner.port()
    }

    /// Stops accepting and waits for in-flight connections to drain.
    pub async fn quit(&self) {
        self.inner.quit().await;
    }
}

struct RpcConnection<H> {
    handler: Arc<H>,
}

impl<H: RpcHandler> ConnectionHandler for RpcConnection<H> {
    fn handle(&self, source: ByteSource, stop: CancellationToken) -> ChunkStream {
        let handler = Arc::clone(&self.handler);
        Box::pin(try_stream! {
            let (last, length) = read_fragment_header(&source).await?;
            let xid = read_u32(&source).await?;
            let msg_type = read_u32(&source).await?;
            if msg_type != MSG_CALL {
                bail(Error::malformed("expected a call message"))?;
            }
            let rpcvers = read_u32(&source).await?;
            if rpcvers != 2 {
                bail(Error::malformed("expected rpcvers = 2"))?;
            }
            let prog = read_u32(&source).await?;
            let vers = read_u32(&source).await?;
            let proc = read_u32(&source).await?;
            let cred = read_auth(&source).await?;
            let verf = read_auth(&source).await?;

            let consumed =
                4 * 10 + padded_len(cred.body.len()) + padded_len(verf.body.len());
            let payload = (length as usize)
                .checked_sub(consumed)
                .ok_or_else(|| Error::malformed("call header overruns fragment"))?;
            let data = RecordSource::new(source.clone(), last, payload as u32);

            let request = RpcRequest {
                xid,
                body: RpcCall {
                    rpcvers,
                    prog,
                    vers,
                    proc,
                    cred,
                    verf,
                    data,
                },
            };
            let response = handler.handle(request, stop.clone()).await?;

            match response.body {
                RpcReply::Denied { stat } => {
                    tracing::error!(?stat, "denied replies are not implemented");
                    bail(Error::runtime("denied replies are not implemented"))?;
                }
                RpcReply::Accepted { verf, stat, data } => {
                    if !verf.body.is_empty() {
                        bail(Error::runtime("non-empty verifier bodies are not implemented"))?;
                    }
                    let mut head = XdrEncoder::new();
                    head.put_u32(response.xid)
                        .put_u32(MSG_REPLY)
                        .put_u32(REPLY_ACCEPTED)
                        .put_u32(verf.flavor)
                        .put_u32(0)
                        .put_enum(stat);

                    // One chunk of lookahead: a fragment header can only be
                    // written once it is known whether its payload is last.
                    let mut head = Some(head.into_bytes());
                    let mut data = data;
                    let mut pending: Option<Bytes> = None;
                    while let Some(piece) = data.next().await.transpose()? {
                        if piece.is_empty() {
                            continue;
                        }
                        let merged = match head.take() {
                            Some(head_bytes) => concat(head_bytes, piece),
                            None => piece,
                        };
                        if let Some(previous) = pending.replace(merged) {
                            yield fragment(previous, false);
                        }
                    }
                    let final_piece = match (pending, head) {
                        (Some(piece), _) => piece,
                        (None, Some(head_bytes)) => head_bytes,
                        (None, None) => unreachable!("reply head consumed without a pending chunk"),
                    };
                    yield fragment(final_piece, true);
                }
            }
        })
    }
}

fn bail(error: Error) -> Result<()> {
    Err(error)
}

async fn read_fragment_header(source: &ByteSource) -> Result<(bool, u32)> {
    let value = read_u32(source).await?;
    Ok((value & LAST_FRAGMENT != 0, value & !LAST_FRAGMENT))
}

async fn read_u32(source: &ByteSource) -> Result<u32> {
    let data = source.read(4).await?;
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Reads an auth blob from the raw stream; the call header is not split
/// across fragments.
async fn read_auth(source: &ByteSource) -> Result<OpaqueAuth> {
    let flavor = read_u32(source).await?;
    let len = read_u32(source).await?;
    if len > MAX_AUTH_SIZE {
        return Err(Error::malformed("opaque length too long"));
    }
    let body = source.read(len).await?;
    let padding = (padded_len(len as usize) - len as usize) as u32;
    source.read(padding).await?;
    Ok(OpaqueAuth { flavor, body })
}

fn concat(head: Bytes, tail: Bytes) -> Bytes {
    let mut merged = BytesMut::with_capacity(head.len() + tail.len());
    merged.put_slice(&head);
    merged.put_slice(&tail);
    merged.freeze()
}

fn fragment(data: Bytes, last: bool) -> Chunk {
    let mut framed = BytesMut::with_capacity(4 + data.len());
    let header = data.len() as u32 | if last { LAST_FRAGMENT } else { 0 };
    framed.put_u32(header);
    framed.put_slice(&data);
    Chunk::Bytes(framed.freeze())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;
    use crate::xdr::XdrDecoder;
    use strand_core::body;

    const PORTMAP_PROG: u32 = 100_000;
    const PORTMAP_GETPORT: u32 = 3;
    const NFS_PORT: u32 = 2049;

    /// Encodes a call header (without the fragment framing).
    fn call_bytes(xid: u32, prog: u32, vers: u32, proc: u32, payload: &[u8]) -> Bytes {
        let mut call = XdrEncoder::new();
        call.put_u32(xid)
            .put_u32(MSG_CALL)
            .put_u32(2)
            .put_u32(prog)
            .put_u32(vers)
            .put_u32(proc)
            .put_u32(0)
            .put_opaque(&[])
            .put_u32(0)
            .put_opaque(&[]);
        call.put_opaque_fixed(payload);
        call.into_bytes()
    }

    fn framed(payload: &[u8], last: bool) -> Vec<u8> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        let header = payload.len() as u32 | if last { LAST_FRAGMENT } else { 0 };
        framed.extend_from_slice(&header.to_be_bytes());
        framed.extend_from_slice(payload);
        framed
    }

    async fn read_reply(stream: &mut TcpStream) -> (bool, Vec<u8>) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let value = u32::from_be_bytes(header);
        let mut payload = vec![0u8; (value & !LAST_FRAGMENT) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        (value & LAST_FRAGMENT != 0, payload)
    }

    async fn portmap_handler(
        mut request: RpcRequest,
        _stop: CancellationToken,
    ) -> Result<RpcResponse> {
        assert_eq!(request.body.prog, PORTMAP_PROG);
        assert_eq!(request.body.vers, 2);
        assert_eq!(request.body.proc, PORTMAP_GETPORT);

        let prog = request.body.data.read_u32().await?;
        let vers = request.body.data.read_u32().await?;
        let prot = request.body.data.read_u32().await?;
        let _port = request.body.data.read_u32().await?;
        request.body.data.drain().await?;
        assert_eq!((prog, vers, prot), (100_003, 3, 6));

        let mut result = XdrEncoder::new();
        result.put_u32(NFS_PORT);
        Ok(RpcResponse::success(request.xid, body::full(result.into_bytes())))
    }

    #[tokio::test]
    async fn portmapper_getport_round_trip() {
        let server = RpcServer::bind(portmap_handler, &ServerConfig::default())
            .await
            .unwrap();

        let mut arguments = XdrEncoder::new();
        arguments
            .put_u32(100_003)
            .put_u32(3)
            .put_u32(6)
            .put_u32(0);
        let call = call_bytes(0x2137, PORTMAP_PROG, 2, PORTMAP_GETPORT, &arguments.into_bytes());

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&framed(&call, true)).await.unwrap();

        let (last, payload) = read_reply(&mut client).await;
        assert!(last);
        let mut reply = XdrDecoder::new(&payload);
        assert_eq!(reply.get_u32().unwrap(), 0x2137);
        assert_eq!(reply.get_u32().unwrap(), MSG_REPLY);
        assert_eq!(reply.get_u32().unwrap(), REPLY_ACCEPTED);
        assert_eq!(reply.get_u32().unwrap(), 0); // verifier flavor
        assert_eq!(reply.get_u32().unwrap(), 0); // verifier length
        assert_eq!(reply.get_u32().unwrap(), u32::from(AcceptStat::Success));
        assert_eq!(reply.get_u32().unwrap(), NFS_PORT);
        assert_eq!(reply.remaining(), 0);
        server.quit().await;
    }

    async fn echo_handler(
        mut request: RpcRequest,
        _stop: CancellationToken,
    ) -> Result<RpcResponse> {
        let mut echoed = BytesMut::new();
        loop {
            let piece = request.body.data.read(u32::MAX).await?;
            if piece.is_empty() {
                break;
            }
            echoed.extend_from_slice(&piece);
        }
        Ok(RpcResponse::success(
            request.xid,
            body::full(echoed.freeze()),
        ))
    }

    #[tokio::test]
    async fn reassembles_multi_fragment_calls() {
        let server = RpcServer::bind(echo_handler, &ServerConfig::default())
            .await
            .unwrap();

        let call = call_bytes(7, 1, 1, 1, b"hello 00");
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        // First fragment: the call header plus half the payload; second
        // fragment: the rest.
        client.write_all(&framed(&call, false)).await.unwrap();
        client.write_all(&framed(b"world 00", true)).await.unwrap();

        let (last, payload) = read_reply(&mut client).await;
        assert!(last);
        assert_eq!(&payload[24..], b"hello 00world 00");
        server.quit().await;
    }

    #[tokio::test]
    async fn streams_multi_fragment_replies() {
        let handler = |mut request: RpcRequest, _stop: CancellationToken| async move {
            request.body.data.drain().await?;
            let stream: ByteStream = Box::pin(async_stream::try_stream! {
                yield Bytes::from_static(b"part-one");
                yield Bytes::from_static(b"part-two");
            });
            Ok(RpcResponse::success(request.xid, stream))
        };
        let server = RpcServer::bind(handler, &ServerConfig::default())
            .await
            .unwrap();

        let call = call_bytes(1, 1, 1, 1, &[]);
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&framed(&call, true)).await.unwrap();

        let (first_last, first) = read_reply(&mut client).await;
        assert!(!first_last);
        assert_eq!(&first[24..], b"part-one");
        let (second_last, second) = read_reply(&mut client).await;
        assert!(second_last);
        assert_eq!(&second[..], b"part-two");
        server.quit().await;
    }

    #[tokio::test]
    async fn serves_sequential_calls_on_one_connection() {
        let server = RpcServer::bind(echo_handler, &ServerConfig::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        for xid in [1u32, 2] {
            let call = call_bytes(xid, 1, 1, 1, b"ping");
            client.write_all(&framed(&call, true)).await.unwrap();
            let (last, payload) = read_reply(&mut client).await;
            assert!(last);
            let mut reply = XdrDecoder::new(&payload);
            assert_eq!(reply.get_u32().unwrap(), xid);
        }
        server.quit().await;
    }

    #[tokio::test]
    async fn reading_past_the_record_is_buffer_underflow() {
        let handler = |mut request: RpcRequest, _stop: CancellationToken| async move {
            let error = request.body.data.read(64).await.unwrap_err();
            let message = format!("{error}");
            Ok(RpcResponse::success(
                request.xid,
                body::full(Bytes::from(message)),
            ))
        };
        let server = RpcServer::bind(handler, &ServerConfig::default())
            .await
            .unwrap();

        let call = call_bytes(9, 1, 1, 1, b"tiny");
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&framed(&call, true)).await.unwrap();
        let (_, payload) = read_reply(&mut client).await;
        let text = String::from_utf8_lossy(&payload[24..]).into_owned();
        assert!(text.contains("buffer underflow"));
        server.quit().await;
    }

    #[tokio::test]
    async fn rejects_wrong_rpc_version() {
        let server = RpcServer::bind(echo_handler, &ServerConfig::default())
            .await
            .unwrap();

        let mut call = XdrEncoder::new();
        call.put_u32(5)
            .put_u32(MSG_CALL)
            .put_u32(3) // rpcvers
            .put_u32(1)
            .put_u32(1)
            .put_u32(1)
            .put_u32(0)
            .put_opaque(&[])
            .put_u32(0)
            .put_opaque(&[]);

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(&framed(&call.into_bytes(), true))
            .await
            .unwrap();

        // The server closes the connection without replying.
        let mut buffer = [0u8; 1];
        let closed = timeout(Duration::from_secs(5), client.read(&mut buffer))
            .await
            .expect("server should close the connection");
        assert_eq!(closed.unwrap(), 0);
        server.quit().await;
    }
}
