//! ONC-RPC over TCP for the Strand toolkit.
//!
//! Two layers:
//!
//! - [`xdr`]: big-endian XDR primitives (integers, booleans, opaque data,
//!   strings, optionals), every encoded length a multiple of four;
//! - [`server`]: a record-marking RPC server on the Strand TCP substrate:
//!   fragment reassembly on the way in ([`RecordSource`]), call dispatch,
//!   and streamed reply framing with the final fragment flagged.

pub mod record;
pub mod server;
pub mod xdr;

pub use record::RecordSource;
pub use server::{
    AcceptStat, OpaqueAuth, RejectStat, RpcCall, RpcHandler, RpcReply, RpcRequest, RpcResponse,
    RpcServer,
};
