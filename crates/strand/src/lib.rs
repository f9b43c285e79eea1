//! Strand is a small coroutine-flavored networking toolkit: a cancellable,
//! backpressured TCP substrate with an HTTP/1.1 server, a streaming HTTP
//! client, a single-flight response cache and an ONC-RPC/XDR server on
//! top. This crate re-exports the workspace behind feature gates.

pub use strand_core as core;
#[doc(no_inline)]
pub use strand_core::*;

/// Single-flight LRU response caching.
#[cfg(feature = "cache")]
#[cfg_attr(docsrs, doc(cfg(feature = "cache")))]
pub mod cache {
    #[doc(no_inline)]
    pub use strand_cache::*;
}

/// ONC-RPC server and XDR codec.
#[cfg(feature = "rpc")]
#[cfg_attr(docsrs, doc(cfg(feature = "rpc")))]
pub mod rpc {
    #[doc(no_inline)]
    pub use strand_rpc::*;
}
