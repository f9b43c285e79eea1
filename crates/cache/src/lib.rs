//! Single-flight LRU caching for Strand HTTP clients.
//!
//! [`CachedClient`] wraps any [`HttpClient`] and serves repeated lookups
//! from memory:
//!
//! - only exchanges that look like API traffic are cached (an `Accept` of
//!   JSON or XML, and a compatible `Content-Type` if any);
//! - concurrent misses for the same key coalesce onto one upstream fetch;
//! - entries go stale after a configurable window, when the upstream
//!   reported an error status, or when any state-changing request runs;
//! - the key is the whole exchange: URL, method, the header list in order,
//!   and the fully materialized request body.
//!
//! ```no_run
//! use strand_cache::CachedClient;
//! use strand_core::client::{Client, HttpClient};
//! use strand_core::http::Request;
//! use strand_core::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> strand_core::Result<()> {
//! let client = CachedClient::new(Client::new());
//! let request = Request::new("http://example.com/api").header("Accept", "application/json");
//! let response = client.fetch(request, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use strand_core::body;
use strand_core::client::HttpClient;
use strand_core::http::{
    Body, Headers, Method, Request, RequestFlag, Response, get_header, has_header,
};
use strand_core::sync::{CancellationToken, SharedPromise};
use strand_core::Result;

use store::LruStore;

/// Capacity and freshness knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached responses.
    pub capacity: usize,
    /// Entries older than this are re-fetched.
    pub max_staleness: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_staleness: Duration::from_millis(10_000),
        }
    }
}

/// The cache key: one whole exchange. Header equality is order-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    url: String,
    method: Method,
    headers: Headers,
    body: Bytes,
}

impl CacheKey {
    fn to_request(&self) -> Request {
        Request {
            url: self.url.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: if self.body.is_empty() {
                Body::Empty
            } else {
                Body::Full(self.body.clone())
            },
            flags: Default::default(),
        }
    }
}

/// A fully materialized response plus its creation time.
#[derive(Debug, Clone)]
struct CachedResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
    timestamp_ms: u64,
}

struct CacheState {
    entries: LruStore<CacheKey, CachedResponse>,
    pending: HashMap<CacheKey, SharedPromise<CachedResponse>>,
    last_invalidate_ms: u64,
}

/// An [`HttpClient`] middleware adding a single-flight LRU response cache.
pub struct CachedClient<C> {
    inner: Arc<C>,
    state: Arc<Mutex<CacheState>>,
    config: CacheConfig,
    stop: CancellationToken,
}

impl<C> std::fmt::Debug for CachedClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedClient").finish_non_exhaustive()
    }
}

impl<C> Drop for CachedClient<C> {
    fn drop(&mut self) {
        // Abandon in-flight producers with the cache.
        self.stop.cancel();
    }
}

impl<C: HttpClient> CachedClient<C> {
    /// Wraps `inner` with the default configuration.
    pub fn new(inner: C) -> Self {
        Self::with_config(inner, CacheConfig::default())
    }

    /// Wraps `inner` with explicit capacity and staleness settings.
    pub fn with_config(inner: C, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            state: Arc::new(Mutex::new(CacheState {
                entries: LruStore::new(config.capacity),
                pending: HashMap::new(),
                last_invalidate_ms: 0,
            })),
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Marks every current entry stale.
    pub fn invalidate_all(&self) {
        self.state.lock().last_invalidate_ms = now_ms();
    }

    async fn fetch_cached(&self, request: Request, stop: CancellationToken) -> Result<Response> {
        if !cacheable(&request) {
            return self.inner.fetch(request, stop).await;
        }

        let Request {
            url,
            method,
            headers,
            body,
            ..
        } = request;
        let body = body.into_bytes().await?;
        let key = CacheKey {
            url,
            method,
            headers,
            body,
        };

        let flight = {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get(&key).cloned() {
                if !self.is_stale(&entry, state.last_invalidate_ms) {
                    return Ok(to_response(entry));
                }
                state.entries.remove(&key);
            }
            match state.pending.get(&key) {
                Some(flight) => flight.clone(),
                None => {
                    let flight = SharedPromise::new(self.produce(key.clone()));
                    state.pending.insert(key.clone(), flight.clone());
                    flight
                }
            }
        };
        let entry = flight.get(&stop).await?;
        Ok(to_response(entry))
    }

    /// The upstream fetch behind a cache miss. Runs under the cache's own
    /// lifetime token so consumer cancellations never reach it; cleans up
    /// the pending slot and stores the entry itself.
    fn produce(&self, key: CacheKey) -> impl Future<Output = Result<CachedResponse>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        async move {
            let result = async {
                let response = inner.fetch(key.to_request(), stop).await?;
                let status = response.status;
                let headers = response.headers;
                let data = body::collect(response.body).await?;
                Ok(CachedResponse {
                    status,
                    headers,
                    body: data,
                    timestamp_ms: now_ms(),
                })
            }
            .await;

            let mut state = state.lock();
            state.pending.remove(&key);
            if let Ok(entry) = &result {
                state.entries.insert(key, entry.clone());
            }
            result
        }
    }

    fn is_stale(&self, entry: &CachedResponse, last_invalidate_ms: u64) -> bool {
        entry.status >= 400
            || entry.timestamp_ms <= last_invalidate_ms
            || now_ms() - entry.timestamp_ms >= self.config.max_staleness.as_millis() as u64
    }
}

impl<C: HttpClient> HttpClient for CachedClient<C> {
    async fn fetch(&self, request: Request, stop: CancellationToken) -> Result<Response> {
        let invalidates = (!request.method.is_idempotent()
            && !request.flags.contains(RequestFlag::Read))
            || request.flags.contains(RequestFlag::Write);
        let result = self.fetch_cached(request, stop).await;
        if invalidates {
            tracing::debug!("state-changing request completed; invalidating cache");
            self.invalidate_all();
        }
        result
    }
}

/// Cacheable traffic: JSON/XML `Accept`, and no `Content-Type` beyond the
/// JSON/XML/form family.
fn cacheable(request: &Request) -> bool {
    let accepts = has_header(&request.headers, "Accept", "application/json")
        || has_header(&request.headers, "Accept", "application/xml");
    if !accepts {
        return false;
    }
    match get_header(&request.headers, "Content-Type") {
        None => true,
        Some(content_type) => matches!(
            content_type,
            "application/json" | "application/xml" | "application/x-www-form-urlencoded"
        ),
    }
}

fn to_response(entry: CachedResponse) -> Response {
    Response {
        status: entry.status,
        headers: entry.headers,
        body: body::full(entry.body),
    }
}

/// Monotonic milliseconds since the first call; starts at 1 so that a
/// never-invalidated cache (`last_invalidate_ms == 0`) keeps its entries.
fn now_ms() -> u64 {
    static START: LazyLock<Instant> = LazyLock::new(Instant::now);
    START.elapsed().as_millis() as u64 + 1
}
