//! # quiver
//!
//! A client-side asynchronous HTTP request pipeline. Application code
//! submits typed requests and receives parsed results (or typed errors) on a
//! delivery context of its choosing, while the pipeline maximizes cache
//! reuse, serializes duplicate work and retries transient failures.
//!
//! ## Pipeline
//!
//! A [`RequestQueue`] owns two priority queues and the workers draining
//! them:
//!
//! - Submissions are assigned a monotonic sequence number; queues dispatch
//!   higher priorities first and in submission order within one priority.
//! - Cacheable submissions are deduplicated by cache key: while a request
//!   for a key is in flight, later submissions for the same key wait for
//!   its result instead of being dispatched.
//! - A single cache triage worker serves fresh hits from the [`DiskCache`],
//!   delivers soft-expired hits immediately as *intermediate* responses
//!   followed by a background refresh, and routes misses and hard-expired
//!   entries to the network.
//! - A pool of network workers performs the exchange through the
//!   [`Transport`], honoring `ETag`/`Last-Modified` validators (a `304`
//!   re-delivers the cached body), following 301/302 through the retry
//!   policy, and writing cacheable responses back to the cache before
//!   delivery.
//! - Timeouts, auth failures (401/403) and redirects are retried according
//!   to the request's [`RetryPolicy`] with exponential backoff.
//!
//! Responses never reach listeners inline on a worker: they are posted onto
//! the [`Executor`] the queue was built with, typically the application's
//! main or UI context.
//!
//! ## Example
//!
//! ```no_run
//! use quiver::{Config, Event, Request, StringParser};
//!
//! # async fn run() {
//! let runtime = tokio::runtime::Handle::current();
//! let queue = quiver::new_request_queue(Config::default(), runtime);
//! queue.start();
//!
//! let request = Request::get("https://example.com/").build(
//!     StringParser::uncached(),
//!     Box::new(|event| match event {
//!         Event::Response { value, .. } => println!("got {} bytes", value.len()),
//!         Event::Failed(error) => eprintln!("request failed: {error}"),
//!     }),
//! );
//! queue.submit(request);
//! # }
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;

mod cache;
mod config;
mod delivery;
mod dispatch;
mod error;
mod parsers;
mod queue;
mod request;
mod response;
mod retry;
mod transport;

pub use cache::{CacheEntry, CacheStore, DiskCache, NoopCache, DEFAULT_MAX_BYTES};
pub use config::{Config, DEFAULT_NETWORK_POOL_SIZE};
pub use delivery::{Executor, ResponseDelivery, TokioExecutor};
pub use error::{Error, ErrorContext};
pub use parsers::{BytesParser, StringParser};
pub use queue::{FinishedListener, RequestQueue};
pub use request::{Event, Listener, Method, Parse, Priority, Request, RequestBuilder};
pub use response::{Headers, NetworkResponse, Parsed};
pub use retry::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT,
};
pub use transport::{RawResponse, ReqwestTransport, Transport, TransportError};

/// Creates a ready-to-start [`RequestQueue`] with the default wiring: a
/// [`DiskCache`] under `config.cache_dir` (or a [`NoopCache`] when no
/// directory is configured), the [`ReqwestTransport`] and delivery onto
/// `runtime`.
pub fn new_request_queue(config: Config, runtime: Handle) -> RequestQueue {
    let cache: Arc<dyn CacheStore> = match &config.cache_dir {
        Some(dir) => Arc::new(DiskCache::with_max_bytes(dir, config.max_cache_bytes)),
        None => Arc::new(NoopCache),
    };
    let transport = Arc::new(ReqwestTransport::new());
    let delivery = ResponseDelivery::new(Arc::new(TokioExecutor::new(runtime.clone())));

    RequestQueue::new(config, cache, transport, delivery, runtime)
}
