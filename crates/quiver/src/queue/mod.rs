//! The request queue: submission, deduplication and worker lifecycle.
//!
//! [`RequestQueue`] accepts typed requests, assigns monotonic sequence
//! numbers and routes every submission either to the cache triage queue or
//! straight to the network queue. Cacheable submissions are deduplicated by
//! cache key: while one request for a key is in flight, later submissions
//! for the same key are parked and released onto the cache queue once the
//! winner finishes, at which point they are usually served by the entry the
//! winner just wrote.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::delivery::ResponseDelivery;
use crate::dispatch::{CacheDispatcher, NetworkDispatcher};
use crate::queue::priority::PendingQueue;
use crate::request::Request;
use crate::transport::Transport;

mod priority;

/// Callback invoked whenever a request finishes processing.
pub type FinishedListener = Box<dyn Fn(&Arc<Request>) + Send + Sync>;

/// Shared state behind a [`RequestQueue`], also reachable from requests via
/// a weak back-handle so that `finish` can be driven from any thread.
pub(crate) struct QueueCore {
    sequence_generator: AtomicU64,
    /// All requests currently owned by the queue: parked, queued or being
    /// processed by a worker. Keyed by request identifier.
    current_requests: Mutex<HashMap<String, Arc<Request>>>,
    /// In-flight tracking per cache key. `None` means a request for the key
    /// is in flight with no siblings parked behind it yet.
    waiting_requests: Mutex<HashMap<String, Option<Vec<Arc<Request>>>>>,
    finished_listeners: Mutex<Vec<FinishedListener>>,

    pub(crate) cache_queue: PendingQueue,
    pub(crate) network_queue: PendingQueue,
    pub(crate) cache: Arc<dyn CacheStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) delivery: ResponseDelivery,
    pub(crate) config: Config,
}

impl QueueCore {
    fn next_sequence(&self) -> u64 {
        self.sequence_generator.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Called when processing of `request` is complete: drops it from the
    /// current set, notifies finished listeners, and promotes any
    /// deduplicated siblings to the cache queue.
    pub(crate) fn finish(&self, request: &Arc<Request>) {
        self.current_requests
            .lock()
            .unwrap()
            .remove(request.identifier());

        for listener in self.finished_listeners.lock().unwrap().iter() {
            listener(request);
        }

        if request.should_cache() {
            let cache_key = request.cache_key();
            let staged = self.waiting_requests.lock().unwrap().remove(&cache_key);
            if let Some(Some(siblings)) = staged {
                tracing::debug!(
                    count = siblings.len(),
                    cache_key = %cache_key,
                    "releasing waiting requests",
                );
                // The cache has been primed by the finished request, so the
                // siblings go through cache triage rather than the network.
                for sibling in siblings {
                    self.cache_queue.push(sibling);
                }
            }
        }
    }
}

/// A request dispatch queue with a cache triage worker and a pool of network
/// workers.
///
/// Workers do not run until [`start`](Self::start) is called.
pub struct RequestQueue {
    core: Arc<QueueCore>,
    runtime: Handle,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RequestQueue {
    /// Creates the queue. `runtime` is where the workers and deliveries are
    /// spawned.
    pub fn new(
        config: Config,
        cache: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
        delivery: ResponseDelivery,
        runtime: Handle,
    ) -> Self {
        RequestQueue {
            core: Arc::new(QueueCore {
                sequence_generator: AtomicU64::new(0),
                current_requests: Mutex::new(HashMap::new()),
                waiting_requests: Mutex::new(HashMap::new()),
                finished_listeners: Mutex::new(Vec::new()),
                cache_queue: PendingQueue::new(),
                network_queue: PendingQueue::new(),
                cache,
                transport,
                delivery,
                config,
            }),
            runtime,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts the workers, stopping any that are already running first.
    pub fn start(&self) {
        self.stop();

        self.core.cache_queue.reopen();
        self.core.network_queue.reopen();

        let mut workers = self.workers.lock().unwrap();
        workers.push(
            self.runtime
                .spawn(CacheDispatcher::new(self.core.clone()).run()),
        );
        for worker in 0..self.core.config.network_pool_size {
            workers.push(
                self.runtime
                    .spawn(NetworkDispatcher::new(self.core.clone(), worker).run()),
            );
        }

        tracing::debug!(
            network_workers = self.core.config.network_pool_size,
            "request queue started",
        );
    }

    /// Signals all workers to quit. Workers finish the request they are on;
    /// undispatched requests remain queued for a later [`start`](Self::start).
    pub fn stop(&self) {
        self.core.cache_queue.close();
        self.core.network_queue.close();
        self.workers.lock().unwrap().clear();
    }

    /// Submits a request for dispatch. Responses and errors arrive at the
    /// request's listener on the delivery context.
    pub fn submit(&self, request: Arc<Request>) -> Arc<Request> {
        let core = &self.core;
        request.attach_queue(Arc::downgrade(core));

        core.current_requests
            .lock()
            .unwrap()
            .insert(request.identifier().to_owned(), request.clone());

        request.set_sequence(core.next_sequence());
        request.mark("add-to-queue");

        // Uncacheable requests skip both the cache and the dedup map.
        if !request.should_cache() {
            core.network_queue.push(request.clone());
            return request;
        }

        let cache_key = request.cache_key();
        let mut waiting = core.waiting_requests.lock().unwrap();
        match waiting.entry(cache_key) {
            Entry::Occupied(mut staged) => {
                // A request for this key is in flight; park this one.
                staged
                    .get_mut()
                    .get_or_insert_with(Vec::new)
                    .push(request.clone());
                tracing::trace!(
                    cache_key = %staged.key(),
                    request = %request.identifier(),
                    "request for cache key is in flight, putting on hold",
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
                core.cache_queue.push(request.clone());
            }
        }

        request
    }

    /// Cancels every current request the filter matches.
    pub fn cancel_all(&self, filter: impl Fn(&Request) -> bool) {
        let current = self.core.current_requests.lock().unwrap();
        for request in current.values() {
            if filter(request) {
                request.cancel();
            }
        }
    }

    /// Cancels every current request carrying the given tag.
    pub fn cancel_tagged(&self, tag: &str) {
        self.cancel_all(|request| request.tag() == Some(tag));
    }

    /// Registers a callback invoked whenever a request finishes.
    pub fn add_finished_listener(&self, listener: FinishedListener) {
        self.core.finished_listeners.lock().unwrap().push(listener);
    }

    /// The cache this queue reads and writes.
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.core.cache
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
