//! The cache triage worker.
//!
//! A single worker drains the cache queue. Hits are parsed and delivered
//! without touching the network; misses and hard-expired entries are handed
//! to the network queue. A soft-expired hit is delivered immediately as an
//! intermediate response, and the refresh is enqueued only after the
//! listener has observed the stale value.

use std::sync::Arc;

use crate::queue::QueueCore;
use crate::request::Request;
use crate::response::NetworkResponse;

pub(crate) struct CacheDispatcher {
    core: Arc<QueueCore>,
}

impl CacheDispatcher {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        CacheDispatcher { core }
    }

    pub(crate) async fn run(self) {
        tracing::debug!("cache dispatcher running");
        self.core.cache.initialize();

        while let Some(request) = self.core.cache_queue.take().await {
            self.process(request);
        }
        tracing::debug!("cache dispatcher exiting");
    }

    fn process(&self, request: Arc<Request>) {
        request.mark("cache-queue-take");

        if request.is_canceled() {
            request.finish("cache-discard-canceled");
            return;
        }

        let Some(entry) = self.core.cache.get(&request.cache_key()) else {
            request.mark("cache-miss");
            self.core.network_queue.push(request);
            return;
        };

        if entry.is_expired() {
            // Hard expired: revalidate, but carry the entry so the network
            // worker can still honor a 304.
            request.mark("cache-hit-expired");
            request.set_cache_entry(entry);
            self.core.network_queue.push(request);
            return;
        }

        request.mark("cache-hit");
        let response = NetworkResponse::from_cache(&entry);
        let parsed = match request.handler().parse(&response) {
            Ok(parsed) => parsed,
            Err(error) => {
                let error = request.handler().parse_error(error);
                self.core.delivery.post_error(request, error);
                return;
            }
        };
        request.mark("cache-hit-parsed");

        if !entry.refresh_needed() {
            // Completely unexpired cache hit. Just deliver the response.
            self.core.delivery.post_response(request, parsed, false, None);
        } else {
            // Soft-expired hit: deliver the stale value as intermediate and
            // refresh over the network once the caller has seen it.
            request.mark("cache-hit-refresh-needed");
            request.set_cache_entry(entry);

            let core = self.core.clone();
            let refresh = request.clone();
            self.core.delivery.post_response(
                request,
                parsed,
                true,
                Some(Box::new(move || core.network_queue.push(refresh))),
            );
        }
    }
}
