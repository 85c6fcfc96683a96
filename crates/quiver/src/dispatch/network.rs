//! The network worker pool.
//!
//! Each worker drains the network queue, performs the HTTP exchange through
//! the transport, translates the status line into the pipeline's vocabulary
//! (304 merges, 301/302 redirect-retries, auth failures) and feeds
//! retryable errors through the request's retry policy. Successful
//! responses are parsed on the worker and written to the cache before
//! delivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::CacheEntry;
use crate::error::{Error, ErrorContext};
use crate::queue::QueueCore;
use crate::request::Request;
use crate::response::{format_http_date, Headers, NetworkResponse};
use crate::transport::{RawResponse, TransportError};

pub(crate) struct NetworkDispatcher {
    core: Arc<QueueCore>,
    worker: usize,
}

impl NetworkDispatcher {
    pub(crate) fn new(core: Arc<QueueCore>, worker: usize) -> Self {
        NetworkDispatcher { core, worker }
    }

    pub(crate) async fn run(self) {
        tracing::debug!(worker = self.worker, "network dispatcher running");
        while let Some(request) = self.core.network_queue.take().await {
            self.process(request).await;
        }
        tracing::debug!(worker = self.worker, "network dispatcher exiting");
    }

    async fn process(&self, request: Arc<Request>) {
        request.mark("network-queue-take");

        if request.is_canceled() {
            request.finish("network-discard-cancelled");
            return;
        }

        match self.perform_with_retries(&request).await {
            Ok(response) => self.complete(request, response),
            Err(error) => self.fail(request, error),
        }
    }

    /// Drives attempts until one yields a response or the retry policy gives
    /// up. Redirects re-enter the loop with the request's new URL already in
    /// place.
    async fn perform_with_retries(&self, request: &Arc<Request>) -> Result<NetworkResponse, Error> {
        loop {
            let attempt_timeout = request.timeout();
            let (log_prefix, error) = match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            let retried = { request.retry_policy().retry(error) };
            match retried {
                Ok(()) => {
                    request.mark(&format!(
                        "{log_prefix}-retry [timeout={}ms]",
                        attempt_timeout.as_millis()
                    ));
                }
                Err(error) => {
                    request.mark(&format!(
                        "{log_prefix}-giveup [timeout={}ms]",
                        attempt_timeout.as_millis()
                    ));
                    return Err(error);
                }
            }
        }
    }

    /// One transport exchange plus status translation. Errors come back with
    /// the log prefix used for retry markers.
    async fn attempt(
        &self,
        request: &Arc<Request>,
    ) -> Result<NetworkResponse, (&'static str, Error)> {
        let conditional = conditional_headers(&request.cache_entry());

        let started = Instant::now();
        let raw = self.core.transport.perform(request, &conditional).await;
        let network_time = started.elapsed();

        let raw = match raw {
            Ok(raw) => raw,
            Err(error) => return Err(translate_transport_error(error, network_time)),
        };

        match raw.status {
            304 => {
                request.mark("not-modified");
                Ok(not_modified_response(request, raw, network_time))
            }
            301 | 302 => {
                let location = raw.headers.get("Location").map(str::to_owned);
                match &location {
                    Some(location) => {
                        tracing::debug!(
                            request = %request.identifier(),
                            from = %request.effective_url(),
                            to = %location,
                            "request redirected",
                        );
                        request.set_redirect_url(location.clone());
                    }
                    None => tracing::warn!(
                        request = %request.identifier(),
                        status = raw.status,
                        "redirect without Location header",
                    ),
                }
                let context = ErrorContext::with_response(
                    snapshot(raw, network_time),
                    network_time,
                );
                Err(("redirect", Error::Redirect(context)))
            }
            200..=299 => {
                self.log_slow_request(request, &raw, network_time);
                request.mark("network-http-complete");
                // A 204 or an empty entity simply yields a zero-length body.
                Ok(NetworkResponse {
                    status: raw.status,
                    data: raw.body,
                    headers: raw.headers,
                    not_modified: false,
                    network_time,
                })
            }
            401 | 403 => {
                let context =
                    ErrorContext::with_response(snapshot(raw, network_time), network_time);
                Err(("auth", Error::AuthFailure(context)))
            }
            _ => {
                let context =
                    ErrorContext::with_response(snapshot(raw, network_time), network_time);
                Err(("server", Error::Server(context)))
            }
        }
    }

    fn complete(&self, request: Arc<Request>, response: NetworkResponse) {
        // If the server returned 304 and we already delivered an
        // intermediate response, there is nothing new to deliver.
        if request.response_delivered() && response.not_modified {
            request.finish("not-modified");
            return;
        }

        let parsed = match request.handler().parse(&response) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.fail(request, error);
                return;
            }
        };
        request.mark("network-parse-complete");

        if request.should_cache() {
            if let Some(entry) = &parsed.cache_entry {
                self.core.cache.put(&request.cache_key(), entry.clone());
                request.mark("network-cache-written");
            }
        }

        request.mark_delivered();
        self.core.delivery.post_response(request, parsed, false, None);
    }

    fn fail(&self, request: Arc<Request>, error: Error) {
        if request.response_delivered() {
            // An intermediate response already reached the listener; a
            // failed background refresh is dropped.
            tracing::debug!(
                request = %request.identifier(),
                error = %error,
                "background refresh failed",
            );
            request.finish("refresh-failed");
            return;
        }

        let error = request.handler().parse_error(error);
        self.core.delivery.post_error(request, error);
    }

    fn log_slow_request(&self, request: &Request, raw: &RawResponse, network_time: Duration) {
        if network_time > self.core.config.slow_request_threshold {
            tracing::debug!(
                request = %request.identifier(),
                lifetime_ms = network_time.as_millis() as u64,
                size = raw.body.len(),
                status = raw.status,
                retries = request.retry_policy().current_retry_count(),
                "slow http response",
            );
        }
    }
}

/// Conditional headers derived from the cache entry that seeded this
/// attempt.
fn conditional_headers(entry: &Option<CacheEntry>) -> Headers {
    let mut headers = Headers::new();
    let Some(entry) = entry else {
        return headers;
    };

    if let Some(etag) = &entry.etag {
        headers.insert("If-None-Match", etag.clone());
    }
    if entry.last_modified > 0 {
        headers.insert("If-Modified-Since", format_http_date(entry.last_modified));
    }
    headers
}

/// Builds the response for a `304 Not Modified`: the cached body with the
/// fresh headers merged into the cached ones. Without a seeding entry the
/// 304 is anomalous and delivered with an empty body.
fn not_modified_response(
    request: &Request,
    raw: RawResponse,
    network_time: Duration,
) -> NetworkResponse {
    let mut entry = request.cache_entry();
    match entry.as_mut() {
        Some(entry) => {
            entry.response_headers.merge(&raw.headers);
            NetworkResponse {
                status: raw.status,
                data: entry.data.clone(),
                headers: entry.response_headers.clone(),
                not_modified: true,
                network_time,
            }
        }
        None => NetworkResponse {
            status: raw.status,
            data: Vec::new(),
            headers: raw.headers,
            not_modified: true,
            network_time,
        },
    }
}

fn snapshot(raw: RawResponse, network_time: Duration) -> NetworkResponse {
    NetworkResponse {
        status: raw.status,
        data: raw.body,
        headers: raw.headers,
        not_modified: false,
        network_time,
    }
}

fn translate_transport_error(
    error: TransportError,
    network_time: Duration,
) -> (&'static str, Error) {
    match error {
        TransportError::SocketTimeout => {
            ("socket", Error::Timeout(ErrorContext::elapsed(network_time)))
        }
        TransportError::ConnectTimeout => (
            "connection",
            Error::Timeout(ErrorContext::elapsed(network_time)),
        ),
        // A URL that cannot be parsed can never obtain a status; like a
        // failed connection it is fatal without retry.
        TransportError::MalformedUrl(reason) => ("url", Error::NoConnection { reason }),
        TransportError::NoConnection(reason) => ("connection", Error::NoConnection { reason }),
        TransportError::Io(_) => (
            "network",
            Error::Network(ErrorContext::elapsed(network_time)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_headers() {
        let entry = CacheEntry {
            etag: Some("v1".into()),
            last_modified: 1_700_000_000_000,
            ..Default::default()
        };

        let headers = conditional_headers(&Some(entry));
        assert_eq!(headers.get("If-None-Match"), Some("v1"));
        assert_eq!(
            headers.get("If-Modified-Since"),
            Some("Tue, 14 Nov 2023 22:13:20 GMT")
        );

        assert!(conditional_headers(&None).is_empty());
    }

    #[test]
    fn test_translate_transport_errors() {
        let elapsed = Duration::from_millis(5);

        let (prefix, error) = translate_transport_error(TransportError::SocketTimeout, elapsed);
        assert_eq!(prefix, "socket");
        assert!(matches!(error, Error::Timeout(_)));

        let (prefix, error) = translate_transport_error(TransportError::ConnectTimeout, elapsed);
        assert_eq!(prefix, "connection");
        assert!(matches!(error, Error::Timeout(_)));

        let (_, error) =
            translate_transport_error(TransportError::MalformedUrl("bad".into()), elapsed);
        assert!(matches!(error, Error::NoConnection { .. }));
        assert!(!error.is_retryable());

        let (_, error) = translate_transport_error(TransportError::Io("broken pipe".into()), elapsed);
        assert!(matches!(error, Error::Network(_)));
    }
}
