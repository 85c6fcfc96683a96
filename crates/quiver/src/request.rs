//! Request descriptors and the typed parsing seam.
//!
//! A [`Request`] is an immutable submission descriptor plus a small amount of
//! queue-managed state (sequence number, cancellation, the cache entry that
//! seeded a revalidation attempt). The typed side of a request lives in its
//! [`Parse`] implementation and listener; the pipeline itself only works with
//! type-erased requests behind `Arc<Request>`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::cache::CacheEntry;
use crate::error::Error;
use crate::queue::QueueCore;
use crate::response::{Headers, NetworkResponse, Parsed};
use crate::retry::RetryPolicy;

/// The HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Trace,
    Patch,
    /// Compatibility method that resolves to `POST` when the request carries
    /// a body and `GET` otherwise.
    LegacyGetOrPost,
}

impl Method {
    /// Whether an implicit body may be built from request params.
    fn allows_params_body(self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Patch | Method::LegacyGetOrPost
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::LegacyGetOrPost => "GET_OR_POST",
        };
        f.write_str(name)
    }
}

/// Dispatch priority. Within one priority level requests are processed in
/// submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// Turns raw network bytes into a typed value.
///
/// `parse` runs on a dispatcher worker, not on the delivery context, so CPU
/// heavy parsing never blocks delivery. Besides the value it may produce a
/// [`CacheEntry`] which the pipeline writes to the cache before delivering.
pub trait Parse: Send + Sync + 'static {
    type Output: Send + 'static;

    fn parse(&self, response: &NetworkResponse) -> Result<Parsed<Self::Output>, Error>;

    /// Refines an error before it is surfaced to the listener.
    fn parse_error(&self, error: Error) -> Error {
        error
    }
}

/// What a listener observes for one submission.
#[derive(Debug)]
pub enum Event<T> {
    /// A parsed response. `intermediate` is true when the value came from a
    /// soft-expired cache entry and a fresh response may follow.
    Response { value: T, intermediate: bool },
    /// The request failed; no further events follow.
    Failed(Error),
}

/// The callback invoked on the delivery context.
pub type Listener<T> = Box<dyn Fn(Event<T>) + Send + Sync>;

/// The parsed-but-untyped result a dispatcher moves between parsing and
/// delivery.
pub(crate) struct ErasedParsed {
    pub(crate) value: Box<dyn Any + Send>,
    pub(crate) cache_entry: Option<CacheEntry>,
}

/// Object-safe face of a request's parser and listener.
pub(crate) trait Handler: Send + Sync {
    fn parse(&self, response: &NetworkResponse) -> Result<ErasedParsed, Error>;
    fn parse_error(&self, error: Error) -> Error;
    fn deliver(&self, parsed: ErasedParsed, intermediate: bool);
    fn deliver_error(&self, error: Error);
}

struct TypedHandler<P: Parse> {
    parser: P,
    listener: Listener<P::Output>,
}

impl<P: Parse> Handler for TypedHandler<P> {
    fn parse(&self, response: &NetworkResponse) -> Result<ErasedParsed, Error> {
        let parsed = self.parser.parse(response)?;
        Ok(ErasedParsed {
            value: Box::new(parsed.value),
            cache_entry: parsed.cache_entry,
        })
    }

    fn parse_error(&self, error: Error) -> Error {
        self.parser.parse_error(error)
    }

    fn deliver(&self, parsed: ErasedParsed, intermediate: bool) {
        let value = parsed
            .value
            .downcast::<P::Output>()
            .expect("handler only receives values produced by its own parser");
        (self.listener)(Event::Response {
            value: *value,
            intermediate,
        });
    }

    fn deliver_error(&self, error: Error) {
        (self.listener)(Event::Failed(error));
    }
}

/// A submitted (or submittable) HTTP request.
///
/// Construct through [`Request::builder`], then hand to
/// [`RequestQueue::submit`](crate::RequestQueue::submit). All descriptor
/// fields are frozen at build time; the pipeline only mutates its own
/// bookkeeping state.
pub struct Request {
    method: Method,
    url: String,
    headers: Headers,
    params: BTreeMap<String, String>,
    params_encoding: String,
    body: Option<Vec<u8>>,
    priority: Priority,
    explicit_cache_key: Option<String>,
    should_cache: bool,
    tag: Option<String>,
    identifier: String,

    retry_policy: Mutex<RetryPolicy>,
    sequence: OnceLock<u64>,
    canceled: AtomicBool,
    response_delivered: AtomicBool,
    redirect_url: Mutex<Option<String>>,
    cache_entry: Mutex<Option<CacheEntry>>,
    handler: Box<dyn Handler>,
    queue: OnceLock<Weak<QueueCore>>,
}

impl Request {
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            method,
            url: url.into(),
            headers: Headers::new(),
            params: BTreeMap::new(),
            params_encoding: "UTF-8".to_owned(),
            body: None,
            priority: Priority::default(),
            cache_key: None,
            should_cache: true,
            retry_policy: RetryPolicy::default(),
            tag: None,
        }
    }

    /// A convenience builder for a plain `GET`.
    pub fn get(url: impl Into<String>) -> RequestBuilder {
        Request::builder(Method::Get, url)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The URL the request was submitted with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL the next network attempt will hit: the redirect target if the
    /// server moved us, the original URL otherwise.
    pub fn effective_url(&self) -> String {
        self.redirect_url
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.url.clone())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The request body: the explicit body if one was set, otherwise the
    /// url-encoded params for methods that carry them.
    pub fn body(&self) -> Option<Vec<u8>> {
        if let Some(body) = &self.body {
            return Some(body.clone());
        }
        if !self.params.is_empty() && self.method.allows_params_body() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.params)
                .finish();
            return Some(encoded.into_bytes());
        }
        None
    }

    /// The `Content-Type` for bodies built from params.
    pub fn body_content_type(&self) -> String {
        format!(
            "application/x-www-form-urlencoded; charset={}",
            self.params_encoding
        )
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The key under which responses to this request are cached and
    /// deduplicated. Defaults to the effective URL.
    pub fn cache_key(&self) -> String {
        self.explicit_cache_key
            .clone()
            .unwrap_or_else(|| self.effective_url())
    }

    pub fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The unique identifier assigned at construction.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The sequence number assigned at submit time; 0 before submission.
    pub fn sequence(&self) -> u64 {
        self.sequence.get().copied().unwrap_or(0)
    }

    /// The timeout for the next network attempt.
    pub fn timeout(&self) -> Duration {
        self.retry_policy.lock().unwrap().current_timeout()
    }

    /// Flags the request as canceled. Cancellation is cooperative: a request
    /// already on the wire finishes its exchange, but nothing is delivered.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.mark("canceled");
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Whether a response (including an intermediate one) already reached
    /// the listener.
    pub fn response_delivered(&self) -> bool {
        self.response_delivered.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_delivered(&self) {
        self.response_delivered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        let already_set = self.sequence.set(sequence).is_err();
        debug_assert!(!already_set, "sequence must be assigned exactly once");
    }

    pub(crate) fn set_redirect_url(&self, url: impl Into<String>) {
        *self.redirect_url.lock().unwrap() = Some(url.into());
    }

    pub(crate) fn retry_policy(&self) -> MutexGuard<'_, RetryPolicy> {
        self.retry_policy.lock().unwrap()
    }

    pub(crate) fn cache_entry(&self) -> MutexGuard<'_, Option<CacheEntry>> {
        self.cache_entry.lock().unwrap()
    }

    pub(crate) fn set_cache_entry(&self, entry: CacheEntry) {
        *self.cache_entry.lock().unwrap() = Some(entry);
    }

    pub(crate) fn handler(&self) -> &dyn Handler {
        &*self.handler
    }

    pub(crate) fn attach_queue(&self, core: Weak<QueueCore>) {
        let _ = self.queue.set(core);
    }

    /// Emits a lifecycle marker for this request.
    pub(crate) fn mark(&self, marker: &str) {
        tracing::trace!(request = %self.identifier, marker);
    }

    /// Declares processing of this request finished and notifies the queue,
    /// which releases any deduplicated siblings.
    pub(crate) fn finish(self: &Arc<Self>, reason: &str) {
        self.mark(reason);
        if let Some(core) = self.queue.get().and_then(Weak::upgrade) {
            core.finish(self);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("identifier", &self.identifier)
            .field("sequence", &self.sequence())
            .field("should_cache", &self.should_cache)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: Headers,
    params: BTreeMap<String, String>,
    params_encoding: String,
    body: Option<Vec<u8>>,
    priority: Priority,
    cache_key: Option<String>,
    should_cache: bool,
    retry_policy: RetryPolicy,
    tag: Option<String>,
}

impl RequestBuilder {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a form param. Params are url-encoded into the body for methods
    /// that carry one.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// The charset advertised in the `Content-Type` of a params body.
    pub fn params_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.params_encoding = encoding.into();
        self
    }

    /// Sets an explicit body, overriding any params.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the cache key. Defaults to the effective URL.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Attaches an opaque tag for bulk cancellation.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Finalizes the request with its parser and listener.
    pub fn build<P: Parse>(self, parser: P, listener: Listener<P::Output>) -> Arc<Request> {
        let identifier = next_identifier(self.method, &self.url);
        Arc::new(Request {
            method: self.method,
            url: self.url,
            headers: self.headers,
            params: self.params,
            params_encoding: self.params_encoding,
            body: self.body,
            priority: self.priority,
            explicit_cache_key: self.cache_key,
            should_cache: self.should_cache,
            tag: self.tag,
            identifier,
            retry_policy: Mutex::new(self.retry_policy),
            sequence: OnceLock::new(),
            canceled: AtomicBool::new(false),
            response_delivered: AtomicBool::new(false),
            redirect_url: Mutex::new(None),
            cache_entry: Mutex::new(None),
            handler: Box::new(TypedHandler { parser, listener }),
            queue: OnceLock::new(),
        })
    }
}

/// Derives a unique request identifier from the method, URL, submission time
/// and a process-wide counter.
fn next_identifier(method: Method, url: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    let mut hasher = Sha1::new();
    hasher.update(format!("Request:{method}:{url}:{millis}:{counter}").as_bytes());

    let digest = hasher.finalize();
    let mut identifier = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(&mut identifier, "{byte:02x}").unwrap();
    }
    identifier
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::parsers::StringParser;

    fn noop_listener() -> Listener<String> {
        Box::new(|_event| {})
    }

    #[test]
    fn test_identifiers_are_unique() {
        let a = Request::get("http://example.com").build(StringParser::uncached(), noop_listener());
        let b = Request::get("http://example.com").build(StringParser::uncached(), noop_listener());
        assert_ne!(a.identifier(), b.identifier());
    }

    #[test]
    fn test_cache_key_defaults_to_effective_url() {
        let request =
            Request::get("http://example.com/a").build(StringParser::uncached(), noop_listener());
        assert_eq!(request.cache_key(), "http://example.com/a");

        request.set_redirect_url("http://example.com/b");
        assert_eq!(request.effective_url(), "http://example.com/b");
        assert_eq!(request.cache_key(), "http://example.com/b");
    }

    #[test]
    fn test_explicit_cache_key_wins() {
        let request = Request::get("http://example.com/a")
            .cache_key("pinned")
            .build(StringParser::uncached(), noop_listener());
        request.set_redirect_url("http://example.com/b");
        assert_eq!(request.cache_key(), "pinned");
    }

    #[test]
    fn test_params_body() {
        let request = Request::builder(Method::Post, "http://example.com")
            .param("b", "2 2")
            .param("a", "1")
            .build(StringParser::uncached(), noop_listener());

        assert_eq!(request.body().as_deref(), Some(&b"a=1&b=2+2"[..]));
        assert_eq!(
            request.body_content_type(),
            "application/x-www-form-urlencoded; charset=UTF-8"
        );
    }

    #[test]
    fn test_params_ignored_for_get() {
        let request = Request::builder(Method::Get, "http://example.com")
            .param("a", "1")
            .build(StringParser::uncached(), noop_listener());
        assert_eq!(request.body(), None);
    }

    #[test]
    fn test_explicit_body_overrides_params() {
        let request = Request::builder(Method::Post, "http://example.com")
            .param("a", "1")
            .body(b"raw".to_vec())
            .build(StringParser::uncached(), noop_listener());
        assert_eq!(request.body().as_deref(), Some(&b"raw"[..]));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Immediate > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
