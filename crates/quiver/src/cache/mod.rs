//! Response caching.
//!
//! The pipeline talks to the cache through the [`CacheStore`] trait. The
//! default implementation is the disk-backed [`DiskCache`], which persists
//! entries in a compact binary format and prunes least-recently-used entries
//! once a byte budget is exceeded. [`NoopCache`] is a cache that stores
//! nothing, for queues that should always hit the network.
//!
//! An entry carries two expiration timestamps: past `soft_ttl` the entry is
//! still served but a background refresh is scheduled; past `ttl` it must be
//! revalidated before use. Both are millisecond epoch timestamps supplied by
//! the parser that produced the entry.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::response::{parse_http_date, Headers, NetworkResponse};

mod disk;

pub use disk::{DiskCache, DEFAULT_MAX_BYTES};

/// The current time as a millisecond epoch timestamp.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cached response: the body plus the validators and expiration metadata
/// persisted alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    /// The response body.
    pub data: Vec<u8>,
    /// The `ETag` the server sent, if any.
    pub etag: Option<String>,
    /// Server `Date` header as a millisecond epoch timestamp, 0 if unset.
    pub server_date: u64,
    /// Server `Last-Modified` header as a millisecond epoch timestamp,
    /// 0 if unset.
    pub last_modified: u64,
    /// Hard expiration: past this the entry must be revalidated.
    pub ttl: u64,
    /// Soft expiration: past this the entry is served but refreshed.
    pub soft_ttl: u64,
    /// The response headers to replay for cache-sourced responses.
    pub response_headers: Headers,
}

impl CacheEntry {
    /// Builds an entry from a network response with caller-supplied
    /// expiration timestamps. Validators (`ETag`, `Date`, `Last-Modified`)
    /// are lifted out of the response headers.
    pub fn from_response(response: &NetworkResponse, ttl: u64, soft_ttl: u64) -> Self {
        let headers = &response.headers;
        CacheEntry {
            data: response.data.clone(),
            etag: headers.get("ETag").map(str::to_owned),
            server_date: headers
                .get("Date")
                .and_then(parse_http_date)
                .unwrap_or_default(),
            last_modified: headers
                .get("Last-Modified")
                .and_then(parse_http_date)
                .unwrap_or_default(),
            ttl,
            soft_ttl,
            response_headers: headers.clone(),
        }
    }

    /// True if the entry is past its hard expiration.
    pub fn is_expired(&self) -> bool {
        self.ttl < now_millis()
    }

    /// True if the entry should be refreshed in the background.
    pub fn refresh_needed(&self) -> bool {
        self.soft_ttl < now_millis()
    }
}

/// Storage for response entries, keyed by cache key.
///
/// Implementations must be safe to call from multiple dispatcher tasks
/// concurrently.
pub trait CacheStore: Send + Sync + 'static {
    /// Performs whatever setup is needed before first use, e.g. scanning a
    /// cache directory. Called once by the cache triage worker on startup.
    fn initialize(&self);

    /// Retrieves a full entry, or `None` on miss or read error.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Stores an entry, replacing any previous one under the same key.
    fn put(&self, key: &str, entry: CacheEntry);

    /// Deletes the entry under `key`, if any.
    fn remove(&self, key: &str);

    /// Expires the entry under `key`: always clears the soft TTL, and with
    /// `full_expire` also the hard TTL.
    fn invalidate(&self, key: &str, full_expire: bool);

    /// Deletes all entries.
    fn clear(&self);
}

/// A cache that stores nothing. Every lookup is a miss.
#[derive(Debug, Default)]
pub struct NoopCache;

impl CacheStore for NoopCache {
    fn initialize(&self) {}

    fn get(&self, _key: &str) -> Option<CacheEntry> {
        None
    }

    fn put(&self, _key: &str, _entry: CacheEntry) {}

    fn remove(&self, _key: &str) {}

    fn invalidate(&self, _key: &str, _full_expire: bool) {}

    fn clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiration() {
        let now = now_millis();

        let fresh = CacheEntry {
            ttl: now + 10_000,
            soft_ttl: now + 10_000,
            ..Default::default()
        };
        assert!(!fresh.is_expired());
        assert!(!fresh.refresh_needed());

        let soft_expired = CacheEntry {
            ttl: now + 10_000,
            soft_ttl: now.saturating_sub(1),
            ..Default::default()
        };
        assert!(!soft_expired.is_expired());
        assert!(soft_expired.refresh_needed());

        let hard_expired = CacheEntry {
            ttl: now.saturating_sub(1),
            soft_ttl: now.saturating_sub(1),
            ..Default::default()
        };
        assert!(hard_expired.is_expired());
        assert!(hard_expired.refresh_needed());
    }

    #[test]
    fn test_entry_from_response_lifts_validators() {
        let mut headers = Headers::new();
        headers.insert("ETag", "v1");
        headers.insert("Date", "Tue, 14 Nov 2023 22:13:20 GMT");
        headers.insert("Content-Type", "text/plain");

        let response = NetworkResponse {
            status: 200,
            data: b"hello".to_vec(),
            headers,
            ..Default::default()
        };

        let entry = CacheEntry::from_response(&response, 1, 2);
        assert_eq!(entry.data, b"hello");
        assert_eq!(entry.etag.as_deref(), Some("v1"));
        assert_eq!(entry.server_date, 1_700_000_000_000);
        assert_eq!(entry.last_modified, 0);
        assert_eq!(entry.ttl, 1);
        assert_eq!(entry.soft_ttl, 2);
        assert_eq!(entry.response_headers.get("Content-Type"), Some("text/plain"));
    }
}
