//! Wire-level response types shared between the transport, the cache and
//! request parsers.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::cache::CacheEntry;

/// An HTTP header map with case-insensitive lookup.
///
/// Header names keep the casing they were inserted with, but lookups and
/// replacement compare names ASCII-case-insensitively as HTTP requires.
/// Insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any existing header with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx] = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Looks up a header value by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .map(|idx| self.entries[idx].1.as_str())
    }

    /// Merges `other` into `self`, replacing headers of the same name.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in &other.entries {
            self.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a String);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a String, &'a String),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(|(n, v)| (n, v))
    }
}

/// A raw response as seen by request parsers.
///
/// This is either the translated result of a network exchange, or a synthetic
/// response assembled from a cache entry by the cache triage worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The response body.
    pub data: Vec<u8>,
    /// The response headers.
    pub headers: Headers,
    /// True when the server answered `304 Not Modified` and `data` carries
    /// the locally cached body.
    pub not_modified: bool,
    /// Round-trip time of the network exchange. Zero for cache-sourced
    /// responses.
    pub network_time: Duration,
}

impl NetworkResponse {
    /// Assembles a synthetic `200 OK` response from a cache entry.
    pub(crate) fn from_cache(entry: &CacheEntry) -> Self {
        NetworkResponse {
            status: 200,
            data: entry.data.clone(),
            headers: entry.response_headers.clone(),
            not_modified: false,
            network_time: Duration::ZERO,
        }
    }
}

/// The successful output of a parser: the typed value plus an optional cache
/// entry the pipeline should persist before delivery.
#[derive(Debug)]
pub struct Parsed<T> {
    pub value: T,
    pub cache_entry: Option<CacheEntry>,
}

impl<T> Parsed<T> {
    /// A parsed value that should not be cached.
    pub fn uncached(value: T) -> Self {
        Parsed {
            value,
            cache_entry: None,
        }
    }

    /// A parsed value together with the entry to write to the cache.
    pub fn cached(value: T, cache_entry: CacheEntry) -> Self {
        Parsed {
            value,
            cache_entry: Some(cache_entry),
        }
    }
}

/// Formats a millisecond epoch timestamp as an RFC 1123 HTTP date, suitable
/// for `If-Modified-Since`.
pub(crate) fn format_http_date(epoch_millis: u64) -> String {
    let date = Utc
        .timestamp_millis_opt(epoch_millis as i64)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an RFC 1123 HTTP date into a millisecond epoch timestamp.
pub(crate) fn parse_http_date(value: &str) -> Option<u64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp_millis().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get("content-length"), None);
    }

    #[test]
    fn test_headers_insert_replaces() {
        let mut headers = Headers::new();
        headers.insert("ETag", "v1");
        headers.insert("etag", "v2");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("ETag"), Some("v2"));
    }

    #[test]
    fn test_headers_merge() {
        let mut cached: Headers = [("Date", "old"), ("ETag", "v1")]
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        let fresh: Headers = [("date", "new"), ("Age", "0")]
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();

        cached.merge(&fresh);

        assert_eq!(cached.get("Date"), Some("new"));
        assert_eq!(cached.get("ETag"), Some("v1"));
        assert_eq!(cached.get("Age"), Some("0"));
    }

    #[test]
    fn test_http_date_round_trip() {
        // HTTP dates have second granularity.
        let millis = 1_700_000_000_000;
        let formatted = format_http_date(millis);
        assert_eq!(parse_http_date(&formatted), Some(millis));
    }

    #[test]
    fn test_parse_http_date_rejects_garbage() {
        assert_eq!(parse_http_date("not a date"), None);
    }
}
