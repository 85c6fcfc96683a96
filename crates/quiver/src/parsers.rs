//! Ready-made parsers for common payloads.

use std::time::Duration;

use crate::cache::{now_millis, CacheEntry};
use crate::error::Error;
use crate::request::Parse;
use crate::response::{NetworkResponse, Parsed};

/// Caching behavior shared by the bundled parsers: either don't cache, or
/// cache with caller-supplied expiration offsets.
#[derive(Debug, Clone, Copy)]
enum CachePolicy {
    Uncached,
    Cached { ttl: Duration, soft_ttl: Duration },
}

impl CachePolicy {
    fn entry_for(self, response: &NetworkResponse) -> Option<CacheEntry> {
        match self {
            CachePolicy::Uncached => None,
            CachePolicy::Cached { ttl, soft_ttl } => {
                let now = now_millis();
                Some(CacheEntry::from_response(
                    response,
                    now + ttl.as_millis() as u64,
                    now + soft_ttl.as_millis() as u64,
                ))
            }
        }
    }
}

/// Parses the response body as a UTF-8 string (lossily, as servers routinely
/// mislabel encodings).
#[derive(Debug, Clone, Copy)]
pub struct StringParser {
    policy: CachePolicy,
}

impl StringParser {
    /// A parser whose responses are never written to the cache.
    pub fn uncached() -> Self {
        StringParser {
            policy: CachePolicy::Uncached,
        }
    }

    /// A parser whose responses are cached for `ttl`, with a background
    /// refresh after `soft_ttl`.
    pub fn cached(ttl: Duration, soft_ttl: Duration) -> Self {
        StringParser {
            policy: CachePolicy::Cached { ttl, soft_ttl },
        }
    }
}

impl Parse for StringParser {
    type Output = String;

    fn parse(&self, response: &NetworkResponse) -> Result<Parsed<String>, Error> {
        let value = String::from_utf8_lossy(&response.data).into_owned();
        Ok(Parsed {
            value,
            cache_entry: self.policy.entry_for(response),
        })
    }
}

/// Hands the raw response body through untouched.
#[derive(Debug, Clone, Copy)]
pub struct BytesParser {
    policy: CachePolicy,
}

impl BytesParser {
    pub fn uncached() -> Self {
        BytesParser {
            policy: CachePolicy::Uncached,
        }
    }

    pub fn cached(ttl: Duration, soft_ttl: Duration) -> Self {
        BytesParser {
            policy: CachePolicy::Cached { ttl, soft_ttl },
        }
    }
}

impl Parse for BytesParser {
    type Output = Vec<u8>;

    fn parse(&self, response: &NetworkResponse) -> Result<Parsed<Vec<u8>>, Error> {
        Ok(Parsed {
            value: response.data.clone(),
            cache_entry: self.policy.entry_for(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::response::Headers;

    #[test]
    fn test_string_parser() {
        let response = NetworkResponse {
            status: 200,
            data: b"hello".to_vec(),
            ..Default::default()
        };
        let parsed = StringParser::uncached().parse(&response).unwrap();
        assert_eq!(parsed.value, "hello");
        assert!(parsed.cache_entry.is_none());
    }

    #[test]
    fn test_cached_parser_builds_entry() {
        let mut headers = Headers::new();
        headers.insert("ETag", "v1");
        let response = NetworkResponse {
            status: 200,
            data: b"hello".to_vec(),
            headers,
            ..Default::default()
        };

        let parser = StringParser::cached(Duration::from_secs(60), Duration::from_secs(30));
        let parsed = parser.parse(&response).unwrap();
        let entry = parsed.cache_entry.unwrap();

        assert_eq!(entry.data, b"hello");
        assert_eq!(entry.etag.as_deref(), Some("v1"));
        assert!(!entry.is_expired());
        assert!(!entry.refresh_needed());
        assert!(entry.soft_ttl < entry.ttl);
    }
}
