//! The reqwest-backed [`Transport`] implementation.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, redirect, Client, Url};

use crate::request::{Method, Request};
use crate::response::Headers;
use crate::transport::{RawResponse, Transport, TransportError};

/// HTTP User-Agent string to use.
const USER_AGENT: &str = concat!("quiver/", env!("CARGO_PKG_VERSION"));

/// [`Transport`] backed by a shared [`reqwest::Client`].
///
/// The client is configured to *not* follow redirects: the network workers
/// translate 3xx themselves so the retry policy governs redirect handling.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Self {
        let client = Client::builder()
            .gzip(true)
            .redirect(redirect::Policy::none())
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("TLS backend must be available");
        ReqwestTransport { client }
    }

    /// Creates a transport from a custom client.
    ///
    /// The client should have redirects disabled; a client that follows
    /// redirects hides 301/302 from the pipeline's redirect handling.
    pub fn with_client(client: Client) -> Self {
        ReqwestTransport { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(
        &self,
        request: &Request,
        extra_headers: &Headers,
    ) -> Result<RawResponse, TransportError> {
        let url = request.effective_url();
        let url = Url::parse(&url).map_err(|error| {
            TransportError::MalformedUrl(format!("{url}: {error}"))
        })?;

        let body = request.body();
        let method = match request.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
            Method::Trace => reqwest::Method::TRACE,
            Method::Patch => reqwest::Method::PATCH,
            Method::LegacyGetOrPost if body.is_some() => reqwest::Method::POST,
            Method::LegacyGetOrPost => reqwest::Method::GET,
        };

        let mut builder = self
            .client
            .request(method, url)
            .timeout(request.timeout())
            .header(header::USER_AGENT, USER_AGENT);

        for (name, value) in request.headers().iter().chain(extra_headers.iter()) {
            if let Ok(name) = header::HeaderName::from_bytes(name.as_bytes()) {
                builder = builder.header(name, value);
            }
        }

        if let Some(body) = body {
            if request.headers().get("Content-Type").is_none() {
                builder = builder.header(header::CONTENT_TYPE, request.body_content_type());
            }
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify_error)?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str(), value);
            }
        }

        let mut stream = response.bytes_stream();
        let mut raw_body = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_error)?;
            raw_body.extend_from_slice(&chunk);
        }

        Ok(RawResponse {
            status,
            headers,
            body: raw_body,
        })
    }
}

fn classify_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        if error.is_connect() {
            TransportError::ConnectTimeout
        } else {
            TransportError::SocketTimeout
        }
    } else if error.is_connect() {
        TransportError::NoConnection(root_cause(&error))
    } else if error.is_builder() {
        TransportError::MalformedUrl(root_cause(&error))
    } else {
        TransportError::Io(root_cause(&error))
    }
}

/// Digs out the innermost error message, which is usually the only part a
/// user can act on.
fn root_cause(error: &dyn std::error::Error) -> String {
    let mut error = error;
    while let Some(source) = error.source() {
        error = source;
    }
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::parsers::StringParser;
    use crate::request::Listener;
    use crate::retry::RetryPolicy;

    fn noop_listener() -> Listener<String> {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn test_perform_reads_body() {
        quiver_test::setup();
        let server = quiver_test::Server::new();

        let request = Request::get(server.url("/echo/hello-world"))
            .build(StringParser::uncached(), noop_listener());
        let transport = ReqwestTransport::new();

        let response = transport.perform(&request, &Headers::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello-world");
    }

    #[tokio::test]
    async fn test_redirects_are_surfaced() {
        quiver_test::setup();
        let server = quiver_test::Server::new();

        let request = Request::get(server.url("/redirect/echo/after"))
            .build(StringParser::uncached(), noop_listener());
        let transport = ReqwestTransport::new();

        let response = transport.perform(&request, &Headers::new()).await.unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(response.headers.get("Location"), Some("/echo/after"));
    }

    #[tokio::test]
    async fn test_conditional_headers_reach_server() {
        quiver_test::setup();
        let server = quiver_test::Server::new();

        let request = Request::get(server.url("/cached/v1"))
            .build(StringParser::uncached(), noop_listener());
        let transport = ReqwestTransport::new();

        let mut conditional = Headers::new();
        conditional.insert("If-None-Match", "\"v1\"");
        let response = transport.perform(&request, &conditional).await.unwrap();
        assert_eq!(response.status, 304);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_url() {
        quiver_test::setup();

        let request =
            Request::get("not a url at all").build(StringParser::uncached(), noop_listener());
        let transport = ReqwestTransport::new();

        let error = transport
            .perform(&request, &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::MalformedUrl(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        quiver_test::setup();
        let server = quiver_test::Server::new();

        let request = Request::get(server.url("/delay/2s/echo/late"))
            .retry_policy(RetryPolicy::new(Duration::from_millis(100), 0, 1.0))
            .build(StringParser::uncached(), noop_listener());
        let transport = ReqwestTransport::new();

        let error = transport
            .perform(&request, &Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            TransportError::SocketTimeout | TransportError::ConnectTimeout
        ));
    }
}
