//! Helpers for testing the request pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp
//!    directory is held for the entire lifetime of the test, e.g.
//!    `let _cache_dir = quiver_test::tempdir()`. When dropped too early the
//!    cache writes into a deleted directory and every test lookup misses.
//!
//!  - When using [`Server`], hold the server until all requests to it have
//!    been made. If the server is dropped, connections to it time out.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::extract;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the `quiver` crate
/// and the test server, and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("quiver=trace,tower_http=debug"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it
/// as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// The server counts all requests, to be accessed via `accesses` or
/// `all_hits`. It has a couple of routes with different behavior:
///
/// - `/echo/$data` responds with `$data` as the body.
/// - `/redirect/$path` redirects (302) to the `$path` url.
/// - `/moved/$path` redirects permanently (301) to the `$path` url.
/// - `/delay/$time/$path` sleeps for `$time` and then redirects to `$path`.
/// - `/status/$num` responds with the given status code.
/// - `/cached/$tag` responds `304 Not Modified` when the request carries
///   `If-None-Match: "$tag"`, and otherwise with a body and validators
///   (`ETag`, `Date`, `Last-Modified`).
///
/// This server requires a `tokio` runtime and is supposed to be run in a
/// `tokio::test`. It automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    /// Creates a new Server with the testing-focused router described in the
    /// main [`Server`] docs.
    pub fn new() -> Self {
        Self::with_router(Self::test_router())
    }

    /// Creates a new Server with the given [`Router`].
    pub fn with_router(router: Router) -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |req: extract::Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(req.uri().to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = router
            .layer(middleware::from_fn(hitcounter))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Creates a new [`Router`] with the routes described in the main
    /// [`Server`] docs.
    pub fn test_router() -> Router {
        Router::new()
            .route(
                "/echo/{*data}",
                get(|extract::Path(data): extract::Path<String>| async move { data }),
            )
            .route(
                "/redirect/{*path}",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [("Location", format!("/{path}"))])
                }),
            )
            .route(
                "/moved/{*path}",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (
                        StatusCode::MOVED_PERMANENTLY,
                        [("Location", format!("/{path}"))],
                    )
                }),
            )
            .route(
                "/delay/{time}/{*path}",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/status/{num}",
                get(|extract::Path(num): extract::Path<u16>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route(
                "/cached/{tag}",
                get(
                    |extract::Path(tag): extract::Path<String>, headers: HeaderMap| async move {
                        let etag = format!("\"{tag}\"");
                        let matches = headers
                            .get("If-None-Match")
                            .and_then(|value| value.to_str().ok())
                            .is_some_and(|value| value == etag);

                        let common = [
                            ("ETag", etag),
                            ("Date", "Wed, 01 Jan 2025 00:00:00 GMT".to_owned()),
                            ("Last-Modified", "Tue, 31 Dec 2024 00:00:00 GMT".to_owned()),
                        ];

                        if matches {
                            (StatusCode::NOT_MODIFIED, common, String::new()).into_response()
                        } else {
                            (StatusCode::OK, common, format!("cached-body-{tag}"))
                                .into_response()
                        }
                    },
                ),
            )
    }

    /// Returns the sum total of hits and clears the hit counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns a sorted list of `(path, hits)`-tuples, and clears the hit
    /// counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.socket.port(), path)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
