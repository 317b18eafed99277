//! Helpers for testing the loading pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`Server`], make sure that it is held until all requests to it have been
//!    made. Dropping it stops serving, and its files are deleted along with it.
//!
//!  - [`TestLoader`] answers from scripted responses and never touches the network. Use
//!    [`TestLoader::gated`] to keep fetches pending until the test opens the gate.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract;
use axum::http::{StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

use streamload_service::error::{LoadError, LoadResult};
use streamload_service::intention::{AssetSource, Intention};
use streamload_service::loader::Loader;
use streamload_service::loading::Orchestrator;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `streamload_service` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("streamload_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Ticks `orchestrator` until every submitted request has settled.
///
/// # Panics
///
/// Panics if the requests do not settle within a few seconds.
pub async fn drive<L: Loader>(orchestrator: &mut Orchestrator<L>) {
    tick_until(orchestrator, |orchestrator| orchestrator.pending() == 0).await
}

/// Ticks `orchestrator` until `condition` holds.
pub async fn tick_until<L, F>(orchestrator: &mut Orchestrator<L>, mut condition: F)
where
    L: Loader,
    F: FnMut(&Orchestrator<L>) -> bool,
{
    for _ in 0..5_000 {
        orchestrator.tick();
        if condition(orchestrator) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached, {orchestrator:?}");
}

/// A scripted answer of the [`TestLoader`].
#[derive(Clone, Debug)]
pub enum Response {
    Payload(&'static str),
    Error(LoadError),
    /// Panics inside the fetch.
    Panic,
}

/// A loader answering fetches from scripted per-key responses.
///
/// Once the responses of a key are used up, fetches return the key itself as payload.
/// Payloads starting with a nul byte fail to parse. Every intention qualifies for the disk
/// cache unless [`without_disk_cache`](Self::without_disk_cache) is used.
#[derive(Debug)]
pub struct TestLoader {
    responses: Mutex<HashMap<String, VecDeque<Response>>>,
    fetches: Mutex<Vec<(String, AssetSource)>>,
    disposed: Mutex<Vec<String>>,
    cancel_on_parse: HashSet<String>,
    disk_cache: bool,
    gate: watch::Sender<bool>,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::with_gate(true)
    }

    /// A loader whose fetches wait for [`open_gate`](Self::open_gate).
    pub fn gated() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        Self {
            responses: Default::default(),
            fetches: Default::default(),
            disposed: Default::default(),
            cancel_on_parse: Default::default(),
            disk_cache: true,
            gate: watch::Sender::new(open),
        }
    }

    /// Queues `responses` for fetches of `key`.
    pub fn respond(self, key: &str, responses: impl IntoIterator<Item = Response>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .extend(responses);
        self
    }

    /// Cancels the intention of `key` once its payload arrived, right before parsing it.
    pub fn cancel_after_fetch(mut self, key: &str) -> Self {
        self.cancel_on_parse.insert(key.to_owned());
        self
    }

    /// Keeps all intentions out of the disk cache.
    pub fn without_disk_cache(mut self) -> Self {
        self.disk_cache = false;
        self
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// The number of fetches started for `key`.
    pub fn fetches(&self, key: &str) -> usize {
        self.fetches.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    /// The sources fetched from for `key`, in order.
    pub fn fetched_sources(&self, key: &str) -> Vec<AssetSource> {
        let fetches = self.fetches.lock().unwrap();
        fetches
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, source)| *source)
            .collect()
    }

    /// Assets that were loaded after every request for them was cancelled.
    pub fn disposed(&self) -> Vec<String> {
        self.disposed.lock().unwrap().clone()
    }
}

impl Default for TestLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader for TestLoader {
    type Args = ();
    type Asset = String;

    const NAME: &'static str = "test";

    fn fetch<'a>(&'a self, intention: &'a Intention<()>) -> BoxFuture<'a, LoadResult<Bytes>> {
        let key = intention.key().as_str().to_owned();
        self.fetches
            .lock()
            .unwrap()
            .push((key.clone(), intention.current_source()));
        let response = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        let mut gate = self.gate.subscribe();

        async move {
            gate.wait_for(|open| *open).await.ok();
            match response {
                Some(Response::Payload(payload)) => Ok(Bytes::from_static(payload.as_bytes())),
                Some(Response::Error(error)) => Err(error),
                Some(Response::Panic) => panic!("fetch of {key} blew up"),
                None => Ok(Bytes::from(key.into_bytes())),
            }
        }
        .boxed()
    }

    fn parse(&self, intention: &Intention<()>, data: &[u8]) -> LoadResult<String> {
        if self.cancel_on_parse.contains(intention.key().as_str()) {
            intention.cancel();
        }
        match data.first() {
            Some(0) => Err(LoadError::Parse("unexpected nul byte".into())),
            _ => String::from_utf8(data.to_vec()).map_err(|e| LoadError::Parse(e.to_string())),
        }
    }

    fn qualifies_for_disk_cache(&self, _intention: &Intention<()>) -> bool {
        self.disk_cache
    }

    fn to_payload(&self, asset: &String) -> Option<Bytes> {
        Some(Bytes::from(asset.clone()))
    }

    fn dispose_abandoned(&self, asset: String) {
        self.disposed.lock().unwrap().push(asset);
    }
}

/// A test server that binds to a random port and serves files from a temporary directory.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
///
/// Routes:
///
///  - `/files/<name>`: the files passed to [`Server::with_files`], with support for range
///    requests.
///  - `/plain/<name>`: the same files, ignoring range requests.
///  - `/respond_statuscode/<code>/...`: an empty response with the given status.
///  - `/delay/<duration>/...`: redirects to `/...` after the given delay.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    ranges: Arc<Mutex<Vec<String>>>,
    _files: TempDir,
}

impl Server {
    pub fn new() -> Self {
        Self::with_files([])
    }

    /// Creates a server for the given `(name, contents)` pairs.
    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }

        let hits = Arc::new(Mutex::new(BTreeMap::new()));
        let ranges = Arc::new(Mutex::new(Vec::new()));

        let hitcounter = {
            let hits = hits.clone();
            let ranges = ranges.clone();
            move |request: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                let ranges = ranges.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(request.uri().path().to_owned()).or_default() += 1;
                    }
                    if let Some(range) = request.headers().get(header::RANGE) {
                        let range = String::from_utf8_lossy(range.as_bytes()).into_owned();
                        ranges.lock().unwrap().push(range);
                    }

                    next.run(request).await
                }
            }
        };

        let plain_dir = dir.path().to_owned();
        let router = Router::new()
            .nest_service("/files", ServeDir::new(dir.path()))
            .route(
                "/plain/*name",
                get(move |extract::Path(name): extract::Path<String>| {
                    let path = plain_dir.join(name);
                    async move {
                        match tokio::fs::read(path).await {
                            Ok(contents) => (StatusCode::OK, contents),
                            Err(_) => (StatusCode::NOT_FOUND, Vec::new()),
                        }
                    }
                }),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
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
            ranges,
            _files: dir,
        }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.socket.port(), path)
            .parse()
            .unwrap()
    }

    /// Requests per path.
    pub fn hits(&self) -> BTreeMap<String, usize> {
        self.hits.lock().unwrap().clone()
    }

    /// The `Range` headers of all requests, in order.
    pub fn range_requests(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
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
