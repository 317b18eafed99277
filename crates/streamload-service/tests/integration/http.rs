use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use url::Url;

use streamload_service::config::DownloadTimeouts;
use streamload_service::download::RangeFetch;
use streamload_service::download::http::HttpFetcher;
use streamload_service::error::{LoadError, LoadResult};
use streamload_service::intention::{CacheKey, Intention};
use streamload_service::loader::Loader;

use crate::{Server, drive, setup_orchestrator};

const PAYLOAD: &[u8] = b"0123456789";

fn server() -> Server {
    Server::with_files([("scene.bin", PAYLOAD)])
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(DownloadTimeouts::default()).unwrap()
}

#[derive(Clone, Debug)]
struct Remote(Url);

impl AsRef<Url> for Remote {
    fn as_ref(&self) -> &Url {
        &self.0
    }
}

/// Loads raw bytes in chunks over HTTP.
struct RemoteLoader {
    fetcher: HttpFetcher,
}

impl Loader for RemoteLoader {
    type Args = Remote;
    type Asset = Bytes;

    const NAME: &'static str = "remote";

    fn fetch<'a>(&'a self, intention: &'a Intention<Remote>) -> BoxFuture<'a, LoadResult<Bytes>> {
        self.fetcher.fetch(intention.args().as_ref()).boxed()
    }

    fn parse(&self, _intention: &Intention<Remote>, data: &[u8]) -> LoadResult<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn partial(&self) -> Option<&dyn RangeFetch<Remote>> {
        Some(&self.fetcher)
    }
}

#[tokio::test]
async fn test_fetch_whole_file() {
    streamload_test::setup();
    let server = server();

    let data = fetcher().fetch(&server.url("files/scene.bin")).await;
    assert_eq!(data, Ok(Bytes::from_static(PAYLOAD)));
    assert_eq!(server.hits().get("/files/scene.bin"), Some(&1));
}

#[tokio::test]
async fn test_error_statuses() {
    streamload_test::setup();
    let server = server();
    let fetcher = fetcher();

    let missing = fetcher.fetch(&server.url("files/missing.bin")).await;
    assert_eq!(missing, Err(LoadError::NotFound));

    let forbidden = fetcher.fetch(&server.url("respond_statuscode/403/x")).await;
    assert_eq!(
        forbidden,
        Err(LoadError::PermissionDenied("403 Forbidden".into()))
    );

    let broken = fetcher.fetch(&server.url("respond_statuscode/500/x")).await;
    assert_eq!(
        broken,
        Err(LoadError::DownloadError("500 Internal Server Error".into()))
    );
}

#[tokio::test]
async fn test_slow_server_times_out() {
    streamload_test::setup();
    let server = server();
    let fetcher = HttpFetcher::new(DownloadTimeouts {
        head: Duration::from_millis(100),
        ..Default::default()
    })
    .unwrap();

    let result = fetcher
        .fetch(&server.url("delay/1s/files/scene.bin"))
        .await;
    assert_eq!(result, Err(LoadError::Timeout(Duration::from_millis(100))));
}

#[tokio::test]
async fn test_chunked_load() {
    let server = server();
    let loader = RemoteLoader { fetcher: fetcher() };
    let mut orchestrator = setup_orchestrator(loader, |config| config.chunk_size = 4);

    let url = server.url("files/scene.bin");
    let intention = orchestrator.intention(CacheKey::from_url(&url), Remote(url));
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Ok(Bytes::from_static(PAYLOAD))));
    assert_eq!(
        server.range_requests(),
        ["bytes=0-3", "bytes=4-7", "bytes=8-9"]
    );
    assert_eq!(server.hits().get("/files/scene.bin"), Some(&3));
}

#[tokio::test]
async fn test_chunked_load_without_range_support() {
    let server = server();
    let loader = RemoteLoader { fetcher: fetcher() };
    let mut orchestrator = setup_orchestrator(loader, |config| config.chunk_size = 6);

    let url = server.url("plain/scene.bin");
    let intention = orchestrator.intention(CacheKey::from_url(&url), Remote(url));
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Ok(Bytes::from_static(PAYLOAD))));
    assert_eq!(server.hits().get("/plain/scene.bin"), Some(&2));
}

#[tokio::test]
async fn test_chunked_load_of_missing_file() {
    let server = server();
    let loader = RemoteLoader { fetcher: fetcher() };
    let mut orchestrator = setup_orchestrator(loader, |_| {});

    let url = server.url("files/missing.bin");
    let key = CacheKey::from_url(&url);
    let intention = orchestrator.intention(key.clone(), Remote(url));
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Err(LoadError::NotFound)));
    assert_eq!(server.hits().get("/files/missing.bin"), Some(&1));
    assert_eq!(
        orchestrator.cache().irrecoverable_failures().get(&key),
        Some(LoadError::NotFound)
    );
}
