use std::time::Duration;

use streamload_service::error::LoadError;
use streamload_service::intention::{AssetSource, AssetSources, CacheKey};

use crate::{Response, TestLoader, drive, setup_orchestrator};

fn timeout() -> Response {
    Response::Error(LoadError::Timeout(Duration::from_secs(1)))
}

#[tokio::test]
async fn test_falls_back_to_next_source() {
    let loader = TestLoader::new().respond(
        "tex:7",
        [timeout(), timeout(), timeout(), Response::Payload("texture")],
    );
    let mut orchestrator = setup_orchestrator(loader, |_| {});

    let intention = orchestrator
        .intention(CacheKey::new("tex:7"), ())
        .with_sources(AssetSource::Local.into(), AssetSource::Cdn);
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Ok("texture".to_owned())));
    assert_eq!(
        orchestrator.loader().fetched_sources("tex:7"),
        [
            AssetSource::Cdn,
            AssetSource::Cdn,
            AssetSource::Cdn,
            AssetSource::Local
        ]
    );
    assert_eq!(orchestrator.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_attempts_per_source() {
    for attempts in 1..=4 {
        let loader = TestLoader::new().respond("tex:1", std::iter::repeat_n(timeout(), 10));
        let mut orchestrator = setup_orchestrator(loader, |config| {
            config.default_attempts = attempts;
        });

        let intention = orchestrator.intention(CacheKey::new("tex:1"), ());
        let promise = orchestrator.submit(intention);
        drive(&mut orchestrator).await;

        assert_eq!(
            promise.resolved().await,
            Some(Err(LoadError::Timeout(Duration::from_secs(1))))
        );
        assert_eq!(orchestrator.loader().fetches("tex:1"), attempts as usize);
    }
}

#[tokio::test]
async fn test_non_retryable_error_moves_on() {
    let loader = TestLoader::new().respond(
        "tex:2",
        [Response::Error(LoadError::PermissionDenied("403 Forbidden".into()))],
    );
    let mut orchestrator = setup_orchestrator(loader, |_| {});

    let intention = orchestrator
        .intention(CacheKey::new("tex:2"), ())
        .with_sources(AssetSource::Embedded.into(), AssetSource::Web);
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Ok("tex:2".to_owned())));
    assert_eq!(
        orchestrator.loader().fetched_sources("tex:2"),
        [AssetSource::Web, AssetSource::Embedded]
    );
}

#[tokio::test]
async fn test_every_source_fails() {
    let loader = TestLoader::new().respond(
        "tex:3",
        [
            Response::Error(LoadError::NotFound),
            Response::Error(LoadError::NotFound),
        ],
    );
    let mut orchestrator = setup_orchestrator(loader, |_| {});
    let key = CacheKey::new("tex:3");

    let sources = AssetSources::from_iter([AssetSource::Local, AssetSource::Cdn]);
    let intention = orchestrator
        .intention(key.clone(), ())
        .with_sources(sources, AssetSource::Cdn);
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Err(LoadError::NotFound)));
    assert_eq!(
        orchestrator.loader().fetched_sources("tex:3"),
        [AssetSource::Cdn, AssetSource::Local]
    );
    assert_eq!(
        orchestrator.cache().irrecoverable_failures().get(&key),
        Some(LoadError::NotFound)
    );
    assert_eq!(orchestrator.cache().ref_count(&key), None);
}

#[tokio::test]
async fn test_failures_are_memoized() {
    let loader = TestLoader::new().respond("tex:4", [Response::Error(LoadError::NotFound)]);
    let mut orchestrator = setup_orchestrator(loader, |_| {});
    let key = CacheKey::new("tex:4");

    let intention = orchestrator.intention(key.clone(), ());
    let first = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert_eq!(first.resolved().await, Some(Err(LoadError::NotFound)));

    let intention = orchestrator.intention(key.clone(), ());
    let second = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert_eq!(second.resolved().await, Some(Err(LoadError::NotFound)));
    assert_eq!(orchestrator.loader().fetches("tex:4"), 1);

    // the resource showed up in the meantime
    orchestrator.cache().irrecoverable_failures().invalidate(&key);
    let intention = orchestrator.intention(key.clone(), ());
    let third = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert_eq!(third.resolved().await, Some(Ok("tex:4".to_owned())));
    assert_eq!(orchestrator.loader().fetches("tex:4"), 2);
}

#[tokio::test]
async fn test_parse_errors_are_not_retried() {
    let loader = TestLoader::new().respond("tex:5", [Response::Payload("\u{0}broken")]);
    let mut orchestrator = setup_orchestrator(loader, |_| {});

    let intention = orchestrator.intention(CacheKey::new("tex:5"), ());
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert!(matches!(
        promise.resolved().await,
        Some(Err(LoadError::Parse(_)))
    ));
    assert_eq!(orchestrator.loader().fetches("tex:5"), 1);
}
