use streamload_service::error::LoadError;
use streamload_service::intention::CacheKey;

use crate::{Response, TestLoader, drive, setup_orchestrator, tick_until};

#[tokio::test]
async fn test_panicking_fetch_resolves_internal_error() {
    let loader = TestLoader::new().respond("scene:13", [Response::Panic]);
    let mut orchestrator = setup_orchestrator(loader, |_| {});
    let key = CacheKey::new("scene:13");

    let intention = orchestrator.intention(key.clone(), ());
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert_eq!(promise.resolved().await, Some(Err(LoadError::InternalError)));
    assert!(!orchestrator.cache().ongoing_requests().contains(&key));
    assert_eq!(orchestrator.admission().in_flight(), 0);

    // a panic is not memoized, the next request fetches again
    let intention = orchestrator.intention(key.clone(), ());
    let promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;
    assert_eq!(promise.resolved().await, Some(Ok("scene:13".to_owned())));
    assert_eq!(orchestrator.loader().fetches("scene:13"), 2);
}

#[tokio::test]
async fn test_follower_survives_panicking_leader() {
    let loader = TestLoader::gated().respond("scene:14", [Response::Panic]);
    let mut orchestrator = setup_orchestrator(loader, |_| {});
    let key = CacheKey::new("scene:14");

    let intention = orchestrator.intention(key.clone(), ());
    let leader = orchestrator.submit(intention);
    let intention = orchestrator.intention(key.clone(), ());
    let follower = orchestrator.submit(intention);

    tick_until(&mut orchestrator, |o| {
        o.loader().total_fetches() == 1 && o.admission().in_flight() == 1
    })
    .await;
    orchestrator.loader().open_gate();
    drive(&mut orchestrator).await;

    assert_eq!(leader.resolved().await, Some(Err(LoadError::InternalError)));
    assert_eq!(follower.resolved().await, Some(Ok("scene:14".to_owned())));
    assert_eq!(orchestrator.loader().fetches("scene:14"), 2);
    assert_eq!(orchestrator.admission().in_flight(), 0);
}
