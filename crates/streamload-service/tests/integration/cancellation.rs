use streamload_service::intention::CacheKey;
use streamload_service::loading::Status;

use crate::{TestLoader, drive, setup_orchestrator, tick_until};

#[tokio::test]
async fn test_cancelled_request_is_torn_down_silently() {
    let mut orchestrator = setup_orchestrator(TestLoader::gated(), |_| {});
    let key = CacheKey::new("scene:5");

    let intention = orchestrator.intention(key.clone(), ());
    let mut promise = orchestrator.submit(intention);
    tick_until(&mut orchestrator, |o| o.loader().total_fetches() == 1).await;
    assert_eq!(orchestrator.status(promise.id()), Some(Status::InProgress));

    promise.cancel();
    drive(&mut orchestrator).await;

    assert!(promise.is_abandoned());
    assert!(promise.try_result().is_none());
    assert_eq!(orchestrator.admission().in_flight(), 0);
    assert!(!orchestrator.cache().ongoing_requests().contains(&key));
    assert_eq!(orchestrator.cache().ref_count(&key), None);
    assert!(orchestrator.cache().irrecoverable_failures().is_empty());
}

#[tokio::test]
async fn test_asset_loaded_after_cancellation_is_disposed() {
    let loader = TestLoader::new().cancel_after_fetch("scene:6");
    let mut orchestrator = setup_orchestrator(loader, |_| {});
    let key = CacheKey::new("scene:6");

    let intention = orchestrator.intention(key.clone(), ());
    let mut promise = orchestrator.submit(intention);
    drive(&mut orchestrator).await;

    assert!(promise.is_abandoned());
    assert!(promise.try_result().is_none());
    assert_eq!(orchestrator.loader().fetches("scene:6"), 1);
    assert_eq!(orchestrator.loader().disposed(), ["scene:6"]);
    assert_eq!(orchestrator.cache().ref_count(&key), None);
    assert!(!orchestrator.cache().ongoing_requests().contains(&key));
    assert!(orchestrator.cache().irrecoverable_failures().is_empty());
    assert_eq!(orchestrator.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_follower_takes_over_from_cancelled_leader() {
    let mut orchestrator = setup_orchestrator(TestLoader::gated(), |_| {});
    let key = CacheKey::new("scene:7");

    let intention = orchestrator.intention(key.clone(), ());
    let mut leader = orchestrator.submit(intention);
    let intention = orchestrator.intention(key.clone(), ());
    let follower = orchestrator.submit(intention);

    tick_until(&mut orchestrator, |o| {
        o.loader().total_fetches() == 1 && o.admission().in_flight() == 1
    })
    .await;

    leader.cancel();
    // the follower leads a new fetch with a budget of its own
    tick_until(&mut orchestrator, |o| o.loader().total_fetches() == 2).await;
    assert_eq!(orchestrator.admission().in_flight(), 1);
    assert!(orchestrator.cache().ongoing_requests().contains(&key));

    orchestrator.loader().open_gate();
    drive(&mut orchestrator).await;

    assert!(leader.is_abandoned());
    assert_eq!(follower.resolved().await, Some(Ok("scene:7".to_owned())));
    assert_eq!(orchestrator.cache().ref_count(&key), Some(1));
    assert_eq!(orchestrator.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_cancelled_follower_leaves_leader_alone() {
    let mut orchestrator = setup_orchestrator(TestLoader::gated(), |_| {});
    let key = CacheKey::new("scene:8");

    let intention = orchestrator.intention(key.clone(), ());
    let leader = orchestrator.submit(intention);
    let intention = orchestrator.intention(key.clone(), ());
    let mut follower = orchestrator.submit(intention);

    tick_until(&mut orchestrator, |o| {
        o.loader().total_fetches() == 1 && o.admission().in_flight() == 1
    })
    .await;

    follower.cancel();
    tick_until(&mut orchestrator, |o| o.pending() == 1).await;
    assert!(follower.is_abandoned());

    orchestrator.loader().open_gate();
    drive(&mut orchestrator).await;

    assert_eq!(leader.resolved().await, Some(Ok("scene:8".to_owned())));
    assert_eq!(orchestrator.loader().fetches("scene:8"), 1);
    assert_eq!(orchestrator.cache().ref_count(&key), Some(1));
}

#[tokio::test]
async fn test_shutdown_abandons_everything() {
    let mut orchestrator = setup_orchestrator(TestLoader::gated(), |config| {
        config.max_concurrent_loads = 2;
    });

    let mut promises: Vec<_> = ["mesh:1", "mesh:2", "mesh:3"]
        .into_iter()
        .map(|key| {
            let intention = orchestrator.intention(CacheKey::new(key), ());
            orchestrator.submit(intention)
        })
        .collect();

    tick_until(&mut orchestrator, |o| o.loader().total_fetches() == 2).await;
    orchestrator.shutdown();
    drive(&mut orchestrator).await;

    for promise in &mut promises {
        assert!(promise.is_abandoned());
    }
    assert_eq!(orchestrator.loader().total_fetches(), 2);
    assert_eq!(orchestrator.admission().in_flight(), 0);
    assert!(orchestrator.cache().is_empty());
}

#[tokio::test]
async fn test_budget_is_never_exceeded() {
    let mut orchestrator = setup_orchestrator(TestLoader::gated(), |config| {
        config.max_concurrent_loads = 3;
    });

    let mut promises: Vec<_> = (0..20)
        .map(|i| {
            let key = CacheKey::new(format!("tex:{}", i % 7));
            let intention = orchestrator.intention(key, ());
            orchestrator.submit(intention)
        })
        .collect();
    for promise in promises.iter().step_by(4) {
        promise.cancel();
    }

    tick_until(&mut orchestrator, |o| o.admission().in_flight() == 3).await;
    orchestrator.loader().open_gate();

    let mut max_in_flight = 0;
    tick_until(&mut orchestrator, |o| {
        max_in_flight = max_in_flight.max(o.admission().in_flight());
        o.pending() == 0
    })
    .await;

    assert!(max_in_flight <= 3);
    assert_eq!(orchestrator.admission().in_flight(), 0);
    for (i, promise) in promises.iter_mut().enumerate() {
        if i % 4 == 0 {
            assert!(promise.is_abandoned());
        } else {
            assert!(matches!(promise.try_result(), Some(Ok(_))));
        }
    }
    assert!(orchestrator.loader().total_fetches() <= 7);
}
