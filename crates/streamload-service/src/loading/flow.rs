//! The asynchronous part of a request: single-flight coordination around the retry loop.

use std::any::Any;
use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::admission::AdmissionController;
use crate::caching::{LeaderGuard, Ongoing, StreamableCache};
use crate::download::{PartialDownloader, RepeatOutcome, repeat_loop};
use crate::error::{LoadError, LoadResult};
use crate::intention::{CacheKey, Intention};
use crate::loader::Loader;
use crate::utils::defer::defer;
use crate::utils::futures::measure;
use crate::utils::sentry::ConfigureScope;

use super::LoadingState;

/// Where the result of a request came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultOrigin {
    /// This request fetched the asset itself; the cache entry already holds its reference.
    Fetched,
    /// The asset was already cached.
    Cache,
    /// This request read the asset from the disk cache; the cache entry already holds its
    /// reference.
    Disk,
    /// Another request fetched it.
    Shared,
    /// A memoized irrecoverable failure.
    Memoized,
}

/// How a flow ended.
#[derive(Debug)]
pub(crate) enum FlowOutcome<A> {
    Resolved {
        result: LoadResult<A>,
        origin: ResultOrigin,
    },
    /// The current source could not fulfill the request, others may.
    NotFulfilled,
    Cancelled,
}

impl<A> FlowOutcome<A> {
    fn status(&self) -> &'static str {
        match self {
            FlowOutcome::Resolved { result: Ok(_), .. } => "ok",
            FlowOutcome::Resolved { result: Err(_), .. } => "err",
            FlowOutcome::NotFulfilled => "not_fulfilled",
            FlowOutcome::Cancelled => "cancelled",
        }
    }
}

/// Everything the flows of one asset type share.
pub(crate) struct LoadingContext<L: Loader> {
    pub loader: L,
    pub cache: Arc<StreamableCache<L::Asset>>,
    pub admission: Arc<AdmissionController>,
    pub downloader: PartialDownloader,
}

/// Runs one source pass of a request.
///
/// The budget held by `state` is released when this returns, also when the flow panics.
pub(crate) async fn run<L: Loader>(
    context: Arc<LoadingContext<L>>,
    mut intention: Intention<L::Args>,
    mut state: LoadingState,
) -> (Intention<L::Args>, FlowOutcome<L::Asset>) {
    let budget = state.acquired_budget().cloned();
    let _release = defer(move || {
        if let Some(budget) = budget {
            budget.release();
        }
    });

    let flow = AssertUnwindSafe(cacheable_flow(&context, &mut intention, &mut state));
    let outcome = measure(
        L::NAME,
        |outcome: &Result<FlowOutcome<L::Asset>, _>| match outcome {
            Ok(outcome) => outcome.status(),
            Err(_) => "panic",
        },
        flow.catch_unwind(),
    )
    .await;
    state.release_budget();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(&*panic);
            intention.configure_scope();
            tracing::error!(loader = L::NAME, "Loading {intention} panicked: {message}");
            sentry::capture_message(
                &format!("Loading flow panicked: {message}"),
                sentry::Level::Error,
            );
            FlowOutcome::Resolved {
                result: Err(LoadError::InternalError),
                origin: ResultOrigin::Fetched,
            }
        }
    };
    (intention, outcome)
}

async fn cacheable_flow<L: Loader>(
    context: &LoadingContext<L>,
    intention: &mut Intention<L::Args>,
    state: &mut LoadingState,
) -> FlowOutcome<L::Asset> {
    let key = intention.key().clone();
    let cancel = intention.cancel_token().clone();

    loop {
        if cancel.is_cancelled() {
            return FlowOutcome::Cancelled;
        }

        let guard = match context.cache.ongoing_requests().get_or_create(&key) {
            Ongoing::Leader(guard) => guard,
            Ongoing::Follower(shared) => {
                // a waiting follower must not block admission of other requests
                state.release_budget();
                metric!(counter("caches.ongoing.joined") += 1, "cache" => context.cache.name());
                tracing::trace!("Joining running fetch of {intention}");

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return FlowOutcome::Cancelled,
                    result = shared => result,
                };
                match result {
                    Some(result) => {
                        return FlowOutcome::Resolved {
                            result,
                            origin: ResultOrigin::Shared,
                        };
                    }
                    None => {
                        tracing::trace!("Leader of {intention} finished without a result");
                        continue;
                    }
                }
            }
        };

        if !state.holds_budget() {
            // taking over from a vanished leader
            let budget = tokio::select! {
                biased;
                _ = cancel.cancelled() => return FlowOutcome::Cancelled,
                budget = context.admission.acquire() => budget,
            };
            match budget {
                Ok(budget) => state.set_budget(budget),
                Err(err) => {
                    guard.resolve(None);
                    return FlowOutcome::Resolved {
                        result: Err(err),
                        origin: ResultOrigin::Fetched,
                    };
                }
            }
        }

        return lead(context, intention, state, guard).await;
    }
}

async fn lead<L: Loader>(
    context: &LoadingContext<L>,
    intention: &mut Intention<L::Args>,
    state: &mut LoadingState,
    guard: LeaderGuard<L::Asset>,
) -> FlowOutcome<L::Asset> {
    let key = guard.key().clone();

    if let Some(asset) = context.cache.try_get(&key) {
        guard.resolve(Some(Ok(asset.clone())));
        return FlowOutcome::Resolved {
            result: Ok(asset),
            origin: ResultOrigin::Cache,
        };
    }

    if let Some(asset) = load_from_disk(context, intention, &key).await {
        return finish_loaded(context, intention, guard, asset, ResultOrigin::Disk);
    }

    if let Some(error) = context.cache.irrecoverable_failures().get(&key) {
        tracing::trace!("Memoized failure for {intention}: {error}");
        guard.resolve(Some(Err(error.clone())));
        return FlowOutcome::Resolved {
            result: Err(error),
            origin: ResultOrigin::Memoized,
        };
    }

    let outcome = repeat_loop(&context.loader, &context.downloader, intention, state).await;
    match outcome {
        RepeatOutcome::Loaded(asset) => {
            if !intention.is_cancelled() {
                store_on_disk(context, intention, &key, &asset).await;
            }
            finish_loaded(context, intention, guard, asset, ResultOrigin::Fetched)
        }
        RepeatOutcome::Failed(error) => {
            tracing::debug!("Every source of {intention} failed: {error}");
            metric!(
                counter("loading.irrecoverable") += 1,
                "loader" => L::NAME,
                "error" => error.kind(),
            );
            context
                .cache
                .irrecoverable_failures()
                .set(key, error.clone());
            guard.resolve(Some(Err(error.clone())));
            FlowOutcome::Resolved {
                result: Err(error),
                origin: ResultOrigin::Fetched,
            }
        }
        RepeatOutcome::NotFulfilled => {
            guard.resolve(None);
            FlowOutcome::NotFulfilled
        }
        RepeatOutcome::Cancelled => {
            guard.resolve(None);
            FlowOutcome::Cancelled
        }
    }
}

/// Publishes an asset this flow produced itself, unless its request was cancelled meanwhile.
fn finish_loaded<L: Loader>(
    context: &LoadingContext<L>,
    intention: &Intention<L::Args>,
    guard: LeaderGuard<L::Asset>,
    asset: L::Asset,
    origin: ResultOrigin,
) -> FlowOutcome<L::Asset> {
    if intention.is_cancelled() {
        guard.resolve(None);
        context.loader.dispose_abandoned(asset);
        return FlowOutcome::Cancelled;
    }

    // cached before anyone can observe the result
    context.cache.add(guard.key().clone(), asset.clone());
    guard.resolve(Some(Ok(asset.clone())));
    FlowOutcome::Resolved {
        result: Ok(asset),
        origin,
    }
}

async fn load_from_disk<L: Loader>(
    context: &LoadingContext<L>,
    intention: &Intention<L::Args>,
    key: &CacheKey,
) -> Option<L::Asset> {
    let disk = context.cache.disk_cache()?;
    if !context.loader.qualifies_for_disk_cache(intention) {
        return None;
    }

    let lookup = {
        let disk = Arc::clone(disk);
        let key = key.clone();
        tokio::task::spawn_blocking(move || disk.get(&key))
    };
    let payload = match lookup.await {
        Ok(Ok(payload)) => payload?,
        Ok(Err(err)) => {
            tracing::error!(error = &err as &dyn Error, "Failed to read {intention} from disk");
            return None;
        }
        Err(err) => {
            tracing::error!(error = &err as &dyn Error, "Disk lookup of {intention} failed");
            return None;
        }
    };

    match context.loader.parse(intention, &payload) {
        Ok(asset) => {
            tracing::trace!("Loaded {intention} from disk");
            Some(asset)
        }
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn Error,
                "Ignoring unreadable disk entry of {intention}"
            );
            None
        }
    }
}

async fn store_on_disk<L: Loader>(
    context: &LoadingContext<L>,
    intention: &Intention<L::Args>,
    key: &CacheKey,
    asset: &L::Asset,
) {
    let Some(disk) = context.cache.disk_cache() else {
        return;
    };
    if !context.loader.qualifies_for_disk_cache(intention) {
        return;
    }
    let Some(payload) = context.loader.to_payload(asset) else {
        return;
    };

    let store = {
        let disk = Arc::clone(disk);
        let key = key.clone();
        tokio::task::spawn_blocking(move || disk.put(&key, &payload))
    };
    match store.await {
        Ok(Ok(())) => tracing::trace!("Stored {intention} on disk"),
        Ok(Err(err)) => {
            tracing::error!(error = &err as &dyn Error, "Failed to store {intention} on disk");
        }
        Err(err) => {
            tracing::error!(error = &err as &dyn Error, "Disk write of {intention} failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
