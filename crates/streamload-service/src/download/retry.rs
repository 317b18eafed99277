use std::error::Error;

use crate::error::{ErrorClass, LoadError, LoadResult};
use crate::intention::Intention;
use crate::loader::Loader;
use crate::loading::LoadingState;

use super::PartialDownloader;

/// The outcome of [`repeat_loop`].
#[derive(Debug, PartialEq)]
pub enum RepeatOutcome<T> {
    /// The asset was fetched and parsed.
    Loaded(T),
    /// The last permitted source failed with this error.
    Failed(LoadError),
    /// The current source is exhausted, but other permitted sources are left.
    NotFulfilled,
    /// The intention was cancelled.
    Cancelled,
}

/// Fetches and parses an asset from the intention's current source, retrying transient errors.
///
/// Every transient error consumes one attempt; the source is retried immediately while
/// attempts are left. Once the source is of no further use it is removed from the permitted
/// sources, and the loop reports [`Failed`](RepeatOutcome::Failed) if that was the last one,
/// or [`NotFulfilled`](RepeatOutcome::NotFulfilled) otherwise.
pub async fn repeat_loop<L: Loader>(
    loader: &L,
    downloader: &PartialDownloader,
    intention: &mut Intention<L::Args>,
    state: &mut LoadingState,
) -> RepeatOutcome<L::Asset> {
    loop {
        if intention.is_cancelled() {
            return RepeatOutcome::Cancelled;
        }

        metric!(
            counter("loading.fetch") += 1,
            "loader" => L::NAME,
            "source" => intention.current_source().as_str(),
        );

        let cancel = intention.cancel_token().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            result = attempt(loader, downloader, intention, state) => result,
        };
        let error = match result {
            Ok(asset) => return RepeatOutcome::Loaded(asset),
            Err(error) => error,
        };

        match loader.classify_error(&error) {
            ErrorClass::Cancellation => return RepeatOutcome::Cancelled,
            ErrorClass::Transient => {
                let remaining = intention.decrement_attempts();
                if remaining > 0 {
                    tracing::debug!(
                        error = &error as &dyn Error,
                        "Retrying {intention}, {remaining} attempts left"
                    );
                    metric!(counter("loading.retry") += 1, "loader" => L::NAME);
                    continue;
                }
            }
            ErrorClass::NonRetryable => {}
        }

        tracing::debug!(error = &error as &dyn Error, "Giving up on {intention}");
        metric!(
            counter("loading.source_exhausted") += 1,
            "loader" => L::NAME,
            "source" => intention.current_source().as_str(),
            "error" => error.kind(),
        );

        intention.remove_current_source();
        return match intention.permitted_sources().is_empty() {
            true => RepeatOutcome::Failed(error),
            false => RepeatOutcome::NotFulfilled,
        };
    }
}

async fn attempt<L: Loader>(
    loader: &L,
    downloader: &PartialDownloader,
    intention: &Intention<L::Args>,
    state: &mut LoadingState,
) -> LoadResult<L::Asset> {
    match loader.partial() {
        Some(fetcher) => {
            let payload = downloader
                .download(fetcher, intention, state.partial_mut())
                .await?;
            loader.parse(intention, &payload)
        }
        None => {
            let payload = loader.fetch(intention).await?;
            loader.parse(intention, &payload)
        }
    }
}
