//! # Request lifecycle
//!
//! An [`Orchestrator`] owns the requests of one asset type. It is driven by the client's
//! simulation loop calling [`Orchestrator::tick`]; all request bookkeeping happens inside
//! `tick`, while the fetches themselves run as tasks on a tokio runtime.
//!
//! A request goes through one or more source passes:
//!
//! 1. While [`Idle`](Status::Idle), every tick tries to take admission budget for it.
//! 2. Once admitted, the current source is removed from the permitted ones and a flow is
//!    spawned. The flow either joins a running fetch of the same key, or leads a fetch
//!    through the cache, the disk cache, the memoized failures and finally the retry loop.
//! 3. The flow reports back over a channel. A result is attached to the promise; a source
//!    that could not fulfill the request makes the request [`Idle`](Status::Idle) again with
//!    the next source; a cancelled request is torn down without a result.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sentry::SentryFutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::admission::AdmissionController;
use crate::caching::StreamableCache;
use crate::config::LoadingConfig;
use crate::download::PartialDownloader;
use crate::error::{LoadError, LoadResult};
use crate::intention::{CacheKey, Intention};
use crate::loader::Loader;

mod flow;
mod promise;
mod state;

use flow::{FlowOutcome, LoadingContext};

pub use flow::ResultOrigin;
pub use promise::{Promise, RequestId};
pub use state::{LoadingState, Status};

struct Request<L: Loader> {
    intention: Intention<L::Args>,
    state: LoadingState,
    sender: Option<oneshot::Sender<LoadResult<L::Asset>>>,
}

struct Completion<L: Loader> {
    id: RequestId,
    intention: Intention<L::Args>,
    outcome: FlowOutcome<L::Asset>,
}

/// Drives the requests of one asset type from submission to result.
pub struct Orchestrator<L: Loader> {
    context: Arc<LoadingContext<L>>,
    runtime: tokio::runtime::Handle,
    default_attempts: u32,
    requests: BTreeMap<RequestId, Request<L>>,
    next_id: u64,
    completion_sender: mpsc::UnboundedSender<Completion<L>>,
    completions: mpsc::UnboundedReceiver<Completion<L>>,
}

impl<L: Loader> Orchestrator<L> {
    /// Creates an orchestrator spawning its flows on `runtime`.
    ///
    /// `cache` and `admission` may be shared with other orchestrators.
    pub fn new(
        loader: L,
        cache: Arc<StreamableCache<L::Asset>>,
        admission: Arc<AdmissionController>,
        config: &LoadingConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let (completion_sender, completions) = mpsc::unbounded_channel();
        let context = LoadingContext {
            loader,
            cache,
            admission,
            downloader: PartialDownloader::from_config(config),
        };

        Self {
            context: Arc::new(context),
            runtime,
            default_attempts: config.default_attempts,
            requests: BTreeMap::new(),
            next_id: 0,
            completion_sender,
            completions,
        }
    }

    /// Creates an intention with the configured number of attempts.
    pub fn intention(&self, key: CacheKey, args: L::Args) -> Intention<L::Args> {
        Intention::new(key, args).with_attempts(self.default_attempts)
    }

    pub fn cache(&self) -> &Arc<StreamableCache<L::Asset>> {
        &self.context.cache
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.context.admission
    }

    pub fn loader(&self) -> &L {
        &self.context.loader
    }

    /// Registers a request, which is started by one of the next ticks.
    pub fn submit(&mut self, intention: Intention<L::Args>) -> Promise<L::Asset> {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let (sender, receiver) = oneshot::channel();
        let promise = Promise::new(id, receiver, intention.cancel_token().clone());
        tracing::trace!("Submitted {intention} as {id}");

        self.requests.insert(
            id,
            Request {
                intention,
                state: LoadingState::default(),
                sender: Some(sender),
            },
        );
        promise
    }

    /// Performs one cooperative pass over all requests.
    ///
    /// Returns the number of flows started.
    pub fn tick(&mut self) -> usize {
        while let Ok(completion) = self.completions.try_recv() {
            self.finalize(completion);
        }

        let mut idle: Vec<_> = self
            .requests
            .iter()
            .filter(|(_, request)| request.state.status() == Status::Idle)
            .map(|(id, request)| (request.intention.partition(), *id))
            .collect();
        idle.sort();

        let mut started = 0;
        let mut exhausted = false;
        for (_, id) in idle {
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };

            let lost_interest = request.sender.as_ref().is_none_or(|s| s.is_closed());
            if request.intention.is_cancelled() || lost_interest {
                self.abandon(id);
                continue;
            }
            if exhausted {
                continue;
            }

            let Some(budget) = self.context.admission.try_acquire() else {
                exhausted = true;
                continue;
            };
            request.state.allow(budget);
            request.state.start_progress();
            request.intention.remove_current_source();

            let flow_state = request.state.fork_for_flow();
            let intention = request.intention.clone();
            self.spawn_flow(id, intention, flow_state);
            started += 1;
        }
        started
    }

    /// The number of requests without a result yet.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// The status of a request that has not been finalized yet.
    pub fn status(&self, id: RequestId) -> Option<Status> {
        self.requests.get(&id).map(|request| request.state.status())
    }

    /// Cancels every request.
    ///
    /// Running flows stop at their next cancellation point; the next ticks tear the
    /// requests down without results.
    pub fn shutdown(&mut self) {
        tracing::debug!(loader = L::NAME, "Shutting down {} requests", self.requests.len());
        for request in self.requests.values() {
            request.intention.cancel();
        }
    }

    fn spawn_flow(&self, id: RequestId, intention: Intention<L::Args>, state: LoadingState) {
        let context = Arc::clone(&self.context);
        let sender = self.completion_sender.clone();

        let job = async move {
            let (intention, outcome) = flow::run(context, intention, state).await;
            // the orchestrator was dropped, nobody is waiting anymore
            sender
                .send(Completion {
                    id,
                    intention,
                    outcome,
                })
                .ok();
        };
        self.runtime
            .spawn(job.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));
    }

    fn finalize(&mut self, completion: Completion<L>) {
        let Completion {
            id,
            intention,
            outcome,
        } = completion;
        let Some(mut request) = self.requests.remove(&id) else {
            return;
        };
        request.state.release_budget();
        request.intention = intention;

        match outcome {
            FlowOutcome::Resolved { result, origin } => {
                request.state.finish();
                self.resolve(request, result, origin);
            }
            FlowOutcome::NotFulfilled if request.intention.is_cancelled() => {
                self.tear_down(request);
            }
            FlowOutcome::NotFulfilled => {
                match self.context.loader.next_source(&request.intention) {
                    Some(source) if request.intention.permitted_sources().contains(source) => {
                        tracing::debug!(
                            "{} not fulfilled, trying {source} next",
                            request.intention
                        );
                        request.intention.prepare_for_source(source);
                        request.state = LoadingState::default();
                        self.requests.insert(id, request);
                    }
                    _ => {
                        tracing::debug!("No source left for {}", request.intention);
                        self.resolve(request, Err(LoadError::NotFound), ResultOrigin::Fetched);
                    }
                }
            }
            FlowOutcome::Cancelled => self.tear_down(request),
        }
    }

    fn resolve(&self, mut request: Request<L>, result: LoadResult<L::Asset>, origin: ResultOrigin) {
        let key = request.intention.key();
        let referenced = match &result {
            Ok(asset) => {
                tracing::debug!("{} successfully loaded ({origin:?})", request.intention);
                if !matches!(origin, ResultOrigin::Fetched | ResultOrigin::Disk) {
                    self.context.cache.add_reference(key, asset.clone());
                }
                true
            }
            Err(error) => {
                tracing::debug!("{} failed: {error}", request.intention);
                false
            }
        };

        let delivered = match request.sender.take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        };
        if referenced && !delivered {
            // the consumer is gone, so is its reference
            self.context.cache.release(key);
        }
    }

    fn abandon(&mut self, id: RequestId) {
        if let Some(request) = self.requests.remove(&id) {
            self.tear_down(request);
        }
    }

    fn tear_down(&self, mut request: Request<L>) {
        tracing::trace!("Abandoning {}", request.intention);
        metric!(counter("loading.abandoned") += 1, "loader" => L::NAME);
        request.state.release_budget();
    }
}

impl<L: Loader> fmt::Debug for Orchestrator<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("loader", &L::NAME)
            .field("pending", &self.requests.len())
            .field("admission", &self.context.admission)
            .finish()
    }
}
