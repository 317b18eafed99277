use std::fmt;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::error::LoadResult;

/// Identifies a request within its [`Orchestrator`](super::Orchestrator).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum PromiseState<A> {
    Pending(oneshot::Receiver<LoadResult<A>>),
    Resolved(LoadResult<A>),
    Abandoned,
}

/// The consumer side of a submitted intention.
///
/// A promise is resolved exactly once, or abandoned without a result when its request
/// was cancelled.
pub struct Promise<A> {
    id: RequestId,
    state: PromiseState<A>,
    cancel: CancellationToken,
}

impl<A> Promise<A> {
    pub(crate) fn new(
        id: RequestId,
        receiver: oneshot::Receiver<LoadResult<A>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            state: PromiseState::Pending(receiver),
            cancel,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Withdraws interest in the result.
    ///
    /// The request is torn down silently; a result that was already attached stays.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Polls for the result without waiting.
    pub fn try_result(&mut self) -> Option<&LoadResult<A>> {
        if let PromiseState::Pending(receiver) = &mut self.state {
            match receiver.try_recv() {
                Ok(result) => self.state = PromiseState::Resolved(result),
                Err(TryRecvError::Closed) => self.state = PromiseState::Abandoned,
                Err(TryRecvError::Empty) => {}
            }
        }

        match &self.state {
            PromiseState::Resolved(result) => Some(result),
            _ => None,
        }
    }

    /// The request was torn down without a result.
    pub fn is_abandoned(&mut self) -> bool {
        self.try_result();
        matches!(self.state, PromiseState::Abandoned)
    }

    /// Waits for the result, `None` if the request was abandoned.
    pub async fn resolved(self) -> Option<LoadResult<A>> {
        match self.state {
            PromiseState::Pending(receiver) => receiver.await.ok(),
            PromiseState::Resolved(result) => Some(result),
            PromiseState::Abandoned => None,
        }
    }
}

impl<A> fmt::Debug for Promise<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            PromiseState::Pending(_) => "pending",
            PromiseState::Resolved(Ok(_)) => "succeeded",
            PromiseState::Resolved(Err(_)) => "failed",
            PromiseState::Abandoned => "abandoned",
        };
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}
