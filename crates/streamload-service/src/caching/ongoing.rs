use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::error::LoadResult;
use crate::intention::CacheKey;

/// The result a leader shares with its followers.
///
/// `None` means the leader finished without a result, because it was cancelled, could not
/// fulfill the request from its current source, or vanished.
pub type SharedResult<A> = Shared<BoxFuture<'static, Option<LoadResult<A>>>>;

type Requests<A> = Arc<Mutex<HashMap<CacheKey, SharedResult<A>>>>;

/// The role of a flow for a given key, as returned by [`OngoingRequests::get_or_create`].
pub enum Ongoing<A> {
    /// No fetch for this key is running; the caller is now responsible for it.
    Leader(LeaderGuard<A>),
    /// Another flow is already fetching this key.
    Follower(SharedResult<A>),
}

impl<A> fmt::Debug for Ongoing<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ongoing::Leader(guard) => f.debug_tuple("Leader").field(&guard.key).finish(),
            Ongoing::Follower(_) => f.write_str("Follower"),
        }
    }
}

/// The single-flight table.
///
/// An entry exists exactly while one leader for its key has not resolved.
pub struct OngoingRequests<A> {
    requests: Requests<A>,
}

impl<A: Clone + Send + Sync + 'static> OngoingRequests<A> {
    pub(crate) fn new() -> Self {
        Self {
            requests: Default::default(),
        }
    }

    /// Atomically joins a running fetch for `key`, or registers a new one.
    pub fn get_or_create(&self, key: &CacheKey) -> Ongoing<A> {
        let mut requests = self.requests.lock().unwrap();
        if let Some(shared) = requests.get(key) {
            return Ongoing::Follower(shared.clone());
        }

        let (sender, receiver) = oneshot::channel();
        // a dropped sender means the leader vanished without a result
        let shared = receiver.map(|result| result.ok().flatten()).boxed().shared();
        requests.insert(key.clone(), shared);

        Ongoing::Leader(LeaderGuard {
            key: key.clone(),
            sender: Some(sender),
            requests: Arc::clone(&self.requests),
        })
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.requests.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Leadership over one key in the [`OngoingRequests`] table.
///
/// Resolving or dropping the guard removes the entry. Followers of a dropped guard observe
/// `None`.
pub struct LeaderGuard<A> {
    key: CacheKey,
    sender: Option<oneshot::Sender<Option<LoadResult<A>>>>,
    requests: Requests<A>,
}

impl<A> LeaderGuard<A> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Removes the entry, then hands `result` to every follower.
    ///
    /// Removing first guarantees that a flow arriving after the result was published starts
    /// over instead of joining a finished fetch.
    pub fn resolve(mut self, result: Option<LoadResult<A>>) {
        self.remove();
        if let Some(sender) = self.sender.take() {
            // nobody listening is fine
            sender.send(result).ok();
        }
    }

    fn remove(&mut self) {
        let mut requests = self.requests.lock().unwrap();
        requests.remove(&self.key);
    }
}

impl<A> Drop for LeaderGuard<A> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            // during unwinding the table must stay usable for the other flows
            if let Ok(mut requests) = self.requests.lock() {
                requests.remove(&self.key);
            }
        }
    }
}
