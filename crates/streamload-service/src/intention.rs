//! The description of a desired fetch.
//!
//! An [`Intention`] is created by whoever needs an asset and is handed to the
//! [`Orchestrator`](crate::loading::Orchestrator). Only its retry budget and its set of
//! permitted sources change during its life, and both only ever shrink within a source pass.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use url::Url;

/// The number of attempts per source when nothing else is configured.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// A place an asset can be fetched from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetSource {
    /// Shipped with the client.
    Embedded,
    /// A local copy, for example from a previous session.
    Local,
    /// The original remote location.
    Web,
    /// A content delivery network mirroring the remote location.
    Cdn,
}

impl AssetSource {
    /// All sources, in the order they are tried by default.
    pub const ALL: [AssetSource; 4] = [
        AssetSource::Embedded,
        AssetSource::Local,
        AssetSource::Cdn,
        AssetSource::Web,
    ];

    fn bit(self) -> u8 {
        match self {
            AssetSource::Embedded => 1 << 0,
            AssetSource::Local => 1 << 1,
            AssetSource::Web => 1 << 2,
            AssetSource::Cdn => 1 << 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssetSource::Embedded => "embedded",
            AssetSource::Local => "local",
            AssetSource::Web => "web",
            AssetSource::Cdn => "cdn",
        }
    }
}

impl fmt::Display for AssetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`AssetSource`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AssetSources(u8);

impl AssetSources {
    /// The empty set.
    pub const NONE: AssetSources = AssetSources(0);

    pub fn all() -> Self {
        AssetSource::ALL.into_iter().collect()
    }

    pub fn contains(self, source: AssetSource) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn insert(&mut self, source: AssetSource) {
        self.0 |= source.bit();
    }

    pub fn remove(&mut self, source: AssetSource) {
        self.0 &= !source.bit();
    }

    pub fn with(mut self, source: AssetSource) -> Self {
        self.insert(source);
        self
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the contained sources in the default fallback order.
    pub fn iter(self) -> impl Iterator<Item = AssetSource> {
        AssetSource::ALL
            .into_iter()
            .filter(move |source| self.contains(*source))
    }
}

impl From<AssetSource> for AssetSources {
    fn from(source: AssetSource) -> Self {
        AssetSources(source.bit())
    }
}

impl FromIterator<AssetSource> for AssetSources {
    fn from_iter<I: IntoIterator<Item = AssetSource>>(iter: I) -> Self {
        let mut sources = AssetSources::NONE;
        for source in iter {
            sources.insert(source);
        }
        sources
    }
}

impl fmt::Debug for AssetSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The canonical identity of an asset.
///
/// Two intentions with equal keys share one fetch and one cache entry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key from an arbitrary identifier, like `scene:42`.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        CacheKey(key.into())
    }

    /// Creates a key from a URL.
    ///
    /// Scheme and host are lowercased and default ports are dropped while parsing;
    /// the fragment is never sent to a server and is removed here.
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        CacheKey(url.as_str().into())
    }

    /// Parses `url` and creates a normalized key from it.
    pub fn parse_url(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::from_url(&Url::parse(url)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A scheduling hint: requests in lower buckets are admitted first.
///
/// Within one bucket, requests in front of the viewer win over those behind it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub bucket: u8,
    pub is_behind: bool,
}

/// A desired fetch of one asset.
#[derive(Clone)]
pub struct Intention<A> {
    key: CacheKey,
    args: A,
    attempts_per_source: u32,
    attempts_remaining: u32,
    permitted_sources: AssetSources,
    current_source: AssetSource,
    cancel: CancellationToken,
    created: Instant,
    partition: Partition,
}

impl<A> Intention<A> {
    /// Creates an intention to fetch `args` from the web, identified by `key`.
    pub fn new(key: CacheKey, args: A) -> Self {
        Self {
            key,
            args,
            attempts_per_source: DEFAULT_ATTEMPTS,
            attempts_remaining: DEFAULT_ATTEMPTS,
            permitted_sources: AssetSource::Web.into(),
            current_source: AssetSource::Web,
            cancel: CancellationToken::new(),
            created: Instant::now(),
            partition: Partition::default(),
        }
    }

    /// Sets the number of attempts made against each source, at least one.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        let attempts = attempts.max(1);
        self.attempts_per_source = attempts;
        self.attempts_remaining = attempts;
        self
    }

    /// Sets the sources this intention may use, starting with `current`.
    ///
    /// `current` is always part of the permitted set.
    pub fn with_sources(mut self, permitted: AssetSources, current: AssetSource) -> Self {
        self.permitted_sources = permitted.with(current);
        self.current_source = current;
        self
    }

    /// Uses `token` as the cancellation signal instead of a fresh one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn args(&self) -> &A {
        &self.args
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    pub fn permitted_sources(&self) -> AssetSources {
        self.permitted_sources
    }

    pub fn current_source(&self) -> AssetSource {
        self.current_source
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signals that nobody is interested in the result anymore.
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Removes the current source from the permitted ones. Idempotent.
    pub(crate) fn remove_current_source(&mut self) {
        self.permitted_sources.remove(self.current_source);
    }

    /// Consumes one attempt and returns how many are left.
    pub(crate) fn decrement_attempts(&mut self) -> u32 {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.attempts_remaining
    }

    /// Switches to `source` for the next pass, with a full retry budget.
    pub(crate) fn prepare_for_source(&mut self, source: AssetSource) {
        self.current_source = source;
        self.attempts_remaining = self.attempts_per_source;
    }
}

impl<A> fmt::Debug for Intention<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intention")
            .field("key", &self.key)
            .field("attempts_remaining", &self.attempts_remaining)
            .field("permitted_sources", &self.permitted_sources)
            .field("current_source", &self.current_source)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("partition", &self.partition)
            .finish()
    }
}

impl<A> fmt::Display for Intention<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` from {}", self.key, self.current_source)
    }
}
