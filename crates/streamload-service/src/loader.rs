use bytes::Bytes;
use futures::future::BoxFuture;

use crate::download::RangeFetch;
use crate::error::{ErrorClass, LoadError, LoadResult};
use crate::intention::{AssetSource, Intention};

/// The asset specific part of loading.
///
/// A loader knows how to fetch the bytes of one asset type and how to turn them into an
/// asset. Everything else (deduplication, admission, retries, source fallback and caching)
/// is done by the [`Orchestrator`](crate::loading::Orchestrator).
pub trait Loader: Send + Sync + 'static {
    /// Loader specific arguments, carried by every [`Intention`].
    type Args: Clone + Send + Sync + 'static;
    /// The loaded asset, shared by every request for the same key.
    type Asset: Clone + Send + Sync + 'static;

    /// Used in logs and metrics.
    const NAME: &'static str;

    /// Fetches the complete payload from the intention's current source.
    fn fetch<'a>(&'a self, intention: &'a Intention<Self::Args>) -> BoxFuture<'a, LoadResult<Bytes>>;

    /// Turns a complete payload into an asset.
    fn parse(&self, intention: &Intention<Self::Args>, data: &[u8]) -> LoadResult<Self::Asset>;

    /// Decides how the retry loop reacts to `error`.
    fn classify_error(&self, error: &LoadError) -> ErrorClass {
        error.class()
    }

    /// A range fetcher, for assets that are downloaded in chunks.
    ///
    /// When this returns `Some`, [`fetch`](Self::fetch) is not used.
    fn partial(&self) -> Option<&dyn RangeFetch<Self::Args>> {
        None
    }

    /// Picks the source of the next pass after the current one could not fulfill the request.
    ///
    /// Only sources that are still permitted may be returned.
    fn next_source(&self, intention: &Intention<Self::Args>) -> Option<AssetSource> {
        intention.permitted_sources().iter().next()
    }

    /// Whether `intention` may be served from and stored in the disk cache.
    fn qualifies_for_disk_cache(&self, intention: &Intention<Self::Args>) -> bool {
        let _ = intention;
        false
    }

    /// Turns an asset back into a payload accepted by [`parse`](Self::parse).
    ///
    /// Assets without a payload are not written to the disk cache.
    fn to_payload(&self, asset: &Self::Asset) -> Option<Bytes> {
        let _ = asset;
        None
    }

    /// Receives an asset that was loaded after everybody lost interest in it.
    fn dispose_abandoned(&self, asset: Self::Asset) {
        drop(asset);
    }
}
