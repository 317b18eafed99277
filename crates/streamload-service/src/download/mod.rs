//! Fetching bytes: chunked range downloads, the retry/fallback loop and an HTTP fetcher.

use futures::future::BoxFuture;

use crate::error::LoadResult;
use crate::intention::Intention;

pub mod http;
pub mod partial;
pub mod retry;

pub use partial::{BytesContentRange, InvalidBytesRange, PartialDownloader, PartialState, Range};
pub use retry::{RepeatOutcome, repeat_loop};

/// One answer to a range request.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    /// The received bytes.
    pub data: bytes::Bytes,
    /// The size of the whole resource, as reported by the source.
    pub total_size: u64,
}

/// Fetches a byte range of the resource described by an intention.
pub trait RangeFetch<A>: Send + Sync {
    fn fetch_range<'a>(
        &'a self,
        intention: &'a Intention<A>,
        range: Range,
    ) -> BoxFuture<'a, LoadResult<RangeResponse>>;
}
