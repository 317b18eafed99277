//! Chunked downloads through HTTP `Range` requests.
//!
//! A [`PartialState`] belongs to one request and survives failed attempts, so a retry
//! continues where the previous attempt stopped instead of starting over.

use std::{fmt, str::FromStr};

use reqwest::StatusCode;

use crate::config::LoadingConfig;
use crate::error::{LoadError, LoadResult};
use crate::intention::Intention;
use crate::utils::pool::{BufferPool, PooledBuffer};

use super::{RangeFetch, RangeResponse};

/// Represents an HTTP Range header.
///
/// The string representation can be used as a range header.
///
/// Unlike ranges in HTTP, this one always has an end.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Range {
    /// Start of the range, inclusive.
    pub start: u64,
    /// End of the range, inclusive.
    pub end: u64,
}

impl Range {
    /// Returns the amount of bytes the range contains.
    pub fn size(&self) -> u64 {
        if self.start > self.end {
            return 0;
        }
        // +1 because the end of the range is inclusive,
        // A 0-0 range is 1 byte in size.
        self.end - self.start + 1
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// A parsed `Content-Range` header for `bytes`.
///
/// This implementation only supports the very basic format
/// where all values are present: `bytes <start>-<end>/<size>`.
///
/// All other variations like `bytes */<size>` are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesContentRange {
    /// Start of the returned range, offset in bytes.
    pub start: u64,
    /// End of the returned range, offset in bytes.
    pub end: u64,
    /// The total size of the resource on the server.
    pub total_size: u64,
}

impl BytesContentRange {
    /// Extracts the contained range into a [`Range`].
    pub fn range(self) -> Range {
        Range {
            start: self.start,
            end: self.end,
        }
    }

    /// Parses a [`BytesContentRange`] from a [`reqwest::Response`].
    ///
    /// Returns `None` if the response is not a partial response.
    pub fn from_response(response: &reqwest::Response) -> Option<Result<Self, InvalidBytesRange>> {
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return None;
        }

        let parsed = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|hv| hv.to_str().ok())
            .map(|s| s.parse())
            .unwrap_or(Err(InvalidBytesRange::Malformed));
        Some(parsed)
    }
}

/// An error which can be returned when parsing a [`BytesContentRange`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidBytesRange {
    /// The header is malformed.
    #[error("content range header is malformed")]
    Malformed,
    /// The specified unit is not `bytes`.
    #[error("content range unit is not bytes")]
    NotBytes,
    /// The header indicates the requested range is not satisfiable.
    #[error("the requested range is not satisfiable")]
    RangeNotSatisfiable,
    /// The header indicates the total length of the resource is unknown.
    #[error("the total length of the resource is not known")]
    UnknownLength,
}

impl From<InvalidBytesRange> for LoadError {
    fn from(err: InvalidBytesRange) -> Self {
        LoadError::Malformed(err.to_string())
    }
}

impl FromStr for BytesContentRange {
    type Err = InvalidBytesRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(("bytes", s)) = s.trim().split_once(' ') else {
            return Err(InvalidBytesRange::NotBytes);
        };

        let (range, total_size) = s
            .trim()
            .split_once('/')
            .ok_or(InvalidBytesRange::Malformed)?;
        if range.trim() == "*" {
            return Err(InvalidBytesRange::RangeNotSatisfiable);
        }

        let (start, end) = range.split_once('-').ok_or(InvalidBytesRange::Malformed)?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| InvalidBytesRange::Malformed)?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| InvalidBytesRange::Malformed)?;

        if end < start {
            return Err(InvalidBytesRange::Malformed);
        }

        let total_size = match total_size.trim() {
            "*" => Err(InvalidBytesRange::UnknownLength),
            size => size.parse().map_err(|_| InvalidBytesRange::Malformed),
        }?;

        Ok(Self {
            start,
            end,
            total_size,
        })
    }
}

/// Progress of one chunked download.
#[derive(Debug, Default)]
pub struct PartialState {
    next_range_start: u64,
    full_file_size: Option<u64>,
    buffer: Option<PooledBuffer>,
    chunks: usize,
}

impl PartialState {
    pub fn next_range_start(&self) -> u64 {
        self.next_range_start
    }

    /// The size of the resource, known after the first chunk arrived.
    pub fn full_file_size(&self) -> Option<u64> {
        self.full_file_size
    }

    pub fn is_fully_downloaded(&self) -> bool {
        self.full_file_size == Some(self.next_range_start)
    }

    /// The number of chunks received so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// The next range to request, `None` once the download is complete.
    pub fn next_range(&self, chunk_size: u64) -> Option<Range> {
        let start = self.next_range_start;
        let end = start + chunk_size.max(1) - 1;
        match self.full_file_size {
            None => Some(Range { start, end }),
            Some(_) if self.is_fully_downloaded() => None,
            Some(total) => Some(Range {
                start,
                end: end.min(total - 1),
            }),
        }
    }

    /// Copies a received chunk into the reassembly buffer.
    ///
    /// The buffer is taken from `pool` when the first chunk reveals the total size.
    pub fn append(&mut self, range: Range, response: RangeResponse, pool: &BufferPool) -> LoadResult<()> {
        let total = response.total_size;
        match self.full_file_size {
            None => {
                let len = usize::try_from(total)
                    .map_err(|_| LoadError::Malformed(format!("resource too large: {total}")))?;
                self.buffer = Some(pool.get(len));
                self.full_file_size = Some(total);
            }
            Some(known) if known != total => {
                return Err(LoadError::Malformed(format!(
                    "total size changed from {known} to {total}"
                )));
            }
            Some(_) => {}
        }

        let received = response.data.len() as u64;
        let remaining = total.saturating_sub(range.start);
        // the last chunk is shorter than requested
        if (received != range.size() && received != remaining) || received > remaining {
            return Err(LoadError::Malformed(format!(
                "expected {} bytes at offset {}, got {received} of {total}",
                range.size(),
                range.start,
            )));
        }

        let buffer = self.buffer.as_mut().ok_or(LoadError::InternalError)?;
        let start = range.start as usize;
        buffer[start..start + response.data.len()].copy_from_slice(&response.data);

        self.next_range_start = (range.end + 1).min(total);
        self.chunks += 1;
        Ok(())
    }

    /// Hands out the reassembled payload once every chunk arrived.
    pub fn take_completed(&mut self) -> Option<PooledBuffer> {
        if !self.is_fully_downloaded() {
            return None;
        }
        self.buffer.take()
    }
}

/// Runs chunked downloads, one range request per invocation.
#[derive(Debug, Clone)]
pub struct PartialDownloader {
    chunk_size: u64,
    pool: BufferPool,
}

impl PartialDownloader {
    pub fn new(chunk_size: u64, pool: BufferPool) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pool,
        }
    }

    pub fn from_config(config: &LoadingConfig) -> Self {
        Self::new(config.chunk_size, BufferPool::new(config.max_pooled_buffers))
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Requests and stores the next chunk.
    ///
    /// Does nothing if the download is already complete.
    pub async fn download_next_chunk<A>(
        &self,
        fetcher: &dyn RangeFetch<A>,
        intention: &Intention<A>,
        state: &mut PartialState,
    ) -> LoadResult<()> {
        let Some(range) = state.next_range(self.chunk_size) else {
            return Ok(());
        };

        tracing::trace!("Requesting {range} of {intention}");
        let response = fetcher.fetch_range(intention, range).await?;
        state.append(range, response, &self.pool)
    }

    /// Downloads the remaining chunks and returns the complete payload.
    ///
    /// On error the progress stays in `state`, the next call resumes from there.
    pub async fn download<A>(
        &self,
        fetcher: &dyn RangeFetch<A>,
        intention: &Intention<A>,
        state: &mut PartialState,
    ) -> LoadResult<PooledBuffer> {
        if state.is_fully_downloaded() && state.buffer.is_none() {
            // the payload was handed out before, start over
            *state = PartialState::default();
        }

        loop {
            if let Some(buffer) = state.take_completed() {
                if let Some(size) = state.full_file_size() {
                    metric!(histogram("loading.partial.size") = size);
                }
                return Ok(buffer);
            }
            if intention.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            self.download_next_chunk(fetcher, intention, state).await?;
        }
    }
}
