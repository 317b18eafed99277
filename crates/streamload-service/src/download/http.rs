//! A [`reqwest`] based fetcher for assets addressed by URL.

use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{StatusCode, header};
use url::Url;

use crate::config::DownloadTimeouts;
use crate::error::{LoadError, LoadResult};
use crate::intention::Intention;

use super::{BytesContentRange, Range, RangeFetch, RangeResponse};

/// Fetches whole files or byte ranges over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(timeouts: DownloadTimeouts) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.max_download)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, timeouts })
    }

    /// Downloads the complete file at `url`.
    pub async fn fetch(&self, url: &Url) -> LoadResult<Bytes> {
        let response = self.send(self.client.get(url.clone()), url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(url, status));
        }
        self.read_body(response).await
    }

    /// Downloads `range` of the file at `url`.
    ///
    /// A server ignoring the range header answers with the whole file, which is cut down to
    /// the requested range.
    pub async fn fetch_range(&self, url: &Url, range: Range) -> LoadResult<RangeResponse> {
        let request = self
            .client
            .get(url.clone())
            .header(header::RANGE, range.to_string());
        let response = self.send(request, url).await?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(LoadError::Malformed(format!("{range} is not satisfiable")));
        }
        if !status.is_success() {
            return Err(error_for_status(url, status));
        }

        match BytesContentRange::from_response(&response) {
            Some(content_range) => {
                let content_range = content_range?;
                let data = self.read_body(response).await?;
                if content_range.start != range.start {
                    return Err(LoadError::Malformed(format!(
                        "requested {range}, got {}",
                        content_range.range()
                    )));
                }
                Ok(RangeResponse {
                    data,
                    total_size: content_range.total_size,
                })
            }
            None => {
                let data = self.read_body(response).await?;
                Ok(slice_whole_file(data, range))
            }
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> LoadResult<reqwest::Response> {
        tracing::trace!("Fetching {url}");
        match tokio::time::timeout(self.timeouts.head, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if err.is_timeout() => Err(LoadError::Timeout(self.timeouts.max_download)),
            Ok(Err(err)) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "Request to {url} failed");
                Err(err.into())
            }
            Err(_) => Err(LoadError::Timeout(self.timeouts.head)),
        }
    }

    async fn read_body(&self, response: reqwest::Response) -> LoadResult<Bytes> {
        match response.bytes().await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_timeout() => Err(LoadError::Timeout(self.timeouts.max_download)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Fetches ranges from the URL carried in the intention's arguments.
impl<A: AsRef<Url> + Send + Sync> RangeFetch<A> for HttpFetcher {
    fn fetch_range<'a>(
        &'a self,
        intention: &'a Intention<A>,
        range: Range,
    ) -> BoxFuture<'a, LoadResult<RangeResponse>> {
        HttpFetcher::fetch_range(self, intention.args().as_ref(), range).boxed()
    }
}

/// Maps an unsuccessful status code to an error.
pub fn error_for_status(url: &Url, status: StatusCode) -> LoadError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");
        LoadError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        LoadError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when downloading from `{url}`: {status}");
        LoadError::PermissionDenied("Potential login page detected".to_string())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        LoadError::DownloadError(status.to_string())
    }
}

/// Treats a complete `200 OK` body as the answer to a range request.
fn slice_whole_file(data: Bytes, range: Range) -> RangeResponse {
    let total_size = data.len() as u64;
    let start = range.start.min(total_size) as usize;
    let end = (range.end.saturating_add(1)).min(total_size) as usize;
    RangeResponse {
        data: data.slice(start..end),
        total_size,
    }
}
