use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while loading an asset.
///
/// Errors are `Clone` so that a single result can be handed to every request that
/// waited on the same underlying fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The asset was not found at the source.
    #[error("not found")]
    NotFound,
    /// The asset could not be fetched due to missing permissions.
    ///
    /// The attached string contains the source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The asset could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The asset could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The payload was received, but is inconsistent.
    ///
    /// For example a range response of the wrong length, or a total size that changed
    /// between two chunks.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The payload was received in full, but could not be turned into an asset.
    #[error("failed to parse: {0}")]
    Parse(String),
    /// The request was explicitly aborted by the source or the collaborator.
    #[error("aborted")]
    Aborted,
    /// The request was cancelled by its owner.
    ///
    /// This is never attached to a request as its result.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the loading pipeline itself.
    #[error("internal error")]
    InternalError,
}

/// How the retry loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying against the same source.
    Transient,
    /// The current source is of no further use.
    NonRetryable,
    /// The request was cancelled, nothing is reported.
    Cancellation,
}

impl LoadError {
    /// The default classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            LoadError::Timeout(_) | LoadError::DownloadError(_) => ErrorClass::Transient,
            LoadError::Cancelled => ErrorClass::Cancellation,
            LoadError::NotFound
            | LoadError::PermissionDenied(_)
            | LoadError::Malformed(_)
            | LoadError::Parse(_)
            | LoadError::Aborted
            | LoadError::InternalError => ErrorClass::NonRetryable,
        }
    }

    /// A short name of the variant, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::NotFound => "notfound",
            LoadError::PermissionDenied(_) => "permissiondenied",
            LoadError::Timeout(_) => "timeout",
            LoadError::DownloadError(_) => "downloaderror",
            LoadError::Malformed(_) => "malformed",
            LoadError::Parse(_) => "parse",
            LoadError::Aborted => "aborted",
            LoadError::Cancelled => "cancelled",
            LoadError::InternalError => "internalerror",
        }
    }

    /// Logs an unexpected error and turns it into [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Creates a [`DownloadError`](Self::DownloadError) from the innermost cause of `error`.
    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<std::io::Error> for LoadError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// The outcome of loading an asset, attached exactly once to every request.
pub type LoadResult<T> = Result<T, LoadError>;
