//! # Errors
//!
//! Every failure surfaced through a retrieval completion is an [`ImageError`].
//! The error is cloneable because a single coalesced transfer fans its result
//! out to many waiting callers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::source::Source;

/// Errors raised while building a request.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RequestError {
    #[error("Request is empty or was discarded by the request modifier")]
    EmptyRequest,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Task for {key} was cancelled")]
    TaskCancelled { key: String },
}

/// Errors raised while receiving or validating a response.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ResponseError {
    #[error("Response for {url} is not an HTTP response")]
    NonHttpResponse { url: String },

    #[error("Server returned status code {status} for {url}")]
    InvalidStatusCode { url: String, status: u16 },

    #[error("Transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("Transport error for {url}: {message}")]
    TransportMessage { url: String, message: String },

    #[error("No response received for {url}")]
    NoResponse { url: String },

    #[error("Response for {url} was cancelled by the downloader delegate")]
    CancelledByDelegate { url: String },

    #[error("Downloaded data for {url} was rejected by the data modifier")]
    DataModifyingFailed { url: String },

    #[error("Response body for {url} exceeds the {limit} byte limit")]
    BodyTooLarge { url: String, limit: u64 },

    #[error("Request for {url} was rejected by a constrained network")]
    NetworkConstrained { url: String },
}

/// Errors raised by the memory or disk cache.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("No image cached for key {key}")]
    ImageNotExisting { key: String },

    #[error("Cannot serialize image for key {key}")]
    CannotSerializeImage { key: String },

    #[error("Cannot create cache directory {path:?}: {source}")]
    CannotCreateDirectory {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Cannot write cache file {path:?}: {source}")]
    CannotCreateCacheFile {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Cannot read cache file {path:?}: {source}")]
    CannotLoadDataFromDisk {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Cannot remove cache file {path:?}: {source}")]
    CannotRemoveFile {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Invalid cache metadata at {path:?}: {message}")]
    InvalidMetadata { path: PathBuf, message: String },

    #[error("Disk storage at {path:?} is not ready")]
    DiskStorageNotReady { path: PathBuf },
}

/// Errors raised by an image processor.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ProcessorError {
    #[error("Processor {identifier:?} failed to process {item}")]
    ProcessingFailed { identifier: String, item: String },
}

/// A single failed attempt recorded while walking alternative sources.
#[derive(Debug, Clone)]
pub struct PropagationError {
    pub source: Source,
    pub error: ImageError,
}

/// Errors tied to the request as a whole rather than one transfer.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ImageSettingError {
    #[error("Source is empty")]
    EmptySource,

    #[error("Result for {key} belongs to a task that is no longer current")]
    NotCurrentSourceTask { key: String },

    #[error("Data provider for {key} failed: {message}")]
    DataProviderError { key: String, message: String },

    #[error("All alternative sources failed after {} attempts", .0.len())]
    AlternativeSourcesExhausted(Vec<PropagationError>),
}

/// Error delivered to a retrieval completion.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ImageError {
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Response error: {0}")]
    Response(#[from] ResponseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Image setting error: {0}")]
    ImageSetting(#[from] ImageSettingError),
}

impl ImageError {
    pub(crate) fn cancelled(key: impl Into<String>) -> Self {
        RequestError::TaskCancelled { key: key.into() }.into()
    }

    /// Whether the caller cancelled the task.
    pub fn is_task_cancelled(&self) -> bool {
        matches!(self, ImageError::Request(RequestError::TaskCancelled { .. }))
    }

    /// Whether the platform refused the request because the network is constrained.
    pub fn is_network_constrained(&self) -> bool {
        matches!(
            self,
            ImageError::Response(ResponseError::NetworkConstrained { .. })
        )
    }

    /// Whether this is a response-class error (the only class eligible for retry).
    pub fn is_response_error(&self) -> bool {
        matches!(self, ImageError::Response(_))
    }

    pub fn is_invalid_response_status_code(&self) -> bool {
        self.invalid_status_code().is_some()
    }

    /// Returns the status code when the server answered with an invalid one.
    pub fn invalid_status_code(&self) -> Option<u16> {
        match self {
            ImageError::Response(ResponseError::InvalidStatusCode { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Returns the attempt chain when all alternative sources failed.
    pub fn propagation_errors(&self) -> Option<&[PropagationError]> {
        match self {
            ImageError::ImageSetting(ImageSettingError::AlternativeSourcesExhausted(errors)) => {
                Some(errors)
            }
            _ => None,
        }
    }
}

/// Errors raised while constructing the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}
