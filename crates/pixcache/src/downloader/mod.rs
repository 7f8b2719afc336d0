//! # Downloader
//!
//! Network side of the engine: the [`Transport`] that moves bytes, the
//! delegate and request-modifier hooks, and the [`TaskRegistry`] that makes
//! concurrent requests for one key share a single transfer.

mod delegate;
mod registry;
mod task;
mod transport;

use std::sync::Arc;

use futures::FutureExt;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use tracing::{debug, instrument};
use url::Url;

pub use delegate::{AnyModifier, DefaultDownloaderDelegate, DownloaderDelegate, RequestModifier};
pub use registry::{
    CancelToken, FetchFuture, FetchedData, ImageLoadingResult, SessionCallback, TaskRegistry,
};
pub use task::DownloadTask;
pub use transport::{FetchRequest, FetchResponse, HttpTransport, Transport, create_client};

use crate::error::{ImageError, RequestError, ResponseError};
use crate::options::RetrieveOptions;

/// Downloads image bytes, coalescing requests by key.
#[derive(Clone)]
pub struct ImageDownloader {
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn DownloaderDelegate>,
    registry: TaskRegistry,
}

impl ImageDownloader {
    pub fn new(transport: Arc<dyn Transport>, registry: TaskRegistry) -> Self {
        Self {
            transport,
            delegate: Arc::new(DefaultDownloaderDelegate),
            registry,
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn DownloaderDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Start or join the download of `url` under `key`.
    ///
    /// The request modifier of `options` runs first; a vetoed request fails
    /// before anything is registered.
    pub fn download(
        &self,
        url: &Url,
        key: &str,
        options: &RetrieveOptions,
        callback: SessionCallback,
    ) -> Result<CancelToken, ImageError> {
        let mut request = FetchRequest::new(url.clone());
        if let Some(modifier) = &options.request_modifier {
            request = modifier
                .modified(request)
                .ok_or(RequestError::EmptyRequest)?;
        }

        let transport = Arc::clone(&self.transport);
        let delegate = Arc::clone(&self.delegate);
        Ok(self.registry.start(
            key,
            move || fetch(transport, delegate, request).boxed(),
            callback,
        ))
    }
}

#[instrument(skip_all, fields(url = %request.url))]
async fn fetch(
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn DownloaderDelegate>,
    request: FetchRequest,
) -> Result<FetchedData, ImageError> {
    let url = request.url.clone();
    let mut response = transport.get(request.clone()).await?;

    if response.status == Some(StatusCode::UNAUTHORIZED) {
        if let Some(credentials) = delegate.credentials_for(&url, StatusCode::UNAUTHORIZED) {
            debug!("Retrying with credentials after authentication challenge");
            let mut retry = request;
            retry.headers.insert(AUTHORIZATION, credentials);
            response = transport.get(retry).await?;
        }
    }

    let Some(status) = response.status else {
        return Err(ResponseError::NonHttpResponse {
            url: url.to_string(),
        }
        .into());
    };

    if !delegate.should_accept_response(&response) {
        return Err(ResponseError::CancelledByDelegate {
            url: url.to_string(),
        }
        .into());
    }

    if !delegate.is_valid_status_code(status) {
        return Err(ResponseError::InvalidStatusCode {
            url: url.to_string(),
            status: status.as_u16(),
        }
        .into());
    }

    let data = delegate
        .did_download(response.body, &url)
        .ok_or_else(|| ResponseError::DataModifyingFailed {
            url: url.to_string(),
        })?;

    Ok(FetchedData {
        data,
        url: Some(response.url),
    })
}
