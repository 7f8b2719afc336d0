//! Hooks into the request and response path of the downloader.

use std::fmt;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::HeaderValue;
use url::Url;

use super::transport::{FetchRequest, FetchResponse};

/// Rewrites or vetoes a request before it is sent.
pub trait RequestModifier: Send + Sync {
    /// Returning `None` fails the retrieval with `EmptyRequest`.
    fn modified(&self, request: FetchRequest) -> Option<FetchRequest>;
}

/// [`RequestModifier`] built from a closure
pub struct AnyModifier<F> {
    modify: F,
}

impl<F> AnyModifier<F>
where
    F: Fn(FetchRequest) -> Option<FetchRequest> + Send + Sync,
{
    pub fn new(modify: F) -> Self {
        Self { modify }
    }
}

impl<F> RequestModifier for AnyModifier<F>
where
    F: Fn(FetchRequest) -> Option<FetchRequest> + Send + Sync,
{
    fn modified(&self, request: FetchRequest) -> Option<FetchRequest> {
        (self.modify)(request)
    }
}

impl<F> fmt::Debug for AnyModifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnyModifier")
    }
}

/// Observes and steers responses.
pub trait DownloaderDelegate: Send + Sync {
    /// Status codes treated as success.
    fn is_valid_status_code(&self, status: StatusCode) -> bool {
        (200..400).contains(&status.as_u16())
    }

    /// Rejecting a response fails it with `CancelledByDelegate`.
    fn should_accept_response(&self, _response: &FetchResponse) -> bool {
        true
    }

    /// Last chance to rewrite the body. `None` fails with `DataModifyingFailed`.
    fn did_download(&self, data: Bytes, _url: &Url) -> Option<Bytes> {
        Some(data)
    }

    /// `Authorization` header to retry with after an authentication challenge.
    fn credentials_for(&self, _url: &Url, _status: StatusCode) -> Option<HeaderValue> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDownloaderDelegate;

impl DownloaderDelegate for DefaultDownloaderDelegate {}
