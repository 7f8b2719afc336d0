//! Byte transport used by the downloader.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use rustls::ClientConfig;
use rustls::crypto::{CryptoProvider, aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;
use url::Url;

use crate::config::DownloaderConfig;
use crate::error::{EngineError, ResponseError};

/// A GET request about to be sent.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
        }
    }
}

/// A fully received response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: Url,
    /// `None` when the response did not come from an HTTP exchange
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Issues GET requests and returns the whole body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: FetchRequest) -> Result<FetchResponse, ResponseError>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &DownloaderConfig) -> Result<Client, EngineError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if config.danger_accept_invalid_certs {
        // reqwest builds its own rustls config here and needs a process-wide provider.
        let _ = CryptoProvider::install_default(aws_lc_rs::default_provider());
        client_builder = client_builder.danger_accept_invalid_certs(true);
    } else {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_platform_verifier()?
            .with_no_client_auth();
        client_builder = client_builder.use_preconfigured_tls(tls_config);
    }

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(EngineError::from)
}

/// [`Transport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    max_body_size: u64,
}

impl HttpTransport {
    pub fn new(config: &DownloaderConfig) -> Result<Self, EngineError> {
        Ok(Self::with_client(create_client(config)?, config.max_body_size))
    }

    pub fn with_client(client: Client, max_body_size: u64) -> Self {
        Self {
            client,
            max_body_size,
        }
    }

    fn too_large(&self, len: u64) -> bool {
        self.max_body_size > 0 && len > self.max_body_size
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: FetchRequest) -> Result<FetchResponse, ResponseError> {
        let url = request.url;
        let transport_error = |e: reqwest::Error| ResponseError::Transport {
            url: url.to_string(),
            source: Arc::new(e),
        };

        let response = self
            .client
            .get(url.clone())
            .headers(request.headers)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        if let Some(len) = response.content_length() {
            if self.too_large(len) {
                return Err(ResponseError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_size,
                });
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            if self.too_large((body.len() + chunk.len()) as u64) {
                return Err(ResponseError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "Response received");
        Ok(FetchResponse {
            url,
            status: Some(status),
            headers,
            body: body.freeze(),
        })
    }
}
