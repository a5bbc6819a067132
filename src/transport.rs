// src/transport.rs

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{header, Client};
use std::time::Duration;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::models::RequestDescriptor;

/// Failures of a single transfer or probe.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("body stream failed: {0}")]
    Stream(String),
    #[error("no source available")]
    NoSource,
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout
        } else {
            TransferError::Network(err)
        }
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Response head plus a body that is read chunk by chunk.
pub struct TransferResponse {
    pub status: u16,
    /// Declared `Content-Length`, if any.
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl TransferResponse {
    /// 2xx, which includes 206 Partial Content.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub accept_ranges: Option<String>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn supports_range(&self) -> bool {
        self.accept_ranges
            .as_deref()
            .is_some_and(|value| value.to_ascii_lowercase().contains("bytes"))
    }
}

/// The HTTP capability the engine runs on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET for the descriptor's URL, with its byte range when present.
    async fn get(&self, request: &RequestDescriptor) -> Result<TransferResponse, TransferError>;

    /// Existence check used by the reachability prober.
    async fn head(&self, url: &str, timeout: Duration) -> Result<ProbeResponse, TransferError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Client with the configured connect timeout. Header and body deadlines
    /// are enforced per transfer by the worker.
    pub fn new(config: &EngineConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client })
    }

    #[inline]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &RequestDescriptor) -> Result<TransferResponse, TransferError> {
        let mut builder = self
            .client
            .get(&request.url)
            .header(header::CACHE_CONTROL, "no-store");
        if let Some(range) = request.range {
            builder = builder.header(header::RANGE, range.header_value());
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let content_length = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = resp.bytes_stream().map_err(TransferError::from).boxed();

        Ok(TransferResponse {
            status,
            content_length,
            body,
        })
    }

    async fn head(&self, url: &str, timeout: Duration) -> Result<ProbeResponse, TransferError> {
        let resp = self
            .client
            .head(url)
            .header(header::CACHE_CONTROL, "no-store")
            .timeout(timeout)
            .send()
            .await?;

        let accept_ranges = resp
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(ProbeResponse {
            status: resp.status().as_u16(),
            accept_ranges,
        })
    }
}
