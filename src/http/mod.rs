//! Transport client
//!
//! Issues a single ranged GET per fragment and streams the body into the
//! fragment's sidecar file through a fixed-size read buffer, bumping the
//! fragment's progress as bytes land. Retrying is the engine's job; the
//! client fails fast and reports a typed [`FetchError`].

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::model::SharedResource;

/// Abstraction over the fragment transport, substitutable in tests
#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Probe the advertised content length of the resource
    async fn probe_size(&self, uri: &str) -> Result<u64, FetchError>;

    /// Fetch one fragment of the resource into `sink`.
    ///
    /// Honours the cancellation token at every read; partial progress stays
    /// recorded on the fragment.
    async fn fetch_data(
        &self,
        cancel: &CancellationToken,
        resource: &SharedResource,
        index: usize,
        sink: &mut File,
    ) -> Result<(), FetchError>;
}

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Total per-request timeout, covering connect and body streaming
    pub timeout: Duration,
    /// Maximum redirect hops; only standard 3xx redirects are followed
    pub redirects: usize,
}

/// Transport client backed by a pooled reqwest client
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.redirects))
            .build()
            .map_err(|e| FetchError::RequestBuild(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchClient for HttpClient {
    async fn probe_size(&self, uri: &str) -> Result<u64, FetchError> {
        let response = self
            .client
            .head(uri)
            .send()
            .await
            .map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UnexpectedStatus(status.as_u16()));
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                FetchError::Transport("failed to parse content-length header".to_string())
            })
    }

    async fn fetch_data(
        &self,
        cancel: &CancellationToken,
        resource: &SharedResource,
        index: usize,
        sink: &mut File,
    ) -> Result<(), FetchError> {
        // snapshot what the request needs; the lock must not be held across awaits
        let (uri, buffer_size, ranged, start, end) = {
            let r = resource.read();
            let fragment = r
                .fragments
                .get(&index)
                .ok_or_else(|| FetchError::RequestBuild(format!("unknown fragment {}", index)))?;
            (
                r.uri.clone(),
                r.buffer_size,
                r.fragments.len() > 1 && fragment.end > fragment.start,
                fragment.start,
                fragment.end,
            )
        };

        let mut request = self.client.get(&uri);
        if ranged {
            request = request.header(RANGE, format!("bytes={}-{}", start, end));
        }

        let response = tokio::select! {
            response = request.send() => response.map_err(FetchError::from)?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::UnexpectedStatus(status.as_u16()));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut buffer = vec![0u8; buffer_size.max(1)];

        loop {
            let read = tokio::select! {
                read = reader.read(&mut buffer) => {
                    read.map_err(|e| FetchError::Read(e.to_string()))?
                }
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            };
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read])
                .await
                .map_err(|e| FetchError::Write(e.to_string()))?;
            resource.add_fragment_progress(index, read as u64);
        }

        sink.flush()
            .await
            .map_err(|e| FetchError::Write(e.to_string()))?;

        Ok(())
    }
}
