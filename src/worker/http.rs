//! HTTP client for streaming part downloads

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::WorkerConfig;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("Failed to read body: {0}")]
    Body(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Timeout
        } else if e.is_redirect() {
            DownloadError::TooManyRedirects
        } else if e.is_builder() {
            DownloadError::InvalidUrl(e.to_string())
        } else if e.is_body() || e.is_decode() {
            DownloadError::Body(e.to_string())
        } else {
            DownloadError::RequestFailed(e.to_string())
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("bundlebox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&WorkerConfig> for HttpConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Response body of an opened download
///
/// There is no overall request timeout: a transfer may legitimately take
/// hours. The worker detects stalls between chunks instead.
pub struct DownloadStream {
    content_length: Option<u64>,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
}

impl DownloadStream {
    /// Declared body length, if the server sent one
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Next body chunk, `None` at end of body. Cancel safe.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.body.next().await.map(|chunk| chunk.map_err(DownloadError::from))
    }
}

/// HTTP downloader
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }

    /// Send the request and hand back the body as a stream of chunks
    pub async fn open(&self, url: &str) -> Result<DownloadStream> {
        debug!(url, "Opening download");

        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        let content_length = response.content_length();
        debug!(url, ?content_length, "Download opened");

        Ok(DownloadStream {
            content_length,
            body: response.bytes_stream().boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.user_agent.starts_with("bundlebox/"));
    }

    #[tokio::test]
    async fn test_open_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let client = HttpClient::new(HttpConfig::default()).unwrap();
        let mut stream = client
            .open(&format!("{}/file.bin", server.uri()))
            .await
            .unwrap();
        assert_eq!(stream.content_length(), Some(4096));

        let mut received = 0;
        while let Some(chunk) = stream.next_chunk().await {
            received += chunk.unwrap().len();
        }
        assert_eq!(received, 4096);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpClient::new(HttpConfig::default()).unwrap();
        let result = client.open(&format!("{}/missing", server.uri())).await;
        assert!(matches!(
            result,
            Err(DownloadError::Status { status: 404, .. })
        ));
    }
}
