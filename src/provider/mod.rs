//! File-hosting provider used to turn share links into transient download URLs.

pub mod client;
pub mod digest;
pub mod session;

use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use client::HostingClient;
pub use session::SessionManager;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    #[error("Provider returned HTTP {status} for {operation}")]
    Status { operation: &'static str, status: u16 },

    #[error("Provider rejected {operation}: {code} {message}")]
    Rejected {
        operation: &'static str,
        code: String,
        message: String,
    },

    #[error("Provider authentication failed: {0}")]
    Unauthorized(String),

    #[error("Malformed provider response for {operation}: {reason}")]
    Malformed {
        operation: &'static str,
        reason: String,
    },

    #[error("Provider credentials are not configured")]
    MissingCredentials,

    #[error("File not found on provider: {0}")]
    FileNotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ProviderError {
    /// Errors after which the cached session must not be reused
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Unauthorized(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Remote operations of the provider API
#[async_trait]
pub trait FileHost: Send + Sync {
    /// Per-user salt for the password digest
    async fn salt(&self, username: &str) -> Result<String>;

    /// Returns a session token
    async fn login(&self, username: &str, password_digest: &str) -> Result<String>;

    async fn resolve_download_link(&self, token: &str, ident: &str) -> Result<String>;

    async fn file_exists(&self, token: &str, ident: &str) -> Result<bool>;
}

/// File ident of a provider share link
///
/// Accepts `/file/<ident>/...` in the path as well as `#/file/<ident>` in
/// the fragment.
pub fn file_ident(url: &Url) -> Option<String> {
    let from_segments = |path: &str| {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            if segment == "file" {
                return segments.next().map(str::to_string);
            }
        }
        None
    };

    from_segments(url.path()).or_else(|| url.fragment().and_then(from_segments))
}

/// Maps a part URL to the URL actually fetched
#[derive(Clone, Default)]
pub struct LinkResolver {
    hosts: Vec<String>,
    session: Option<Arc<SessionManager>>,
}

impl LinkResolver {
    /// Resolver that fetches every URL as given
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn new(hosts: Vec<String>, session: Option<Arc<SessionManager>>) -> Self {
        Self { hosts, session }
    }

    pub fn session(&self) -> Option<&Arc<SessionManager>> {
        self.session.as_ref()
    }

    fn is_provider_host(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
    }

    pub async fn resolve(&self, url: &str) -> Result<String> {
        let parsed =
            Url::parse(url).map_err(|e| ProviderError::InvalidUrl(format!("{}: {}", url, e)))?;

        if !self.is_provider_host(&parsed) {
            return Ok(url.to_string());
        }

        let ident = file_ident(&parsed)
            .ok_or_else(|| ProviderError::InvalidUrl(format!("{}: no file ident", url)))?;
        let session = self
            .session
            .as_ref()
            .ok_or(ProviderError::MissingCredentials)?;

        debug!(ident, "Resolving provider link");
        session.resolve_link(&ident).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_ident_from_path_and_fragment() {
        let path = Url::parse("https://files.test/file/AbC123/movie-mkv").unwrap();
        assert_eq!(file_ident(&path).as_deref(), Some("AbC123"));

        let fragment = Url::parse("https://files.test/#/file/XyZ/name").unwrap();
        assert_eq!(file_ident(&fragment).as_deref(), Some("XyZ"));

        let none = Url::parse("https://files.test/download/1").unwrap();
        assert_eq!(file_ident(&none), None);
    }

    #[tokio::test]
    async fn test_direct_urls_pass_through() {
        let resolver = LinkResolver::new(vec!["files.test".to_string()], None);
        assert_eq!(
            resolver.resolve("http://a/1").await.unwrap(),
            "http://a/1"
        );
    }

    #[tokio::test]
    async fn test_provider_url_without_credentials() {
        let resolver = LinkResolver::new(vec!["files.test".to_string()], None);
        let result = resolver.resolve("https://FILES.test/file/abc").await;
        assert!(matches!(result, Err(ProviderError::MissingCredentials)));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let resolver = LinkResolver::direct();
        assert!(matches!(
            resolver.resolve("not a url").await,
            Err(ProviderError::InvalidUrl(_))
        ));
    }
}
