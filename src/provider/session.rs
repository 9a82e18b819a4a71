use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::digest::password_digest;
use super::{FileHost, ProviderError, Result};

/// Cached provider session shared by all workers
///
/// Logs in lazily. When the provider rejects the token the cache is
/// cleared and the error is returned unchanged; the next attempt of the
/// job logs in again.
pub struct SessionManager {
    host: Arc<dyn FileHost>,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(host: Arc<dyn FileHost>, username: String, password: String) -> Self {
        Self {
            host,
            username,
            password,
            token: RwLock::new(None),
        }
    }

    /// Cached token, logging in when there is none
    pub async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut cached = self.token.write().await;
        // Another worker may have logged in while we waited
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let salt = self.host.salt(&self.username).await?;
        let digest = password_digest(&self.password, &salt);
        let token = self.host.login(&self.username, &digest).await?;
        info!(username = %self.username, "Logged in to provider");

        *cached = Some(token.clone());
        Ok(token)
    }

    pub async fn invalidate(&self) {
        self.token.write().await.take();
    }

    /// Transient download URL for a provider file
    pub async fn resolve_link(&self, ident: &str) -> Result<String> {
        let token = self.token().await?;

        let result = async {
            if !self.host.file_exists(&token, ident).await? {
                return Err(ProviderError::FileNotFound(ident.to_string()));
            }
            self.host.resolve_download_link(&token, ident).await
        }
        .await;

        if let Err(err) = &result {
            if err.is_auth() {
                warn!(ident, error = %err, "Provider session rejected, dropping cached token");
                self.invalidate().await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHost {
        logins: AtomicUsize,
        reject_next: AtomicBool,
    }

    #[async_trait]
    impl FileHost for FakeHost {
        async fn salt(&self, _username: &str) -> Result<String> {
            Ok("saltsalt".to_string())
        }

        async fn login(&self, _username: &str, digest: &str) -> Result<String> {
            assert_eq!(digest, "8f3315e7ab76ef346454e2f25a8560d66c593dc3");
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{}", n))
        }

        async fn resolve_download_link(&self, token: &str, ident: &str) -> Result<String> {
            if self.reject_next.swap(false, Ordering::SeqCst) {
                return Err(ProviderError::Unauthorized("expired".to_string()));
            }
            Ok(format!("http://cdn.test/{}?t={}", ident, token))
        }

        async fn file_exists(&self, _token: &str, ident: &str) -> Result<bool> {
            Ok(ident != "gone")
        }
    }

    fn manager(host: Arc<FakeHost>) -> SessionManager {
        SessionManager::new(host, "alice".to_string(), "password".to_string())
    }

    #[tokio::test]
    async fn test_login_is_cached() {
        let host = Arc::new(FakeHost::default());
        let session = manager(host.clone());

        assert_eq!(
            session.resolve_link("a").await.unwrap(),
            "http://cdn.test/a?t=token-1"
        );
        session.resolve_link("b").await.unwrap();
        assert_eq!(host.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_session_forces_login_next_time() {
        let host = Arc::new(FakeHost::default());
        let session = manager(host.clone());
        session.token().await.unwrap();

        host.reject_next.store(true, Ordering::SeqCst);
        let err = session.resolve_link("a").await.unwrap_err();
        assert!(err.is_auth());
        // Not retried within the same call
        assert_eq!(host.logins.load(Ordering::SeqCst), 1);

        let link = session.resolve_link("a").await.unwrap();
        assert_eq!(link, "http://cdn.test/a?t=token-2");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let session = manager(Arc::new(FakeHost::default()));
        assert!(matches!(
            session.resolve_link("gone").await,
            Err(ProviderError::FileNotFound(_))
        ));
    }
}
