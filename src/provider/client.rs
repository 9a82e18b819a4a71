//! HTTP client for the provider API
//!
//! Every call is a form-encoded POST to `<base_url>/<operation>/` answered
//! with a flat XML document:
//!
//! ```xml
//! <response><status>OK</status><token>...</token></response>
//! <response><status>FATAL</status><code>NOT_LOGGED_IN</code><message>...</message></response>
//! ```

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{FileHost, ProviderError, Result};

const STATUS_OK: &str = "OK";
const CODE_NOT_LOGGED_IN: &str = "NOT_LOGGED_IN";
const CODE_FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";

#[derive(Debug, Default, Deserialize)]
struct ProviderResponse {
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    salt: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

pub struct HostingClient {
    client: Client,
    base_url: Url,
}

impl HostingClient {
    pub fn new(base_url: &str, connect_timeout: Duration, user_agent: &str) -> Result<Self> {
        // join() replaces the last segment unless the base ends with a slash
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ProviderError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    async fn call(&self, operation: &'static str, form: &[(&str, &str)]) -> Result<ProviderResponse> {
        let url = self
            .base_url
            .join(&format!("{}/", operation))
            .map_err(|e| ProviderError::InvalidUrl(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Unauthorized(format!(
                "{} returned HTTP {}",
                operation,
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Status {
                operation,
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let parsed: ProviderResponse =
            quick_xml::de::from_str(&body).map_err(|e| ProviderError::Malformed {
                operation,
                reason: e.to_string(),
            })?;

        debug!(operation, status = %parsed.status, "Provider call finished");
        Ok(parsed)
    }

    /// Turn a non-OK response into the matching error
    fn check(operation: &'static str, response: ProviderResponse) -> Result<ProviderResponse> {
        if response.status == STATUS_OK {
            return Ok(response);
        }

        let code = response.code.unwrap_or_default();
        let message = response.message.unwrap_or_default();
        if operation == "login" || code == CODE_NOT_LOGGED_IN {
            return Err(ProviderError::Unauthorized(format!("{} {}", code, message)));
        }
        Err(ProviderError::Rejected {
            operation,
            code,
            message,
        })
    }

    fn field(operation: &'static str, value: Option<String>, name: &str) -> Result<String> {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::Malformed {
                operation,
                reason: format!("missing <{}>", name),
            })
    }
}

#[async_trait]
impl FileHost for HostingClient {
    async fn salt(&self, username: &str) -> Result<String> {
        let response = Self::check("salt", self.call("salt", &[("username", username)]).await?)?;
        Self::field("salt", response.salt, "salt")
    }

    async fn login(&self, username: &str, password_digest: &str) -> Result<String> {
        let form = [
            ("username", username),
            ("password", password_digest),
            ("keep_logged_in", "1"),
        ];
        let response = Self::check("login", self.call("login", &form).await?)?;
        Self::field("login", response.token, "token")
    }

    async fn resolve_download_link(&self, token: &str, ident: &str) -> Result<String> {
        let form = [("token", token), ("ident", ident)];
        let response = Self::check("file_link", self.call("file_link", &form).await?)?;
        Self::field("file_link", response.link, "link")
    }

    async fn file_exists(&self, token: &str, ident: &str) -> Result<bool> {
        let form = [("token", token), ("ident", ident)];
        match Self::check("file_info", self.call("file_info", &form).await?) {
            Ok(_) => Ok(true),
            Err(ProviderError::Rejected { code, .. }) if code == CODE_FILE_NOT_FOUND => Ok(false),
            Err(err) => Err(err),
        }
    }
}
