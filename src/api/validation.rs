use std::collections::HashSet;
use thiserror::Error;

use super::models::CreateBundleRequest;
use crate::config::ApiConfig;

const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleValidationError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name exceeds {MAX_NAME_LEN} characters")]
    NameTooLong,
    #[error("urls must contain between 1 and {0} entries")]
    InvalidUrlCount(usize),
    #[error("url #{0} exceeds {1} bytes")]
    UrlTooLong(usize, usize),
    #[error("url #{0} must be an absolute http/https url")]
    InvalidUrl(usize),
    #[error("url #{0} is listed twice")]
    DuplicateUrl(usize),
}

pub fn validate_bundle(
    request: &CreateBundleRequest,
    limits: &ApiConfig,
) -> Result<(), BundleValidationError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(BundleValidationError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(BundleValidationError::NameTooLong);
    }

    if !(1..=limits.max_urls_per_bundle).contains(&request.urls.len()) {
        return Err(BundleValidationError::InvalidUrlCount(
            limits.max_urls_per_bundle,
        ));
    }

    let mut seen = HashSet::new();
    for (index, url) in request.urls.iter().enumerate() {
        if url.len() > limits.max_url_bytes {
            return Err(BundleValidationError::UrlTooLong(index, limits.max_url_bytes));
        }

        let valid = reqwest::Url::parse(url)
            .is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.has_host());
        if !valid {
            return Err(BundleValidationError::InvalidUrl(index));
        }

        if !seen.insert(url.as_str()) {
            return Err(BundleValidationError::DuplicateUrl(index));
        }
    }

    Ok(())
}
