//! API utility functions
//!
//! Pure, stateless helpers for request processing, kept apart from the
//! handlers so they can be unit tested.

use crate::api::error::ApiError;
use crate::progress::Topic;

/// Parses and validates a Content-Type header for application/json
///
/// Accepts `application/json`, optionally with a charset parameter.
/// Rejects `application/jsonp`, `application/json-patch+json`, `text/json`
/// and malformed media types.
pub fn parse_content_type(content_type: &str) -> Result<mime::Mime, ApiError> {
    let media_type: mime::Mime = content_type.parse().map_err(|_| {
        ApiError::InvalidPayload(format!("invalid Content-Type: {}", content_type))
    })?;

    if media_type.type_() != mime::APPLICATION || media_type.subtype() != mime::JSON {
        return Err(ApiError::InvalidPayload(format!(
            "Content-Type must be application/json, got: {}/{}",
            media_type.type_(),
            media_type.subtype()
        )));
    }

    Ok(media_type)
}

/// Validates that body size does not exceed the maximum allowed size
pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), ApiError> {
    if data.len() > max_size {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }
    Ok(())
}

/// Comma separated topic filter of a stream request. Missing or empty means all.
pub fn parse_topics(raw: Option<&str>) -> Result<Vec<Topic>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.parse::<Topic>().map_err(ApiError::InvalidPayload))
        .collect()
}
