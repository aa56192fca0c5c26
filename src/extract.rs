//! Bearer token extraction from the `Authorization` header (RFC 6750 §2.1).

use crate::error::FilterError;
use crate::token::BearerToken;

const BEARER_SCHEME: &str = "bearer";

/// Pull a bearer token out of an `Authorization` header value.
///
/// # Arguments
///
/// * `header` - The raw header value, or `None` when the request had no
///   `Authorization` header
///
/// # Returns
///
/// - `Ok(BearerToken)` for `Bearer <token>` (scheme matched case-insensitively)
/// - `Err(MissingCredential)` when the header is absent
/// - `Err(MalformedCredential)` for any other shape: a different scheme, no
///   token, more than one space, embedded whitespace or control characters
///
/// The token itself is not inspected beyond that; whether it is a JWT or an
/// opaque string is decided by the configured trust model.
pub fn extract_bearer(header: Option<&str>) -> Result<BearerToken, FilterError> {
    let value = header.ok_or(FilterError::MissingCredential)?;

    let (scheme, token) = value
        .split_once(' ')
        .ok_or(FilterError::MalformedCredential {
            reason: "expected 'Bearer <token>'",
        })?;

    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        return Err(FilterError::MalformedCredential {
            reason: "authorization scheme is not Bearer",
        });
    }
    if token.is_empty() {
        return Err(FilterError::MalformedCredential {
            reason: "bearer token is empty",
        });
    }
    if token
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(FilterError::MalformedCredential {
            reason: "bearer token contains whitespace or control characters",
        });
    }

    Ok(BearerToken::new(token))
}

/// Same as [`extract_bearer`], reading straight from an `http` header map.
///
/// A header that is present but not visible ASCII counts as malformed.
pub fn extract_from_headers(headers: &http::HeaderMap) -> Result<BearerToken, FilterError> {
    match headers.get(http::header::AUTHORIZATION) {
        None => Err(FilterError::MissingCredential),
        Some(value) => {
            let value = value.to_str().map_err(|_| FilterError::MalformedCredential {
                reason: "authorization header is not visible ASCII",
            })?;
            extract_bearer(Some(value))
        }
    }
}
