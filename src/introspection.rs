//! Opaque token validation via OAuth2 Token Introspection (RFC 7662).

use crate::cache::TtlCache;
use crate::config::{FilterSettings, OpaqueConfig};
use crate::error::{ConfigError, FilterError};
use crate::token::{parse_scope_string, unix_now, BearerToken, ValidationResult};
use crate::transport::HttpTransport;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Opaque-result cache key: configuration generation and SHA-256 of the token.
pub(crate) type OpaqueCacheKey = (u64, [u8; 32]);

/// Cached introspection outcome.
///
/// `exp` is the expiry the server reported. When it is absent the token stays
/// valid for as long as the entry is cached, and `result.expires_at` only
/// marks the end of the cache TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Introspected {
    pub(crate) result: ValidationResult,
    pub(crate) exp: Option<i64>,
}

/// Fields of an introspection response the filter relies on.
///
/// Everything else the server returns is ignored.
#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: Option<bool>,
    sub: Option<String>,
    username: Option<String>,
    client_id: Option<String>,
    scope: Option<String>,
    exp: Option<i64>,
}

pub(crate) struct OpaqueValidator {
    config: OpaqueConfig,
    transport: HttpTransport,
    max_ttl: Duration,
    default_ttl: Duration,
}

impl OpaqueValidator {
    pub(crate) fn new(config: OpaqueConfig, settings: &FilterSettings) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(settings, config.verify_tls)?;
        Ok(Self {
            config,
            transport,
            max_ttl: settings.introspection_max_ttl,
            default_ttl: settings.introspection_default_ttl,
        })
    }

    /// Validate `token`, consulting `cache` first.
    ///
    /// Concurrent validations of the same token share one introspection call.
    /// Only successful results are cached.
    pub(crate) fn validate(
        &self,
        token: &BearerToken,
        generation: u64,
        cache: &TtlCache<OpaqueCacheKey, Introspected>,
    ) -> Result<ValidationResult, FilterError> {
        let key = (generation, token.digest());
        let entry = cache.get_or_try_insert_with(key, || self.introspect(token))?;
        // A cached entry outlives `exp` only by the sub-second rounding of its TTL
        if let Some(exp) = entry.exp {
            let now = unix_now();
            if exp <= now {
                cache.invalidate(&(generation, token.digest()));
                return Err(FilterError::TokenExpired { exp, now });
            }
        }
        Ok(entry.result)
    }

    fn introspect(&self, token: &BearerToken) -> Result<(Introspected, Duration), FilterError> {
        debug!(token = %token, url = %self.config.introspection_url, "introspecting token");

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token.as_str())
            .finish();

        let resp = self
            .transport
            .send("introspection", |client| {
                client
                    .post(self.config.introspection_url.clone())
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .header(
                        http::header::CONTENT_TYPE,
                        "application/x-www-form-urlencoded",
                    )
                    .header(http::header::ACCEPT, "application/json")
                    .body(body.clone())
            })
            .map_err(|e| FilterError::IntrospectionUnreachable {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(FilterError::IntrospectionUnreachable {
                reason: format!("introspection endpoint returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(FilterError::IntrospectionBadResponse {
                reason: format!("introspection endpoint returned {}", status),
            });
        }

        let bytes = resp
            .bytes()
            .map_err(|e| FilterError::IntrospectionUnreachable {
                reason: e.to_string(),
            })?;
        let parsed: IntrospectionResponse =
            serde_json::from_slice(&bytes).map_err(|e| FilterError::IntrospectionBadResponse {
                reason: format!("invalid JSON: {}", e),
            })?;

        self.interpret(parsed, unix_now())
    }

    /// Turn a parsed response into a result and its cache TTL.
    fn interpret(
        &self,
        resp: IntrospectionResponse,
        now: i64,
    ) -> Result<(Introspected, Duration), FilterError> {
        match resp.active {
            None => {
                return Err(FilterError::IntrospectionBadResponse {
                    reason: "missing 'active' field".to_string(),
                })
            }
            Some(false) => return Err(FilterError::TokenInactive),
            Some(true) => {}
        }

        if let Some(exp) = resp.exp {
            if exp <= now {
                return Err(FilterError::TokenExpired { exp, now });
            }
        }

        let subject = [resp.sub, resp.username, resp.client_id]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .ok_or_else(|| FilterError::IntrospectionBadResponse {
                reason: "active token has no sub, username or client_id".to_string(),
            })?;

        let (expires_at, ttl) = match resp.exp {
            Some(exp) => {
                let remaining = Duration::from_secs((exp - now) as u64);
                (exp, remaining.min(self.max_ttl))
            }
            None => {
                let ttl = self.default_ttl.min(self.max_ttl);
                (now + ttl.as_secs() as i64, ttl)
            }
        };

        let result = ValidationResult {
            subject,
            scopes: resp
                .scope
                .as_deref()
                .map(parse_scope_string)
                .unwrap_or_default(),
            expires_at,
            issuer: None,
        };
        Ok((
            Introspected {
                result,
                exp: resp.exp,
            },
            ttl,
        ))
    }
}
