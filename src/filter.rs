//! The filter: configuration, validation dispatch, and guarded operations.
//!
//! # Request flow
//!
//! 1. Extract the bearer token from `Authorization`
//! 2. Load the active trust configuration (`FilterNotConfigured` if none)
//! 3. Validate: introspection for opaque tokens, JWKS + claims for JWTs
//! 4. Enforce the operation's required scopes
//! 5. Build the [`RequestContext`] and run the operation
//!
//! Any failure short-circuits into a [`Denial`]; the operation never runs.
//!
//! # Reconfiguration
//!
//! The active configuration sits behind an `ArcSwapOption`, so a request sees
//! either the old or the new configuration, never a mix. Each `configure*`
//! call bumps a generation counter that is part of every cache key, then
//! clears both caches.
//!
//! # Example
//!
//! ```no_run
//! use http::{HeaderMap, Method};
//! use oauth_filter::{FilterRequest, OAuthFilter};
//! use std::sync::Arc;
//!
//! let filter = Arc::new(OAuthFilter::from_env());
//! filter
//!     .configure_opaque(
//!         "https://idsvr.example.com/oauth/v2/introspection",
//!         "test_gateway_client",
//!         "secret",
//!     )
//!     .unwrap();
//!
//! let hello = filter.protect([""], |_req, ctx| format!("hello {}", ctx.user));
//!
//! let (method, headers) = (Method::GET, HeaderMap::new());
//! match hello.call(&FilterRequest::new(&method, &headers)) {
//!     Ok(body) => println!("{}", body),
//!     Err(denial) => println!("{} {}", denial.status, denial.message),
//! }
//! ```

use crate::cache::{CacheStats, TtlCache};
use crate::config::{FilterSettings, TrustConfig};
use crate::error::{ConfigError, FilterError};
use crate::extract::extract_from_headers;
use crate::introspection::{Introspected, OpaqueCacheKey, OpaqueValidator};
use crate::jwt::jwks::SigningKey;
use crate::jwt::{JwtValidator, KeyCacheKey};
use crate::request::{Denial, FilterRequest, RequestContext};
use crate::scope::RequiredScopes;
use crate::token::{BearerToken, ValidationResult};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

enum Validator {
    Opaque(OpaqueValidator),
    Jwt(JwtValidator),
}

struct ActiveTrust {
    generation: u64,
    mode: &'static str,
    validator: Validator,
}

/// OAuth2 bearer-token filter.
///
/// Owns its trust configuration and caches; several filters with different
/// trust models can run side by side. Share it across threads with `Arc`.
pub struct OAuthFilter {
    settings: FilterSettings,
    active: ArcSwapOption<ActiveTrust>,
    generation: AtomicU64,
    opaque_results: TtlCache<OpaqueCacheKey, Introspected>,
    signing_keys: TtlCache<KeyCacheKey, SigningKey>,
}

impl Default for OAuthFilter {
    fn default() -> Self {
        Self::with_settings(FilterSettings::default())
    }
}

impl OAuthFilter {
    /// Unconfigured filter with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconfigured filter with settings from `OAUTH_FILTER_*` variables.
    pub fn from_env() -> Self {
        Self::with_settings(FilterSettings::from_env())
    }

    pub fn with_settings(settings: FilterSettings) -> Self {
        Self {
            opaque_results: TtlCache::new(settings.cache_capacity),
            signing_keys: TtlCache::new(settings.cache_capacity),
            settings,
            active: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    /// Install `trust`, replacing any previous configuration.
    ///
    /// Performs no network I/O. On error the previous configuration stays
    /// in place.
    pub fn configure(&self, trust: TrustConfig) -> Result<(), ConfigError> {
        let mode = trust.mode();
        let validator = match trust {
            TrustConfig::Opaque(cfg) => Validator::Opaque(OpaqueValidator::new(cfg, &self.settings)?),
            TrustConfig::Jwt(cfg) => Validator::Jwt(JwtValidator::new(cfg, &self.settings)?),
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.active.store(Some(Arc::new(ActiveTrust {
            generation,
            mode,
            validator,
        })));
        self.opaque_results.clear();
        self.signing_keys.clear();

        info!(mode, generation, "oauth filter configured");
        Ok(())
    }

    /// Validate opaque tokens against an introspection endpoint.
    pub fn configure_opaque(
        &self,
        introspection_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<(), ConfigError> {
        self.configure(TrustConfig::opaque(
            introspection_url,
            client_id,
            client_secret,
        )?)
    }

    /// Validate JWTs from one issuer, with keys from `jwks_url`.
    pub fn configure_jwt<I, S>(
        &self,
        jwks_url: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        scopes: I,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configure(TrustConfig::jwt(jwks_url, issuer, audience, scopes)?)
    }

    /// Validate JWTs from several issuers, each publishing keys at
    /// `<issuer>/jwks`.
    pub fn configure_jwt_issuers<I, S, T>(
        &self,
        issuers: I,
        audience: impl Into<String>,
        scopes: T,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        self.configure(TrustConfig::jwt_issuers(issuers, audience, scopes)?)
    }

    pub fn is_configured(&self) -> bool {
        self.active.load().is_some()
    }

    /// `"opaque"` or `"jwt"`, once configured.
    pub fn mode(&self) -> Option<&'static str> {
        self.active.load().as_ref().map(|a| a.mode)
    }

    /// Fail fast at startup instead of denying every request with a 500.
    pub fn ensure_configured(&self) -> Result<(), FilterError> {
        if self.is_configured() {
            Ok(())
        } else {
            let err = FilterError::FilterNotConfigured;
            err.log();
            Err(err)
        }
    }

    /// Validate a token under the active trust configuration.
    pub fn validate_token(&self, token: &BearerToken) -> Result<ValidationResult, FilterError> {
        let active = self.active.load_full().ok_or(FilterError::FilterNotConfigured)?;
        match &active.validator {
            Validator::Opaque(v) => v.validate(token, active.generation, &self.opaque_results),
            Validator::Jwt(v) => v.validate(token, active.generation, &self.signing_keys),
        }
    }

    /// Run the full decision for one request.
    pub fn authorize(
        &self,
        req: &FilterRequest<'_>,
        required: &RequiredScopes,
    ) -> Result<RequestContext, Denial> {
        self.decide(req, required).map_err(|err| {
            err.log();
            Denial::from_error(&err)
        })
    }

    fn decide(
        &self,
        req: &FilterRequest<'_>,
        required: &RequiredScopes,
    ) -> Result<RequestContext, FilterError> {
        let token = extract_from_headers(req.headers)?;
        let result = self.validate_token(&token)?;
        required.enforce(&result.scopes)?;

        debug!(
            token = %token,
            user = %result.subject,
            method = %req.method,
            "request authorized"
        );
        Ok(RequestContext::new(result, req))
    }

    /// Guard `operation` behind this filter and `required` scopes.
    ///
    /// `[""]` (or an empty list) requires a valid token and nothing else.
    pub fn protect<I, S, F, R>(self: &Arc<Self>, required: I, operation: F) -> Protected<F>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&FilterRequest<'_>, RequestContext) -> R,
    {
        Protected {
            filter: Arc::clone(self),
            required: RequiredScopes::new(required),
            operation,
        }
    }

    /// Counters for cached introspection results.
    pub fn introspection_cache_stats(&self) -> CacheStats {
        self.opaque_results.stats()
    }

    /// Counters for cached JWKS signing keys.
    pub fn key_cache_stats(&self) -> CacheStats {
        self.signing_keys.stats()
    }
}

/// An operation that only runs for authorized requests.
pub struct Protected<F> {
    filter: Arc<OAuthFilter>,
    required: RequiredScopes,
    operation: F,
}

impl<F> Protected<F> {
    pub fn required_scopes(&self) -> &RequiredScopes {
        &self.required
    }

    /// Authorize `req`, then run the operation with the resulting context.
    ///
    /// The operation's return value is passed through unchanged.
    pub fn call<R>(&self, req: &FilterRequest<'_>) -> Result<R, Denial>
    where
        F: Fn(&FilterRequest<'_>, RequestContext) -> R,
    {
        let ctx = self.filter.authorize(req, &self.required)?;
        Ok((self.operation)(req, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use http::{HeaderMap, HeaderValue, Method};
    use std::sync::atomic::AtomicUsize;

    fn headers(auth: Option<&'static str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = auth {
            h.insert(http::header::AUTHORIZATION, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn test_filter_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OAuthFilter>();
    }

    #[test]
    fn test_unconfigured_filter_denies_with_500() {
        let filter = Arc::new(OAuthFilter::new());
        assert!(!filter.is_configured());
        assert_eq!(filter.ensure_configured(), Err(FilterError::FilterNotConfigured));

        let calls = AtomicUsize::new(0);
        let op = filter.protect([""], |_req, _ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        let (method, h) = (Method::GET, headers(Some("Bearer abc")));
        let denial = op.call(&FilterRequest::new(&method, &h)).unwrap_err();
        assert_eq!(denial.kind, FailureKind::FilterNotConfigured);
        assert_eq!(denial.status, 500);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_header_checked_before_configuration() {
        let filter = OAuthFilter::new();
        let (method, h) = (Method::GET, headers(None));
        let denial = filter
            .authorize(&FilterRequest::new(&method, &h), &RequiredScopes::none())
            .unwrap_err();
        assert_eq!(denial.kind, FailureKind::MissingCredential);
        assert_eq!(denial.status, 401);
    }

    #[test]
    fn test_configure_bumps_generation_and_mode() {
        let filter = OAuthFilter::new();
        filter
            .configure_opaque("https://idsvr.example.com/introspection", "c", "s")
            .unwrap();
        assert_eq!(filter.mode(), Some("opaque"));
        filter
            .configure_jwt_issuers(["https://idsvr.example.com/oauth"], "api", ["openid"])
            .unwrap();
        assert_eq!(filter.mode(), Some("jwt"));
        assert_eq!(filter.generation.load(Ordering::SeqCst), 2);
        assert!(filter.ensure_configured().is_ok());
    }

    #[test]
    fn test_failed_configure_keeps_previous() {
        let filter = OAuthFilter::new();
        filter
            .configure_opaque("https://idsvr.example.com/introspection", "c", "s")
            .unwrap();
        let err = filter.configure_jwt("http://idsvr.example.com/jwks", "iss", "api", [""]);
        assert!(matches!(err, Err(ConfigError::InsecureUrl { .. })));
        assert_eq!(filter.mode(), Some("opaque"));
        assert_eq!(filter.generation.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_header_denied() {
        let filter = Arc::new(OAuthFilter::new());
        filter
            .configure_opaque("https://idsvr.example.com/introspection", "c", "s")
            .unwrap();
        let (method, h) = (Method::GET, headers(Some("Basic dXNlcjpwdw==")));
        let denial = filter
            .protect(["read"], |_req, _ctx| ())
            .call(&FilterRequest::new(&method, &h))
            .unwrap_err();
        assert_eq!(denial.kind, FailureKind::MalformedCredential);
        assert_eq!(denial.status, 401);
    }
}
