//! Failure taxonomy for token validation and filter configuration.
//!
//! [`FilterError`] carries operator-facing detail (which claim failed, which
//! scopes were missing, why an upstream was unreachable). Its `Display` output
//! is safe to surface to callers: it never contains a raw token, a client
//! secret, key material or an upstream response body. The extra diagnostic
//! strings some variants hold (e.g. `reason`) are only emitted through
//! [`FilterError::log`] as structured `tracing` fields.

use std::fmt;
use tracing::{debug, error, warn};

/// Public classification of a validation failure.
///
/// This is what a denial exposes to the dispatch layer. Several internal
/// [`FilterError`] variants can collapse onto the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MissingCredential,
    MalformedCredential,
    FilterNotConfigured,
    IntrospectionUnreachable,
    IntrospectionBadResponse,
    TokenInactive,
    TokenExpired,
    UnknownIssuer,
    KeyNotFound,
    InvalidSignature,
    ClaimValidationFailed,
    InsufficientScope,
}

impl FailureKind {
    /// Stable identifier used in logs and denial bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::MissingCredential => "missing_credential",
            FailureKind::MalformedCredential => "malformed_credential",
            FailureKind::FilterNotConfigured => "filter_not_configured",
            FailureKind::IntrospectionUnreachable => "introspection_unreachable",
            FailureKind::IntrospectionBadResponse => "introspection_bad_response",
            FailureKind::TokenInactive => "token_inactive",
            FailureKind::TokenExpired => "token_expired",
            FailureKind::UnknownIssuer => "unknown_issuer",
            FailureKind::KeyNotFound => "key_not_found",
            FailureKind::InvalidSignature => "invalid_signature",
            FailureKind::ClaimValidationFailed => "claim_validation_failed",
            FailureKind::InsufficientScope => "insufficient_scope",
        }
    }

    /// HTTP status the surrounding dispatch layer should answer with.
    ///
    /// - `403` when the token is valid but lacks scopes
    /// - `500` when the filter was never configured (programmer error)
    /// - `401` for everything else
    pub fn status(&self) -> u16 {
        match self {
            FailureKind::InsufficientScope => 403,
            FailureKind::FilterNotConfigured => 500,
            _ => 401,
        }
    }

    /// RFC 6750 §3.1 error code, if the kind maps to one.
    ///
    /// A request without any credential gets a bare challenge (no code).
    pub fn bearer_error_code(&self) -> Option<&'static str> {
        match self {
            FailureKind::MissingCredential | FailureKind::FilterNotConfigured => None,
            FailureKind::MalformedCredential => Some("invalid_request"),
            FailureKind::InsufficientScope => Some("insufficient_scope"),
            _ => Some("invalid_token"),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can stop a request from reaching a protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// No `Authorization` header on the request
    MissingCredential,
    /// `Authorization` present but not `Bearer <token>`, or the token is not
    /// structurally usable (e.g. a JWT that cannot be decoded)
    MalformedCredential { reason: &'static str },
    /// The filter was used before any trust configuration was installed
    FilterNotConfigured,
    /// Introspection endpoint could not be reached, timed out, or failed (5xx)
    IntrospectionUnreachable { reason: String },
    /// Introspection answered with something that is not a usable RFC 7662 body
    IntrospectionBadResponse { reason: String },
    /// Introspection reported `active: false`
    TokenInactive,
    /// Introspection reported `active: true` but `exp` is in the past
    TokenExpired { exp: i64, now: i64 },
    /// `iss` claim missing or not one of the configured issuers
    UnknownIssuer { issuer: Option<String> },
    /// The key id is absent from the issuer's JWKS, even after a fresh fetch
    KeyNotFound { issuer: String, kid: Option<String> },
    /// The issuer's JWKS could not be fetched or parsed
    JwksUnavailable { issuer: String, reason: String },
    /// Header `alg` is not in the issuer's allowed set (covers `none`)
    DisallowedAlgorithm { alg: String },
    /// Signature does not verify against the resolved key
    InvalidSignature,
    /// A registered claim (`exp`, `nbf`, `aud`, `iss`, `sub`) failed validation
    ClaimValidationFailed { claim: &'static str, reason: String },
    /// The token lacks one or more required scopes
    InsufficientScope { missing: Vec<String> },
}

impl FilterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FilterError::MissingCredential => FailureKind::MissingCredential,
            FilterError::MalformedCredential { .. } => FailureKind::MalformedCredential,
            FilterError::FilterNotConfigured => FailureKind::FilterNotConfigured,
            FilterError::IntrospectionUnreachable { .. } => FailureKind::IntrospectionUnreachable,
            FilterError::IntrospectionBadResponse { .. } => FailureKind::IntrospectionBadResponse,
            FilterError::TokenInactive => FailureKind::TokenInactive,
            FilterError::TokenExpired { .. } => FailureKind::TokenExpired,
            FilterError::UnknownIssuer { .. } => FailureKind::UnknownIssuer,
            FilterError::KeyNotFound { .. } | FilterError::JwksUnavailable { .. } => {
                FailureKind::KeyNotFound
            }
            FilterError::DisallowedAlgorithm { .. } | FilterError::InvalidSignature => {
                FailureKind::InvalidSignature
            }
            FilterError::ClaimValidationFailed { .. } => FailureKind::ClaimValidationFailed,
            FilterError::InsufficientScope { .. } => FailureKind::InsufficientScope,
        }
    }

    /// Emit the failure with structured fields.
    ///
    /// Expected, client-caused failures log at `debug`; failures that point at
    /// an attack, misconfiguration or an unhealthy upstream log at `warn`.
    pub fn log(&self) {
        match self {
            FilterError::MissingCredential => {
                debug!(kind = %self.kind(), "token validation failed: no Authorization header");
            }
            FilterError::MalformedCredential { reason } => {
                debug!(kind = %self.kind(), reason, "token validation failed: malformed credential");
            }
            FilterError::FilterNotConfigured => {
                error!(
                    kind = %self.kind(),
                    "oauth filter used before configuration; every request is being denied"
                );
            }
            FilterError::IntrospectionUnreachable { reason } => {
                warn!(kind = %self.kind(), %reason, "token validation failed: introspection unreachable");
            }
            FilterError::IntrospectionBadResponse { reason } => {
                warn!(kind = %self.kind(), %reason, "token validation failed: bad introspection response");
            }
            FilterError::TokenInactive => {
                debug!(kind = %self.kind(), "token validation failed: token inactive");
            }
            FilterError::TokenExpired { exp, now } => {
                debug!(kind = %self.kind(), exp, now, "token validation failed: token expired");
            }
            FilterError::UnknownIssuer { issuer } => {
                warn!(kind = %self.kind(), ?issuer, "token validation failed: issuer not trusted");
            }
            FilterError::KeyNotFound { issuer, kid } => {
                warn!(kind = %self.kind(), %issuer, ?kid, "token validation failed: key not found in JWKS");
            }
            FilterError::JwksUnavailable { issuer, reason } => {
                warn!(kind = %self.kind(), %issuer, %reason, "token validation failed: JWKS unavailable");
            }
            FilterError::DisallowedAlgorithm { alg } => {
                warn!(kind = %self.kind(), %alg, "token validation failed: algorithm not allowed");
            }
            FilterError::InvalidSignature => {
                warn!(kind = %self.kind(), "token validation failed: invalid signature");
            }
            FilterError::ClaimValidationFailed { claim, reason } => {
                debug!(kind = %self.kind(), claim, %reason, "token validation failed: claim rejected");
            }
            FilterError::InsufficientScope { missing } => {
                debug!(kind = %self.kind(), ?missing, "token validation failed: insufficient scope");
            }
        }
    }
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::MissingCredential => write!(f, "missing bearer token"),
            FilterError::MalformedCredential { reason } => {
                write!(f, "malformed bearer credential: {}", reason)
            }
            FilterError::FilterNotConfigured => write!(f, "authorization is not configured"),
            FilterError::IntrospectionUnreachable { .. } => {
                write!(f, "token introspection is unavailable")
            }
            FilterError::IntrospectionBadResponse { .. } => {
                write!(f, "token introspection returned an invalid response")
            }
            FilterError::TokenInactive => write!(f, "token is not active"),
            FilterError::TokenExpired { .. } => write!(f, "token has expired"),
            FilterError::UnknownIssuer { .. } => write!(f, "token issuer is not trusted"),
            FilterError::KeyNotFound { .. } => write!(f, "token signing key is unknown"),
            FilterError::JwksUnavailable { .. } => {
                write!(f, "token signing keys are unavailable")
            }
            FilterError::DisallowedAlgorithm { alg } => {
                write!(f, "token algorithm {} is not allowed", alg)
            }
            FilterError::InvalidSignature => write!(f, "token signature is invalid"),
            FilterError::ClaimValidationFailed { claim, .. } => {
                write!(f, "token claim '{}' is invalid", claim)
            }
            FilterError::InsufficientScope { missing } => {
                write!(f, "token is missing required scope(s): {}", missing.join(" "))
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// Configuration error
///
/// Returned while building a [`crate::TrustConfig`] or installing it on a
/// filter. None of these involve network I/O.
#[derive(Debug)]
pub enum ConfigError {
    /// Multi-issuer configuration with no issuers
    EmptyIssuerList,
    /// A configured URL does not parse
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    /// Plain `http` outside of localhost development
    InsecureUrl { field: &'static str, value: String },
    /// Config file declares neither `[opaque]` nor `[jwt]`
    MissingMode,
    /// Config file declares both `[opaque]` and `[jwt]`
    AmbiguousMode,
    /// Config file is not valid TOML for the expected shape
    Parse(String),
    /// Config file could not be read
    Io(std::io::Error),
    /// The outbound HTTP client could not be built
    HttpClient(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyIssuerList => {
                write!(f, "trust configuration error: at least one issuer is required")
            }
            ConfigError::InvalidUrl {
                field,
                value,
                reason,
            } => write!(
                f,
                "trust configuration error: {} '{}' is not a valid URL ({})",
                field, value, reason
            ),
            ConfigError::InsecureUrl { field, value } => write!(
                f,
                "trust configuration error: {} '{}' must use HTTPS \
                (HTTP only allowed for localhost/127.0.0.1)",
                field, value
            ),
            ConfigError::MissingMode => write!(
                f,
                "trust configuration error: expected an [opaque] or a [jwt] section"
            ),
            ConfigError::AmbiguousMode => write!(
                f,
                "trust configuration error: [opaque] and [jwt] are mutually exclusive"
            ),
            ConfigError::Parse(e) => write!(f, "trust configuration error: {}", e),
            ConfigError::Io(e) => write!(f, "trust configuration error: {}", e),
            ConfigError::HttpClient(e) => {
                write!(f, "trust configuration error: cannot build HTTP client ({})", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}
