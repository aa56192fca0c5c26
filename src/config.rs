//! # Trust and Runtime Configuration
//!
//! Two independent pieces of configuration drive a filter:
//!
//! - [`TrustConfig`]: *whom* to trust. Either an OAuth2 introspection endpoint
//!   for opaque tokens, or one or more JWT issuers with their JWKS endpoints.
//!   Built in code or loaded from a TOML file.
//! - [`FilterSettings`]: *how* to talk to them. Timeouts, retry, cache TTLs and
//!   clock leeway, loaded from `OAUTH_FILTER_*` environment variables.
//!
//! Building a configuration never touches the network.
//!
//! ## URL policy
//!
//! Every configured URL must use `https`. Plain `http` is accepted only for the
//! exact hosts `localhost` and `127.0.0.1` so a local identity server can be
//! used during development. Subdomains such as `localhost.attacker.com` are
//! rejected.
//!
//! ## TOML format
//!
//! Exactly one of `[opaque]` or `[jwt]` must be present:
//!
//! ```toml
//! [opaque]
//! introspection_url = "https://idsvr.example.com/oauth/v2/introspection"
//! client_id = "test_gateway_client"
//! client_secret = "secret"
//! verify_tls = true
//! ```
//!
//! ```toml
//! [jwt]
//! audience = "back-end-api"
//! scopes = ["openid"]
//! issuers = ["https://idsvr.example.com/oauth/v2/oauth-anonymous"]
//!
//! [[jwt.issuer]]
//! issuer = "https://other.example.com"
//! jwks_url = "https://other.example.com/keys"
//! algorithms = ["ES256"]
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default |
//! |---|---|
//! | `OAUTH_FILTER_HTTP_TIMEOUT_MS` | `5000` |
//! | `OAUTH_FILTER_RETRY_ONCE` | `false` |
//! | `OAUTH_FILTER_RETRY_BACKOFF_MS` | `100` |
//! | `OAUTH_FILTER_INTROSPECTION_MAX_TTL_SECS` | `300` |
//! | `OAUTH_FILTER_INTROSPECTION_DEFAULT_TTL_SECS` | `60` |
//! | `OAUTH_FILTER_JWKS_TTL_SECS` | `3600` |
//! | `OAUTH_FILTER_CACHE_CAPACITY` | `10000` |
//! | `OAUTH_FILTER_LEEWAY_SECS` | `0` |
//!
//! Malformed values fall back to the default.

use crate::error::ConfigError;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Path appended to an issuer URL to locate its key set when only issuer
/// URLs are configured.
pub const JWKS_PATH_SUFFIX: &str = "/jwks";

/// Algorithms accepted when an issuer does not list its own. Asymmetric only.
pub const DEFAULT_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Check a configured URL against the HTTPS policy.
pub(crate) fn validate_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "https" => {}
        "http" => {
            // Exact match only; `localhost.attacker.com` must not pass
            let host = url.host_str().unwrap_or("");
            if host != "localhost" && host != "127.0.0.1" {
                return Err(ConfigError::InsecureUrl {
                    field,
                    value: value.to_string(),
                });
            }
        }
        other => {
            return Err(ConfigError::InvalidUrl {
                field,
                value: value.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            });
        }
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Opaque-token trust: validate by calling an RFC 7662 introspection endpoint.
#[derive(Clone)]
pub struct OpaqueConfig {
    pub introspection_url: Url,
    pub client_id: String,
    pub client_secret: String,
    /// Verify the endpoint's TLS certificate (default `true`)
    pub verify_tls: bool,
}

impl OpaqueConfig {
    pub fn new(
        introspection_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            introspection_url: validate_url("introspection_url", introspection_url)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            verify_tls: true,
        })
    }

    /// Turn certificate verification on or off.
    ///
    /// Only meant for development against self-signed servers.
    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }
}

impl fmt::Debug for OpaqueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueConfig")
            .field("introspection_url", &self.introspection_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// One trusted JWT issuer.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuerTrust {
    /// Exact `iss` value tokens from this issuer carry
    pub issuer: String,
    pub jwks_url: Url,
    /// Value that must appear in the token's `aud`
    pub audience: String,
    /// When set, granted scopes outside this set are dropped
    pub allowed_scopes: Option<BTreeSet<String>>,
    /// Header `alg` values accepted for this issuer
    pub algorithms: Vec<Algorithm>,
}

impl IssuerTrust {
    pub fn new(
        issuer: impl Into<String>,
        jwks_url: &str,
        audience: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            issuer: issuer.into(),
            jwks_url: validate_url("jwks_url", jwks_url)?,
            audience: audience.into(),
            allowed_scopes: None,
            algorithms: DEFAULT_ALGORITHMS.to_vec(),
        })
    }

    /// Trust an issuer whose key set lives at `<issuer>/jwks`.
    pub fn from_issuer_url(
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let issuer = issuer.into();
        validate_url("issuer", &issuer)?;
        let jwks_url = format!("{}{}", issuer.trim_end_matches('/'), JWKS_PATH_SUFFIX);
        Self::new(issuer, &jwks_url, audience)
    }

    /// Restrict the scopes this issuer may grant. An empty list means no
    /// restriction.
    pub fn allowed_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = scopes
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        self.allowed_scopes = if set.is_empty() { None } else { Some(set) };
        self
    }

    pub fn algorithms(mut self, algorithms: impl Into<Vec<Algorithm>>) -> Self {
        self.algorithms = algorithms.into();
        self
    }
}

/// JWT trust: local signature and claim checks against one or more issuers.
#[derive(Debug, Clone, PartialEq)]
pub struct JwtConfig {
    /// Ordered, never empty
    pub issuers: Vec<IssuerTrust>,
    /// Verify the JWKS endpoints' TLS certificates (default `true`)
    pub verify_tls: bool,
}

impl JwtConfig {
    pub fn new(issuers: Vec<IssuerTrust>) -> Result<Self, ConfigError> {
        if issuers.is_empty() {
            return Err(ConfigError::EmptyIssuerList);
        }
        Ok(Self {
            issuers,
            verify_tls: true,
        })
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Trust entry whose `issuer` equals `iss` exactly.
    pub fn find_issuer(&self, iss: &str) -> Option<&IssuerTrust> {
        self.issuers.iter().find(|t| t.issuer == iss)
    }
}

/// The trust model a filter enforces.
#[derive(Debug, Clone)]
pub enum TrustConfig {
    Opaque(OpaqueConfig),
    Jwt(JwtConfig),
}

impl TrustConfig {
    /// Opaque tokens checked against an introspection endpoint.
    pub fn opaque(
        introspection_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(TrustConfig::Opaque(OpaqueConfig::new(
            introspection_url,
            client_id,
            client_secret,
        )?))
    }

    /// JWTs from a single issuer with an explicit JWKS URL.
    pub fn jwt<I, S>(
        jwks_url: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        scopes: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let trust = IssuerTrust::new(issuer, jwks_url, audience)?.allowed_scopes(scopes);
        Ok(TrustConfig::Jwt(JwtConfig::new(vec![trust])?))
    }

    /// JWTs from several issuers, each publishing keys at `<issuer>/jwks`.
    pub fn jwt_issuers<I, S, A, T>(
        issuers: I,
        audience: A,
        scopes: T,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        A: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let audience = audience.into();
        let scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
        let trusts = issuers
            .into_iter()
            .map(|iss| {
                IssuerTrust::from_issuer_url(iss, audience.clone())
                    .map(|t| t.allowed_scopes(scopes.iter().cloned()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TrustConfig::Jwt(JwtConfig::new(trusts)?))
    }

    /// Short name for logs.
    pub fn mode(&self) -> &'static str {
        match self {
            TrustConfig::Opaque(_) => "opaque",
            TrustConfig::Jwt(_) => "jwt",
        }
    }

    /// Parse a TOML trust configuration.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: TrustFile = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        match (file.opaque, file.jwt) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousMode),
            (None, None) => Err(ConfigError::MissingMode),
            (Some(o), None) => Ok(TrustConfig::Opaque(
                OpaqueConfig::new(&o.introspection_url, o.client_id, o.client_secret)?
                    .verify_tls(o.verify_tls),
            )),
            (None, Some(j)) => j.into_config().map(TrustConfig::Jwt),
        }
    }

    /// Read and parse a TOML trust configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrustFile {
    opaque: Option<OpaqueSection>,
    jwt: Option<JwtSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OpaqueSection {
    introspection_url: String,
    client_id: String,
    client_secret: String,
    #[serde(default = "default_true")]
    verify_tls: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JwtSection {
    #[serde(default = "default_true")]
    verify_tls: bool,
    /// Default audience for entries that do not set their own
    audience: Option<String>,
    /// Default scope allow-list for entries that do not set their own
    #[serde(default)]
    scopes: Vec<String>,
    /// Issuer URLs whose keys live at `<issuer>/jwks`
    #[serde(default)]
    issuers: Vec<String>,
    #[serde(default, rename = "issuer")]
    issuer_tables: Vec<IssuerSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssuerSection {
    issuer: String,
    jwks_url: Option<String>,
    audience: Option<String>,
    allowed_scopes: Option<Vec<String>>,
    algorithms: Option<Vec<Algorithm>>,
}

impl JwtSection {
    fn audience_for(&self, own: Option<String>) -> Result<String, ConfigError> {
        own.or_else(|| self.audience.clone()).ok_or_else(|| {
            ConfigError::Parse("jwt issuer has no audience (set jwt.audience)".to_string())
        })
    }

    fn into_config(self) -> Result<JwtConfig, ConfigError> {
        let mut trusts = Vec::with_capacity(self.issuers.len() + self.issuer_tables.len());

        for iss in &self.issuers {
            let audience = self.audience_for(None)?;
            trusts.push(
                IssuerTrust::from_issuer_url(iss.as_str(), audience)?
                    .allowed_scopes(self.scopes.iter().cloned()),
            );
        }

        for table in &self.issuer_tables {
            let audience = self.audience_for(table.audience.clone())?;
            let trust = match &table.jwks_url {
                Some(url) => IssuerTrust::new(table.issuer.as_str(), url, audience)?,
                None => IssuerTrust::from_issuer_url(table.issuer.as_str(), audience)?,
            };
            let scopes = table.allowed_scopes.as_ref().unwrap_or(&self.scopes);
            let mut trust = trust.allowed_scopes(scopes.iter().cloned());
            if let Some(algs) = &table.algorithms {
                trust = trust.algorithms(algs.clone());
            }
            trusts.push(trust);
        }

        Ok(JwtConfig::new(trusts)?.verify_tls(self.verify_tls))
    }
}

/// Transport, cache and clock settings shared by both trust models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    /// Timeout for every outbound call (introspection, JWKS)
    pub http_timeout: Duration,
    /// Retry a failed outbound call once
    pub retry_once: bool,
    /// Pause before the retry
    pub retry_backoff: Duration,
    /// Upper bound on how long an introspection result is reused
    pub introspection_max_ttl: Duration,
    /// TTL for introspection results without `exp`
    pub introspection_default_ttl: Duration,
    /// Upper bound on how long a JWKS key is reused
    pub jwks_ttl: Duration,
    /// Maximum entries per cache
    pub cache_capacity: usize,
    /// Clock skew tolerance for `exp`/`nbf`, in seconds
    pub leeway_secs: u64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_millis(5000),
            retry_once: false,
            retry_backoff: Duration::from_millis(100),
            introspection_max_ttl: Duration::from_secs(300),
            introspection_default_ttl: Duration::from_secs(60),
            jwks_ttl: Duration::from_secs(3600),
            cache_capacity: 10_000,
            leeway_secs: 0,
        }
    }
}

impl FilterSettings {
    /// Load settings from `OAUTH_FILTER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| -> bool {
            match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
                Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
                Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
                _ => default,
            }
        };

        Self {
            http_timeout: Duration::from_millis(num(
                "OAUTH_FILTER_HTTP_TIMEOUT_MS",
                d.http_timeout.as_millis() as u64,
            )),
            retry_once: flag("OAUTH_FILTER_RETRY_ONCE", d.retry_once),
            retry_backoff: Duration::from_millis(num(
                "OAUTH_FILTER_RETRY_BACKOFF_MS",
                d.retry_backoff.as_millis() as u64,
            )),
            introspection_max_ttl: Duration::from_secs(num(
                "OAUTH_FILTER_INTROSPECTION_MAX_TTL_SECS",
                d.introspection_max_ttl.as_secs(),
            )),
            introspection_default_ttl: Duration::from_secs(num(
                "OAUTH_FILTER_INTROSPECTION_DEFAULT_TTL_SECS",
                d.introspection_default_ttl.as_secs(),
            )),
            jwks_ttl: Duration::from_secs(num(
                "OAUTH_FILTER_JWKS_TTL_SECS",
                d.jwks_ttl.as_secs(),
            )),
            cache_capacity: num("OAUTH_FILTER_CACHE_CAPACITY", d.cache_capacity as u64) as usize,
            leeway_secs: num("OAUTH_FILTER_LEEWAY_SECS", d.leeway_secs),
        }
    }
}
