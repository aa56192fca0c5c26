//! Bearer token and validation outcome types.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the hex fingerprint prefix shown in logs and `Debug` output.
const FINGERPRINT_HEX_LEN: usize = 12;

/// Raw bearer credential presented by a client.
///
/// The token value is a secret. `Debug` and `Display` only ever render a
/// SHA-256 fingerprint (`sha256:<12 hex>`), so a `BearerToken` can be put in a
/// log field without leaking it. The raw value is only reachable through
/// [`BearerToken::as_str`].
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wrap a raw token value.
    ///
    /// No format validation happens here; use [`crate::extract_bearer`] to
    /// obtain a token from an `Authorization` header.
    pub fn new(raw: impl Into<String>) -> Self {
        BearerToken(raw.into())
    }

    /// The raw token, for sending to an introspection endpoint or decoding.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 digest of the raw token, used as the opaque-result cache key.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(result.as_slice());
        out
    }

    /// Short, non-reversible identifier safe for logs.
    pub fn fingerprint(&self) -> String {
        let hex: String = self
            .digest()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        format!("sha256:{}", &hex[..FINGERPRINT_HEX_LEN])
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BearerToken")
            .field(&self.fingerprint())
            .finish()
    }
}

impl fmt::Display for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// Outcome of a successful token validation, from either trust model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Authenticated principal (`sub`, or an introspection fallback)
    pub subject: String,
    /// Scopes granted to the token
    pub scopes: BTreeSet<String>,
    /// Expiry as seconds since the Unix epoch
    pub expires_at: i64,
    /// Issuer that vouched for the token; `None` for opaque introspection
    pub issuer: Option<String>,
}

impl ValidationResult {
    /// Scopes joined with single spaces, in sorted order.
    pub fn scope_string(&self) -> String {
        self.scopes
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split an OAuth2 `scope` value on whitespace into a set.
pub(crate) fn parse_scope_string(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
