//! JWT validation against one or more trusted issuers.
//!
//! # Validation Flow
//!
//! 1. Split the compact token and read the header (`alg`, `kid`) and the
//!    *unverified* payload, only to learn which issuer to ask for keys
//! 2. Look up the issuer by exact `iss` match; reject unknown issuers before
//!    any network I/O
//! 3. Reject header algorithms the issuer does not allow (this covers `none`)
//! 4. Resolve the signing key by `kid` from the key cache, downloading the
//!    issuer's JWKS on a miss
//! 5. Verify the signature with `jsonwebtoken`, for the declared algorithm only
//! 6. Check the verified registered claims (`exp`, `nbf`, `aud`, `iss`, `sub`)
//!    with the configured leeway
//! 7. Collect scopes from `scope` or `scp`, filtered by the issuer's allow-list
//!
//! Only signing keys are cached. Claims are checked on every request.

pub(crate) mod jwks;

use crate::cache::{InFlight, TtlCache};
use crate::config::{FilterSettings, IssuerTrust, JwtConfig};
use crate::error::{ConfigError, FilterError};
use crate::token::{parse_scope_string, unix_now, BearerToken, ValidationResult};
use crate::transport::HttpTransport;
use base64::Engine as _;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use jwks::SigningKey;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Signing-key cache key: configuration generation, issuer, `kid`.
///
/// `kid = None` holds the issuer's only key when its set has exactly one,
/// for tokens that carry no `kid`.
pub(crate) type KeyCacheKey = (u64, String, Option<String>);

#[derive(Deserialize)]
struct UnverifiedHeader {
    alg: String,
    kid: Option<String>,
}

/// Header and payload of a token whose signature has not been checked yet.
struct UnverifiedJwt {
    header: UnverifiedHeader,
    claims: Value,
}

fn malformed(reason: &'static str) -> FilterError {
    FilterError::MalformedCredential { reason }
}

impl UnverifiedJwt {
    fn parse(token: &str) -> Result<Self, FilterError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(_sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("token is not a compact JWT"));
        };

        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine
            .decode(header)
            .map_err(|_| malformed("JWT header is not base64url"))?;
        let header: UnverifiedHeader = serde_json::from_slice(&header)
            .map_err(|_| malformed("JWT header is not valid JSON"))?;
        let payload = engine
            .decode(payload)
            .map_err(|_| malformed("JWT payload is not base64url"))?;
        let claims: Value = serde_json::from_slice(&payload)
            .map_err(|_| malformed("JWT payload is not valid JSON"))?;
        if !claims.is_object() {
            return Err(malformed("JWT payload is not a JSON object"));
        }
        Ok(Self { header, claims })
    }
}

pub(crate) struct JwtValidator {
    config: JwtConfig,
    transport: HttpTransport,
    jwks_ttl: Duration,
    leeway: i64,
    // One JWKS download per (generation, issuer) at a time
    fetching: InFlight<(u64, String)>,
}

impl JwtValidator {
    pub(crate) fn new(config: JwtConfig, settings: &FilterSettings) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(settings, config.verify_tls)?;
        Ok(Self {
            config,
            transport,
            jwks_ttl: settings.jwks_ttl,
            leeway: i64::try_from(settings.leeway_secs).unwrap_or(i64::MAX),
            fetching: InFlight::new(),
        })
    }

    pub(crate) fn validate(
        &self,
        token: &BearerToken,
        generation: u64,
        keys: &TtlCache<KeyCacheKey, SigningKey>,
    ) -> Result<ValidationResult, FilterError> {
        let unverified = UnverifiedJwt::parse(token.as_str())?;

        let iss = unverified.claims.get("iss").and_then(Value::as_str);
        let trust = match iss.and_then(|iss| self.config.find_issuer(iss)) {
            Some(trust) => trust,
            None => {
                return Err(FilterError::UnknownIssuer {
                    issuer: iss.map(str::to_string),
                })
            }
        };

        let alg = Algorithm::from_str(&unverified.header.alg)
            .ok()
            .filter(|alg| trust.algorithms.contains(alg))
            .ok_or_else(|| FilterError::DisallowedAlgorithm {
                alg: unverified.header.alg.clone(),
            })?;

        let kid = unverified.header.kid.as_deref();
        let key = self.resolve_key(trust, kid, alg, generation, keys)?;

        let claims = verify_signature(token.as_str(), &key, alg)?;
        let now = unix_now();
        let (subject, expires_at) = check_claims(&claims, trust, now, self.leeway)?;

        debug!(token = %token, issuer = %trust.issuer, sub = %subject, "JWT validated");
        Ok(ValidationResult {
            subject,
            scopes: granted_scopes(&claims, trust),
            expires_at,
            issuer: Some(trust.issuer.clone()),
        })
    }

    fn resolve_key(
        &self,
        trust: &IssuerTrust,
        kid: Option<&str>,
        alg: Algorithm,
        generation: u64,
        keys: &TtlCache<KeyCacheKey, SigningKey>,
    ) -> Result<SigningKey, FilterError> {
        let cache_key: KeyCacheKey = (generation, trust.issuer.clone(), kid.map(str::to_string));
        let not_found = || FilterError::KeyNotFound {
            issuer: trust.issuer.clone(),
            kid: kid.map(str::to_string),
        };

        if let Some(key) = keys.get(&cache_key) {
            return Some(key).filter(|k| k.permits(alg)).ok_or_else(not_found);
        }

        // Unknown kid: the issuer may have rotated keys, so fetch the set again
        self.fetching.run(&(generation, trust.issuer.clone()), || -> Result<SigningKey, FilterError> {
            if let Some(key) = keys.recheck(&cache_key) {
                return Some(key).filter(|k| k.permits(alg)).ok_or_else(not_found);
            }

            let set = jwks::fetch_key_set(
                &self.transport,
                &trust.issuer,
                &trust.jwks_url,
                self.jwks_ttl,
            )?;
            for (k, key) in &set.keys {
                let Some(k) = k else { continue };
                keys.put(
                    (generation, trust.issuer.clone(), Some(k.clone())),
                    key.clone(),
                    set.ttl,
                );
            }
            if let Some(only) = set.sole_key() {
                keys.put((generation, trust.issuer.clone(), None), only.clone(), set.ttl);
            }

            let found = match kid {
                Some(kid) => set.find(kid),
                None => set.sole_key(),
            };
            found
                .filter(|k| k.permits(alg))
                .cloned()
                .ok_or_else(not_found)
        })
    }
}

/// Check the signature and return the payload. Registered claims are
/// checked separately so each failure can name its claim.
fn verify_signature(token: &str, key: &SigningKey, alg: Algorithm) -> Result<Value, FilterError> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<Value>(token, &key.key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => match e.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                Err(malformed("JWT could not be decoded"))
            }
            _ => {
                debug!(error = %e, "JWT signature check failed");
                Err(FilterError::InvalidSignature)
            }
        },
    }
}

fn claim_failed(claim: &'static str, reason: impl Into<String>) -> FilterError {
    FilterError::ClaimValidationFailed {
        claim,
        reason: reason.into(),
    }
}

/// Numeric date claim, tolerating fractional seconds.
fn numeric_claim(claims: &Value, name: &'static str) -> Result<Option<i64>, FilterError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| claim_failed(name, "not a numeric date")),
    }
}

/// Validate registered claims; returns the subject and expiry.
fn check_claims(
    claims: &Value,
    trust: &IssuerTrust,
    now: i64,
    leeway: i64,
) -> Result<(String, i64), FilterError> {
    let exp = numeric_claim(claims, "exp")?.ok_or_else(|| claim_failed("exp", "missing"))?;
    if exp.saturating_add(leeway) <= now {
        return Err(claim_failed("exp", format!("expired at {}, now {}", exp, now)));
    }

    if let Some(nbf) = numeric_claim(claims, "nbf")? {
        if nbf > now.saturating_add(leeway) {
            return Err(claim_failed("nbf", format!("not valid before {}, now {}", nbf, now)));
        }
    }

    let aud_ok = match claims.get("aud") {
        Some(Value::String(aud)) => *aud == trust.audience,
        Some(Value::Array(auds)) => auds
            .iter()
            .any(|a| a.as_str() == Some(trust.audience.as_str())),
        _ => false,
    };
    if !aud_ok {
        return Err(claim_failed("aud", format!("expected {}", trust.audience)));
    }

    if claims.get("iss").and_then(Value::as_str) != Some(trust.issuer.as_str()) {
        return Err(claim_failed("iss", format!("expected {}", trust.issuer)));
    }

    let sub = match claims.get("sub").and_then(Value::as_str) {
        Some(sub) if !sub.is_empty() => sub.to_string(),
        _ => return Err(claim_failed("sub", "missing")),
    };

    Ok((sub, exp))
}

fn scope_values(v: &Value) -> Option<BTreeSet<String>> {
    match v {
        Value::String(s) => Some(parse_scope_string(s)),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// Scopes from `scope`, else `scp`, intersected with the issuer's allow-list.
fn granted_scopes(claims: &Value, trust: &IssuerTrust) -> BTreeSet<String> {
    let scopes = claims
        .get("scope")
        .and_then(scope_values)
        .or_else(|| claims.get("scp").and_then(scope_values))
        .unwrap_or_default();
    match &trust.allowed_scopes {
        Some(allowed) => scopes.into_iter().filter(|s| allowed.contains(s)).collect(),
        None => scopes,
    }
}
