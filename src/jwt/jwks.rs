//! JWKS download and parsing.

use crate::error::FilterError;
use crate::transport::{cache_control_max_age, HttpTransport};
use jsonwebtoken::jwk::{Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// A verification key from an issuer's key set.
#[derive(Clone)]
pub(crate) struct SigningKey {
    pub(crate) key: DecodingKey,
    /// The JWK's `alg`, when it declares one
    pub(crate) alg: Option<Algorithm>,
}

impl SigningKey {
    /// A key that declares an `alg` may only verify that algorithm.
    pub(crate) fn permits(&self, alg: Algorithm) -> bool {
        self.alg.is_none_or(|a| a == alg)
    }
}

/// Result of one JWKS download.
pub(crate) struct KeySet {
    /// Usable keys with their `kid`, in document order
    pub(crate) keys: Vec<(Option<String>, SigningKey)>,
    /// How long the keys may be reused
    pub(crate) ttl: Duration,
}

impl KeySet {
    /// The key a token without `kid` may use: only when the set has exactly one.
    pub(crate) fn sole_key(&self) -> Option<&SigningKey> {
        match self.keys.as_slice() {
            [(_, key)] => Some(key),
            _ => None,
        }
    }

    pub(crate) fn find(&self, kid: &str) -> Option<&SigningKey> {
        self.keys
            .iter()
            .find(|(k, _)| k.as_deref() == Some(kid))
            .map(|(_, key)| key)
    }
}

#[derive(Deserialize)]
struct RawJwkSet {
    keys: Vec<serde_json::Value>,
}

/// Parse a JWKS document, keeping only keys usable for signature checks.
///
/// Entries are parsed one by one so an unsupported key type does not hide the
/// rest of the set. Keys marked `"use": "enc"`, keys whose `alg` is not a
/// signature algorithm, and keys that cannot be turned into a `DecodingKey`
/// are skipped.
pub(crate) fn parse_key_set(body: &[u8]) -> Result<Vec<(Option<String>, SigningKey)>, String> {
    let raw: RawJwkSet =
        serde_json::from_slice(body).map_err(|e| format!("invalid JWKS document: {}", e))?;

    let mut keys = Vec::with_capacity(raw.keys.len());
    for value in raw.keys {
        let jwk: Jwk = match serde_json::from_value(value) {
            Ok(jwk) => jwk,
            Err(e) => {
                debug!(error = %e, "skipping unsupported JWK");
                continue;
            }
        };
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            continue;
        }
        let alg = match jwk.common.key_algorithm {
            Some(ka) => match signature_algorithm(ka) {
                Some(alg) => Some(alg),
                None => continue,
            },
            None => None,
        };
        let key = match DecodingKey::from_jwk(&jwk) {
            Ok(key) => key,
            Err(e) => {
                debug!(kid = ?jwk.common.key_id, error = %e, "skipping unusable JWK");
                continue;
            }
        };
        keys.push((jwk.common.key_id.clone(), SigningKey { key, alg }));
    }
    Ok(keys)
}

/// Signature algorithm named by a JWK `alg`; `None` for encryption algorithms.
fn signature_algorithm(ka: KeyAlgorithm) -> Option<Algorithm> {
    match ka {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        // RSA1_5, RSA-OAEP and unrecognized values
        _ => None,
    }
}

/// Download and parse the key set for `issuer`.
///
/// The TTL is the response's `Cache-Control: max-age` when present, capped by
/// `max_ttl`. Any failure is reported as [`FilterError::JwksUnavailable`].
pub(crate) fn fetch_key_set(
    transport: &HttpTransport,
    issuer: &str,
    url: &Url,
    max_ttl: Duration,
) -> Result<KeySet, FilterError> {
    let unavailable = |reason: String| FilterError::JwksUnavailable {
        issuer: issuer.to_string(),
        reason,
    };

    let start = Instant::now();
    let resp = transport
        .send("jwks", |client| {
            client
                .get(url.clone())
                .header(http::header::ACCEPT, "application/json")
        })
        .map_err(|e| unavailable(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(unavailable(format!("JWKS endpoint returned {}", status)));
    }
    let ttl = cache_control_max_age(resp.headers())
        .map(|age| age.min(max_ttl))
        .unwrap_or(max_ttl);
    let body = resp.bytes().map_err(|e| unavailable(e.to_string()))?;
    let keys = parse_key_set(&body).map_err(unavailable)?;

    debug!(
        issuer,
        keys = keys.len(),
        ttl_secs = ttl.as_secs(),
        elapsed = ?start.elapsed(),
        "JWKS refresh completed"
    );
    Ok(KeySet { keys, ttl })
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: &str = "vSAmJrqw0KEUTZERONOJEonYDD329Obc0iNbcwpu1yb34auap9GDByK6mcbgqsbXAGRPIIW2luJ-_QDMjQdkMSOw5NT6ZhGrIJjFSk7S3wEzIaNcGGk6zoF3KwMjNqCfIouB7x6UrngwdZTrB01V3ZewE4N1w3lFPVoJAZHDcDQzY92FLe020ayHnNRJXDauHeLHExB0XvUXWQXNPxWY4ykAcGnVYA7bdT53awbJpmMvwwjLMwpvq6qCAJ0l4EF9cNi63JbNJqbKSYIIWnfOHzNW_en2eJX_Knnm8ksC1x5hxXmlg5DbrnJLo76DRM-hmKHyG9S7kfRkGhyXyEJ6NQ";

    fn rsa_jwk(kid: &str, extra: &str) -> String {
        format!(
            r#"{{"kty":"RSA","kid":"{}","n":"{}","e":"AQAB"{}}}"#,
            kid, N, extra
        )
    }

    #[test]
    fn test_parses_rsa_keys() {
        let body = format!(
            r#"{{"keys":[{},{}]}}"#,
            rsa_jwk("k1", r#","alg":"RS256","use":"sig""#),
            rsa_jwk("k2", "")
        );
        let keys = parse_key_set(body.as_bytes()).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].0.as_deref(), Some("k1"));
        assert_eq!(keys[0].1.alg, Some(Algorithm::RS256));
        assert!(keys[0].1.permits(Algorithm::RS256));
        assert!(!keys[0].1.permits(Algorithm::PS256));
        assert!(keys[1].1.permits(Algorithm::PS256));
    }

    #[test]
    fn test_skips_encryption_and_unknown_keys() {
        let body = format!(
            r#"{{"keys":[{},{},{{"kty":"weird","kid":"x"}},{}]}}"#,
            rsa_jwk("enc", r#","use":"enc""#),
            rsa_jwk("oaep", r#","alg":"RSA-OAEP""#),
            rsa_jwk("ok", "")
        );
        let keys = parse_key_set(body.as_bytes()).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0.as_deref(), Some("ok"));
    }

    #[test]
    fn test_signature_algorithm_names() {
        assert_eq!(signature_algorithm(KeyAlgorithm::RS256), Some(Algorithm::RS256));
        assert_eq!(signature_algorithm(KeyAlgorithm::PS512), Some(Algorithm::PS512));
        assert_eq!(signature_algorithm(KeyAlgorithm::ES384), Some(Algorithm::ES384));
        assert_eq!(signature_algorithm(KeyAlgorithm::EdDSA), Some(Algorithm::EdDSA));
        assert_eq!(signature_algorithm(KeyAlgorithm::RSA_OAEP_256), None);
        assert_eq!(signature_algorithm(KeyAlgorithm::UNKNOWN_ALGORITHM), None);

        let body = format!(r#"{{"keys":[{}]}}"#, rsa_jwk("ps", r#","alg":"PS384""#));
        let keys = parse_key_set(body.as_bytes()).unwrap();
        assert_eq!(keys[0].1.alg, Some(Algorithm::PS384));
    }

    #[test]
    fn test_sole_key() {
        let one = format!(r#"{{"keys":[{}]}}"#, rsa_jwk("only", ""));
        let set = KeySet {
            keys: parse_key_set(one.as_bytes()).unwrap(),
            ttl: Duration::from_secs(1),
        };
        assert!(set.sole_key().is_some());
        assert!(set.find("only").is_some());
        assert!(set.find("other").is_none());

        let two = format!(
            r#"{{"keys":[{},{}]}}"#,
            rsa_jwk("a", ""),
            rsa_jwk("b", "")
        );
        let set = KeySet {
            keys: parse_key_set(two.as_bytes()).unwrap(),
            ttl: Duration::from_secs(1),
        };
        assert!(set.sole_key().is_none());
    }

    #[test]
    fn test_invalid_document() {
        assert!(parse_key_set(b"not json").is_err());
        assert!(parse_key_set(br#"{"nokeys":[]}"#).is_err());
        assert!(parse_key_set(br#"{"keys":[]}"#).unwrap().is_empty());
    }
}
