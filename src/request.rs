//! Request view handed to the filter, and the two outcomes it produces.

use crate::error::{FailureKind, FilterError};
use crate::token::ValidationResult;
use http::{HeaderMap, Method};
use std::collections::BTreeSet;

/// Header carrying the FAPI interaction id, echoed back by protected services.
pub const INTERACTION_ID_HEADER: &str = "x-fapi-interaction-id";

/// What the filter needs to see of an incoming request.
#[derive(Debug, Clone, Copy)]
pub struct FilterRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
}

impl<'a> FilterRequest<'a> {
    pub fn new(method: &'a Method, headers: &'a HeaderMap) -> Self {
        Self { method, headers }
    }

    /// Borrow method and headers from an `http::Request`.
    pub fn from_request<B>(req: &'a http::Request<B>) -> Self {
        Self {
            method: req.method(),
            headers: req.headers(),
        }
    }

    /// Get a header by name (case-insensitive). Non-ASCII values read as absent.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Identity attached to a request that passed the filter.
///
/// Only ever built from a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated subject
    pub user: String,
    /// Granted scopes, space-joined
    pub scope: String,
    pub scopes: BTreeSet<String>,
    /// Vouching issuer (JWT mode only)
    pub issuer: Option<String>,
    /// Token expiry, seconds since the Unix epoch
    pub expires_at: i64,
    /// `x-fapi-interaction-id` from the request, passed through untouched
    pub interaction_id: Option<String>,
    /// `Origin` from the request, passed through untouched
    pub origin: Option<String>,
}

impl RequestContext {
    pub(crate) fn new(result: ValidationResult, req: &FilterRequest<'_>) -> Self {
        Self {
            scope: result.scope_string(),
            user: result.subject,
            scopes: result.scopes,
            issuer: result.issuer,
            expires_at: result.expires_at,
            interaction_id: req.header(INTERACTION_ID_HEADER).map(str::to_string),
            origin: req.header(http::header::ORIGIN.as_str()).map(str::to_string),
        }
    }
}

/// Refusal to run a protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub kind: FailureKind,
    /// HTTP status to answer with (401, 403 or 500)
    pub status: u16,
    /// Client-safe description
    pub message: String,
    /// RFC 6750 challenge for the `WWW-Authenticate` response header; `None`
    /// for server-side failures
    pub www_authenticate: Option<String>,
}

impl Denial {
    pub fn from_error(err: &FilterError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        let www_authenticate = match kind {
            FailureKind::FilterNotConfigured => None,
            _ => Some(bearer_challenge(err, &message)),
        };
        Self {
            kind,
            status: kind.status(),
            message,
            www_authenticate,
        }
    }
}

impl From<FilterError> for Denial {
    fn from(err: FilterError) -> Self {
        Denial::from_error(&err)
    }
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `Bearer` challenge per RFC 6750 §3. A request without credentials gets
/// the bare scheme.
fn bearer_challenge(err: &FilterError, message: &str) -> String {
    let Some(code) = err.kind().bearer_error_code() else {
        return "Bearer".to_string();
    };
    let mut challenge = format!(
        "Bearer error=\"{}\", error_description=\"{}\"",
        code,
        quote(message)
    );
    if let FilterError::InsufficientScope { missing } = err {
        challenge.push_str(&format!(", scope=\"{}\"", quote(&missing.join(" "))));
    }
    challenge
}
