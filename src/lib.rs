//! # oauth-filter
//!
//! OAuth2 bearer-token enforcement for protected request handlers.
//!
//! ## Overview
//!
//! An [`OAuthFilter`] sits in front of an operation. For every request it
//! extracts the `Authorization: Bearer` token, validates it under one of two
//! trust models, checks the operation's required scopes, and only then runs
//! the operation with a [`RequestContext`] describing the caller. Anything else
//! yields a [`Denial`] carrying the HTTP status and an RFC 6750
//! `WWW-Authenticate` challenge.
//!
//! Trust models:
//!
//! - **Opaque tokens**: POSTed to an RFC 7662 introspection endpoint with HTTP
//!   Basic client credentials; results are cached until the token's `exp`
//!   (bounded by a maximum TTL).
//! - **JWTs**: verified locally against the issuer's JWKS. Several issuers can
//!   be trusted at once; the token's `iss` selects which. Signing keys are
//!   cached and re-fetched when an unknown `kid` shows up.
//!
//! The filter is framework-agnostic: it consumes an `http` method and header
//! map ([`FilterRequest`]) and returns a decision.
//!
//! ## Architecture
//!
//! - **[`extract`]** - Bearer token extraction
//! - **[`config`]** - Trust configuration and runtime settings
//! - **[`filter`]** - The orchestrator and guarded operations
//! - **[`scope`]** - Required-scope enforcement
//! - **[`cache`]** - TTL/LRU cache with fetch coalescing
//! - **[`error`]** - Failure taxonomy
//! - **[`logging`]** - Optional `tracing` subscriber setup
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Op as Protected operation
//!     participant Filter as OAuthFilter
//!     participant Cache as TtlCache
//!     participant IdP as Introspection / JWKS
//!
//!     Client->>Op: GET /hello_world<br/>Authorization: Bearer ...
//!     Op->>Filter: authorize(request, required scopes)
//!     Filter->>Filter: extract_bearer()
//!     Filter->>Cache: lookup (generation, token hash / kid)
//!     alt cache miss
//!         Cache->>IdP: one fetch per key
//!         IdP-->>Cache: result / key set
//!     end
//!     Cache-->>Filter: ValidationResult / signing key
//!     Filter->>Filter: verify claims, enforce scopes
//!     alt authorized
//!         Filter-->>Op: RequestContext
//!         Op-->>Client: 200
//!     else denied
//!         Filter-->>Op: Denial
//!         Op-->>Client: 401 / 403 / 500 + WWW-Authenticate
//!     end
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use oauth_filter::OAuthFilter;
//! use std::sync::Arc;
//!
//! let filter = Arc::new(OAuthFilter::from_env());
//! filter
//!     .configure_jwt_issuers(
//!         ["https://idsvr.example.com/oauth/v2/oauth-anonymous"],
//!         "back-end-api",
//!         ["openid"],
//!     )
//!     .expect("valid trust configuration");
//! filter.ensure_configured().expect("filter configured");
//!
//! let hello = filter.protect(["read"], |_req, ctx| format!("hello {}", ctx.user));
//! # let _ = hello;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod filter;
mod introspection;
mod jwt;
pub mod logging;
mod request;
pub mod scope;
mod token;
mod transport;

pub use cache::{CacheStats, TtlCache};
pub use config::{
    FilterSettings, IssuerTrust, JwtConfig, OpaqueConfig, TrustConfig, DEFAULT_ALGORITHMS,
    JWKS_PATH_SUFFIX,
};
pub use error::{ConfigError, FailureKind, FilterError};
pub use extract::{extract_bearer, extract_from_headers};
pub use filter::{OAuthFilter, Protected};
pub use request::{Denial, FilterRequest, RequestContext, INTERACTION_ID_HEADER};
pub use scope::RequiredScopes;
pub use token::{BearerToken, ValidationResult};

/// Re-exported so callers can name algorithms in [`IssuerTrust::algorithms`].
pub use jsonwebtoken::Algorithm;
