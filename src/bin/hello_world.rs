//! Sample protected service.
//!
//! `GET /` answers `up`; `GET|HEAD /hello_world` requires a valid bearer token
//! and echoes the caller's identity; `OPTIONS /hello_world` answers CORS
//! preflights.
//!
//! ```bash
//! hello_world --introspection-url https://localhost:8443/introspection \
//!     --client-id test_gateway_client --client-secret secret --insecure
//! hello_world --config trust.toml
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use oauth_filter::logging::{init_logging_with_config, LogConfig};
use oauth_filter::{
    Denial, FilterRequest, OAuthFilter, OpaqueConfig, Protected, RequestContext, TrustConfig,
    INTERACTION_ID_HEADER,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

const DEFAULT_INTERACTION_ID: &str = "E990656F-2C08-4B98-8FDD-BE7D7D9625FD";
const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

/// OAuth2-protected hello world service
#[derive(Parser, Debug)]
#[command(name = "hello_world", version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HELLO_WORLD_ADDR", default_value = "0.0.0.0:5555")]
    addr: String,

    /// TOML trust configuration ([opaque] or [jwt])
    #[arg(long, env = "OAUTH_FILTER_CONFIG", conflicts_with = "introspection_url")]
    config: Option<PathBuf>,

    /// Introspection endpoint for opaque tokens
    #[arg(long, env = "OAUTH_FILTER_INTROSPECTION_URL", requires_all = ["client_id", "client_secret"])]
    introspection_url: Option<String>,

    #[arg(long, env = "OAUTH_FILTER_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "OAUTH_FILTER_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Skip TLS certificate verification for the introspection endpoint
    #[arg(long, default_value_t = false)]
    insecure: bool,

    /// Request worker threads
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Reply {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn cors(self, req: &FilterRequest<'_>) -> Self {
        match req.header("origin") {
            Some(origin) => self
                .header("Access-Control-Allow-Origin", origin)
                .header("Access-Control-Allow-Credentials", "true"),
            None => self,
        }
    }
}

fn hello_world(req: &FilterRequest<'_>, ctx: RequestContext) -> Reply {
    let body = serde_json::json!({ "hello": ctx.user, "scope": ctx.scope }).to_string();
    let interaction_id = ctx
        .interaction_id
        .unwrap_or_else(|| DEFAULT_INTERACTION_ID.to_string());
    Reply::new(200, body)
        .header("Content-Type", "application/json")
        .cors(req)
        .header(INTERACTION_ID_HEADER, interaction_id)
}

fn hello_world_options(req: &FilterRequest<'_>) -> Reply {
    let mut reply = Reply::new(200, "");
    if req.header("origin").is_some() {
        reply = reply
            .cors(req)
            .header("Access-Control-Allow-Methods", ALLOWED_METHODS)
            .header("Access-Control-Allow-Headers", "Authorization, WWW-Authenticate");
    }
    reply.header("Allow", ALLOWED_METHODS)
}

fn denied(denial: Denial) -> Reply {
    let body = serde_json::json!({
        "error": denial.kind.as_str(),
        "error_description": denial.message,
    })
    .to_string();
    let mut reply = Reply::new(denial.status, body).header("Content-Type", "application/json");
    if let Some(challenge) = denial.www_authenticate {
        reply = reply.header("WWW-Authenticate", challenge);
    }
    reply
}

fn route<F>(hello: &Protected<F>, path: &str, req: &FilterRequest<'_>) -> Reply
where
    F: Fn(&FilterRequest<'_>, RequestContext) -> Reply,
{
    let path = path.split('?').next().unwrap_or(path);
    match (path, req.method.as_str()) {
        ("/", "GET") => Reply::new(200, "up"),
        ("/hello_world", "OPTIONS") => hello_world_options(req),
        ("/hello_world", "GET" | "HEAD") => hello.call(req).unwrap_or_else(denied),
        ("/", _) | ("/hello_world", _) => {
            Reply::new(405, "method not allowed").header("Allow", ALLOWED_METHODS)
        }
        _ => Reply::new(404, "not found"),
    }
}

fn to_header_map(headers: &[tiny_http::Header]) -> http::HeaderMap {
    let mut map = http::HeaderMap::with_capacity(headers.len());
    for h in headers {
        let name = http::HeaderName::from_bytes(h.field.as_str().as_str().as_bytes());
        let value = http::HeaderValue::from_bytes(h.value.as_str().as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            map.append(name, value);
        }
    }
    map
}

fn serve<F>(server: &tiny_http::Server, hello: &Protected<F>)
where
    F: Fn(&FilterRequest<'_>, RequestContext) -> Reply,
{
    for request in server.incoming_requests() {
        let method = match http::Method::from_bytes(request.method().as_str().as_bytes()) {
            Ok(m) => m,
            Err(_) => http::Method::GET,
        };
        let headers = to_header_map(request.headers());
        let req = FilterRequest::new(&method, &headers);
        let reply = route(hello, request.url(), &req);

        let body = if method == http::Method::HEAD {
            String::new()
        } else {
            reply.body
        };
        let mut response = tiny_http::Response::from_string(body).with_status_code(reply.status);
        for (name, value) in &reply.headers {
            if let Ok(header) = tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                response.add_header(header);
            }
        }
        if let Err(e) = request.respond(response) {
            warn!(error = %e, "failed to write response");
        }
    }
}

fn trust_config(args: &Args) -> Result<TrustConfig> {
    if let Some(path) = &args.config {
        return TrustConfig::load(path)
            .with_context(|| format!("loading trust configuration from {}", path.display()));
    }
    match (&args.introspection_url, &args.client_id, &args.client_secret) {
        (Some(url), Some(id), Some(secret)) => {
            let cfg = OpaqueConfig::new(url, id.clone(), secret.clone())
                .context("invalid introspection configuration")?;
            Ok(TrustConfig::Opaque(cfg.verify_tls(!args.insecure)))
        }
        _ => Err(anyhow!(
            "no trust configuration: pass --config or --introspection-url/--client-id/--client-secret"
        )),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging_with_config(&LogConfig::from_env())?;

    let filter = Arc::new(OAuthFilter::from_env());
    filter.configure(trust_config(&args)?)?;
    filter.ensure_configured()?;

    let hello = Arc::new(filter.protect([""], hello_world));
    let server = Arc::new(
        tiny_http::Server::http(&args.addr)
            .map_err(|e| anyhow!("failed to bind {}: {}", args.addr, e))?,
    );
    info!(addr = %args.addr, mode = ?filter.mode(), "hello_world listening");

    let workers: Vec<_> = (0..args.workers.max(1))
        .map(|_| {
            let server = Arc::clone(&server);
            let hello = Arc::clone(&hello);
            thread::spawn(move || serve(&server, hello.as_ref()))
        })
        .collect();
    for w in workers {
        if w.join().is_err() {
            warn!("worker thread panicked");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method};

    type Handler = fn(&FilterRequest<'_>, RequestContext) -> Reply;

    fn unconfigured() -> Protected<Handler> {
        Arc::new(OAuthFilter::new()).protect([""], hello_world as Handler)
    }

    #[test]
    fn test_health() {
        let (method, headers) = (Method::GET, HeaderMap::new());
        let reply = route(&unconfigured(), "/", &FilterRequest::new(&method, &headers));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, "up");
    }

    #[test]
    fn test_preflight() {
        let method = Method::OPTIONS;
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://spa.example.com"));
        let reply = route(
            &unconfigured(),
            "/hello_world",
            &FilterRequest::new(&method, &headers),
        );
        assert_eq!(reply.status, 200);
        let names: Vec<_> = reply.headers.iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"Access-Control-Allow-Origin"));
        assert!(names.contains(&"Access-Control-Allow-Methods"));
        assert!(names.contains(&"Allow"));
    }

    #[test]
    fn test_missing_token_is_401_with_challenge() {
        let (method, headers) = (Method::GET, HeaderMap::new());
        let reply = route(
            &unconfigured(),
            "/hello_world?x=1",
            &FilterRequest::new(&method, &headers),
        );
        assert_eq!(reply.status, 401);
        assert!(reply
            .headers
            .iter()
            .any(|(n, v)| *n == "WWW-Authenticate" && v == "Bearer"));
    }

    #[test]
    fn test_hello_world_echoes_interaction_id() {
        let (method, headers) = (Method::GET, HeaderMap::new());
        let req = FilterRequest::new(&method, &headers);
        let ctx = RequestContext {
            user: "alice".into(),
            scope: "read".into(),
            scopes: ["read".to_string()].into_iter().collect(),
            issuer: None,
            expires_at: 0,
            interaction_id: None,
            origin: None,
        };
        let reply = hello_world(&req, ctx);
        assert_eq!(reply.body, r#"{"hello":"alice","scope":"read"}"#);
        assert!(reply
            .headers
            .iter()
            .any(|(n, v)| *n == INTERACTION_ID_HEADER && v == DEFAULT_INTERACTION_ID));
    }
}
