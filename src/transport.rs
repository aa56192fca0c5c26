//! Blocking HTTP client shared by the introspection and JWKS fetchers.

use crate::config::FilterSettings;
use crate::error::ConfigError;
use reqwest::blocking::{Client, RequestBuilder, Response};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outbound HTTP with a bounded timeout and an optional single retry.
pub(crate) struct HttpTransport {
    client: Client,
    retry_once: bool,
    retry_backoff: Duration,
}

impl HttpTransport {
    /// Build the client. No connection is opened here.
    pub(crate) fn new(settings: &FilterSettings, verify_tls: bool) -> Result<Self, ConfigError> {
        if !verify_tls {
            warn!("TLS certificate verification is disabled for authorization endpoints");
        }
        let client = Client::builder()
            .timeout(settings.http_timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            retry_once: settings.retry_once,
            retry_backoff: settings.retry_backoff,
        })
    }

    /// Send a request built by `build`, retrying once on a transport error
    /// or a 5xx answer when retry is enabled.
    ///
    /// `build` is called again for the retry since a blocking request cannot
    /// be cloned once it carries a body.
    pub(crate) fn send<F>(&self, what: &'static str, build: F) -> Result<Response, reqwest::Error>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let start = Instant::now();
        let first = build(&self.client).send();

        let retry = self.retry_once
            && match &first {
                Ok(resp) => resp.status().is_server_error(),
                Err(_) => true,
            };
        if !retry {
            debug!(what, elapsed = ?start.elapsed(), "outbound request completed");
            return first;
        }

        match &first {
            Ok(resp) => debug!(what, status = resp.status().as_u16(), "retrying after server error"),
            Err(e) => debug!(what, error = %e, "retrying after transport error"),
        }
        std::thread::sleep(self.retry_backoff);
        let second = build(&self.client).send();
        debug!(what, elapsed = ?start.elapsed(), "outbound request completed after retry");
        second
    }
}

/// `max-age` from a `Cache-Control` header, if present and well formed.
pub(crate) fn cache_control_max_age(headers: &http::HeaderMap) -> Option<Duration> {
    headers
        .get_all(http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|directive| {
            let (name, value) = directive.trim().split_once('=')?;
            if name.trim().eq_ignore_ascii_case("max-age") {
                value.trim().trim_matches('"').parse::<u64>().ok()
            } else {
                None
            }
        })
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn test_max_age_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(cache_control_max_age(&headers), None);

        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=600, must-revalidate"),
        );
        assert_eq!(
            cache_control_max_age(&headers),
            Some(Duration::from_secs(600))
        );

        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        assert_eq!(cache_control_max_age(&headers), None);

        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("Max-Age=abc"),
        );
        assert_eq!(cache_control_max_age(&headers), None);
    }

    #[test]
    fn test_client_builds_without_network() {
        let settings = FilterSettings::default();
        assert!(HttpTransport::new(&settings, true).is_ok());
        assert!(HttpTransport::new(&settings, false).is_ok());
    }
}
