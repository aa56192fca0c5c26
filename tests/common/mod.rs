#![allow(dead_code)]

//! Shared helpers for integration tests: mock introspection / JWKS endpoints
//! and RS256 token minting.

pub mod mock_server {
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// What the mock saw of one request.
    #[derive(Debug, Clone, Default)]
    pub struct RecordedRequest {
        pub method: String,
        pub url: String,
        pub authorization: Option<String>,
        pub content_type: Option<String>,
        pub body: String,
    }

    #[derive(Debug, Clone)]
    pub struct MockResponse {
        pub status: u16,
        pub body: String,
        pub headers: Vec<(String, String)>,
    }

    impl MockResponse {
        pub fn json(status: u16, body: impl Into<String>) -> Self {
            Self {
                status,
                body: body.into(),
                headers: vec![("Content-Type".into(), "application/json".into())],
            }
        }

        pub fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.into(), value.into()));
            self
        }
    }

    /// A running mock endpoint on 127.0.0.1 with a hit counter.
    pub struct MockServer {
        pub base_url: String,
        hits: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
    }

    impl MockServer {
        /// Number of requests served so far
        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        pub fn last_request(&self) -> Option<RecordedRequest> {
            self.requests.lock().unwrap().last().cloned()
        }

        pub fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Start a server answering every request through `handler`.
    ///
    /// The handler gets the zero-based hit index, so tests can change the
    /// answer over time (key rotation, transient failures).
    pub fn start<F>(handler: F) -> MockServer
    where
        F: Fn(usize, &RecordedRequest) -> MockResponse + Send + Sync + 'static,
    {
        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        // Several workers so slow handlers don't serialize concurrent callers
        for _ in 0..4 {
            let server = Arc::clone(&server);
            let hits = Arc::clone(&hits);
            let requests = Arc::clone(&requests);
            let handler = Arc::clone(&handler);
            thread::spawn(move || {
                while let Ok(mut request) = server.recv() {
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    let header = |name: &str| {
                        request
                            .headers()
                            .iter()
                            .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
                            .map(|h| h.value.as_str().to_string())
                    };
                    let recorded = RecordedRequest {
                        method: request.method().as_str().to_string(),
                        url: request.url().to_string(),
                        authorization: header("Authorization"),
                        content_type: header("Content-Type"),
                        body,
                    };
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    requests.lock().unwrap().push(recorded.clone());

                    let reply = handler(n, &recorded);
                    let mut response =
                        tiny_http::Response::from_string(reply.body).with_status_code(reply.status);
                    for (name, value) in &reply.headers {
                        response.add_header(
                            tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes())
                                .unwrap(),
                        );
                    }
                    let _ = request.respond(response);
                }
            });
        }

        MockServer {
            base_url: format!("http://127.0.0.1:{}", port),
            hits,
            requests,
        }
    }

    /// Always answer with the same JSON body.
    pub fn start_json(status: u16, body: impl Into<String>) -> MockServer {
        let body = body.into();
        start(move |_, _| MockResponse::json(status, body.clone()))
    }

    /// A URL on a port nothing listens on.
    pub fn closed_port_url(path: &str) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}{}", port, path)
    }
}

pub mod tokens {
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use serde_json::{json, Value};
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Modulus of `fixtures/rsa_a.pem` (base64url)
    pub const RSA_A_N: &str = "vSAmJrqw0KEUTZERONOJEonYDD329Obc0iNbcwpu1yb34auap9GDByK6mcbgqsbXAGRPIIW2luJ-_QDMjQdkMSOw5NT6ZhGrIJjFSk7S3wEzIaNcGGk6zoF3KwMjNqCfIouB7x6UrngwdZTrB01V3ZewE4N1w3lFPVoJAZHDcDQzY92FLe020ayHnNRJXDauHeLHExB0XvUXWQXNPxWY4ykAcGnVYA7bdT53awbJpmMvwwjLMwpvq6qCAJ0l4EF9cNi63JbNJqbKSYIIWnfOHzNW_en2eJX_Knnm8ksC1x5hxXmlg5DbrnJLo76DRM-hmKHyG9S7kfRkGhyXyEJ6NQ";
    /// Modulus of `fixtures/rsa_b.pem` (base64url)
    pub const RSA_B_N: &str = "lP9dWnBnNTAdGoZUzOfrlyceRbEAqN0PJRPGn2NfbfveD1jV7YUmonJaK9n1YfdEUd3C4VyoeZrPX5oR9SsgspnMXS2PnVXf5gG1q8TIR9iB7DVswVrPYWIICyfj09Jcnf7gyStKr-kgxVvpcHHDTa049TaHhr0ieqdvOzxl2NsWkRN80QTB0I1_UH-_nfIzBfjYexPl0FvEIvOn2ba0JEXKOTE3FzTE-nuft4KMZRkA2xr8DbcM8uCiJDAjbZfruiOCKF8mdPDijlgKn3l-cTEipNIXXHCg5UeZ4yc7ICXQ34TZS1U5oiSXH0_A2TmvdkK5Y6jK3n9nzS3ptMTVLQ";

    const RSA_A_PEM: &[u8] = include_bytes!("../fixtures/rsa_a.pem");
    const RSA_B_PEM: &[u8] = include_bytes!("../fixtures/rsa_b.pem");

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TestKey {
        A,
        B,
    }

    impl TestKey {
        pub fn encoding_key(self) -> EncodingKey {
            let pem = match self {
                TestKey::A => RSA_A_PEM,
                TestKey::B => RSA_B_PEM,
            };
            EncodingKey::from_rsa_pem(pem).unwrap()
        }

        pub fn modulus(self) -> &'static str {
            match self {
                TestKey::A => RSA_A_N,
                TestKey::B => RSA_B_N,
            }
        }

        /// Public JWK for this key.
        pub fn jwk(self, kid: &str) -> Value {
            json!({
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": kid,
                "n": self.modulus(),
                "e": "AQAB",
            })
        }
    }

    pub fn jwks(keys: &[Value]) -> String {
        json!({ "keys": keys }).to_string()
    }

    pub fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    /// Claims valid for an hour.
    pub fn claims(iss: &str, aud: &str, sub: &str, scope: &str) -> Value {
        json!({
            "iss": iss,
            "aud": aud,
            "sub": sub,
            "scope": scope,
            "iat": now(),
            "exp": now() + 3600,
        })
    }

    pub fn make_rs256_jwt(key: TestKey, kid: Option<&str>, claims: &Value) -> String {
        let header = Header {
            kid: kid.map(str::to_string),
            alg: Algorithm::RS256,
            ..Default::default()
        };
        jsonwebtoken::encode(&header, claims, &key.encoding_key()).unwrap()
    }

    pub fn make_hs256_jwt(secret: &[u8], kid: &str, claims: &Value) -> String {
        let header = Header {
            kid: Some(kid.to_string()),
            alg: Algorithm::HS256,
            ..Default::default()
        };
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn base64url_no_pad(data: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
    }

    /// Unsigned token with `alg: none`.
    pub fn make_unsigned_jwt(claims: &Value) -> String {
        let header = base64url_no_pad(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = base64url_no_pad(claims.to_string().as_bytes());
        format!("{}.{}.", header, payload)
    }
}

pub mod requests {
    use http::{HeaderMap, HeaderValue};

    pub fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }
}

pub mod settings {
    use oauth_filter::FilterSettings;
    use std::time::Duration;

    /// Defaults with a short timeout so failure tests finish quickly.
    pub fn fast() -> FilterSettings {
        FilterSettings {
            http_timeout: Duration::from_millis(2000),
            ..FilterSettings::default()
        }
    }
}
