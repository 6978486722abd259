//! Authenticated session against the routing service.
//!
//! The service only answers route requests that carry the cookies of a prior page visit, a CSRF
//! token, a client-generated session id, and a signature `s` computed over the encoded query
//! string. [`SessionClient`] owns that state and refreshes it once it is older than the configured
//! session timeout.
//!
//! Session state is an immutable [`SessionState`] value. Refreshing the session or adopting a
//! new CSRF token produces a new value that replaces the old one; nothing is mutated in place
//! while a request is in flight.

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::scanner::ScanError;
use crate::scanner::models::{RouteQueryResult, RouteResponse};
use crate::types::Coords;

/// Path of the route builder, relative to the service endpoint.
const ROUTE_PATH: &str = "api/router/buildRoute/";

/// Request signature expected by the routing service.
///
/// A DJB2-style rolling hash with XOR in place of addition: a 32-bit signed accumulator starts
/// at 5381 and absorbs each character as `n = (33 * n) ^ c`, wrapping on overflow. The result is
/// reinterpreted as unsigned.
pub fn make_s(source: &str) -> u32 {
    let mut n: i32 = 5381;
    for c in source.chars() {
        n = n.wrapping_mul(33) ^ (c as i32);
    }
    n as u32
}

/// Percent-encode a query component the way the service's own web client does.
///
/// This is `application/x-www-form-urlencoded` except that `~` stays literal and `*` is escaped.
/// The signature covers the encoded bytes, so the difference matters.
fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace("%7E", "~")
        .replace('*', "%2A")
}

fn encode_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Random session id: 13 digits, an underscore, then 6 digits.
fn generate_session_id() -> String {
    use rand::prelude::RngExt;

    let mut rng = rand::rng();
    let mut digits = |count: usize| -> String { (0..count).map(|_| char::from(b'0' + rng.random_range(0..10u8))).collect() };
    let prefix = digits(13);
    let suffix = digits(6);
    format!("{prefix}_{suffix}")
}

fn install_crypto_provider() {
    // Errors only when a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Source of route durations.
///
/// Implemented by [`SessionClient`] for the real service. The scan loop depends only on this
/// trait.
#[async_trait]
pub trait RouteSession: Send + Sync {
    /// Make sure usable credentials exist, refreshing them when `force` is set or they expired.
    async fn ensure_session(&self, force: bool) -> Result<(), ScanError>;

    /// Ask the service for a route from `start` to `end`.
    async fn build_route(&self, start: Coords, end: Coords) -> Result<RouteQueryResult, ScanError>;
}

/// Credentials of one routing session.
///
/// The HTTP client owns the session's cookie jar, so cookies set by any response are carried
/// by every later request of the same session.
#[derive(Clone, Debug)]
pub struct SessionState {
    http: reqwest::Client,
    csrf_token: String,
    session_id: String,
    refreshed_at: Instant,
}

impl SessionState {
    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.refreshed_at.elapsed() > timeout
    }

    /// Same session, new CSRF token.
    fn with_csrf_token(&self, csrf_token: String) -> Self {
        Self {
            csrf_token,
            ..self.clone()
        }
    }
}

/// Client for the routing service.
pub struct SessionClient {
    config: ClientConfig,
    endpoint: Url,
    route_url: Url,
    headers: HeaderMap,
    state: Mutex<Option<SessionState>>,
}

impl SessionClient {
    /// Create a client. No request is made until the first route is built.
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let endpoint = config.endpoint_url()?;
        let route_url = endpoint.join(ROUTE_PATH)?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);
        headers.insert(ACCEPT, HeaderValue::from_str(&config.accept)?);
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&config.accept_language)?);

        install_crypto_provider();

        Ok(Self {
            config,
            endpoint,
            route_url,
            headers,
            state: Mutex::new(None),
        })
    }

    /// Current session, refreshed first if `force` is set or it has expired.
    pub async fn session(&self, force: bool) -> Result<SessionState, ScanError> {
        let mut current = self.state.lock().await;

        if let Some(state) = current.as_ref()
            && !force
            && !state.is_expired(self.config.session_timeout)
        {
            return Ok(state.clone());
        }

        let state = self.open_session().await?;
        *current = Some(state.clone());
        Ok(state)
    }

    async fn replace_session(&self, state: SessionState) {
        *self.state.lock().await = Some(state);
    }

    async fn pause(&self) {
        if !self.config.request_delay.is_zero() {
            tokio::time::sleep(self.config.request_delay).await;
        }
    }

    /// Visit the service root for cookies, then fetch a CSRF token with them.
    async fn open_session(&self) -> Result<SessionState, ScanError> {
        info!("Opening routing session at {}", self.endpoint);

        let http = reqwest::Client::builder()
            .default_headers(self.headers.clone())
            .cookie_provider(Arc::new(Jar::default()))
            .build()
            .map_err(ScanError::Session)?;

        self.pause().await;
        http.get(self.endpoint.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(ScanError::Session)?;

        self.pause().await;
        let body: Value = http
            .get(self.route_url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(ScanError::Session)?
            .json()
            .await
            .map_err(ScanError::Session)?;

        let Some(csrf_token) = body.get("csrfToken").and_then(Value::as_str) else {
            error!(body = %body, "Session handshake returned no csrfToken");
            return Err(ScanError::invalid("session handshake returned no csrfToken"));
        };

        let state = SessionState {
            http,
            csrf_token: csrf_token.to_string(),
            session_id: generate_session_id(),
            refreshed_at: Instant::now(),
        };
        debug!(session_id = %state.session_id, "Routing session ready");
        Ok(state)
    }

    /// Query string of a route request, signed.
    fn signed_query(&self, session: &SessionState, start: Coords, end: Coords) -> String {
        let rll = Coords::to_rll(start, end);
        let params = [
            ("activeComparisonMode", "auto"),
            ("ajax", "1"),
            ("csrfToken", session.csrf_token.as_str()),
            ("ignoreTravelModes", "avia"),
            ("isIntercityRoute", "false"),
            ("lang", self.config.lang.as_str()),
            ("locale", self.config.locale.as_str()),
            ("mode", "best"),
            ("rll", rll.as_str()),
            ("sessionId", session.session_id.as_str()),
            ("type", "auto"),
        ];

        let query = encode_query(&params);
        let signature = make_s(&query);
        format!("{query}&s={signature}")
    }

    #[tracing::instrument(skip_all, fields(start = %start, end = %end))]
    async fn request_route(&self, session: &SessionState, start: Coords, end: Coords) -> Result<RouteResponse, ScanError> {
        let mut url = self.route_url.clone();
        url.set_query(Some(&self.signed_query(session, start, end)));

        self.pause().await;
        let response = session.http.get(url).send().await?.error_for_status()?;
        let text = response.text().await?;

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            error!(body = %text, "Route response is not JSON");
            ScanError::invalid(format!("route response is not JSON: {e}"))
        })?;

        Ok(RouteResponse::classify(body))
    }
}

#[async_trait]
impl RouteSession for SessionClient {
    async fn ensure_session(&self, force: bool) -> Result<(), ScanError> {
        self.session(force).await.map(|_| ())
    }

    async fn build_route(&self, start: Coords, end: Coords) -> Result<RouteQueryResult, ScanError> {
        let session = self.session(false).await?;

        let session = match self.request_route(&session, start, end).await? {
            RouteResponse::Data(result) => return Ok(result),
            RouteResponse::TokenRefreshed(token) => {
                warn!("Routing session is warming up, retrying once with a fresh CSRF token");
                let session = session.with_csrf_token(token);
                self.replace_session(session.clone()).await;
                session
            }
            RouteResponse::Malformed(body) => {
                error!(body = %body, "Route response has neither data nor csrfToken");
                return Err(ScanError::invalid("route response has neither data nor csrfToken"));
            }
        };

        match self.request_route(&session, start, end).await? {
            RouteResponse::Data(result) => Ok(result),
            RouteResponse::TokenRefreshed(_) => {
                error!("CSRF token was refreshed again after a retry");
                Err(ScanError::invalid("CSRF token was refreshed twice in a row"))
            }
            RouteResponse::Malformed(body) => {
                error!(body = %body, "Route response has neither data nor csrfToken");
                Err(ScanError::invalid("route response has neither data nor csrfToken"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MOSCOW: Coords = Coords {
        lat: 55.751244,
        lon: 37.618423,
    };
    const KHAMOVNIKI: Coords = Coords {
        lat: 55.733842,
        lon: 37.588144,
    };
    const RLL: &str = "37.618423,55.751244~37.588144,55.733842";

    fn test_config(server: &MockServer) -> ClientConfig {
        ClientConfig {
            endpoint: format!("{}/maps/", server.uri()),
            request_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Mount the two handshake endpoints, handing out `token`.
    async fn mount_handshake(server: &MockServer, token: &str) {
        Mock::given(method("GET"))
            .and(path("/maps/"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "yandexuid=42; Path=/"))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param_is_missing("rll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": token })))
            .mount(server)
            .await;
    }

    fn route_body(duration: i64) -> serde_json::Value {
        json!({ "data": { "routes": [ { "durationInTraffic": duration } ] } })
    }

    #[test]
    fn test_make_s_known_values() {
        assert_eq!(make_s(""), 5381);
        assert_eq!(make_s("a"), 177604);
        assert_eq!(make_s("ab"), 5860902);
        // Long enough to wrap the accumulator many times over
        assert_eq!(make_s("ajax=1&lang=ru"), 3606996835);
    }

    #[test]
    fn test_make_s_is_deterministic() {
        let input = "activeComparisonMode=auto&ajax=1";
        assert_eq!(make_s(input), make_s(input));
        assert_ne!(make_s(input), make_s("activeComparisonMode=auto&ajax=2"));
    }

    #[test]
    fn test_encode_query_keeps_tilde_and_escapes_separators() {
        let query = encode_query(&[("rll", RLL), ("csrfToken", "abc:123"), ("q", "a b*")]);
        assert_eq!(
            query,
            "rll=37.618423%2C55.751244~37.588144%2C55.733842&csrfToken=abc%3A123&q=a+b%2A"
        );
    }

    #[test]
    fn test_signed_query() {
        let client = SessionClient::new(ClientConfig::default()).unwrap();
        let session = SessionState {
            http: reqwest::Client::new(),
            csrf_token: "abc:123".to_string(),
            session_id: "1234567890123_123456".to_string(),
            refreshed_at: Instant::now(),
        };

        let query = client.signed_query(&session, MOSCOW, KHAMOVNIKI);
        let expected = "activeComparisonMode=auto&ajax=1&csrfToken=abc%3A123&ignoreTravelModes=avia\
                        &isIntercityRoute=false&lang=ru&locale=ru_RU&mode=best\
                        &rll=37.618423%2C55.751244~37.588144%2C55.733842\
                        &sessionId=1234567890123_123456&type=auto";
        assert_eq!(query, format!("{expected}&s=3247597272"));
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        assert_eq!(id.len(), 20);
        assert_eq!(id.find('_'), Some(13));
        assert!(id.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_build_route_with_fresh_session() {
        let server = MockServer::start().await;
        mount_handshake(&server, "tok1").await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok1"))
            .and(query_param("rll", RLL))
            .and(query_param("mode", "best"))
            .and(query_param("type", "auto"))
            .and(header("cookie", "yandexuid=42"))
            .and(header("accept-language", "en-us"))
            .respond_with(ResponseTemplate::new(200).set_body_json(route_body(1834)))
            .expect(1)
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let result = client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap();
        assert_eq!(result.duration_in_traffic().unwrap(), Some(1834));

        // The signature must cover exactly the query that went over the wire
        let requests = server.received_requests().await.unwrap();
        let route_request = requests.iter().find(|r| r.url.query().is_some_and(|q| q.contains("rll="))).unwrap();
        let query = route_request.url.query().unwrap();
        let (unsigned, signature) = query.rsplit_once("&s=").unwrap();
        assert_eq!(signature, make_s(unsigned).to_string());
    }

    #[tokio::test]
    async fn test_session_is_reused_until_forced() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/maps/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param_is_missing("rll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "tok" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(route_body(60)))
            .expect(2)
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap();
        let first = client.session(false).await.unwrap();
        client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap();

        client.ensure_session(true).await.unwrap();
        let second = client.session(false).await.unwrap();
        assert_ne!(first.session_id(), second.session_id());
    }

    #[tokio::test]
    async fn test_retries_once_with_refreshed_token() {
        let server = MockServer::start().await;
        mount_handshake(&server, "tok1").await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "tok2" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(route_body(900)))
            .expect(2)
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let result = client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap();
        assert_eq!(result.duration_in_traffic().unwrap(), Some(900));

        // The refreshed token is kept for later requests
        assert_eq!(client.session(false).await.unwrap().csrf_token(), "tok2");
        client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_token_refresh_is_invalid_response() {
        let server = MockServer::start().await;
        mount_handshake(&server, "tok1").await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "tok2" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "tok3" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let err = client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidResponse { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_malformed_response_fails_without_retry() {
        let server = MockServer::start().await;
        mount_handshake(&server, "tok1").await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "captcha" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let err = client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidResponse { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_non_json_response_is_invalid() {
        let server = MockServer::start().await;
        mount_handshake(&server, "tok1").await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>captcha</html>"))
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let err = client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidResponse { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_route_http_error_is_network_error() {
        let server = MockServer::start().await;
        mount_handshake(&server, "tok1").await;

        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .and(query_param("csrfToken", "tok1"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let err = client.build_route(MOSCOW, KHAMOVNIKI).await.unwrap_err();
        assert!(matches!(err, ScanError::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_handshake_failure_is_session_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/maps/"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let err = client.ensure_session(false).await.unwrap_err();
        assert!(matches!(err, ScanError::Session(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_handshake_without_token_is_invalid_response() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/maps/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/maps/api/router/buildRoute/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = SessionClient::new(test_config(&server)).unwrap();
        let err = client.ensure_session(false).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidResponse { .. }), "got {err:?}");
    }
}
