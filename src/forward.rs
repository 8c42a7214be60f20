//! The proxy's HTTP surface: a liveness probe and the `/chat` forwarder.
//!
//! `/chat` runs a fixed pipeline: check the body is JSON, check the backend
//! address, obtain an identity token for it, POST the caller's bytes, relay
//! the answer. The backend's own status code is always passed through; only
//! the proxy's own failures produce 400/500/502 (see [`ProxyError`]).

use std::{sync::Arc, time::Duration};

use axum::{
    Json,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;

use crate::{AppState, error::ProxyError};

/// Hard upper bound for one backend exchange.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

/// `GET /`
pub async fn health() -> Json<Health> {
    Json(Health {
        status: "echo-proxy-running",
    })
}

/// `POST /chat`
///
/// The validated body is forwarded as received, so numbers outside the
/// range of `f64` and the caller's key order reach the backend unchanged.
#[tracing::instrument(skip_all)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ProxyError> {
    if !json_content_type(&headers) {
        tracing::debug!("request content type is not JSON");
        return Err(ProxyError::InvalidJson);
    }
    let body = body.map_err(|e| {
        tracing::debug!("failed to read request body: {}", e);
        ProxyError::InvalidJson
    })?;
    validate_payload(&body)?;

    let backend_url = state
        .settings
        .backend_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .ok_or(ProxyError::Misconfigured)?;

    let token = state.tokens.fetch_token(backend_url).await?;

    tracing::debug!(backend = %backend_url, "forwarding request");
    let resp = state
        .backend
        .post(backend_url)
        .bearer_auth(token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;

    relay(resp).await
}

/// `application/json`, or any `application/*+json` type. Parameters such as
/// `charset` are ignored.
fn json_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence == "application/json"
        || (essence.starts_with("application/") && essence.ends_with("+json"))
}

fn validate_payload(body: &[u8]) -> Result<(), ProxyError> {
    let payload: Value = serde_json::from_slice(body).map_err(|e| {
        tracing::debug!("request body is not JSON: {}", e);
        ProxyError::InvalidJson
    })?;

    if is_empty(&payload) {
        return Err(ProxyError::InvalidJson);
    }
    Ok(())
}

/// Empty values are refused just like malformed ones: `null`, `false`, zero,
/// `""`, `[]` and `{}`.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Passes the backend's status and body through untouched. The body is
/// labelled JSON only if it actually parses as JSON, and carries a charset
/// only if it is valid UTF-8.
async fn relay(resp: reqwest::Response) -> Result<Response, ProxyError> {
    let status = resp.status();
    let body = resp.bytes().await?;

    let content_type = if serde_json::from_slice::<serde::de::IgnoredAny>(&body).is_ok() {
        "application/json"
    } else if std::str::from_utf8(&body).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "text/plain"
    };

    tracing::debug!(status = %status.as_u16(), content_type, "relaying backend response");
    Ok((status, [(header::CONTENT_TYPE, content_type)], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::token::tests::{ScriptedSource, jwt_expiring_in};
    use crate::token::{IdentityTokenSource, TokenProvider};
    use axum::{Router, body::Body, extract::Request, http::StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{any, body_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app_with(
        backend_url: Option<&str>,
        source: Arc<dyn IdentityTokenSource>,
        timeout: Duration,
    ) -> Router {
        let state = Arc::new(AppState {
            settings: Settings::for_test(backend_url),
            tokens: TokenProvider::new(source, crate::token::FETCH_TIMEOUT),
            backend: reqwest::Client::builder().timeout(timeout).build().unwrap(),
        });
        crate::router(state).unwrap()
    }

    fn app(backend_url: Option<&str>, source: Arc<dyn IdentityTokenSource>) -> Router {
        app_with(backend_url, source, BACKEND_TIMEOUT)
    }

    fn chat_request(body: impl Into<Body>) -> Request {
        chat_request_as(Some("application/json"), body)
    }

    fn chat_request_as(content_type: Option<&str>, body: impl Into<Body>) -> Request {
        let mut builder = Request::builder().method("POST").uri("/chat");
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }
        builder.body(body.into()).unwrap()
    }

    fn headers_with(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
        headers
    }

    async fn send(app: Router, req: Request) -> (StatusCode, Option<String>, Bytes) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, body)
    }

    fn as_json(body: &Bytes) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health_without_configuration() {
        let app = app(None, ScriptedSource::new(vec![]));
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body), json!({ "status": "echo-proxy-running" }));
    }

    #[tokio::test]
    async fn test_invalid_bodies_are_rejected() {
        let bodies = ["", "{", "not json", "null", "{}", "[]", "\"\"", "0", "false", "{\"a\":1} x"];

        for raw in bodies {
            let source = ScriptedSource::new(vec![]);
            let app = app(Some("http://127.0.0.1:1/chat"), source.clone());

            let (status, _, body) = send(app, chat_request(raw)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {raw:?}");
            assert_eq!(as_json(&body), json!({ "error": "Invalid JSON body" }));
            assert_eq!(source.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_invalid_json_reported_before_misconfiguration() {
        let app = app(None, ScriptedSource::new(vec![]));

        let (status, _, _) = send(app, chat_request("{")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_backend_url() {
        for backend_url in [None, Some("")] {
            let source = ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]);
            let app = app(backend_url, source.clone());

            let (status, _, body) = send(app, chat_request(r#"{"msg":"hi"}"#)).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(as_json(&body), json!({ "error": "Server misconfiguration" }));
            assert_eq!(source.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_token_failure_skips_backend() {
        let backend = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let app = app(Some(&format!("{}/chat", backend.uri())), ScriptedSource::new(vec![None]));

        let (status, _, body) = send(app, chat_request(r#"{"msg":"hi"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            as_json(&body),
            json!({ "error": "Failed to authenticate to backend" })
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Bind and release a port so nothing is listening on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]);
        let app = app(Some(&format!("http://{addr}/chat")), source);

        let (status, _, body) = send(app, chat_request(r#"{"msg":"hi"}"#)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(as_json(&body), json!({ "error": "Failed to reach backend" }));
    }

    #[tokio::test]
    async fn test_backend_timeout() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": true }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&backend)
            .await;

        let source = ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]);
        let app = app_with(
            Some(&format!("{}/chat", backend.uri())),
            source,
            Duration::from_millis(100),
        );

        let (status, _, body) = send(app, chat_request(r#"{"msg":"hi"}"#)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(as_json(&body), json!({ "error": "Failed to reach backend" }));
    }

    #[tokio::test]
    async fn test_forwards_with_identity_token() {
        let backend = MockServer::start().await;
        let jwt = jwt_expiring_in(3600);

        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(header("authorization", format!("Bearer {jwt}").as_str()))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({ "msg": "hi" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&backend)
            .await;

        let app = app(
            Some(&format!("{}/chat", backend.uri())),
            ScriptedSource::new(vec![Some(jwt)]),
        );

        let (status, content_type, body) = send(app, chat_request(r#"{"msg": "hi"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(as_json(&body), json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_plain_text_response_is_relayed_verbatim() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&backend)
            .await;

        let app = app(
            Some(&format!("{}/chat", backend.uri())),
            ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]),
        );

        let (status, content_type, body) = send(app, chat_request(r#"{"msg":"ping"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        assert_eq!(&body[..], b"pong");
    }

    #[tokio::test]
    async fn test_backend_error_status_is_passed_through() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({ "detail": "model overloaded" })),
            )
            .mount(&backend)
            .await;

        let app = app(
            Some(&format!("{}/chat", backend.uri())),
            ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]),
        );

        let (status, _, body) = send(app, chat_request(r#"{"msg":"hi"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(as_json(&body), json!({ "detail": "model overloaded" }));
    }

    #[tokio::test]
    async fn test_repeated_requests_are_independent() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["a", 1, null])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "echo": ["a", 1, null] })))
            .expect(2)
            .mount(&backend)
            .await;

        let source = ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]);
        let app = app(Some(&format!("{}/chat", backend.uri())), source.clone());

        let first = send(app.clone(), chat_request(r#"["a", 1, null]"#)).await;
        let second = send(app, chat_request(r#"["a", 1, null]"#)).await;

        assert_eq!(first, second);
        assert_eq!(first.0, StatusCode::OK);
        // The second request reused the cached token.
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_truthy_scalars_are_accepted() {
        for raw in ["1", "true", "\"hello\"", "-0.5"] {
            assert!(validate_payload(raw.as_bytes()).is_ok(), "body {raw:?}");
        }
    }

    #[tokio::test]
    async fn test_non_json_content_type_is_rejected() {
        let backend = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        for content_type in [None, Some("text/plain"), Some("application/x-www-form-urlencoded")] {
            let source = ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]);
            let app = app(Some(&format!("{}/chat", backend.uri())), source.clone());

            let (status, _, body) = send(app, chat_request_as(content_type, r#"{"msg":"hi"}"#)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "content type {content_type:?}");
            assert_eq!(as_json(&body), json!({ "error": "Invalid JSON body" }));
            assert_eq!(source.calls(), 0);
        }
    }

    #[test]
    fn test_json_content_types() {
        for accepted in [
            "application/json",
            "application/json; charset=utf-8",
            "Application/JSON",
            "application/vnd.api+json",
        ] {
            assert!(json_content_type(&headers_with(accepted)), "{accepted}");
        }
        for refused in ["text/plain", "text/json", "application/jsonp", "multipart/form-data"] {
            assert!(!json_content_type(&headers_with(refused)), "{refused}");
        }
        assert!(!json_content_type(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_large_integers_are_forwarded_unchanged() {
        let raw = r#"{"n":123456789012345678901234567890,"m":18446744073709551616}"#;

        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/json"))
            .and(body_string(raw))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&backend)
            .await;

        let app = app(
            Some(&format!("{}/chat", backend.uri())),
            ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]),
        );

        let (status, _, _) = send(app, chat_request(raw)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_body_above_default_limit_is_forwarded() {
        let raw = format!(r#"{{"pad":"{}"}}"#, "x".repeat(3 * 1024 * 1024));

        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string(raw.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&backend)
            .await;

        let app = app(
            Some(&format!("{}/chat", backend.uri())),
            ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]),
        );

        let (status, _, body) = send(app, chat_request(raw)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body), json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_binary_response_has_no_charset() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xfe, b'x']))
            .mount(&backend)
            .await;

        let app = app(
            Some(&format!("{}/chat", backend.uri())),
            ScriptedSource::new(vec![Some(jwt_expiring_in(3600))]),
        );

        let (status, content_type, body) = send(app, chat_request(r#"{"msg":"ping"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        assert_eq!(&body[..], &[0xff, 0xfe, b'x']);
    }
}
