mod callback;
mod gate;

use crate::config::Config;
use crate::error::HttpError;
use crate::ServerState;
use callback::callback_handler;
use gate::gate_handler;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, Router},
};

/// Build the proxy's routing table. The callback path gets its own route;
/// every other request falls through to the gate.
pub fn routes(config: &Config) -> Router<ServerState> {
    Router::new()
        .route(&config.server.callback_path, get(callback_handler))
        .fallback(gate_handler)
}

// `axum::response::Redirect` sends 303/307/308; the login bounce is a plain
// 302 Found.
fn found(location: &str) -> Result<Response, HttpError> {
    let location = HeaderValue::from_str(location)
        .map_err(|_| HttpError::Internal("invalid redirect target"))?;

    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    use crate::authz::EmailMatcher;
    use crate::config::{ProviderConfig, ServerConfig};
    use crate::provider::ProviderClient;
    use crate::proxy::Forwarder;
    use crate::session::{Session, SessionKey, SessionStore};

    use axum::{
        body::Body,
        extract::{ConnectInfo, Request},
        http::{HeaderName, Method},
        response::Json,
        routing::post,
    };
    use serde_json::json;
    use tower::ServiceExt;
    use tower_cookies::CookieManagerLayer;

    const COOKIE_NAME: &str = "_doorman_session";
    const AUTH_URL: &str = "https://provider.example/auth";

    /// Serve a router on an ephemeral port, returning its address.
    async fn spawn(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub local addr");

        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve stub");
        });

        addr
    }

    /// A stand-in backend that echoes the forwarding headers it saw.
    async fn spawn_backend() -> SocketAddr {
        async fn backend_handler(req: Request) -> Response {
            let forwarded_for = req.headers().get("x-forwarded-for").cloned();

            let mut res = (
                StatusCode::OK,
                [
                    (HeaderName::from_static("x-foo"), HeaderValue::from_static("bar")),
                    (header::SET_COOKIE, HeaderValue::from_static("flavor=chocolateChip")),
                ],
                "I am the backend",
            )
                .into_response();
            if let Some(value) = forwarded_for {
                res.headers_mut()
                    .insert(HeaderName::from_static("x-echo-forwarded-for"), value);
            }

            res
        }

        spawn(Router::new().fallback(backend_handler)).await
    }

    /// A stand-in provider with a token endpoint and a user-info endpoint.
    async fn spawn_provider(reject_code: bool, userinfo: &'static str) -> SocketAddr {
        let token = move || async move {
            if reject_code {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_grant" })),
                )
                    .into_response()
            } else {
                Json(json!({
                    "access_token": "test-access-token",
                    "token_type": "bearer",
                }))
                .into_response()
            }
        };

        spawn(
            Router::new()
                .route("/token", post(token))
                .route("/userinfo", get(move || async move { userinfo })),
        )
        .await
    }

    struct TestProxy {
        app: Router,
        key: SessionKey,
    }

    fn test_proxy(
        backend_url: &str,
        provider: Option<SocketAddr>,
        email_pattern: &str,
        protect_path: &str,
    ) -> TestProxy {
        let provider_base = provider
            .map(|addr| format!("http://{addr}"))
            .unwrap_or_else(|| "https://provider.example".to_string());

        let config = Config {
            server: ServerConfig {
                listen_addr: None,
                listen_addr_tls: None,
                tls_cert: None,
                tls_key: None,
                cookie_name: COOKIE_NAME.to_string(),
                callback_path: "/oauth2callback".to_string(),
                protect_path: protect_path.to_string(),
                backend_url: backend_url.to_string(),
            },
            oauth: ProviderConfig {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                redirect_url: "http://proxy.example/oauth2callback".to_string(),
                auth_url: AUTH_URL.to_string(),
                token_url: format!("{provider_base}/token"),
                userinfo_url: format!("{provider_base}/userinfo"),
                scope: "email".to_string(),
                email_pattern: email_pattern.to_string(),
            },
        };

        let key = SessionKey::generate().expect("generate key");
        let state = ServerState {
            sessions: SessionStore::new(config.server.cookie_name.clone(), key.clone()),
            authz: EmailMatcher::new(&config.oauth.email_pattern).expect("compile pattern"),
            provider: ProviderClient::new(&config.oauth).expect("build provider client"),
            forwarder: Forwarder::new(&config.server.backend_url).expect("build forwarder"),
            config: config.clone(),
        };

        let app = routes(&config)
            .with_state(state)
            .layer(CookieManagerLayer::new());

        TestProxy { app, key }
    }

    fn request(uri: &str, cookie: Option<&str>) -> Request {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(value) = cookie {
            builder = builder.header(header::COOKIE, format!("{COOKIE_NAME}={value}"));
        }

        let mut req = builder.body(Body::empty()).expect("build request");
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 34567))));

        req
    }

    fn session_cookie(res: &Response) -> Option<String> {
        res.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find(|value| value.starts_with(COOKIE_NAME))
            .and_then(|value| value.split(';').next())
            .and_then(|value| value.split_once('='))
            .map(|(_, value)| value.to_string())
    }

    fn location(res: &Response) -> &str {
        res.headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location header")
    }

    async fn body_string(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .expect("read body");

        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    #[tokio::test]
    async fn unauthenticated_request_redirects_to_provider() {
        let proxy = test_proxy("http://127.0.0.1:1/", None, ".*", "/");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/some/path?q=1", None))
            .await
            .expect("gate response");

        assert_eq!(res.status(), StatusCode::FOUND);
        assert!(location(&res).starts_with(AUTH_URL));

        let cookie = session_cookie(&res).expect("session cookie");
        let session = proxy.key.open(&cookie).expect("open session");
        assert!(!session.authenticated);
        assert_eq!(session.next.as_deref(), Some("/some/path?q=1"));
    }

    #[tokio::test]
    async fn authenticated_request_reaches_backend() {
        let backend = spawn_backend().await;
        let proxy = test_proxy(&format!("http://{backend}/"), None, ".*", "/");

        let cookie = proxy
            .key
            .seal(&Session {
                authenticated: true,
                email: Some("test@example.com".to_string()),
                next: None,
            })
            .expect("seal session");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/some/path", Some(&cookie)))
            .await
            .expect("gate response");

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("x-foo").map(HeaderValue::as_bytes),
            Some(&b"bar"[..])
        );
        assert!(res
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .any(|value| value.as_bytes().starts_with(b"flavor=")));

        let forwarded_for = res
            .headers()
            .get("x-echo-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .expect("backend saw x-forwarded-for");
        assert!(forwarded_for.contains("127.0.0.1"));

        assert_eq!(body_string(res).await, "I am the backend");
    }

    #[tokio::test]
    async fn request_outside_protected_prefix_is_not_found() {
        let proxy = test_proxy("http://127.0.0.1:1/", None, ".*", "/app");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/other", None))
            .await
            .expect("gate response");

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn callback_without_code_is_bad_request() {
        let proxy = test_proxy("http://127.0.0.1:1/", None, ".*", "/");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/oauth2callback", None))
            .await
            .expect("callback response");

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn callback_with_rejected_code_is_bad_request() {
        let provider = spawn_provider(true, "").await;
        let proxy = test_proxy("http://127.0.0.1:1/", Some(provider), ".*", "/");

        let cookie = proxy
            .key
            .seal(&Session {
                authenticated: false,
                email: None,
                next: Some("/some/path".to_string()),
            })
            .expect("seal session");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/oauth2callback?code=bad", Some(&cookie)))
            .await
            .expect("callback response");

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        // the session must not have been touched
        assert_eq!(session_cookie(&res), None);
    }

    #[tokio::test]
    async fn callback_with_unmatched_identity_is_forbidden() {
        let provider = spawn_provider(false, "test@other.com").await;
        let proxy = test_proxy(
            "http://127.0.0.1:1/",
            Some(provider),
            r".*@example\.com",
            "/",
        );

        let res = proxy
            .app
            .clone()
            .oneshot(request("/oauth2callback?code=good", None))
            .await
            .expect("callback response");

        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(session_cookie(&res), None);
    }

    #[tokio::test]
    async fn callback_completes_login_and_redirects_to_next() {
        let provider = spawn_provider(false, "test@example.com").await;
        let proxy = test_proxy(
            "http://127.0.0.1:1/",
            Some(provider),
            r".*@example\.com",
            "/",
        );

        let cookie = proxy
            .key
            .seal(&Session {
                authenticated: false,
                email: None,
                next: Some("/some/path".to_string()),
            })
            .expect("seal session");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/oauth2callback?code=good", Some(&cookie)))
            .await
            .expect("callback response");

        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(location(&res), "/some/path");

        let cookie = session_cookie(&res).expect("session cookie");
        let session = proxy.key.open(&cookie).expect("open session");
        assert!(session.authenticated);
        assert_eq!(session.email.as_deref(), Some("test@example.com"));
        assert_eq!(session.next, None);
    }

    #[tokio::test]
    async fn callback_without_stored_next_redirects_to_protect_root() {
        let provider = spawn_provider(false, "test@example.com").await;
        let proxy = test_proxy("http://127.0.0.1:1/", Some(provider), ".*", "/");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/oauth2callback?code=good", None))
            .await
            .expect("callback response");

        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(location(&res), "/");
    }

    #[tokio::test]
    async fn tampered_cookie_is_treated_as_logged_out() {
        let proxy = test_proxy("http://127.0.0.1:1/", None, ".*", "/");

        let cookie = proxy
            .key
            .seal(&Session {
                authenticated: true,
                email: Some("test@example.com".to_string()),
                next: None,
            })
            .expect("seal session");
        let mut tampered = cookie.into_bytes();
        let middle = tampered.len() / 2;
        tampered[middle] ^= 0x01;
        let tampered = String::from_utf8(tampered).expect("ascii cookie");

        let res = proxy
            .app
            .clone()
            .oneshot(request("/some/path", Some(&tampered)))
            .await
            .expect("gate response");

        // not proxied: back to the login redirect
        assert_eq!(res.status(), StatusCode::FOUND);
        assert!(location(&res).starts_with(AUTH_URL));
    }

    #[tokio::test]
    async fn full_login_round_trip() {
        let backend = spawn_backend().await;
        let provider = spawn_provider(false, "test@example.com").await;
        let proxy = test_proxy(
            &format!("http://{backend}/"),
            Some(provider),
            r".*@example\.com",
            "/",
        );

        // first visit: bounced to the provider, destination remembered
        let res = proxy
            .app
            .clone()
            .oneshot(request("/reports/42", None))
            .await
            .expect("gate response");
        assert_eq!(res.status(), StatusCode::FOUND);
        let pending = session_cookie(&res).expect("pending session cookie");

        // provider redirects back with a code
        let res = proxy
            .app
            .clone()
            .oneshot(request("/oauth2callback?code=good", Some(&pending)))
            .await
            .expect("callback response");
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(location(&res), "/reports/42");
        let authenticated = session_cookie(&res).expect("authenticated session cookie");

        // the remembered destination now proxies through
        let res = proxy
            .app
            .clone()
            .oneshot(request("/reports/42", Some(&authenticated)))
            .await
            .expect("gate response");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_string(res).await, "I am the backend");
    }
}
