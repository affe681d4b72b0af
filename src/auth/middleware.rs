//! Authentication Middleware
//! Mission: Protect handlers with bearer token validation

use crate::auth::gateway::AuthGateway;
use crate::auth::models::AuthenticatedPrincipal;
use crate::error::AuthError;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

/// Bearer token from the Authorization header, if present and well-formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Rejects the request unless it carries a valid access token.
///
/// Mount with `axum::middleware::from_fn_with_state(gateway, require_auth)`.
pub async fn require_auth(
    State(gateway): State<Arc<AuthGateway>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(req.headers())
        .map(str::to_owned)
        .ok_or_else(|| {
            debug!("Request without bearer token");
            AuthError::Unauthenticated
        })?;

    let principal = gateway.authenticate(&token).await?;

    // Handlers read the principal back with `extract_principal` or `Extension`
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

/// Allows anonymous requests but attaches the principal when a valid token is sent.
pub async fn optional_auth(
    State(gateway): State<Arc<AuthGateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(req.headers()).map(str::to_owned) {
        if let Ok(principal) = gateway.authenticate(&token).await {
            req.extensions_mut().insert(principal);
        }
    }

    next.run(req).await
}

/// Principal placed by `require_auth`
pub fn extract_principal(req: &Request) -> Option<&AuthenticatedPrincipal> {
    req.extensions().get::<AuthenticatedPrincipal>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::SystemClock;
    use crate::auth::jwt::{SigningKeys, TokenService, TokenSettings};
    use crate::auth::models::{NewPrincipal, TokenPair};
    use crate::auth::password::PasswordHasher;
    use crate::auth::session_cache::InMemorySessionCache;
    use crate::auth::user_store::SqliteCredentialStore;
    use axum::{
        body::{to_bytes, Body},
        http::{Request as HttpRequest, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Router,
    };
    use jsonwebtoken::Algorithm;
    use std::collections::BTreeSet;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    async fn gateway_with_login() -> (Arc<AuthGateway>, TokenPair, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let credentials =
            Arc::new(SqliteCredentialStore::new(db.path().to_str().unwrap()).unwrap());
        let clock = Arc::new(SystemClock);
        let tokens = Arc::new(TokenService::new(
            SigningKeys::hmac(Algorithm::HS256, b"middleware-test-secret-long-enough!!").unwrap(),
            TokenSettings::default(),
            Arc::new(InMemorySessionCache::new(clock.clone())),
            clock,
        ));
        let gateway = Arc::new(
            AuthGateway::new(credentials, tokens, PasswordHasher::new(4))
                .await
                .unwrap(),
        );
        gateway
            .register(NewPrincipal {
                username: "alice".into(),
                password: "password123".into(),
                email: None,
                roles: BTreeSet::new(),
            })
            .await
            .unwrap();
        let pair = gateway.login("alice", "password123").await.unwrap();
        (gateway, pair, db)
    }

    async fn whoami(req: Request) -> String {
        extract_principal(&req)
            .map(|p| p.username.clone())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    fn protected(gateway: Arc<AuthGateway>) -> Router {
        Router::new()
            .route("/me", get(whoami))
            .layer(from_fn_with_state(gateway, require_auth))
    }

    fn request(token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri("/me");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let (gateway, pair, _db) = gateway_with_login().await;
        let response = protected(gateway)
            .oneshot(request(Some(&pair.access.token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "alice");
    }

    #[tokio::test]
    async fn test_denials_look_the_same() {
        let (gateway, pair, _db) = gateway_with_login().await;

        let missing = protected(gateway.clone()).oneshot(request(None)).await.unwrap();
        let garbage = protected(gateway.clone())
            .oneshot(request(Some("garbage")))
            .await
            .unwrap();
        let refresh_as_access = protected(gateway.clone())
            .oneshot(request(Some(&pair.refresh.token)))
            .await
            .unwrap();

        gateway.logout(&pair.access.token, None).await.unwrap();
        let revoked = protected(gateway)
            .oneshot(request(Some(&pair.access.token)))
            .await
            .unwrap();

        for response in [missing, garbage, refresh_as_access, revoked] {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_text(response).await, "Authentication failed");
        }
    }

    #[tokio::test]
    async fn test_optional_auth() {
        let (gateway, pair, _db) = gateway_with_login().await;
        let app = Router::new()
            .route("/me", get(whoami))
            .layer(from_fn_with_state(gateway, optional_auth));

        let anonymous = app.clone().oneshot(request(None)).await.unwrap();
        assert_eq!(body_text(anonymous).await, "anonymous");

        let known = app.oneshot(request(Some(&pair.access.token))).await.unwrap();
        assert_eq!(body_text(known).await, "alice");
    }
}
