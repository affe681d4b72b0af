//! Authentication Handlers
//! Mission: Expose token grants and principal management as axum handlers
//!
//! Only handler functions live here. The host application decides paths and
//! layers `require_auth` in front of everything except the two token grants.

use crate::auth::{
    gateway::AuthGateway,
    middleware::{bearer_token, extract_principal},
    models::{
        AuthenticatedPrincipal, ChangePasswordRequest, LogoutRequest, NewPrincipal,
        PasswordTokenRequest, PrincipalResponse, RefreshTokenRequest, Role, TokenResponse,
    },
};
use crate::error::AuthError;
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

fn require_role(principal: &AuthenticatedPrincipal, role: Role) -> Result<(), AuthError> {
    if principal.has_role(role) {
        Ok(())
    } else {
        info!(
            "⛔ {} lacks role {} for an administrative call",
            principal.username,
            role.as_str()
        );
        Err(AuthError::Forbidden)
    }
}

fn parse_principal_id(raw: &str) -> Result<Uuid, AuthError> {
    Uuid::parse_str(raw).map_err(|_| AuthError::InvalidRequest("invalid principal id".into()))
}

/// Password grant. Public.
pub async fn password_token(
    State(gateway): State<Arc<AuthGateway>>,
    Json(payload): Json<PasswordTokenRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let pair = gateway.login(&payload.username, &payload.password).await?;
    Ok(Json(TokenResponse::from_pair(&pair, gateway.now())))
}

/// Refresh grant. Public.
pub async fn refresh_token(
    State(gateway): State<Arc<AuthGateway>>,
    Json(payload): Json<RefreshTokenRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let pair = gateway.refresh(&payload.refresh_token).await?;
    Ok(Json(TokenResponse::from_pair(&pair, gateway.now())))
}

/// Revokes the bearer access token, plus the refresh token when the body names one.
pub async fn logout(
    State(gateway): State<Arc<AuthGateway>>,
    headers: HeaderMap,
    body: Option<Json<LogoutRequest>>,
) -> Result<StatusCode, AuthError> {
    let access_token = bearer_token(&headers).ok_or(AuthError::Unauthenticated)?;
    let refresh_token = body.and_then(|Json(b)| b.refresh_token);

    gateway
        .logout(access_token, refresh_token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Principal behind the current token, read from the claims alone.
pub async fn current_principal(req: Request) -> Result<Json<PrincipalResponse>, AuthError> {
    let principal = extract_principal(&req).ok_or(AuthError::Unauthenticated)?;
    Ok(Json(PrincipalResponse::from_authenticated(principal)))
}

/// Create a principal (Admin only)
pub async fn register(
    State(gateway): State<Arc<AuthGateway>>,
    Extension(caller): Extension<AuthenticatedPrincipal>,
    Json(payload): Json<NewPrincipal>,
) -> Result<(StatusCode, Json<PrincipalResponse>), AuthError> {
    require_role(&caller, Role::Admin)?;

    let principal = gateway.register(payload).await?;
    info!("✅ {} created principal {}", caller.username, principal.username);

    Ok((
        StatusCode::CREATED,
        Json(PrincipalResponse::from_principal(&principal)),
    ))
}

/// List all principals (Admin only)
pub async fn list_principals(
    State(gateway): State<Arc<AuthGateway>>,
    Extension(caller): Extension<AuthenticatedPrincipal>,
) -> Result<Json<Vec<PrincipalResponse>>, AuthError> {
    require_role(&caller, Role::Admin)?;

    let principals = gateway.list_principals().await?;
    Ok(Json(
        principals.iter().map(PrincipalResponse::from_principal).collect(),
    ))
}

/// Remove a principal and revoke its sessions (Admin only)
pub async fn remove_principal(
    State(gateway): State<Arc<AuthGateway>>,
    Extension(caller): Extension<AuthenticatedPrincipal>,
    Path(principal_id): Path<String>,
) -> Result<StatusCode, AuthError> {
    require_role(&caller, Role::Admin)?;

    let id = parse_principal_id(&principal_id)?;
    if id == caller.id {
        return Err(AuthError::InvalidRequest(
            "cannot remove your own account".into(),
        ));
    }

    gateway.remove_account(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

/// Enable or disable a principal (Admin only)
pub async fn set_principal_enabled(
    State(gateway): State<Arc<AuthGateway>>,
    Extension(caller): Extension<AuthenticatedPrincipal>,
    Path(principal_id): Path<String>,
    Json(payload): Json<SetEnabledRequest>,
) -> Result<Json<PrincipalResponse>, AuthError> {
    require_role(&caller, Role::Admin)?;

    let id = parse_principal_id(&principal_id)?;
    let principal = gateway.set_enabled(id, payload.enabled).await?;
    Ok(Json(PrincipalResponse::from_principal(&principal)))
}

/// Change the caller's own password; every session of the caller is revoked.
pub async fn change_password(
    State(gateway): State<Arc<AuthGateway>>,
    Extension(caller): Extension<AuthenticatedPrincipal>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AuthError> {
    gateway
        .rotate_credentials(caller.id, &payload.current_password, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::SystemClock;
    use crate::auth::jwt::{SigningKeys, TokenService, TokenSettings};
    use crate::auth::password::PasswordHasher;
    use crate::auth::session_cache::InMemorySessionCache;
    use crate::auth::user_store::SqliteCredentialStore;
    use axum::{body::Body, http::header::AUTHORIZATION, response::IntoResponse};
    use jsonwebtoken::Algorithm;
    use std::collections::BTreeSet;
    use tempfile::NamedTempFile;

    struct Fixture {
        gateway: Arc<AuthGateway>,
        admin: AuthenticatedPrincipal,
        user: AuthenticatedPrincipal,
        _db: NamedTempFile,
    }

    async fn fixture() -> Fixture {
        let db = NamedTempFile::new().unwrap();
        let credentials =
            Arc::new(SqliteCredentialStore::new(db.path().to_str().unwrap()).unwrap());
        let clock = Arc::new(SystemClock);
        let tokens = Arc::new(TokenService::new(
            SigningKeys::hmac(Algorithm::HS384, b"api-test-secret-that-is-long-enough-ok").unwrap(),
            TokenSettings::default(),
            Arc::new(InMemorySessionCache::new(clock.clone())),
            clock,
        ));
        let gateway = Arc::new(
            AuthGateway::new(credentials, tokens, PasswordHasher::new(4))
                .await
                .unwrap(),
        );

        gateway.ensure_admin("root", "rootpassword").await.unwrap();
        gateway
            .register(NewPrincipal {
                username: "alice".into(),
                password: "password123".into(),
                email: None,
                roles: BTreeSet::new(),
            })
            .await
            .unwrap();

        let admin = login_as(&gateway, "root", "rootpassword").await;
        let user = login_as(&gateway, "alice", "password123").await;
        Fixture {
            gateway,
            admin,
            user,
            _db: db,
        }
    }

    async fn login_as(
        gateway: &AuthGateway,
        username: &str,
        password: &str,
    ) -> AuthenticatedPrincipal {
        let pair = gateway.login(username, password).await.unwrap();
        gateway.authenticate(&pair.access.token).await.unwrap()
    }

    fn new_principal(username: &str) -> NewPrincipal {
        NewPrincipal {
            username: username.into(),
            password: "password123".into(),
            email: Some(format!("{username}@example.com")),
            roles: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_password_and_refresh_grants() {
        let f = fixture().await;

        let Json(tokens) = password_token(
            State(f.gateway.clone()),
            Json(PasswordTokenRequest {
                username: "alice".into(),
                password: "password123".into(),
            }),
        )
        .await
        .unwrap();
        assert!(tokens.expires_in > 0 && tokens.expires_in <= 15 * 60);

        let Json(rotated) = refresh_token(
            State(f.gateway.clone()),
            Json(RefreshTokenRequest {
                refresh_token: tokens.refresh_token.clone(),
            }),
        )
        .await
        .unwrap();
        assert_ne!(rotated.refresh_token, tokens.refresh_token);

        let replay = refresh_token(
            State(f.gateway.clone()),
            Json(RefreshTokenRequest {
                refresh_token: tokens.refresh_token,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(replay.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_password_is_uniform_401() {
        let f = fixture().await;
        let err = password_token(
            State(f.gateway.clone()),
            Json(PasswordTokenRequest {
                username: "alice".into(),
                password: "nope-nope".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_handler() {
        let f = fixture().await;
        let pair = f.gateway.login("alice", "password123").await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {}", pair.access.token).parse().unwrap(),
        );
        let status = logout(
            State(f.gateway.clone()),
            headers,
            Some(Json(LogoutRequest {
                refresh_token: Some(pair.refresh.token.clone()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(f.gateway.authenticate(&pair.access.token).await.is_err());
        assert!(f.gateway.refresh(&pair.refresh.token).await.is_err());

        let missing = logout(State(f.gateway.clone()), HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(missing.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_current_principal() {
        let f = fixture().await;
        let mut req = Request::new(Body::empty());
        assert!(current_principal(Request::new(Body::empty())).await.is_err());

        req.extensions_mut().insert(f.user.clone());
        let Json(me) = current_principal(req).await.unwrap();
        assert_eq!(me.username, "alice");
        assert_eq!(me.roles, vec![Role::User]);
    }

    #[tokio::test]
    async fn test_admin_handlers_require_admin() {
        let f = fixture().await;

        let err = list_principals(State(f.gateway.clone()), Extension(f.user.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

        let err = register(
            State(f.gateway.clone()),
            Extension(f.user.clone()),
            Json(new_principal("bob")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

        let err = remove_principal(
            State(f.gateway.clone()),
            Extension(f.user.clone()),
            Path(f.admin.id.to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_manages_principals() {
        let f = fixture().await;

        let (status, Json(bob)) = register(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Json(new_principal("bob")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(bob.email.as_deref(), Some("bob@example.com"));

        let err = register(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Json(new_principal("bob")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let Json(all) = list_principals(State(f.gateway.clone()), Extension(f.admin.clone()))
            .await
            .unwrap();
        let names: Vec<&str> = all.iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "root"]);

        let Json(disabled) = set_principal_enabled(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Path(bob.id.clone()),
            Json(SetEnabledRequest { enabled: false }),
        )
        .await
        .unwrap();
        assert!(!disabled.enabled);

        let status = remove_principal(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Path(bob.id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = remove_principal(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Path(bob.id),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remove_principal_guards() {
        let f = fixture().await;

        let err = remove_principal(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Path("not-a-uuid".to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = remove_principal(
            State(f.gateway.clone()),
            Extension(f.admin.clone()),
            Path(f.admin.id.to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_change_password_handler() {
        let f = fixture().await;

        let status = change_password(
            State(f.gateway.clone()),
            Extension(f.user.clone()),
            Json(ChangePasswordRequest {
                current_password: "password123".into(),
                new_password: "brand-new-password".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(f.gateway.login("alice", "brand-new-password").await.is_ok());

        let err = change_password(
            State(f.gateway.clone()),
            Extension(f.user.clone()),
            Json(ChangePasswordRequest {
                current_password: "brand-new-password".into(),
                new_password: "short".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
