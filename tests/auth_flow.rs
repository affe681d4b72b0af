//! End-to-end flow over the SQLite credential store and session cache.

use jsonwebtoken::Algorithm;
use jwt_auth::auth::{
    models::NewPrincipal, AuthGateway, PasswordHasher, Role, SigningKeys, SqliteCredentialStore,
    SqliteSessionCache, SystemClock, TokenService, TokenSettings,
};
use jwt_auth::AuthError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

const SECRET: &[u8] = b"integration-test-secret-at-least-32-bytes";

/// A fresh gateway over the same database files, as a restarted process would see them.
async fn boot(dir: &TempDir) -> AuthGateway {
    let clock = Arc::new(SystemClock);
    let credentials = Arc::new(
        SqliteCredentialStore::new(dir.path().join("auth.db").to_str().unwrap()).unwrap(),
    );
    let sessions = Arc::new(
        SqliteSessionCache::new(
            dir.path().join("sessions.db").to_str().unwrap(),
            clock.clone(),
        )
        .unwrap(),
    );
    let tokens = Arc::new(TokenService::new(
        SigningKeys::hmac(Algorithm::HS512, SECRET).unwrap(),
        TokenSettings::default(),
        sessions,
        clock,
    ));
    AuthGateway::new(credentials, tokens, PasswordHasher::new(4))
        .await
        .unwrap()
}

#[tokio::test]
async fn revocation_survives_restart() {
    let dir = TempDir::new().unwrap();

    let first = boot(&dir).await;
    first
        .register(NewPrincipal {
            username: "alice".into(),
            password: "password123".into(),
            email: Some("alice@example.com".into()),
            roles: BTreeSet::new(),
        })
        .await
        .unwrap();
    let pair = first.login("alice", "password123").await.unwrap();
    let keep = first.login("alice", "password123").await.unwrap();
    first.logout(&pair.access.token, Some(&pair.refresh.token)).await.unwrap();
    drop(first);

    let second = boot(&dir).await;
    assert!(matches!(
        second.authenticate(&pair.access.token).await,
        Err(AuthError::Revoked)
    ));
    assert!(matches!(
        second.refresh(&pair.refresh.token).await,
        Err(AuthError::InvalidRefreshToken)
    ));

    // A logged-out refresh token is refused without touching other sessions
    assert!(second.authenticate(&keep.access.token).await.is_ok());
    let rotated = second.refresh(&keep.refresh.token).await.unwrap();
    drop(second);

    let third = boot(&dir).await;
    assert!(third.authenticate(&keep.access.token).await.is_ok());
    assert!(matches!(
        third.refresh(&keep.refresh.token).await,
        Err(AuthError::InvalidRefreshToken)
    ));
    assert!(third.authenticate(&rotated.access.token).await.is_ok());
}

#[tokio::test]
async fn refresh_rotation_across_instances() {
    let dir = TempDir::new().unwrap();

    let first = boot(&dir).await;
    let admin = first
        .ensure_admin("root", "rootpassword")
        .await
        .unwrap()
        .unwrap();
    assert!(admin.has_role(Role::Admin));
    let pair = first.login("root", "rootpassword").await.unwrap();

    // Two instances race for the same refresh token; exactly one wins
    let second = boot(&dir).await;
    let (a, b) = tokio::join!(
        first.refresh(&pair.refresh.token),
        second.refresh(&pair.refresh.token)
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
}

#[tokio::test]
async fn account_lifecycle() {
    let dir = TempDir::new().unwrap();
    let gateway = boot(&dir).await;

    let bob = gateway
        .register(NewPrincipal {
            username: "bob".into(),
            password: "password123".into(),
            email: None,
            roles: BTreeSet::from([Role::Manager]),
        })
        .await
        .unwrap();

    let pair = gateway.login("bob", "password123").await.unwrap();
    let principal = gateway.authenticate(&pair.access.token).await.unwrap();
    assert!(principal.has_role(Role::Manager));
    assert!(!principal.has_role(Role::User));

    gateway
        .rotate_credentials(bob.id, "password123", "an-even-better-one")
        .await
        .unwrap();
    assert!(gateway.authenticate(&pair.access.token).await.is_err());

    gateway.remove_account(bob.id).await.unwrap();
    assert!(matches!(
        gateway.login("bob", "an-even-better-one").await,
        Err(AuthError::Unauthenticated)
    ));
    assert!(gateway.list_principals().await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_refresh_after_rotation_keeps_new_session() {
    let dir = TempDir::new().unwrap();
    let gateway = boot(&dir).await;

    let alice = gateway
        .register(NewPrincipal {
            username: "alice".into(),
            password: "password123".into(),
            email: None,
            roles: BTreeSet::new(),
        })
        .await
        .unwrap();
    let old_device = gateway.login("alice", "password123").await.unwrap();

    gateway
        .rotate_credentials(alice.id, "password123", "newpassword456")
        .await
        .unwrap();
    let fresh = gateway.login("alice", "newpassword456").await.unwrap();

    assert!(matches!(
        gateway.refresh(&old_device.refresh.token).await,
        Err(AuthError::InvalidRefreshToken)
    ));
    assert!(gateway.authenticate(&fresh.access.token).await.is_ok());
    assert!(gateway.refresh(&fresh.refresh.token).await.is_ok());
}
