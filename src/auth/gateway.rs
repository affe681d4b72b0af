//! Auth Gateway
//! Mission: Compose credential checks and token issuance into login flows

use crate::auth::deadline::with_deadline;
use crate::auth::jwt::TokenService;
use crate::auth::models::{
    AuthenticatedPrincipal, NewPrincipal, Principal, Role, TokenPair, TokenType,
};
use crate::auth::password::PasswordHasher;
use crate::auth::user_store::CredentialStore;
use crate::error::{AuthError, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct AuthGateway {
    credentials: Arc<dyn CredentialStore>,
    tokens: Arc<TokenService>,
    hasher: PasswordHasher,
    store_timeout: Duration,
    // Verified against when the username is unknown, so both paths cost one bcrypt check
    dummy_hash: String,
}

impl AuthGateway {
    pub async fn new(
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<TokenService>,
        hasher: PasswordHasher,
    ) -> Result<Self, AuthError> {
        let dummy_hash = hasher.hash(&Uuid::new_v4().to_string()).await?;
        let store_timeout = tokens.settings().store_timeout;
        Ok(Self {
            credentials,
            tokens,
            hasher,
            store_timeout,
            dummy_hash,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.tokens.now()
    }

    async fn store<T, F>(&self, op: &'static str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        with_deadline(self.store_timeout, op, fut)
            .await
            .map_err(AuthError::from)
    }

    async fn find(&self, id: Uuid) -> Result<Principal, AuthError> {
        self.store("credentials.find_by_id", self.credentials.find_by_id(id))
            .await?
            .ok_or(AuthError::PrincipalNotFound)
    }

    pub async fn register(&self, input: NewPrincipal) -> Result<Principal, AuthError> {
        let username = input.username.trim().to_string();
        if username.is_empty() {
            return Err(AuthError::InvalidRequest("username must not be empty".into()));
        }
        PasswordHasher::check_strength(&input.password)?;

        let roles = if input.roles.is_empty() {
            BTreeSet::from([Role::User])
        } else {
            input.roles
        };
        let now = self.now();
        let principal = Principal {
            id: Uuid::new_v4(),
            username,
            email: input.email.filter(|e| !e.trim().is_empty()),
            password_hash: self.hasher.hash(&input.password).await?,
            roles,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        self.store("credentials.create", self.credentials.create(&principal))
            .await?;
        info!(
            "✅ Principal registered: {} ({})",
            principal.username, principal.id
        );
        Ok(principal)
    }

    /// Password grant.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair, AuthError> {
        let found = self
            .store(
                "credentials.find_by_username",
                self.credentials.find_by_username(username.trim()),
            )
            .await?;

        let principal = match found {
            Some(principal) => principal,
            None => {
                self.hasher.verify(password, &self.dummy_hash).await;
                warn!("❌ Failed login attempt: unknown user {}", username);
                return Err(AuthError::Unauthenticated);
            }
        };

        if !self.hasher.verify(password, &principal.password_hash).await {
            warn!("❌ Failed login attempt: {}", principal.username);
            return Err(AuthError::Unauthenticated);
        }
        if !principal.enabled {
            warn!("❌ Login refused for disabled account {}", principal.username);
            return Err(AuthError::Unauthenticated);
        }

        let pair = self.tokens.issue_pair(&principal).await?;
        info!("🔐 Login successful: {} ({})", principal.username, principal.id);
        Ok(pair)
    }

    /// Spend a refresh token and reissue with the principal's current roles.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let holder = self.tokens.redeem_refresh(refresh_token).await?;

        let principal = match self.find(holder.id).await {
            Ok(principal) if principal.enabled => principal,
            Ok(_) | Err(AuthError::PrincipalNotFound) => {
                warn!("Refresh refused for {}: account gone or disabled", holder.id);
                return Err(AuthError::InvalidRefreshToken);
            }
            Err(e) => return Err(e),
        };

        let pair = self.tokens.issue_pair(&principal).await?;
        debug!("Rotated refresh token for {}", principal.username);
        Ok(pair)
    }

    /// Revoke the access token and, when given, the refresh token issued with it.
    pub async fn logout(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let holder = self.tokens.identify(access_token, TokenType::Access)?;

        if let Some(refresh_token) = refresh_token {
            let refresh_holder = self
                .tokens
                .identify(refresh_token, TokenType::Refresh)
                .map_err(|_| AuthError::InvalidRefreshToken)?;
            if refresh_holder.id != holder.id {
                warn!(
                    "Logout by {} presented a refresh token of {}",
                    holder.id, refresh_holder.id
                );
                return Err(AuthError::InvalidRefreshToken);
            }
            self.tokens
                .revoke(refresh_token, TokenType::Refresh)
                .await?;
        }

        self.tokens.revoke(access_token, TokenType::Access).await?;
        info!("👋 Logout: {} ({})", holder.username, holder.id);
        Ok(())
    }

    pub async fn authenticate(
        &self,
        access_token: &str,
    ) -> Result<AuthenticatedPrincipal, AuthError> {
        self.tokens.validate(access_token).await
    }

    /// Change a password. Every outstanding session of the principal is revoked.
    pub async fn rotate_credentials(
        &self,
        id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<usize, AuthError> {
        let mut principal = self.find(id).await?;
        if !self
            .hasher
            .verify(current_password, &principal.password_hash)
            .await
        {
            warn!("❌ Credential rotation refused for {}", principal.username);
            return Err(AuthError::Unauthenticated);
        }
        PasswordHasher::check_strength(new_password)?;

        principal.password_hash = self.hasher.hash(new_password).await?;
        principal.updated_at = self.now();
        if !self
            .store("credentials.update", self.credentials.update(&principal))
            .await?
        {
            return Err(AuthError::PrincipalNotFound);
        }

        let revoked = self.tokens.revoke_all(id).await?;
        info!(
            "🔑 Credentials rotated for {}, {} sessions revoked",
            principal.username, revoked
        );
        Ok(revoked)
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Principal, AuthError> {
        let mut principal = self.find(id).await?;
        principal.enabled = enabled;
        principal.updated_at = self.now();
        if !self
            .store("credentials.update", self.credentials.update(&principal))
            .await?
        {
            return Err(AuthError::PrincipalNotFound);
        }

        if !enabled {
            let revoked = self.tokens.revoke_all(id).await?;
            info!(
                "🚫 Account disabled: {}, {} sessions revoked",
                principal.username, revoked
            );
        } else {
            info!("Account enabled: {}", principal.username);
        }
        Ok(principal)
    }

    pub async fn remove_account(&self, id: Uuid) -> Result<(), AuthError> {
        if !self
            .store("credentials.delete", self.credentials.delete(id))
            .await?
        {
            return Err(AuthError::PrincipalNotFound);
        }
        let revoked = self.tokens.revoke_all(id).await?;
        info!("🗑️  Principal removed: {}, {} sessions revoked", id, revoked);
        Ok(())
    }

    pub async fn list_principals(&self) -> Result<Vec<Principal>, AuthError> {
        self.store("credentials.list", self.credentials.list())
            .await
    }

    /// Create an admin from configured credentials when no admin exists yet.
    ///
    /// Returns the new principal, or `None` when nothing had to be created.
    pub async fn ensure_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Principal>, AuthError> {
        let principals = self.list_principals().await?;
        if principals.iter().any(|p| p.has_role(Role::Admin)) {
            debug!("Admin already present, skipping bootstrap");
            return Ok(None);
        }
        if principals.iter().any(|p| p.username == username.trim()) {
            warn!(
                "Bootstrap admin {} exists without the admin role; leaving it untouched",
                username
            );
            return Ok(None);
        }

        let admin = self
            .register(NewPrincipal {
                username: username.to_string(),
                password: password.to_string(),
                email: None,
                roles: BTreeSet::from([Role::User, Role::Admin]),
            })
            .await?;
        info!("👤 Bootstrap admin created: {}", admin.username);
        Ok(Some(admin))
    }
}
