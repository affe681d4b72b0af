//! JWT Token Service
//! Mission: Issue, validate and rotate signed tokens
//!
//! Validation order is fixed: signature and format, token type, expiry, then
//! the session cache. An expired token is reported as expired even when it
//! was also revoked, and the cache is only consulted for tokens that would
//! otherwise be accepted.

use crate::auth::clock::Clock;
use crate::auth::deadline::with_deadline;
use crate::auth::models::{
    AuthenticatedPrincipal, Claims, IssuedToken, Principal, TokenPair, TokenType, TokenVerdict,
};
use crate::auth::session_cache::{Redemption, SessionCache, SessionRecord};
use crate::error::{AuthError, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shortest HMAC secret accepted, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Key material, built once at startup and never mutated.
#[derive(Clone)]
pub struct SigningKeys {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SigningKeys {
    /// HMAC keys (HS256, HS384 or HS512) from a shared secret.
    pub fn hmac(algorithm: Algorithm, secret: &[u8]) -> Result<Self, AuthError> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(AuthError::SigningError(format!(
                "{algorithm:?} is not an HMAC algorithm"
            )));
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::SigningError(format!(
                "secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        Ok(Self {
            algorithm,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        })
    }

    /// RS256 keys from a PEM-encoded private/public pair.
    pub fn rsa(private_pem: &[u8], public_pem: &[u8]) -> Result<Self, AuthError> {
        let encoding = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| AuthError::SigningError(format!("invalid RSA private key: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)
            .map_err(|e| AuthError::SigningError(format!("invalid RSA public key: {e}")))?;
        Ok(Self {
            algorithm: Algorithm::RS256,
            encoding,
            decoding,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

/// Token lifetimes and claims policy.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub issuer: String,
    pub access_ttl: ChronoDuration,
    pub refresh_ttl: ChronoDuration,
    pub store_timeout: Duration,
    /// Revoke every session of a principal when a spent refresh token comes back.
    pub revoke_sessions_on_replay: bool,
    /// A spent refresh token that comes back sooner than this is refused
    /// without counting as a replay. Must cover `store_timeout`.
    pub replay_grace: ChronoDuration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: "jwt-auth".to_string(),
            access_ttl: ChronoDuration::minutes(15),
            refresh_ttl: ChronoDuration::days(7),
            store_timeout: Duration::from_secs(2),
            revoke_sessions_on_replay: true,
            replay_grace: ChronoDuration::seconds(10),
        }
    }
}

impl TokenSettings {
    pub fn ttl(&self, token_type: TokenType) -> ChronoDuration {
        match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        }
    }
}

pub struct TokenService {
    keys: SigningKeys,
    settings: TokenSettings,
    sessions: Arc<dyn SessionCache>,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(
        keys: SigningKeys,
        settings: TokenSettings,
        sessions: Arc<dyn SessionCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            algorithm = ?keys.algorithm(),
            access_ttl_secs = settings.access_ttl.num_seconds(),
            refresh_ttl_secs = settings.refresh_ttl.num_seconds(),
            "🔑 Token service ready"
        );
        Self {
            keys,
            settings,
            sessions,
            clock,
        }
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn store<T, F>(&self, op: &'static str, fut: F) -> Result<T, AuthError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        with_deadline(self.settings.store_timeout, op, fut)
            .await
            .map_err(AuthError::from)
    }

    /// Sign a token for `principal` and register its session record.
    pub async fn issue(
        &self,
        principal: &Principal,
        token_type: TokenType,
    ) -> Result<IssuedToken, AuthError> {
        let now = self.clock.now();
        let expires_at = now + self.settings.ttl(token_type);
        let token_id = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: principal.id.to_string(),
            username: principal.username.clone(),
            roles: principal.roles.iter().copied().collect(),
            jti: token_id.clone(),
            typ: token_type,
            iss: self.settings.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(self.keys.algorithm), &claims, &self.keys.encoding)
            .map_err(|e| AuthError::SigningError(e.to_string()))?;

        // The token only leaves this function once the cache knows about it.
        self.store(
            "session.register",
            self.sessions.register(SessionRecord {
                token_id: token_id.clone(),
                principal_id: principal.id,
                token_type,
                expires_at,
            }),
        )
        .await?;

        debug!(
            "Issued {} token {} for {} ({})",
            token_type.as_str(),
            token_id,
            principal.username,
            principal.id
        );

        Ok(IssuedToken {
            token,
            token_id,
            token_type,
            expires_at,
        })
    }

    pub async fn issue_pair(&self, principal: &Principal) -> Result<TokenPair, AuthError> {
        let access = self.issue(principal, TokenType::Access).await?;
        let refresh = self.issue(principal, TokenType::Refresh).await?;
        Ok(TokenPair { access, refresh })
    }

    /// Stateless checks: signature, format, type and expiry.
    fn verify_claims(&self, token: &str, expected: TokenType) -> Result<Claims, TokenVerdict> {
        let mut validation = Validation::new(self.keys.algorithm);
        validation.set_issuer(&[self.settings.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        // Expiry is judged against the injected clock below.
        validation.validate_exp = false;

        let claims = decode::<Claims>(token, &self.keys.decoding, &validation)
            .map_err(|e| map_jwt_error(&e))?
            .claims;

        if claims.typ != expected {
            debug!(
                "Rejected {} token presented as {}",
                claims.typ.as_str(),
                expected.as_str()
            );
            return Err(TokenVerdict::Malformed);
        }
        if claims.exp <= self.clock.now().timestamp() {
            return Err(TokenVerdict::Expired);
        }
        Ok(claims)
    }

    /// Full check of a presented token, including revocation.
    ///
    /// Cache failures are returned as errors, never folded into a verdict.
    pub async fn inspect(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<TokenVerdict, AuthError> {
        let claims = match self.verify_claims(token, expected) {
            Ok(claims) => claims,
            Err(verdict) => return Ok(verdict),
        };

        if self
            .store("session.is_revoked", self.sessions.is_revoked(&claims.jti))
            .await?
        {
            return Ok(TokenVerdict::Revoked);
        }

        Ok(match into_principal(claims) {
            Some(principal) => TokenVerdict::Valid(principal),
            None => TokenVerdict::Malformed,
        })
    }

    /// Validate an access token.
    pub async fn validate(&self, token: &str) -> Result<AuthenticatedPrincipal, AuthError> {
        match self.inspect(token, TokenType::Access).await? {
            TokenVerdict::Valid(principal) => Ok(principal),
            TokenVerdict::Expired => Err(AuthError::ExpiredToken),
            TokenVerdict::Revoked => Err(AuthError::Revoked),
            TokenVerdict::Malformed => Err(AuthError::MalformedToken),
            TokenVerdict::InvalidSignature => Err(AuthError::InvalidSignature),
        }
    }

    /// Validate a refresh token and spend it.
    ///
    /// Exactly one caller can redeem a given refresh token. Presenting a token
    /// that was already spent is a replay; a revoked or unknown one is simply
    /// refused.
    ///
    /// A redemption that hits the store deadline may still commit, leaving the
    /// client holding a spent token it never got a pair for. Its retry lands
    /// inside `replay_grace` and is refused without revoking anything.
    pub async fn redeem_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<AuthenticatedPrincipal, AuthError> {
        let claims = self
            .verify_claims(refresh_token, TokenType::Refresh)
            .map_err(|verdict| {
                debug!("Refresh token rejected: {verdict:?}");
                AuthError::InvalidRefreshToken
            })?;

        let redemption = self
            .store("session.consume", self.sessions.consume(&claims.jti))
            .await?;

        let principal = into_principal(claims).ok_or(AuthError::InvalidRefreshToken)?;

        match redemption {
            Redemption::Redeemed => Ok(principal),
            Redemption::Rejected => {
                debug!("Refresh token {} is revoked or unknown", principal.token_id);
                Err(AuthError::InvalidRefreshToken)
            }
            Redemption::Replayed { spent_at } => {
                if self.clock.now() - spent_at < self.settings.replay_grace {
                    debug!(
                        "Refresh token {} re-presented {}s after redemption",
                        principal.token_id,
                        (self.clock.now() - spent_at).num_seconds()
                    );
                    return Err(AuthError::InvalidRefreshToken);
                }
                warn!(
                    "⚠️  Refresh token replay for {} ({}), token {}",
                    principal.username, principal.id, principal.token_id
                );
                if self.settings.revoke_sessions_on_replay {
                    let revoked = self
                        .store("session.revoke_all", self.sessions.revoke_all(principal.id))
                        .await?;
                    warn!("Revoked {} sessions of {}", revoked, principal.id);
                }
                Err(AuthError::InvalidRefreshToken)
            }
        }
    }

    /// Spend a refresh token and issue a fresh pair for the identity it carries.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let principal = self.redeem_refresh(refresh_token).await?;
        let now = self.clock.now();
        let snapshot = Principal {
            id: principal.id,
            username: principal.username,
            email: None,
            password_hash: String::new(),
            roles: principal.roles,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        self.issue_pair(&snapshot).await
    }

    /// Identify the holder of a token we signed, without consulting the cache.
    ///
    /// Expiry is ignored, so logout keeps working on a token that just lapsed.
    pub fn identify(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<AuthenticatedPrincipal, AuthError> {
        let claims = match self.verify_claims(token, expected) {
            Ok(claims) => claims,
            Err(TokenVerdict::Expired) => self.decode_ignoring_expiry(token, expected)?,
            Err(TokenVerdict::InvalidSignature) => return Err(AuthError::InvalidSignature),
            Err(_) => return Err(AuthError::MalformedToken),
        };
        into_principal(claims).ok_or(AuthError::MalformedToken)
    }

    /// Revoke the token's id after checking it was signed by us.
    pub async fn revoke(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<AuthenticatedPrincipal, AuthError> {
        let principal = self.identify(token, expected)?;
        self.store("session.revoke", self.sessions.revoke(&principal.token_id))
            .await?;
        debug!("Revoked {} token {}", expected.as_str(), principal.token_id);
        Ok(principal)
    }

    pub async fn revoke_all(&self, principal_id: Uuid) -> Result<usize, AuthError> {
        self.store("session.revoke_all", self.sessions.revoke_all(principal_id))
            .await
    }

    /// Drop expired session records.
    pub async fn purge_expired(&self) -> Result<usize, AuthError> {
        self.store("session.purge_expired", self.sessions.purge_expired())
            .await
    }

    fn decode_ignoring_expiry(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(self.keys.algorithm);
        validation.set_issuer(&[self.settings.issuer.as_str()]);
        validation.validate_exp = false;
        let claims = decode::<Claims>(token, &self.keys.decoding, &validation)
            .map_err(|_| AuthError::MalformedToken)?
            .claims;
        if claims.typ != expected {
            return Err(AuthError::MalformedToken);
        }
        Ok(claims)
    }
}

fn into_principal(claims: Claims) -> Option<AuthenticatedPrincipal> {
    let id = Uuid::parse_str(&claims.sub).ok()?;
    if claims.username.is_empty() || claims.roles.is_empty() {
        return None;
    }
    let expires_at = Utc.timestamp_opt(claims.exp, 0).single()?;
    Some(AuthenticatedPrincipal {
        id,
        username: claims.username,
        roles: claims.roles.into_iter().collect::<BTreeSet<_>>(),
        token_id: claims.jti,
        token_type: claims.typ,
        expires_at,
    })
}

/// Maps jsonwebtoken errors to a verdict
fn map_jwt_error(error: &jsonwebtoken::errors::Error) -> TokenVerdict {
    use jsonwebtoken::errors::ErrorKind;

    match error.kind() {
        ErrorKind::InvalidSignature => TokenVerdict::InvalidSignature,
        ErrorKind::ExpiredSignature => TokenVerdict::Expired,
        _ => TokenVerdict::Malformed,
    }
}
