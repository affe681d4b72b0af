//! Authentication Models
//! Mission: Define principals, token claims and wire DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Stored identity document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub password_hash: String, // bcrypt hash
    pub roles: BTreeSet<Role>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Principal {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Roles carried in every token
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "manager")]
    Manager,
    #[serde(rename = "admin")]
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().trim_start_matches("role_") {
            "user" => Some(Role::User),
            "manager" => Some(Role::Manager),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT Claims payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String, // principal id
    pub username: String,
    pub roles: Vec<Role>,
    pub jti: String,
    pub typ: TokenType,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Identity recovered from a token that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedPrincipal {
    pub id: Uuid,
    pub username: String,
    pub roles: BTreeSet<Role>,
    pub token_id: String,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
}

impl AuthenticatedPrincipal {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// A signed token together with the metadata its session record was registered with.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: String,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

/// Outcome of checking a presented token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenVerdict {
    Valid(AuthenticatedPrincipal),
    Expired,
    Revoked,
    Malformed,
    InvalidSignature,
}

/// Registration input
#[derive(Debug, Clone, Deserialize)]
pub struct NewPrincipal {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
}

/// Password grant request body
#[derive(Debug, Deserialize)]
pub struct PasswordTokenRequest {
    pub username: String,
    pub password: String,
}

/// Refresh grant request body
#[derive(Debug, Deserialize)]
pub struct RefreshTokenRequest {
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

/// Logout request body; the access token comes from the Authorization header.
#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: Option<String>,
}

/// Credential rotation request body
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(rename = "currentPassword")]
    pub current_password: String,
    #[serde(rename = "newPassword")]
    pub new_password: String,
}

/// Token response
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    #[serde(rename = "expiresIn")]
    pub expires_in: i64, // seconds until the access token expires
}

impl TokenResponse {
    pub fn from_pair(pair: &TokenPair, now: DateTime<Utc>) -> Self {
        Self {
            token: pair.access.token.clone(),
            refresh_token: pair.refresh.token.clone(),
            expires_in: pair.access.expires_in(now),
        }
    }
}

/// Principal response (sanitized)
#[derive(Debug, Serialize, Deserialize)]
pub struct PrincipalResponse {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<Role>,
    pub enabled: bool,
}

impl PrincipalResponse {
    pub fn from_principal(principal: &Principal) -> Self {
        Self {
            id: principal.id.to_string(),
            username: principal.username.clone(),
            email: principal.email.clone(),
            roles: principal.roles.iter().copied().collect(),
            enabled: principal.enabled,
        }
    }

    pub fn from_authenticated(principal: &AuthenticatedPrincipal) -> Self {
        Self {
            id: principal.id.to_string(),
            username: principal.username.clone(),
            email: None,
            roles: principal.roles.iter().copied().collect(),
            enabled: true,
        }
    }
}
