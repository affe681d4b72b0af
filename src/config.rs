//! Configuration
//!
//! Defaults, then an optional TOML file, then environment variables.

use crate::auth::jwt::{SigningKeys, TokenSettings};
use anyhow::{anyhow, bail, Context, Result};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: JwtConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

/// Signing and token lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Shared secret for HS256/HS384/HS512
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// PEM files, used when `algorithm` is RS256
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,

    #[serde(default = "default_issuer")]
    pub issuer: String,

    #[serde(default = "default_access_ttl_secs")]
    pub access_token_ttl_secs: i64,

    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_token_ttl_secs: i64,

    /// Revoke all sessions of a principal when a spent refresh token is replayed
    #[serde(default = "default_true")]
    pub revoke_sessions_on_replay: bool,

    /// A spent refresh token presented again within this window is refused
    /// without being treated as a replay
    #[serde(default = "default_replay_grace_secs")]
    pub replay_grace_secs: i64,
}

fn default_algorithm() -> String {
    "HS512".to_string()
}

fn default_issuer() -> String {
    "jwt-auth".to_string()
}

fn default_access_ttl_secs() -> i64 {
    15 * 60
}

fn default_refresh_ttl_secs() -> i64 {
    7 * 24 * 60 * 60
}

fn default_replay_grace_secs() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: None,
            algorithm: default_algorithm(),
            private_key_path: None,
            public_key_path: None,
            issuer: default_issuer(),
            access_token_ttl_secs: default_access_ttl_secs(),
            refresh_token_ttl_secs: default_refresh_ttl_secs(),
            revoke_sessions_on_replay: true,
            replay_grace_secs: default_replay_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Memory,
    #[default]
    Sqlite,
    Redis,
}

impl FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(SessionBackend::Memory),
            "sqlite" => Ok(SessionBackend::Sqlite),
            "redis" => Ok(SessionBackend::Redis),
            other => bail!("unknown session backend '{other}' (expected memory, sqlite or redis)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_auth_db_path")]
    pub auth_db_path: String,

    #[serde(default)]
    pub session_backend: SessionBackend,

    #[serde(default = "default_session_db_path")]
    pub session_db_path: String,

    #[serde(default)]
    pub redis_url: Option<String>,

    /// Deadline applied to every store call (milliseconds)
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// How often the in-memory cache drops expired records (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_auth_db_path() -> String {
    "auth.db".to_string()
}

fn default_session_db_path() -> String {
    "sessions.db".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            auth_db_path: default_auth_db_path(),
            session_backend: SessionBackend::default(),
            session_db_path: default_session_db_path(),
            redis_url: None,
            store_timeout_ms: default_store_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    #[serde(default)]
    pub bootstrap_admin_username: Option<String>,

    #[serde(default)]
    pub bootstrap_admin_password: Option<String>,
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: default_bcrypt_cost(),
            bootstrap_admin_username: None,
            bootstrap_admin_password: None,
        }
    }
}

impl AuthConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// File (when given) overlaid with the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from variables found by `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
        where
            T::Err: std::fmt::Display,
        {
            raw.map(|v| {
                v.trim()
                    .parse::<T>()
                    .map_err(|e| anyhow!("invalid value for {key}: {e}"))
            })
            .transpose()
        }

        if let Some(v) = lookup("JWT_SECRET") {
            self.jwt.secret = Some(v);
        }
        if let Some(v) = lookup("JWT_ALGORITHM") {
            self.jwt.algorithm = v.trim().to_ascii_uppercase();
        }
        if let Some(v) = lookup("JWT_PRIVATE_KEY_PATH") {
            self.jwt.private_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("JWT_PUBLIC_KEY_PATH") {
            self.jwt.public_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("JWT_ISSUER") {
            self.jwt.issuer = v;
        }
        if let Some(v) = parsed("ACCESS_TOKEN_TTL_SECS", lookup("ACCESS_TOKEN_TTL_SECS"))? {
            self.jwt.access_token_ttl_secs = v;
        }
        if let Some(v) = parsed("REFRESH_TOKEN_TTL_SECS", lookup("REFRESH_TOKEN_TTL_SECS"))? {
            self.jwt.refresh_token_ttl_secs = v;
        }
        if let Some(v) = lookup("REVOKE_SESSIONS_ON_REPLAY") {
            self.jwt.revoke_sessions_on_replay =
                matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Some(v) = parsed("REFRESH_REPLAY_GRACE_SECS", lookup("REFRESH_REPLAY_GRACE_SECS"))?
        {
            self.jwt.replay_grace_secs = v;
        }
        if let Some(v) = lookup("AUTH_DB_PATH") {
            self.storage.auth_db_path = v;
        }
        if let Some(v) = parsed("SESSION_BACKEND", lookup("SESSION_BACKEND"))? {
            self.storage.session_backend = v;
        }
        if let Some(v) = lookup("SESSION_DB_PATH") {
            self.storage.session_db_path = v;
        }
        if let Some(v) = lookup("REDIS_URL") {
            self.storage.redis_url = Some(v);
        }
        if let Some(v) = parsed("STORE_TIMEOUT_MS", lookup("STORE_TIMEOUT_MS"))? {
            self.storage.store_timeout_ms = v;
        }
        if let Some(v) = parsed("BCRYPT_COST", lookup("BCRYPT_COST"))? {
            self.security.bcrypt_cost = v;
        }
        if let Some(v) = lookup("BOOTSTRAP_ADMIN_USERNAME") {
            self.security.bootstrap_admin_username = Some(v);
        }
        if let Some(v) = lookup("BOOTSTRAP_ADMIN_PASSWORD") {
            self.security.bootstrap_admin_password = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt.access_token_ttl_secs <= 0 || self.jwt.refresh_token_ttl_secs <= 0 {
            bail!("token TTLs must be positive");
        }
        if self.jwt.refresh_token_ttl_secs < self.jwt.access_token_ttl_secs {
            bail!("refresh token TTL must not be shorter than the access token TTL");
        }
        if self.storage.store_timeout_ms == 0 {
            bail!("STORE_TIMEOUT_MS must be greater than zero");
        }
        // A redemption abandoned at the deadline may still commit
        let grace_ms = u64::try_from(self.jwt.replay_grace_secs)
            .unwrap_or(0)
            .saturating_mul(1000);
        if grace_ms < self.storage.store_timeout_ms {
            bail!("REFRESH_REPLAY_GRACE_SECS must cover STORE_TIMEOUT_MS");
        }
        if !(4..=31).contains(&self.security.bcrypt_cost) {
            bail!("BCRYPT_COST must be between 4 and 31");
        }
        if self.storage.session_backend == SessionBackend::Redis && self.storage.redis_url.is_none()
        {
            bail!("SESSION_BACKEND=redis requires REDIS_URL");
        }
        Ok(())
    }

    /// Build the signing keys. Failing here is fatal at startup.
    pub fn signing_keys(&self) -> Result<SigningKeys> {
        let algorithm = Algorithm::from_str(&self.jwt.algorithm)
            .map_err(|e| anyhow!("unsupported JWT_ALGORITHM '{}': {e}", self.jwt.algorithm))?;

        let keys = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = self
                    .jwt
                    .secret
                    .as_deref()
                    .context("JWT_SECRET is required for HMAC signing")?;
                SigningKeys::hmac(algorithm, secret.as_bytes())?
            }
            Algorithm::RS256 => {
                let private_path = self
                    .jwt
                    .private_key_path
                    .as_ref()
                    .context("JWT_PRIVATE_KEY_PATH is required for RS256")?;
                let public_path = self
                    .jwt
                    .public_key_path
                    .as_ref()
                    .context("JWT_PUBLIC_KEY_PATH is required for RS256")?;
                let private_pem = std::fs::read(private_path)
                    .with_context(|| format!("failed to read {}", private_path.display()))?;
                let public_pem = std::fs::read(public_path)
                    .with_context(|| format!("failed to read {}", public_path.display()))?;
                SigningKeys::rsa(&private_pem, &public_pem)?
            }
            other => bail!("unsupported JWT_ALGORITHM {other:?}"),
        };
        Ok(keys)
    }

    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            issuer: self.jwt.issuer.clone(),
            access_ttl: chrono::Duration::seconds(self.jwt.access_token_ttl_secs),
            refresh_ttl: chrono::Duration::seconds(self.jwt.refresh_token_ttl_secs),
            store_timeout: self.store_timeout(),
            revoke_sessions_on_replay: self.jwt.revoke_sessions_on_replay,
            replay_grace: chrono::Duration::seconds(self.jwt.replay_grace_secs),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.store_timeout_ms)
    }

    /// Configured bootstrap admin credentials, if both are set.
    pub fn bootstrap_admin(&self) -> Option<(&str, &str)> {
        match (
            self.security.bootstrap_admin_username.as_deref(),
            self.security.bootstrap_admin_password.as_deref(),
        ) {
            (Some(user), Some(pass)) if !user.trim().is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}
