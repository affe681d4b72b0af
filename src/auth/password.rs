//! Password hashing
//! Mission: Keep bcrypt work off the async executor

use crate::error::AuthError;
use bcrypt::{hash, verify};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    cost: u32,
}

impl PasswordHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    pub fn check_strength(password: &str) -> Result<(), AuthError> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN));
        }
        Ok(())
    }

    pub async fn hash(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let cost = self.cost;
        tokio::task::spawn_blocking(move || hash(password, cost))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
            .map_err(|e| AuthError::Internal(format!("failed to hash password: {e}")))
    }

    /// Malformed hashes verify as false rather than erroring.
    pub async fn verify(&self, password: &str, password_hash: &str) -> bool {
        let password = password.to_string();
        let password_hash = password_hash.to_string();
        tokio::task::spawn_blocking(move || verify(password, &password_hash).unwrap_or(false))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strength_check() {
        assert!(PasswordHasher::check_strength("longenough").is_ok());
        assert!(matches!(
            PasswordHasher::check_strength("short"),
            Err(AuthError::WeakPassword(8))
        ));
    }

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hasher = PasswordHasher::new(4);
        let hashed = hasher.hash("correct horse").await.unwrap();
        assert!(hashed.starts_with("$2"));
        assert!(hasher.verify("correct horse", &hashed).await);
        assert!(!hasher.verify("wrong horse", &hashed).await);
    }

    #[tokio::test]
    async fn test_garbage_hash_never_verifies() {
        let hasher = PasswordHasher::new(4);
        assert!(!hasher.verify("anything", "not-a-bcrypt-hash").await);
    }
}
