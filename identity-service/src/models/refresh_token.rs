use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

use super::RevocationReason;

/// Refresh token row. Only the SHA-256 of the opaque value is persisted.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub token_id: Uuid,

    /// Session this token keeps alive
    pub session_id: Uuid,

    pub user_id: Uuid,

    /// SHA-256 hash of the refresh token
    pub token_hash: String,

    pub expires_at: DateTime<Utc>,

    /// Token this one replaced during rotation
    pub rotated_from: Option<Uuid>,

    pub created_at: DateTime<Utc>,

    pub revoked_at: Option<DateTime<Utc>>,

    pub revoked_reason: Option<RevocationReason>,
}

impl RefreshToken {
    /// Create a new refresh token record for `raw_token`.
    pub fn new(
        session_id: Uuid,
        user_id: Uuid,
        raw_token: &str,
        expires_in_days: i64,
        rotated_from: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            token_id: Uuid::new_v4(),
            session_id,
            user_id,
            token_hash: Self::hash_token(raw_token),
            expires_at: now + Duration::days(expires_in_days),
            rotated_from,
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        }
    }

    /// Generate a fresh opaque token value (32 random bytes, hex).
    pub fn generate_raw() -> String {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        hex::encode(bytes)
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_token_creation() {
        let raw = RefreshToken::generate_raw();
        let token = RefreshToken::new(Uuid::new_v4(), Uuid::new_v4(), &raw, 7, None);

        assert_eq!(raw.len(), 64);
        assert_ne!(token.token_hash, raw);
        assert_eq!(token.token_hash, RefreshToken::hash_token(&raw));
        assert!(!token.is_revoked());
        assert!(!token.is_expired());
    }

    #[test]
    fn test_refresh_token_expiry() {
        let mut token = RefreshToken::new(Uuid::new_v4(), Uuid::new_v4(), "token_abc", 7, None);
        assert!(!token.is_expired());

        token.expires_at = Utc::now() - Duration::seconds(1);
        assert!(token.is_expired());
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        assert_ne!(RefreshToken::generate_raw(), RefreshToken::generate_raw());
    }
}
