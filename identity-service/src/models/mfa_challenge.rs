use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::RefreshToken;

/// Single-use MFA challenge issued between password verification and
/// token issuance. Bound to the pending session, IP and device.
#[derive(Debug, Clone, FromRow)]
pub struct MfaChallenge {
    pub challenge_id: Uuid,
    pub token_hash: String,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub ip_address: String,
    pub device_hash: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MfaChallenge {
    /// Create a challenge for `raw_token`. Only its hash is kept.
    pub fn new(
        raw_token: &str,
        user_id: Uuid,
        session_id: Uuid,
        ip_address: &str,
        device_hash: &str,
        ttl_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            challenge_id: Uuid::new_v4(),
            token_hash: RefreshToken::hash_token(raw_token),
            user_id,
            session_id,
            ip_address: ip_address.to_string(),
            device_hash: device_hash.to_string(),
            expires_at: now + Duration::seconds(ttl_seconds),
            consumed_at: None,
            created_at: now,
        }
    }

    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && self.expires_at > now
    }
}
