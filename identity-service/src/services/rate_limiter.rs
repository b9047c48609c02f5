//! Failed-login counters with escalating lockouts.
//!
//! Counters live in the cache store under `login_fail:{id}` with a sliding
//! window; a lock is a separate `login_lock:{id}` marker whose TTL is the
//! remaining lockout. The limiter fails open: if the cache store is
//! unreachable, authentication is never blocked and a warning is logged.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::services::cache::CacheStore;

/// Sliding window for the failure counter, reset on every failure.
pub const FAILURE_WINDOW_SECS: u64 = 15 * 60;

/// Counter ceiling.
pub const MAX_TRACKED_FAILURES: i64 = 25;

/// `(failures, lock seconds)`, ascending. The highest threshold reached wins.
pub const ESCALATION: [(i64, u64); 4] = [
    (5, 10 * 60),
    (10, 60 * 60),
    (15, 4 * 60 * 60),
    (20, 24 * 60 * 60),
];

/// Derived lock state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub retry_after_secs: u64,
    pub attempts: i64,
}

impl LockStatus {
    fn open(attempts: i64) -> Self {
        Self {
            locked: false,
            retry_after_secs: 0,
            attempts,
        }
    }
}

/// Identifier used before the identity is known.
pub fn pre_auth_identifier(email: &str, ip: &str) -> String {
    format!("{}:{}", email.trim().to_lowercase(), ip)
}

/// Identifier used once the identity is known.
pub fn user_identifier(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

/// Lock duration for a failure count, if any threshold is reached.
pub fn lock_duration_for(attempts: i64) -> Option<u64> {
    ESCALATION
        .iter()
        .rev()
        .find(|(threshold, _)| attempts >= *threshold)
        .map(|(_, secs)| *secs)
}

fn fail_key(identifier: &str) -> String {
    format!("login_fail:{}", identifier)
}

fn lock_key(identifier: &str) -> String {
    format!("login_lock:{}", identifier)
}

#[derive(Clone)]
pub struct LoginRateLimiter {
    cache: Arc<dyn CacheStore>,
}

impl LoginRateLimiter {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Current lock state. Reports attempts only when not locked.
    pub async fn check_lock(&self, identifier: &str) -> LockStatus {
        match self.cache.ttl(&lock_key(identifier)).await {
            Ok(Some(remaining)) if remaining > 0 => {
                return LockStatus {
                    locked: true,
                    retry_after_secs: remaining,
                    attempts: self.attempts(identifier).await,
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "Lock check failed, allowing attempt");
                return LockStatus::open(0);
            }
        }

        LockStatus::open(self.attempts(identifier).await)
    }

    async fn attempts(&self, identifier: &str) -> i64 {
        match self.cache.get(&fail_key(identifier)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "Failed to read attempt counter");
                0
            }
        }
    }

    /// Count one failure and lock when a threshold is reached.
    pub async fn record_failure(&self, identifier: &str) -> LockStatus {
        let key = fail_key(identifier);
        let count = match self.cache.incr_with_ttl(&key, FAILURE_WINDOW_SECS).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "Failed to record login failure, lockout disabled");
                return LockStatus::open(0);
            }
        };

        let attempts = count.min(MAX_TRACKED_FAILURES);
        if count > MAX_TRACKED_FAILURES {
            if let Err(e) = self
                .cache
                .set_ex(&key, &attempts.to_string(), FAILURE_WINDOW_SECS)
                .await
            {
                tracing::warn!(identifier = %identifier, error = %e, "Failed to clamp attempt counter");
            }
        }

        let Some(lock_secs) = lock_duration_for(attempts) else {
            return LockStatus::open(attempts);
        };

        if let Err(e) = self.cache.set_ex(&lock_key(identifier), "1", lock_secs).await {
            tracing::warn!(identifier = %identifier, error = %e, "Failed to write lock marker");
            return LockStatus::open(attempts);
        }

        tracing::info!(identifier = %identifier, attempts, lock_secs, "Login identifier locked");

        LockStatus {
            locked: true,
            retry_after_secs: lock_secs,
            attempts,
        }
    }

    /// Remove counter and lock marker.
    pub async fn clear_failures(&self, identifier: &str) {
        if let Err(e) = self
            .cache
            .delete(&[fail_key(identifier), lock_key(identifier)])
            .await
        {
            tracing::warn!(identifier = %identifier, error = %e, "Failed to clear login failures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_duration_picks_highest_threshold() {
        assert_eq!(lock_duration_for(0), None);
        assert_eq!(lock_duration_for(4), None);
        assert_eq!(lock_duration_for(5), Some(600));
        assert_eq!(lock_duration_for(9), Some(600));
        assert_eq!(lock_duration_for(10), Some(3600));
        assert_eq!(lock_duration_for(15), Some(14400));
        assert_eq!(lock_duration_for(25), Some(86400));
    }

    #[test]
    fn test_pre_auth_identifier_normalizes_email() {
        assert_eq!(
            pre_auth_identifier(" A@X.com ", "10.0.0.1"),
            "a@x.com:10.0.0.1"
        );
    }
}
