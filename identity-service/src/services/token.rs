use std::fs;
use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{JwtConfig, JwtSigning};
use crate::models::{AuditEvent, AuditEventType, ProviderKind, RefreshToken, RevocationReason, Session, User};
use crate::services::audit::AuditSink;
use crate::services::error::IdentityError;
use crate::services::metrics;
use crate::services::session::SessionManager;
use crate::services::store::IdentityStore;

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenClaims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Tenant ID
    pub tid: Uuid,
    /// Session ID
    pub sid: Uuid,
    /// Role slugs held by the user
    pub roles: Vec<String>,
    /// Member kind the token was issued for (student, teacher, ...)
    pub scope: String,
    /// Whether the session completed MFA
    pub mfa: bool,
    /// Identity provider that authenticated the user
    pub idp: ProviderKind,
    /// Issuer
    pub iss: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// JWT ID
    pub jti: String,
}

/// Token response returned to client
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Signs and verifies access tokens; issues, rotates and reuse-checks
/// refresh tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
    store: Arc<dyn IdentityStore>,
    sessions: SessionManager,
    audit: Arc<dyn AuditSink>,
}

impl TokenService {
    /// Create a token service from a shared secret (HS256) or RSA key files (RS256).
    pub fn new(
        config: &JwtConfig,
        store: Arc<dyn IdentityStore>,
        sessions: SessionManager,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, anyhow::Error> {
        let (encoding_key, decoding_key, algorithm) = match &config.signing {
            JwtSigning::Hmac { secret } => {
                if secret.len() < 32 {
                    return Err(anyhow::anyhow!("JWT secret must be at least 32 bytes"));
                }
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                    Algorithm::HS256,
                )
            }
            JwtSigning::Rsa {
                private_key_path,
                public_key_path,
            } => {
                let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read private key from {}: {}", private_key_path, e)
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

                let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
                })?;
                let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

                (encoding_key, decoding_key, Algorithm::RS256)
            }
        };

        tracing::info!(algorithm = ?algorithm, issuer = %config.issuer, "Token service initialized");

        Ok(Self {
            encoding_key,
            decoding_key,
            algorithm,
            issuer: config.issuer.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
            store,
            sessions,
            audit,
        })
    }

    /// Access token lifetime in seconds.
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn sign_access_token(
        &self,
        user: &User,
        session: &Session,
        roles: &[String],
    ) -> Result<String, IdentityError> {
        let now = Utc::now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: user.user_id,
            tid: session.tenant_id,
            sid: session.session_id,
            roles: roles.to_vec(),
            scope: user.user_type.as_str().to_string(),
            mfa: session.mfa_verified,
            idp: user.auth_provider,
            iss: self.issuer.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to encode access token: {}", e)))
    }

    /// Validate signature, expiry and issuer of an access token.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, IdentityError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
                _ => IdentityError::InvalidToken,
            })
    }

    /// Issue an access token and a fresh refresh token bound to `session`.
    pub async fn issue_token_pair(
        &self,
        user: &User,
        session: &Session,
        roles: &[String],
    ) -> Result<TokenPair, IdentityError> {
        let access_token = self.sign_access_token(user, session, roles)?;

        let raw = RefreshToken::generate_raw();
        let record = RefreshToken::new(
            session.session_id,
            user.user_id,
            &raw,
            self.refresh_token_expiry_days,
            None,
        );
        self.store.insert_refresh_token(&record).await?;

        Ok(self.pair(access_token, raw))
    }

    fn pair(&self, access_token: String, refresh_token: String) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds(),
        }
    }

    /// Look up a presented refresh token. A revoked record means the token
    /// was replayed: its whole session is revoked before failing.
    pub async fn validate_refresh_token(&self, raw: &str) -> Result<RefreshToken, IdentityError> {
        self.check_refresh_token(raw).await.map(|(token, _)| token)
    }

    async fn check_refresh_token(
        &self,
        raw: &str,
    ) -> Result<(RefreshToken, Session), IdentityError> {
        let token = self
            .store
            .find_refresh_token_by_hash(&RefreshToken::hash_token(raw))
            .await?
            .ok_or(IdentityError::InvalidToken)?;

        if token.is_revoked() {
            self.handle_reuse(&token).await;
            return Err(IdentityError::TokenReuseDetected);
        }

        if token.is_expired() {
            return Err(IdentityError::TokenExpired);
        }

        let session = self.sessions.validate_session(token.session_id).await?;
        Ok((token, session))
    }

    /// Revoke `raw` and issue its successor in one unit.
    #[tracing::instrument(skip(self, raw))]
    pub async fn rotate_refresh_token(&self, raw: &str) -> Result<TokenPair, IdentityError> {
        let (old, session) = self.check_refresh_token(raw).await?;

        let user = self
            .store
            .find_user_by_id(old.user_id)
            .await?
            .ok_or(IdentityError::InvalidToken)?;
        if !user.is_active {
            return Err(IdentityError::AccountInactive);
        }

        let next_raw = RefreshToken::generate_raw();
        let successor = RefreshToken::new(
            old.session_id,
            old.user_id,
            &next_raw,
            self.refresh_token_expiry_days,
            Some(old.token_id),
        );

        // Losing the race to a concurrent rotation is the same signal as replay
        if !self.store.rotate_refresh_token(old.token_id, &successor).await? {
            self.handle_reuse(&old).await;
            return Err(IdentityError::TokenReuseDetected);
        }

        let roles = self.role_slugs(user.user_id).await?;
        let access_token = self.sign_access_token(&user, &session, &roles)?;

        self.audit.record(
            AuditEvent::new(AuditEventType::TokenRefreshed)
                .user(session.tenant_id, user.user_id)
                .session(session.session_id),
        );
        tracing::debug!(user_id = %user.user_id, session_id = %session.session_id, "Refresh token rotated");

        Ok(self.pair(access_token, next_raw))
    }

    pub async fn role_slugs(&self, user_id: Uuid) -> Result<Vec<String>, IdentityError> {
        let mut slugs: Vec<String> = self
            .store
            .user_roles(user_id)
            .await?
            .into_iter()
            .map(|r| r.slug)
            .collect();
        slugs.sort();
        slugs.dedup();
        Ok(slugs)
    }

    async fn handle_reuse(&self, token: &RefreshToken) {
        tracing::warn!(
            user_id = %token.user_id,
            session_id = %token.session_id,
            token_id = %token.token_id,
            "Refresh token reuse detected, revoking session"
        );
        metrics::record_token_reuse();

        if let Err(e) = self
            .sessions
            .revoke_session(token.session_id, RevocationReason::TokenReuse)
            .await
        {
            tracing::error!(session_id = %token.session_id, error = %e, "Failed to revoke session after token reuse");
        }

        let tenant_id = match self.store.find_session(token.session_id).await {
            Ok(Some(session)) => Some(session.tenant_id),
            _ => None,
        };
        let mut event = AuditEvent::new(AuditEventType::TokenReuseDetected)
            .session(token.session_id)
            .data(serde_json::json!({
                "token_id": token.token_id,
                "revoked_reason": token.revoked_reason.map(|r| r.as_str()),
            }));
        event.user_id = Some(token.user_id);
        event.tenant_id = tenant_id;
        self.audit.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceType, UserType};
    use crate::services::audit::MemoryAuditSink;
    use crate::services::cache::MemoryCache;
    use crate::services::session::SessionPolicy;
    use crate::services::store::MemoryStore;

    fn service(secret: &str, issuer: &str) -> Result<TokenService, anyhow::Error> {
        let store: Arc<dyn IdentityStore> = Arc::new(MemoryStore::new());
        let audit = MemoryAuditSink::new();
        let sessions = SessionManager::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            audit.clone(),
            SessionPolicy::default(),
        );
        let config = JwtConfig {
            signing: JwtSigning::Hmac {
                secret: secret.to_string(),
            },
            issuer: issuer.to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        };
        TokenService::new(&config, store, sessions, audit)
    }

    fn fixtures() -> (User, Session) {
        let user = User::new(Uuid::new_v4(), "a@x.com".to_string(), "hash".to_string(), UserType::Teacher);
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: user.user_id,
            tenant_id: user.tenant_id,
            device_id: "d".to_string(),
            ip_address: "127.0.0.1".to_string(),
            user_agent_hash: "ua".to_string(),
            device_type: DeviceType::Desktop,
            is_new_device: false,
            mfa_verified: true,
            mfa_verified_at: Some(now),
            last_active_at: now,
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        };
        (user, session)
    }

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    #[test]
    fn test_access_token_round_trip_carries_claims() -> Result<(), anyhow::Error> {
        let tokens = service(SECRET, "identity")?;
        let (user, session) = fixtures();

        let token = tokens.sign_access_token(&user, &session, &["teacher".to_string()])?;
        let claims = tokens.verify_access_token(&token)?;

        assert_eq!(claims.sub, user.user_id);
        assert_eq!(claims.tid, user.tenant_id);
        assert_eq!(claims.sid, session.session_id);
        assert_eq!(claims.roles, vec!["teacher".to_string()]);
        assert_eq!(claims.scope, "teacher");
        assert!(claims.mfa);
        Ok(())
    }

    #[test]
    fn test_tampered_token_rejected() -> Result<(), anyhow::Error> {
        let tokens = service(SECRET, "identity")?;
        let (user, session) = fixtures();
        let token = tokens.sign_access_token(&user, &session, &[])?;
        let escalated = tokens.sign_access_token(&user, &session, &["admin".to_string()])?;

        // Splice the escalated payload onto the original signature
        let parts: Vec<&str> = token.split('.').collect();
        let forged: Vec<&str> = escalated.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged[1], parts[2]);

        assert!(matches!(
            tokens.verify_access_token(&tampered),
            Err(IdentityError::InvalidToken)
        ));
        Ok(())
    }

    #[test]
    fn test_foreign_issuer_rejected() -> Result<(), anyhow::Error> {
        let ours = service(SECRET, "identity")?;
        let theirs = service(SECRET, "someone-else")?;
        let (user, session) = fixtures();

        let token = theirs.sign_access_token(&user, &session, &[])?;
        assert!(matches!(
            ours.verify_access_token(&token),
            Err(IdentityError::InvalidToken)
        ));
        Ok(())
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(service("short", "identity").is_err());
    }
}
