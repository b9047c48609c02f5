use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;

use crate::error::AppError;

/// Settings shared with the rest of the platform, loaded from an optional
/// `configuration` file and `APP__*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub mfa: MfaConfig,
    pub permission_cache: PermissionCacheConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Access token signing material.
#[derive(Clone)]
pub enum JwtSigning {
    /// HS256 with a shared secret of at least 32 bytes.
    Hmac { secret: String },
    /// RS256 with PEM key files.
    Rsa {
        private_key_path: String,
        public_key_path: String,
    },
}

impl std::fmt::Debug for JwtSigning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtSigning::Hmac { .. } => f.write_str("Hmac(***)"),
            JwtSigning::Rsa {
                private_key_path,
                public_key_path,
            } => f
                .debug_struct("Rsa")
                .field("private_key_path", private_key_path)
                .field("public_key_path", public_key_path)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub signing: JwtSigning,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_concurrent: usize,
    pub inactivity_days: i64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MfaConfig {
    /// Shown by authenticator apps next to the account name.
    pub issuer: String,
    pub challenge_ttl_seconds: i64,
    pub backup_code_count: usize,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            issuer: "Identity".to_string(),
            challenge_ttl_seconds: 300,
            backup_code_count: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionCacheConfig {
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per IP per window on `/auth/login`, ahead of account lockout.
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let signing = match env::var("JWT_SECRET") {
            Ok(secret) => JwtSigning::Hmac { secret },
            Err(_) => JwtSigning::Rsa {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
            },
        };

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
                run_migrations: parse_env("DATABASE_RUN_MIGRATIONS", "true", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            jwt: JwtConfig {
                signing,
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "30",
                    is_prod,
                )?,
            },
            session: SessionConfig {
                max_concurrent: parse_env("SESSION_MAX_CONCURRENT", "5", is_prod)?,
                inactivity_days: parse_env("SESSION_INACTIVITY_DAYS", "30", is_prod)?,
                sweep_interval_seconds: parse_env(
                    "SESSION_SWEEP_INTERVAL_SECONDS",
                    "3600",
                    is_prod,
                )?,
            },
            mfa: MfaConfig {
                issuer: get_env("MFA_ISSUER", Some("Identity"), is_prod)?,
                challenge_ttl_seconds: parse_env("MFA_CHALLENGE_TTL_SECONDS", "300", is_prod)?,
                backup_code_count: parse_env("MFA_BACKUP_CODE_COUNT", "10", is_prod)?,
            },
            permission_cache: PermissionCacheConfig {
                ttl_seconds: parse_env("PERMISSION_CACHE_TTL_SECONDS", "3600", is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("20"), is_prod)?
                    .parse()
                    .unwrap_or(20),
                login_window_seconds: get_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(60),
                register_attempts: get_env("RATE_LIMIT_REGISTER_ATTEMPTS", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                register_window_seconds: get_env(
                    "RATE_LIMIT_REGISTER_WINDOW_SECONDS",
                    Some("3600"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(3600),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if let JwtSigning::Hmac { secret } = &self.jwt.signing {
            if secret.len() < 32 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JWT_SECRET must be at least 32 bytes"
                )));
            }
        }

        if self.session.max_concurrent == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_MAX_CONCURRENT must be positive"
            )));
        }

        if self.session.inactivity_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_INACTIVITY_DAYS must be positive"
            )));
        }

        if self.mfa.challenge_ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_CHALLENGE_TTL_SECONDS must be positive"
            )));
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
