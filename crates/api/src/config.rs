//! Environment-driven configuration.
//!
//! Production hardening is deliberate: a missing or weak secret is a fatal
//! configuration error, never a silent allow.

use jobforge_auth::{MIN_PRODUCTION_SECRET_LEN, ProcessingSecret};
use jobforge_queue::DEFAULT_RETENTION_DAYS;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn from_env() -> Self {
        match std::env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "JWT_SECRET must be set to at least {MIN_PRODUCTION_SECRET_LEN} bytes in production"
    )]
    WeakJwtSecret,

    #[error(
        "PROCESSING_SECRET must be set to at least {MIN_PRODUCTION_SECRET_LEN} bytes in production"
    )]
    WeakProcessingSecret,

    #[error("invalid {name}: {message}")]
    Invalid {
        name: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub processing_secret: ProcessingSecret,
    pub retention_days: i64,
    /// Postgres connection string; None runs the in-memory store (dev only).
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_env();

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(value) => value,
            Err(_) if environment.is_production() => return Err(ConfigError::WeakJwtSecret),
            Err(_) => {
                warn!("JWT_SECRET not set; using insecure dev default");
                "dev-secret".to_string()
            }
        };
        if environment.is_production() && jwt_secret.len() < MIN_PRODUCTION_SECRET_LEN {
            return Err(ConfigError::WeakJwtSecret);
        }

        let processing_secret = match std::env::var("PROCESSING_SECRET") {
            Ok(value) => ProcessingSecret::new(value),
            Err(_) if environment.is_production() => {
                return Err(ConfigError::WeakProcessingSecret);
            }
            Err(_) => {
                warn!("PROCESSING_SECRET not set; using insecure dev default");
                ProcessingSecret::new("dev-processing-secret")
            }
        };
        if environment.is_production() && !processing_secret.is_production_grade() {
            return Err(ConfigError::WeakProcessingSecret);
        }

        let retention_days = match std::env::var("JOB_RETENTION_DAYS") {
            Ok(value) => value.parse::<i64>().map_err(|e| ConfigError::Invalid {
                name: "JOB_RETENTION_DAYS",
                message: e.to_string(),
            })?,
            Err(_) => DEFAULT_RETENTION_DAYS,
        };
        if retention_days < 1 {
            return Err(ConfigError::Invalid {
                name: "JOB_RETENTION_DAYS",
                message: "must be at least 1".to_string(),
            });
        }

        let database_url = std::env::var("DATABASE_URL").ok();
        if database_url.is_none() && environment.is_production() {
            warn!("DATABASE_URL not set in production; jobs will not survive restarts");
        }

        Ok(Self {
            environment,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret,
            processing_secret,
            retention_days,
            database_url,
        })
    }

    /// In-memory development/test configuration.
    pub fn for_tests(jwt_secret: &str, processing_secret: &str) -> Self {
        Self {
            environment: Environment::Development,
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: jwt_secret.to_string(),
            processing_secret: ProcessingSecret::new(processing_secret),
            retention_days: DEFAULT_RETENTION_DAYS,
            database_url: None,
        }
    }
}
