//! Application configuration loaded from environment variables.
//!
//! Rate-limit settings are required; anything missing or malformed is a
//! [`ConfigError`] and stops startup.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use actix_web::http::header::HeaderName;
use turnstile_core::{ConfigError, EngineConfig, LimitPolicy};
use turnstile_infra::RetryConfig;

use crate::middleware::rate_limit::AdmissionConfig;

/// Largest accepted window or block duration: the TTL must fit Redis's
/// signed 64-bit millisecond expiry.
const MAX_DURATION_SECS: u64 = i64::MAX as u64 / 1000;

/// Which counter store backs the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Redis {
        addr: String,
        password: Option<String>,
        db: i64,
        connect_timeout: Duration,
        key_prefix: String,
    },
    Memory,
}

impl StoreSettings {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreSettings::Redis { .. } => "redis",
            StoreSettings::Memory => "memory",
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreSettings,
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub admission: AdmissionConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let store = match vars.optional("STORE_BACKEND", "redis".to_string())?.as_str() {
            "redis" => StoreSettings::Redis {
                addr: vars.required_str("REDIS_ADDR")?,
                password: vars.get("REDIS_PASSWORD").filter(|p| !p.is_empty()),
                db: vars.required("REDIS_DB")?,
                connect_timeout: Duration::from_secs(
                    vars.optional("REDIS_CONNECT_TIMEOUT_SECS", 5)?,
                ),
                key_prefix: vars.optional("RATE_LIMIT_KEY_PREFIX", "ratelimit".to_string())?,
            },
            "memory" => StoreSettings::Memory,
            other => {
                return Err(ConfigError::invalid(
                    "STORE_BACKEND",
                    other,
                    "expected `redis` or `memory`",
                ));
            }
        };

        let limits = LimitPolicy {
            per_ip: vars.required("IP_RATE_LIMIT")?,
            per_token: vars.required("TOKEN_RATE_LIMIT")?,
        };

        let engine = EngineConfig {
            window: vars.required_secs("RATE_LIMIT_WINDOW")?,
            block_duration: vars.required_secs("BLOCK_DURATION")?,
            store_timeout: Duration::from_millis(positive(
                "STORE_TIMEOUT_MS",
                vars.optional("STORE_TIMEOUT_MS", 500)?,
            )?),
        };

        let retry = RetryConfig {
            max_attempts: vars.optional("STORE_RETRY_ATTEMPTS", 3)?,
            initial_delay: Duration::from_millis(vars.optional("STORE_RETRY_BASE_MS", 10)?),
            ..RetryConfig::default()
        };

        let header = vars.optional("TOKEN_HEADER", "API_KEY".to_string())?;
        let token_header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| ConfigError::invalid("TOKEN_HEADER", header.as_str(), e.to_string()))?;

        let admission = AdmissionConfig {
            limits,
            token_header,
            trust_forwarded_headers: vars.flag("TRUST_FORWARDED_HEADERS", false)?,
        };

        Ok(Self {
            host: vars.optional("HOST", "127.0.0.1".to_string())?,
            port: vars.optional("PORT", 8080)?,
            store,
            engine,
            retry,
            admission,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
    }

    fn required_str(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(name))
    }

    fn required<T>(&self, name: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.required_str(name)?;
        parse(name, &raw)
    }

    /// A positive number of seconds, at most [`MAX_DURATION_SECS`].
    fn required_secs(&self, name: &'static str) -> Result<Duration, ConfigError> {
        let secs = positive(name, self.required(name)?)?;
        if secs > MAX_DURATION_SECS {
            return Err(ConfigError::invalid(
                name,
                secs.to_string(),
                format!("must be at most {} seconds", MAX_DURATION_SECS),
            ));
        }
        Ok(Duration::from_secs(secs))
    }

    /// Unset falls back to `default`; set but malformed is still an error.
    fn optional<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            Some(raw) if !raw.trim().is_empty() => parse(name, &raw),
            _ => Ok(default),
        }
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.trim().to_lowercase()) {
            None => Ok(default),
            Some(v) if v.is_empty() => Ok(default),
            Some(v) if v == "true" || v == "1" => Ok(true),
            Some(v) if v == "false" || v == "0" => Ok(false),
            Some(v) => Err(ConfigError::invalid(name, v, "expected true/false")),
        }
    }
}

fn positive(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(name, "0", "must be greater than zero"));
    }
    Ok(value)
}

fn parse<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(name, raw, e.to_string()))
}
