use std::{env, fmt, net::SocketAddr, path::PathBuf};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://loanbook.db?mode=rwc";
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";
pub const DEFAULT_AGREEMENT_DIR: &str = "storage/agreements";
pub const DEFAULT_MAIL_FROM: &str = "no-reply@loanbook.local";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How agreement notifications behave when one recipient fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Stop at the first failed notification.
    #[default]
    AbortOnFailure,
    /// Attempt every investor and report the failures together.
    BestEffort,
}

impl DeliveryMode {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "abort" => Ok(Self::AbortOnFailure),
            "best_effort" => Ok(Self::BestEffort),
            other => Err(ConfigError::InvalidDeliveryMode(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AbortOnFailure => "abort",
            Self::BestEffort => "best_effort",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Base URL agreement links are published under.
    pub public_url: String,
    pub agreement_dir: PathBuf,
    /// Mail relay endpoint. Notifications are only logged when unset.
    pub mail_relay_url: Option<String>,
    pub mail_from: String,
    pub delivery_mode: DeliveryMode,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let public_url = var_or("APP_PUBLIC_URL", DEFAULT_PUBLIC_URL);
        if !public_url.starts_with("http://") && !public_url.starts_with("https://") {
            return Err(ConfigError::InvalidPublicUrl(public_url));
        }

        let delivery_mode = match non_empty_var("AGREEMENT_DELIVERY_MODE") {
            Some(value) => DeliveryMode::from_str(&value)?,
            None => DeliveryMode::default(),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: var_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            public_url,
            agreement_dir: PathBuf::from(var_or("AGREEMENT_DIR", DEFAULT_AGREEMENT_DIR)),
            mail_relay_url: non_empty_var("MAIL_RELAY_URL"),
            mail_from: var_or("MAIL_FROM", DEFAULT_MAIL_FROM),
            delivery_mode,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    non_empty_var(key).unwrap_or_else(|| default.to_string())
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidPublicUrl(String),
    InvalidDeliveryMode(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidPublicUrl(value) => {
                write!(f, "APP_PUBLIC_URL must be an http(s) url (got {value})")
            }
            Self::InvalidDeliveryMode(value) => write!(
                f,
                "AGREEMENT_DELIVERY_MODE must be 'abort' or 'best_effort' (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    const KEYS: [&str; 8] = [
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "APP_PUBLIC_URL",
        "AGREEMENT_DIR",
        "MAIL_RELAY_URL",
        "MAIL_FROM",
        "AGREEMENT_DELIVERY_MODE",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.public_url, DEFAULT_PUBLIC_URL);
        assert_eq!(config.agreement_dir, PathBuf::from(DEFAULT_AGREEMENT_DIR));
        assert_eq!(config.mail_relay_url, None);
        assert_eq!(config.delivery_mode, DeliveryMode::AbortOnFailure);
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn parses_production_settings() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("DATABASE_URL", "sqlite:///var/lib/loanbook/loans.db");
        env::set_var("APP_PUBLIC_URL", "https://loans.example.com");
        env::set_var("MAIL_RELAY_URL", "https://relay.example.com/send");
        env::set_var("AGREEMENT_DELIVERY_MODE", "best_effort");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.database_url, "sqlite:///var/lib/loanbook/loans.db");
        assert_eq!(config.public_url, "https://loans.example.com");
        assert_eq!(
            config.mail_relay_url.as_deref(),
            Some("https://relay.example.com/send")
        );
        assert_eq!(config.delivery_mode, DeliveryMode::BestEffort);

        clear_env();
    }

    #[test]
    fn blank_relay_url_means_log_only() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("MAIL_RELAY_URL", "   ");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.mail_relay_url, None);

        clear_env();
    }

    #[test]
    fn rejects_unknown_delivery_mode_and_bad_public_url() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("AGREEMENT_DELIVERY_MODE", "sometimes");
        let err = AppConfig::from_env().expect_err("mode should be rejected");
        assert!(matches!(err, ConfigError::InvalidDeliveryMode(value) if value == "sometimes"));

        clear_env();
        env::set_var("APP_PUBLIC_URL", "loans.example.com");
        let err = AppConfig::from_env().expect_err("url should be rejected");
        assert!(err.to_string().contains("APP_PUBLIC_URL"));

        clear_env();
    }
}
