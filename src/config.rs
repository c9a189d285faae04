/// Configuration management for the Telegram login bot.
use crate::error::{BotError, Result};
use crate::server::RESERVED_PATHS;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Runtime environment, which decides how updates reach the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Upper bound on a code's lifetime: one day.
const MAX_CODE_TTL_SECS: u64 = 86_400;

/// Main application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (from TELEGRAM_BOT_TOKEN). Absent means the bot stays disabled.
    pub bot_token: Option<String>,
    /// Public base URL of the web application, used for deep links.
    pub app_base_url: Url,
    pub environment: Environment,
    /// Path the webhook is served under.
    pub webhook_path: String,
    /// Public base URL the platform pushes webhook updates to.
    pub webhook_public_url: Url,
    pub webhook_secret: Option<String>,
    pub webhook_max_connections: u8,
    pub poll_timeout: Duration,
    pub listen_addr: SocketAddr,
    pub database_path: String,
    /// Lifetime of an issued verification code.
    pub code_ttl: Duration,
    pub welcome_followup_delay: Duration,
    pub expiry_sweep_interval: Duration,
    pub task_max_attempts: u32,
    pub task_retry_base: Duration,
    /// Wrong guesses allowed before a verification code is locked.
    pub verify_max_attempts: u32,
    /// Bearer token the web application must present on the internal API.
    /// Mandatory in production.
    pub internal_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required for the bot to come up:
    /// - `TELEGRAM_BOT_TOKEN`: The bot token from BotFather.
    ///
    /// Everything else is optional, see `from_lookup` for defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Defaults:
    /// - `APP_BASE_URL`: http://localhost:3000
    /// - `APP_ENV`: development
    /// - `WEBHOOK_PATH`: /api/telegram/webhook
    /// - `WEBHOOK_PUBLIC_URL`: same as `APP_BASE_URL`
    /// - `WEBHOOK_MAX_CONNECTIONS`: 40
    /// - `POLL_TIMEOUT_SECS`: 10
    /// - `LISTEN_ADDR`: 0.0.0.0:8080
    /// - `DATABASE_PATH`: freelance_tg_bot.db
    /// - `CODE_TTL_SECS`: 600
    /// - `WELCOME_FOLLOWUP_DELAY_MS`: 500
    /// - `EXPIRY_SWEEP_SECS`: 60
    /// - `TASK_MAX_ATTEMPTS`: 3
    /// - `TASK_RETRY_BASE_MS`: 250
    /// - `VERIFY_MAX_ATTEMPTS`: 5
    ///
    /// `INTERNAL_API_KEY` has no default and must be set when `APP_ENV` is production.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| -> Result<u64> {
            match non_empty(key) {
                Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                    BotError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))
                }),
                None => Ok(default),
            }
        };

        let bot_token = non_empty("TELEGRAM_BOT_TOKEN");

        let app_base_url = parse_url(
            "APP_BASE_URL",
            &non_empty("APP_BASE_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
        )?;

        let environment = non_empty("APP_ENV")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Development);

        let webhook_path =
            non_empty("WEBHOOK_PATH").unwrap_or_else(|| "/api/telegram/webhook".to_string());
        if !webhook_path.starts_with('/') {
            return Err(BotError::Config(format!(
                "WEBHOOK_PATH must start with '/', got '{}'",
                webhook_path
            )));
        }
        if RESERVED_PATHS.contains(&webhook_path.as_str()) {
            return Err(BotError::Config(format!(
                "WEBHOOK_PATH '{}' collides with a built-in route",
                webhook_path
            )));
        }

        let webhook_public_url = match non_empty("WEBHOOK_PUBLIC_URL") {
            Some(raw) => parse_url("WEBHOOK_PUBLIC_URL", &raw)?,
            None => app_base_url.clone(),
        };

        let webhook_max_connections = number("WEBHOOK_MAX_CONNECTIONS", 40)?;
        if !(1..=100).contains(&webhook_max_connections) {
            return Err(BotError::Config(format!(
                "WEBHOOK_MAX_CONNECTIONS ({}) must be between 1 and 100",
                webhook_max_connections
            )));
        }

        let listen_raw = non_empty("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let listen_addr = listen_raw.parse::<SocketAddr>().map_err(|_| {
            BotError::Config(format!("LISTEN_ADDR is not a socket address: '{}'", listen_raw))
        })?;

        let code_ttl_secs = number("CODE_TTL_SECS", 600)?;
        if !(1..=MAX_CODE_TTL_SECS).contains(&code_ttl_secs) {
            return Err(BotError::Config(format!(
                "CODE_TTL_SECS ({}) must be between 1 and {}",
                code_ttl_secs, MAX_CODE_TTL_SECS
            )));
        }

        let verify_max_attempts = number("VERIFY_MAX_ATTEMPTS", 5)?;
        if !(1..=100).contains(&verify_max_attempts) {
            return Err(BotError::Config(format!(
                "VERIFY_MAX_ATTEMPTS ({}) must be between 1 and 100",
                verify_max_attempts
            )));
        }

        let internal_api_key = non_empty("INTERNAL_API_KEY");
        if environment == Environment::Production && internal_api_key.is_none() {
            return Err(BotError::Config(
                "INTERNAL_API_KEY is required in production".to_string(),
            ));
        }

        let task_max_attempts = number("TASK_MAX_ATTEMPTS", 3)?;
        if task_max_attempts == 0 {
            return Err(BotError::Config(
                "TASK_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        let expiry_sweep_secs = number("EXPIRY_SWEEP_SECS", 60)?;
        if expiry_sweep_secs == 0 {
            return Err(BotError::Config(
                "EXPIRY_SWEEP_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(Config {
            bot_token,
            app_base_url,
            environment,
            webhook_path,
            webhook_public_url,
            webhook_secret: non_empty("WEBHOOK_SECRET"),
            webhook_max_connections: webhook_max_connections as u8,
            poll_timeout: Duration::from_secs(number("POLL_TIMEOUT_SECS", 10)?),
            listen_addr,
            database_path: non_empty("DATABASE_PATH")
                .unwrap_or_else(|| "freelance_tg_bot.db".to_string()),
            code_ttl: Duration::from_secs(code_ttl_secs),
            welcome_followup_delay: Duration::from_millis(number("WELCOME_FOLLOWUP_DELAY_MS", 500)?),
            expiry_sweep_interval: Duration::from_secs(expiry_sweep_secs),
            task_max_attempts: task_max_attempts as u32,
            task_retry_base: Duration::from_millis(number("TASK_RETRY_BASE_MS", 250)?),
            verify_max_attempts: verify_max_attempts as u32,
            internal_api_key,
        })
    }

    /// Join a path (and optional query) onto the web application's base URL.
    pub fn app_link(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.app_base_url.as_str().trim_end_matches('/'),
            path_and_query
        )
    }

    /// Full URL the platform should push webhook updates to.
    pub fn webhook_url(&self) -> Result<Url> {
        let raw = format!(
            "{}{}",
            self.webhook_public_url.as_str().trim_end_matches('/'),
            self.webhook_path
        );
        parse_url("WEBHOOK_PUBLIC_URL", &raw)
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim())
        .map_err(|e| BotError::Config(format!("{} is not a valid URL ('{}'): {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert!(config.bot_token.is_none());
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.code_ttl, Duration::from_secs(600));
        assert_eq!(config.webhook_max_connections, 40);
        assert_eq!(config.webhook_path, "/api/telegram/webhook");
        assert_eq!(config.welcome_followup_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_empty_token_counts_as_missing() {
        let config = Config::from_lookup(lookup_from(&[("TELEGRAM_BOT_TOKEN", "  ")])).unwrap();
        assert!(config.bot_token.is_none());
    }

    #[test]
    fn test_production_environment() {
        let config = Config::from_lookup(lookup_from(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("APP_ENV", "Production"),
            ("APP_BASE_URL", "https://market.example.com/"),
            ("INTERNAL_API_KEY", "k3y"),
        ]))
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(
            config.webhook_url().unwrap().as_str(),
            "https://market.example.com/api/telegram/webhook"
        );
        assert_eq!(
            config.app_link("/login/telegram"),
            "https://market.example.com/login/telegram"
        );
    }

    #[test]
    fn test_separate_webhook_host() {
        let config = Config::from_lookup(lookup_from(&[
            ("APP_BASE_URL", "https://market.example.com"),
            ("WEBHOOK_PUBLIC_URL", "https://hooks.example.com"),
            ("WEBHOOK_PATH", "/tg"),
        ]))
        .unwrap();
        assert_eq!(
            config.webhook_url().unwrap().as_str(),
            "https://hooks.example.com/tg"
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("APP_BASE_URL", "not a url")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CODE_TTL_SECS", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CODE_TTL_SECS", "ten")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("TASK_MAX_ATTEMPTS", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("WEBHOOK_MAX_CONNECTIONS", "500")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("LISTEN_ADDR", "localhost")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("WEBHOOK_PATH", "hook")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("VERIFY_MAX_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn test_code_ttl_capped() {
        assert!(Config::from_lookup(lookup_from(&[("CODE_TTL_SECS", "86400")])).is_ok());
        assert!(Config::from_lookup(lookup_from(&[("CODE_TTL_SECS", "86401")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CODE_TTL_SECS", "9000000000000000")])).is_err());
    }

    #[test]
    fn test_webhook_path_cannot_shadow_builtin_routes() {
        for path in ["/healthz", "/api/telegram/send-code", "/api/telegram/verify"] {
            assert!(Config::from_lookup(lookup_from(&[("WEBHOOK_PATH", path)])).is_err());
        }
    }

    #[test]
    fn test_production_requires_internal_key() {
        let err = Config::from_lookup(lookup_from(&[("APP_ENV", "production")])).unwrap_err();
        assert!(err.to_string().contains("INTERNAL_API_KEY"));

        let dev = Config::from_lookup(lookup_from(&[("APP_ENV", "development")])).unwrap();
        assert!(dev.internal_api_key.is_none());
        assert_eq!(dev.verify_max_attempts, 5);
    }
}
