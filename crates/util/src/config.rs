use std::{env, fmt, net::SocketAddr, str::FromStr};

use super::server_bind_address;

const DEV_JWT_SECRET: &str = "stockflow-development-secret-change-me";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://stockflow.db?mode=rwc";
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:5173";
pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com/v1/";

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

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
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

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub public_base_url: String,
    pub auth: AuthConfig,
    pub inventory: InventoryConfig,
    pub sse: SseConfig,
    pub stripe: StripeConfig,
    pub smtp: SmtpConfig,
}

/// Token signing and account policies.
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_ttl_secs: u64,
    pub verification_ttl_hours: i64,
    pub require_verified_email: bool,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("jwt_ttl_secs", &self.jwt_ttl_secs)
            .field("verification_ttl_hours", &self.verification_ttl_hours)
            .field("require_verified_email", &self.require_verified_email)
            .field(
                "bootstrap_admin",
                &self.bootstrap_admin.as_ref().map(|admin| &admin.email),
            )
            .finish()
    }
}

/// Credentials for the administrator account created on first start.
#[derive(Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy)]
pub struct InventoryConfig {
    pub low_stock_threshold: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct SseConfig {
    pub heartbeat_secs: u64,
    pub ring_max: usize,
    pub ring_ttl_secs: u64,
}

/// Stripe billing settings. Secrets are never printed through `Debug`.
#[derive(Clone)]
pub struct StripeConfig {
    pub enabled: bool,
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub api_base: String,
    pub success_url: String,
    pub cancel_url: String,
    pub price_monthly: Option<String>,
    pub price_annual: Option<String>,
}

impl fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeConfig")
            .field("enabled", &self.enabled)
            .field("has_secret_key", &self.secret_key.is_some())
            .field("has_webhook_secret", &self.webhook_secret.is_some())
            .field("api_base", &self.api_base)
            .field("success_url", &self.success_url)
            .field("cancel_url", &self.cancel_url)
            .finish()
    }
}

/// SMTP relay settings.
#[derive(Clone)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub from_email: String,
    pub from_name: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("use_tls", &self.use_tls)
            .field("from_email", &self.from_email)
            .finish()
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url = optional("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into());
        let public_base_url = optional("PUBLIC_BASE_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.into())
            .trim_end_matches('/')
            .to_string();

        let jwt_secret = match optional("JWT_SECRET") {
            Some(secret) => secret,
            None if environment.is_production() => {
                return Err(ConfigError::Missing("JWT_SECRET"))
            }
            None => DEV_JWT_SECRET.to_string(),
        };
        let bootstrap_admin = match (optional("ADMIN_EMAIL"), optional("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapAdmin { email, password }),
            _ => None,
        };
        let auth = AuthConfig {
            jwt_secret,
            jwt_ttl_secs: parse_or("JWT_TTL_SECS", 8 * 60 * 60)?,
            verification_ttl_hours: parse_or("VERIFICATION_TOKEN_TTL_HOURS", 24)?,
            require_verified_email: flag_or("AUTH_REQUIRE_VERIFIED_EMAIL", true)?,
            bootstrap_admin,
        };

        let inventory = InventoryConfig {
            low_stock_threshold: parse_or("LOW_STOCK_THRESHOLD", 10)?,
        };

        let sse = SseConfig {
            heartbeat_secs: parse_or("SSE_HEARTBEAT_SECS", 25)?,
            ring_max: parse_or("SSE_RING_MAX", 64)?,
            ring_ttl_secs: parse_or("SSE_RING_TTL_SECS", 300)?,
        };

        let stripe = StripeConfig {
            enabled: flag_or("STRIPE_ENABLED", false)?,
            secret_key: optional("STRIPE_SECRET_KEY"),
            webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
            api_base: optional("STRIPE_API_BASE").unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.into()),
            success_url: optional("STRIPE_SUCCESS_URL")
                .unwrap_or_else(|| format!("{public_base_url}/checkout/success")),
            cancel_url: optional("STRIPE_CANCEL_URL")
                .unwrap_or_else(|| format!("{public_base_url}/checkout/cancel")),
            price_monthly: optional("STRIPE_PRICE_MONTHLY"),
            price_annual: optional("STRIPE_PRICE_ANNUAL"),
        };
        if stripe.enabled && environment.is_production() {
            if stripe.secret_key.is_none() {
                return Err(ConfigError::Missing("STRIPE_SECRET_KEY"));
            }
            if stripe.webhook_secret.is_none() {
                return Err(ConfigError::Missing("STRIPE_WEBHOOK_SECRET"));
            }
        }

        let smtp = SmtpConfig {
            enabled: flag_or("SMTP_ENABLED", false)?,
            host: optional("SMTP_HOST").unwrap_or_else(|| "localhost".into()),
            port: parse_or("SMTP_PORT", 1025)?,
            username: optional("SMTP_USERNAME"),
            password: optional("SMTP_PASSWORD"),
            use_tls: flag_or("SMTP_USE_TLS", false)?,
            from_email: optional("SMTP_FROM_EMAIL")
                .unwrap_or_else(|| "noreply@stockflowpro.local".into()),
            from_name: optional("SMTP_FROM_NAME").unwrap_or_else(|| "StockFlow Pro".into()),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            public_base_url,
            auth,
            inventory,
            sse,
            stripe,
            smtp,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

fn flag_or(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name).map(|raw| raw.to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set in this environment"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    const MANAGED_VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "PUBLIC_BASE_URL",
        "JWT_SECRET",
        "JWT_TTL_SECS",
        "STRIPE_ENABLED",
        "STRIPE_SECRET_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "SMTP_PORT",
        "AUTH_REQUIRE_VERIFIED_EMAIL",
    ];

    fn clear_env() {
        for name in MANAGED_VARS {
            env::remove_var(name);
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
        assert_eq!(config.auth.jwt_ttl_secs, 8 * 60 * 60);
        assert!(config.auth.require_verified_email);
        assert!(!config.stripe.enabled);
        assert_eq!(
            config.stripe.success_url,
            "http://localhost:5173/checkout/success"
        );
        assert_eq!(config.smtp.port, 1025);
        assert_eq!(config.inventory.low_stock_threshold, 10);
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
    fn production_requires_jwt_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));

        env::set_var("JWT_SECRET", "prod-secret");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.auth.jwt_secret, "prod-secret");

        clear_env();
    }

    #[test]
    fn production_billing_requires_stripe_secrets() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("JWT_SECRET", "prod-secret");
        env::set_var("STRIPE_ENABLED", "true");
        env::set_var("STRIPE_SECRET_KEY", "sk_test");

        let err = AppConfig::from_env().expect_err("missing webhook secret should error");
        assert!(matches!(err, ConfigError::Missing("STRIPE_WEBHOOK_SECRET")));

        clear_env();
    }

    #[test]
    fn rejects_malformed_numbers_and_flags() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("SMTP_PORT", "not-a-port");
        let err = AppConfig::from_env().expect_err("bad port");
        assert!(matches!(err, ConfigError::InvalidValue { name: "SMTP_PORT", .. }));

        env::remove_var("SMTP_PORT");
        env::set_var("AUTH_REQUIRE_VERIFIED_EMAIL", "maybe");
        let err = AppConfig::from_env().expect_err("bad flag");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "AUTH_REQUIRE_VERIFIED_EMAIL",
                ..
            }
        ));

        clear_env();
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("JWT_SECRET", "super-secret-value");
        env::set_var("STRIPE_SECRET_KEY", "sk_live_secret");

        let config = AppConfig::from_env().expect("config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(!rendered.contains("sk_live_secret"));

        clear_env();
    }
}
