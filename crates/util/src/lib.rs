pub mod config;

use std::{env, net::SocketAddr};

pub use config::{
    AppConfig, AuthConfig, BootstrapAdmin, ConfigError, Environment, InventoryConfig, SmtpConfig,
    SseConfig, StripeConfig,
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Reads `.env` into the process environment. A missing file is not an error.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// `APP_BIND_ADDR`, or [`DEFAULT_BIND_ADDR`] when unset.
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    env::var("APP_BIND_ADDR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
        .trim()
        .parse()
}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
