//! Environment-driven server configuration.

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP RPC binding.
    pub http_addr: String,
    /// Path of the libSQL database file.
    pub store_path: String,
    /// Shared token accepted by the legacy auth fallback.
    pub auth_token: Option<String>,
    /// The legacy fallback is opt-in; both this flag and `auth_token` must be
    /// set for it to engage.
    pub allow_legacy_auth: bool,
    pub bootstrap_agent_id: String,
    pub bootstrap_agent_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            http_addr: env_or("HTTP_ADDR", "127.0.0.1:8080"),
            store_path: env_or("STORE_PATH", "./data/modeloman.db"),
            auth_token: env_opt("AUTH_TOKEN"),
            allow_legacy_auth: env_bool_or("ALLOW_LEGACY_AUTH_TOKEN", false)?,
            bootstrap_agent_id: env_or("BOOTSTRAP_AGENT_ID", "orchestrator"),
            bootstrap_agent_key: env_opt("BOOTSTRAP_AGENT_KEY"),
        })
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    env_opt(key).unwrap_or_else(|| fallback.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => {
            let value = value.trim();
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        Err(_) => None,
    }
}

fn env_bool_or(key: &str, fallback: bool) -> Result<bool, AppError> {
    match env_opt(key) {
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            AppError::invalid_argument(format!("{key} must be 'true' or 'false', got {raw:?}"))
        }),
        None => Ok(fallback),
    }
}
