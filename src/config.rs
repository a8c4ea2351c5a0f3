//! Runtime configuration resolved from the environment
//!
//! Everything is read once at startup; no component reads env vars on its
//! own after construction.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::info;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Credentials and endpoint override for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret for bearer-token verification.
    pub auth_secret: String,
    pub port: u16,
    /// Postgres connection string; `None` selects the in-memory backends.
    pub database_url: Option<String>,
    pub default_chat_provider: String,
    pub default_embedding_provider: String,
    pub providers: HashMap<String, ProviderCredentials>,
    pub request_timeout: Duration,
    pub chat_timeout: Duration,
    pub embed_timeout: Duration,
}

fn env_duration_ms(name: &str, fallback: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("POSTGRES_URL"))
            .or_else(|_| env::var("PG_URL"))
            .ok();

        let port = env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(8080);

        let auth_secret = env::var("AUTH_SECRET").unwrap_or_default();

        let mut providers = HashMap::new();
        for name in ["openai", "anthropic", "fireworks", "ollama"] {
            let key_var = format!("{}_API_KEY", name.to_uppercase());
            let endpoint_var = format!("{}_ENDPOINT", name.to_uppercase());
            providers.insert(
                name.to_string(),
                ProviderCredentials {
                    api_key: env::var(&key_var).ok(),
                    endpoint: env::var(&endpoint_var).ok(),
                },
            );
        }

        let request_timeout = env_duration_ms("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT);

        let config = Self {
            auth_secret,
            port,
            database_url,
            default_chat_provider: env::var("DEFAULT_MODEL_PROVIDER")
                .unwrap_or_else(|_| "openai".to_string()),
            default_embedding_provider: env::var("DEFAULT_EMBEDDING_PROVIDER")
                .unwrap_or_else(|_| "internal".to_string()),
            providers,
            request_timeout,
            chat_timeout: env_duration_ms("CHAT_TIMEOUT_MS", request_timeout),
            embed_timeout: env_duration_ms("EMBED_TIMEOUT_MS", request_timeout),
        };

        // Never log the secret or API keys, only which backends are active.
        info!(
            database = config.database_url.is_some(),
            chat_provider = %config.default_chat_provider,
            embedding_provider = %config.default_embedding_provider,
            "Configuration resolved"
        );

        config
    }

    pub fn credentials(&self, provider: &str) -> ProviderCredentials {
        self.providers.get(provider).cloned().unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_secret: String::new(),
            port: 8080,
            database_url: None,
            default_chat_provider: "openai".to_string(),
            default_embedding_provider: "internal".to_string(),
            providers: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            chat_timeout: DEFAULT_REQUEST_TIMEOUT,
            embed_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}
