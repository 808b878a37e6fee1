//! Server configuration: TOML file, environment overrides, validation.
//!
//! Every setting can be overridden with a `RUNARC_`-prefixed environment
//! variable, upper-cased with `_` separators (`RUNARC_SERVER_PORT`,
//! `RUNARC_SERVER_AUTH_ENABLED`, ...). List values are comma-separated.

use std::env;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub library: LibrarySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub max_concurrent: usize,
    pub auth: AuthSettings,
    pub timeout: TimeoutSettings,
    pub cors: CorsSettings,
    pub rate_limit: RateLimitSettings,
    pub ip_whitelist: IpWhitelistSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            max_concurrent: 100,
            auth: AuthSettings::default(),
            timeout: TimeoutSettings::default(),
            cors: CorsSettings::default(),
            rate_limit: RateLimitSettings::default(),
            ip_whitelist: IpWhitelistSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub header_key: String,
    /// Single key kept for backward compatibility.
    pub secret_key: String,
    pub api_keys: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            header_key: "X-API-Key".to_string(),
            secret_key: String::new(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Request read deadline in seconds.
    pub read: u64,
    /// Response write deadline in seconds.
    pub write: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { read: 30, write: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub enabled: bool,
    /// `"*"` or exact-match origins.
    pub origins: Vec<String>,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_min: u32,
    /// Client addresses that bypass limiting.
    pub whitelist: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_min: 60,
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IpWhitelistSettings {
    pub enabled: bool,
    /// Plain IPs and CIDR blocks, IPv4 and IPv6.
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Archive size cap in bytes, 0 means unlimited.
    pub max_file_size: u64,
    /// Signed seconds: negative disables deadlines, 0 selects the default.
    pub timeout: i64,
    pub debug: bool,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            max_file_size: 500 * 1024 * 1024,
            timeout: 30,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional TOML file, apply environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw).context("failed to parse config file")?
            }
            None => ServerConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// All accepted API keys: the legacy single key plus the key list.
    pub fn all_api_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if !self.server.auth.secret_key.is_empty() {
            keys.push(self.server.auth.secret_key.clone());
        }
        keys.extend(
            self.server
                .auth
                .api_keys
                .iter()
                .filter(|k| !k.is_empty())
                .cloned(),
        );
        keys
    }

    fn apply_env_overrides(&mut self) {
        override_parse("RUNARC_SERVER_PORT", &mut self.server.port);
        override_parse("RUNARC_SERVER_MAX_CONCURRENT", &mut self.server.max_concurrent);
        override_parse("RUNARC_SERVER_AUTH_ENABLED", &mut self.server.auth.enabled);
        override_string("RUNARC_SERVER_AUTH_HEADER_KEY", &mut self.server.auth.header_key);
        override_string("RUNARC_SERVER_AUTH_SECRET_KEY", &mut self.server.auth.secret_key);
        override_list("RUNARC_SERVER_AUTH_API_KEYS", &mut self.server.auth.api_keys);
        override_parse("RUNARC_SERVER_TIMEOUT_READ", &mut self.server.timeout.read);
        override_parse("RUNARC_SERVER_TIMEOUT_WRITE", &mut self.server.timeout.write);
        override_parse("RUNARC_SERVER_CORS_ENABLED", &mut self.server.cors.enabled);
        override_list("RUNARC_SERVER_CORS_ORIGINS", &mut self.server.cors.origins);
        override_parse(
            "RUNARC_SERVER_RATE_LIMIT_ENABLED",
            &mut self.server.rate_limit.enabled,
        );
        override_parse(
            "RUNARC_SERVER_RATE_LIMIT_REQUESTS_PER_MIN",
            &mut self.server.rate_limit.requests_per_min,
        );
        override_list(
            "RUNARC_SERVER_RATE_LIMIT_WHITELIST",
            &mut self.server.rate_limit.whitelist,
        );
        override_parse(
            "RUNARC_SERVER_IP_WHITELIST_ENABLED",
            &mut self.server.ip_whitelist.enabled,
        );
        override_list("RUNARC_SERVER_IP_WHITELIST_IPS", &mut self.server.ip_whitelist.ips);
        override_parse("RUNARC_LIBRARY_MAX_FILE_SIZE", &mut self.library.max_file_size);
        override_parse("RUNARC_LIBRARY_TIMEOUT", &mut self.library.timeout);
        override_parse("RUNARC_LIBRARY_DEBUG", &mut self.library.debug);
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            bail!("invalid port number: {}", self.server.port);
        }

        if self.server.auth.enabled && self.all_api_keys().is_empty() {
            bail!("auth is enabled but no API keys are configured (set secret_key or api_keys)");
        }

        if self.server.max_concurrent < 1 {
            bail!("max_concurrent must be at least 1");
        }

        if self.server.ip_whitelist.enabled && self.server.ip_whitelist.ips.is_empty() {
            bail!("ip_whitelist is enabled but no IPs are configured");
        }

        Ok(())
    }
}

fn override_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse::<T>() {
            *target = parsed;
        }
    }
}

fn override_string(name: &str, target: &mut String) {
    if let Ok(value) = env::var(name) {
        *target = value;
    }
}

fn override_list(name: &str, target: &mut Vec<String>) {
    if let Ok(value) = env::var(name) {
        *target = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}
