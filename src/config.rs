//! Library configuration.
//!
//! Mirrors the knobs a session needs: the HTTP client (or settings to build
//! one), the operation timeout, static headers, the user agent and the
//! archive size cap. Builder methods allow fluent construction:
//!
//! ```
//! use runarc::{Config, Timeout};
//!
//! let config = Config::default()
//!     .with_timeout(Timeout::Unlimited)
//!     .with_header("Authorization", "Bearer token")
//!     .with_max_file_size(512 * 1024 * 1024);
//! # let _ = config;
//! ```

use std::collections::HashMap;
use std::time::Duration;

/// Operation deadline for a session.
///
/// The configuration convention is signed seconds: negative disables the
/// deadline entirely (required for streaming multi-gigabyte extractions,
/// both the HTTP client timer and the session deadline are turned off),
/// zero selects the 120 second default, positive is a hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// No deadline at all.
    Unlimited,
    /// Hard deadline per session.
    After(Duration),
}

impl Timeout {
    /// Default deadline applied when the configured value is zero.
    pub const DEFAULT: Duration = Duration::from_secs(120);

    /// Interpret a signed-seconds configuration value.
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            Timeout::Unlimited
        } else if secs == 0 {
            Timeout::After(Self::DEFAULT)
        } else {
            Timeout::After(Duration::from_secs(secs as u64))
        }
    }

    /// The deadline duration, if any.
    pub fn deadline(&self) -> Option<Duration> {
        match self {
            Timeout::Unlimited => None,
            Timeout::After(d) => Some(*d),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::After(Duration::from_secs(30))
    }
}

/// Configuration for archive sessions.
#[derive(Debug, Clone)]
pub struct Config {
    /// Injected HTTP client. When `None`, a pooled client is built from the
    /// other settings.
    pub http_client: Option<reqwest::Client>,
    /// Deadline for session operations and HTTP requests.
    pub timeout: Timeout,
    /// Static headers added to every request.
    pub headers: HashMap<String, String>,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Maximum archive size in bytes, 0 means unlimited.
    pub max_file_size: u64,
    /// Log degraded-origin warnings and other diagnostics.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_client: None,
            timeout: Timeout::default(),
            headers: HashMap::new(),
            user_agent: concat!("runarc/", env!("CARGO_PKG_VERSION")).to_string(),
            max_file_size: 0,
            debug: false,
        }
    }
}

impl Config {
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
