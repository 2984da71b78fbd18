//! Configuration management for the relay.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default Broadmail HTTP API base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://api.broadmail.de/http";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default number of replays before a record is escalated.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 5;

/// Default subject line of the operator alert.
pub const DEFAULT_OPERATOR_SUBJECT: &str = "Broadmail delivery failed";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 600;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Recipient of escalation alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Operator e-mail address. Escalations are only logged when unset.
    #[serde(default)]
    pub address: Option<String>,
    /// Display name used in the `To:` header.
    #[serde(default)]
    pub name: Option<String>,
    /// Subject line of the alert.
    #[serde(default = "default_operator_subject")]
    pub subject: String,
}

fn default_operator_subject() -> String {
    DEFAULT_OPERATOR_SUBJECT.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRY_COUNT
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_retry_interval_secs() -> u64 {
    DEFAULT_RETRY_INTERVAL_SECS
}

fn default_user_agent() -> String {
    format!("broadmail-relay/{}", env!("CARGO_PKG_VERSION"))
}

/// Main relay configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Base URL of the Broadmail HTTP API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// API authorization code. Calls are rejected locally while it is unset.
    #[serde(default)]
    pub auth_code: Option<String>,
    /// Replays allowed per record before escalation.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// TCP connect timeout for outbound calls.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Overall timeout for one outbound call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Period of the retry loop in `run` mode.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// User agent sent with every call.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Escalation recipient.
    #[serde(default)]
    pub operator: OperatorConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("api_base_url", &self.api_base_url)
            .field("auth_code", &self.auth_code.as_ref().map(|_| "<redacted>"))
            .field("max_retry_count", &self.max_retry_count)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retry_interval_secs", &self.retry_interval_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("user_agent", &self.user_agent)
            .field("operator", &self.operator)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            api_base_url: default_api_base_url(),
            auth_code: None,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            accept_invalid_certs: false,
            user_agent: default_user_agent(),
            operator: OperatorConfig {
                subject: default_operator_subject(),
                ..OperatorConfig::default()
            },
        }
    }
}

impl Config {
    /// Load configuration from the base directory, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Apply `BROADMAIL_*` overrides using the given variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(level) = lookup("BROADMAIL_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(format) = lookup("BROADMAIL_LOG_FORMAT").and_then(|f| LogFormat::from_str(&f)) {
            self.log_format = format;
        }
        if let Some(url) = lookup("BROADMAIL_API_URL") {
            self.api_base_url = url;
        }
        if let Some(code) = lookup("BROADMAIL_AUTH_CODE") {
            self.auth_code = Some(code);
        }
        if let Some(count) = lookup("BROADMAIL_MAX_RETRY_COUNT").and_then(|c| c.parse().ok()) {
            self.max_retry_count = count;
        }
        if let Some(address) = lookup("BROADMAIL_OPERATOR_EMAIL") {
            self.operator.address = Some(address);
        }
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        self.api_base_url()?;
        if self.max_retry_count == 0 {
            return Err(CoreError::Config(
                "max_retry_count must be at least 1".to_string(),
            ));
        }
        if self.retry_interval_secs == 0 {
            return Err(CoreError::Config(
                "retry_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the API base URL as a parsed URL.
    pub fn api_base_url(&self) -> CoreResult<Url> {
        Url::parse(&self.api_base_url).map_err(CoreError::from)
    }

    /// The configured credential, ignoring blank values.
    pub fn credential(&self) -> Option<&str> {
        self.auth_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
    }
}
