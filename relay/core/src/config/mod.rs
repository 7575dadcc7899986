//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, from a TOML file at
//! `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - config: `$XDG_CONFIG_HOME/chat-relay/relay.toml`
//! - state: `$XDG_DATA_HOME/chat-relay/` (credentials and sessions)
//!
//! # Example Configuration
//!
//! ```toml
//! [upstream]
//! base_url = "https://grok.com"
//! connect_timeout_ms = 10000
//! request_timeout_secs = 120
//! stream_timeout_secs = 600
//! proxy_url = "http://127.0.0.1:7890"
//!
//! [pool]
//! rate_limit_cooldown_secs = 18000
//! quota_exhausted_cooldown_secs = 36000
//! failure_cooldown_secs = 3600
//! failure_threshold = 5
//! refresh_quota_after_turn = true
//!
//! [conversation]
//! ttl_secs = 72000
//! max_per_credential = 100
//! refresh_share_each_turn = true
//! sweep_interval_secs = 60
//!
//! [output]
//! show_thinking = true
//! show_search = true
//!
//! [storage]
//! data_dir = "/var/lib/chat-relay"
//! max_log_entries = 1000
//!
//! [[credentials]]
//! secret = "eyJhbGciOi..."
//! name = "main"
//! tier = "super"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::StoreConfig;
use crate::credentials::{PoolConfig, Tier};
use crate::driver::DriverConfig;
use crate::translator::TranslatorConfig;
use crate::upstream::UpstreamConfig;

/// Application directory under the XDG base directories
const APP_DIR: &str = "chat-relay";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Upstream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Base URL of the upstream service
    pub base_url: Option<String>,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Timeout for share, clone and quota calls in seconds
    pub request_timeout_secs: Option<u64>,

    /// Timeout for one streamed turn in seconds
    pub stream_timeout_secs: Option<u64>,

    /// HTTP(S) or SOCKS proxy
    pub proxy_url: Option<String>,
}

/// Pool section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Cooldown after a rate limit while quota remains
    pub rate_limit_cooldown_secs: Option<u64>,

    /// Cooldown after a rate limit with no quota left
    pub quota_exhausted_cooldown_secs: Option<u64>,

    /// Cooldown after repeated other failures
    pub failure_cooldown_secs: Option<u64>,

    /// Consecutive other failures before cooling
    pub failure_threshold: Option<u32>,

    /// How long an auth failure disables a credential (0 = until re-enabled)
    pub auth_cooldown_secs: Option<u64>,

    /// Re-read a credential's quota in the background after each success
    pub refresh_quota_after_turn: Option<bool>,
}

/// Conversation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationToml {
    /// Idle time-to-live of a conversation in seconds
    pub ttl_secs: Option<u64>,

    /// Live conversations per credential
    pub max_per_credential: Option<usize>,

    /// Refresh the share link after every turn
    pub refresh_share_each_turn: Option<bool>,

    /// Maintenance sweep interval in seconds
    pub sweep_interval_secs: Option<u64>,
}

/// Output section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputToml {
    /// Surface reasoning inside a think block
    pub show_thinking: Option<bool>,

    /// Surface search progress lines
    pub show_search: Option<bool>,
}

/// Storage section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Directory for persisted credentials and sessions
    pub data_dir: Option<PathBuf>,

    /// Entries kept in the in-memory request log
    pub max_log_entries: Option<usize>,

    /// Image cache budget, for the external image cache
    pub max_image_cache_mb: Option<u64>,

    /// Log file size limit, for the external log rotation
    pub max_log_file_mb: Option<u64>,
}

/// One `[[credentials]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialToml {
    /// Raw secret, optionally cookie-formatted (`sso=...`)
    pub secret: String,

    /// Operator label
    pub name: Option<String>,

    /// Account tier (`free`, `super`, `unknown`)
    pub tier: Option<String>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Upstream settings
    pub upstream: UpstreamToml,

    /// Credential pool settings
    pub pool: PoolToml,

    /// Conversation store settings
    pub conversation: ConversationToml,

    /// Output settings
    pub output: OutputToml,

    /// Storage settings
    pub storage: StorageToml,

    /// Seed credentials
    pub credentials: Vec<CredentialToml>,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// A credential to add to the pool at startup
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSeed {
    /// Raw secret
    pub secret: String,
    /// Operator label
    pub name: String,
    /// Account tier
    pub tier: Tier,
}

impl std::fmt::Debug for CredentialSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSeed")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

/// Relay configuration with all sources resolved
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Upstream client settings
    pub upstream: UpstreamConfig,

    /// Credential cooldown policy
    pub pool: PoolConfig,

    /// Conversation store limits
    pub store: StoreConfig,

    /// Refresh the share link after every turn
    pub refresh_share_each_turn: bool,

    /// Re-read a credential's quota in the background after each success
    pub refresh_quota_after_turn: bool,

    /// Maintenance sweep interval
    pub sweep_interval: Duration,

    /// Fragment kinds surfaced to callers
    pub output: TranslatorConfig,

    /// Directory for persisted state
    pub data_dir: PathBuf,

    /// Entries kept in the request log
    pub max_log_entries: usize,

    /// Image cache budget in MiB (consumed by the external image cache)
    pub max_image_cache_mb: u64,

    /// Log file size limit in MiB (consumed by the external log rotation)
    pub max_log_file_mb: u64,

    /// Credentials added to the pool at startup
    pub credentials: Vec<CredentialSeed>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            pool: PoolConfig::default(),
            store: StoreConfig::default(),
            refresh_share_each_turn: true,
            refresh_quota_after_turn: true,
            sweep_interval: Duration::from_secs(60),
            output: TranslatorConfig::default(),
            data_dir: default_data_dir(),
            max_log_entries: 1000,
            max_image_cache_mb: 500,
            max_log_file_mb: 10,
            credentials: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Continuation driver settings derived from this configuration
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            refresh_share_each_turn: self.refresh_share_each_turn,
            refresh_quota_after_turn: self.refresh_quota_after_turn,
            translator: self.output,
            stream_timeout: self.upstream.stream_timeout,
            ..DriverConfig::default()
        }
    }

    /// Reject values the relay cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::ValidationError(what.to_string()));

        if self.store.ttl.is_zero() {
            return invalid("conversation ttl must be greater than zero");
        }
        if self.store.max_per_credential == 0 {
            return invalid("max conversations per credential must be greater than zero");
        }
        if self.upstream.connect_timeout.is_zero() {
            return invalid("connect timeout must be greater than zero");
        }
        if self.upstream.request_timeout.is_zero() {
            return invalid("request timeout must be greater than zero");
        }
        if self.upstream.stream_timeout.is_zero() {
            return invalid("stream timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep interval must be greater than zero");
        }
        if self.pool.failure_threshold == 0 {
            return invalid("failure threshold must be at least 1");
        }
        if self.upstream.base_url.trim().is_empty() {
            return invalid("upstream base_url must not be empty");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("relay.toml"))
}

/// Default directory for persisted state
///
/// `$XDG_DATA_HOME/chat-relay`, or `./data` when no data directory is known.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from("data"), |p| p.join(APP_DIR))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resolved values fail validation. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails [`RelayConfig::validate`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                credentials = config.credentials.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) -> Result<(), ConfigError> {
    // Upstream
    if let Some(url) = &toml.upstream.base_url {
        config.upstream.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(ms) = toml.upstream.connect_timeout_ms {
        config.upstream.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.upstream.request_timeout_secs {
        config.upstream.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.upstream.stream_timeout_secs {
        config.upstream.stream_timeout = Duration::from_secs(secs);
    }
    if toml.upstream.proxy_url.is_some() {
        config.upstream.proxy_url = toml.upstream.proxy_url.clone().filter(|p| !p.is_empty());
    }

    // Pool
    if let Some(secs) = toml.pool.rate_limit_cooldown_secs {
        config.pool.rate_limit_cooldown = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.pool.quota_exhausted_cooldown_secs {
        config.pool.quota_exhausted_cooldown = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.pool.failure_cooldown_secs {
        config.pool.failure_cooldown = Duration::from_secs(secs);
    }
    if let Some(threshold) = toml.pool.failure_threshold {
        config.pool.failure_threshold = threshold;
    }
    if let Some(secs) = toml.pool.auth_cooldown_secs {
        config.pool.auth_cooldown = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(refresh) = toml.pool.refresh_quota_after_turn {
        config.refresh_quota_after_turn = refresh;
    }

    // Conversation
    if let Some(secs) = toml.conversation.ttl_secs {
        config.store.ttl = Duration::from_secs(secs);
    }
    if let Some(max) = toml.conversation.max_per_credential {
        config.store.max_per_credential = max;
    }
    if let Some(refresh) = toml.conversation.refresh_share_each_turn {
        config.refresh_share_each_turn = refresh;
    }
    if let Some(secs) = toml.conversation.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }

    // Output
    if let Some(show) = toml.output.show_thinking {
        config.output.show_thinking = show;
    }
    if let Some(show) = toml.output.show_search {
        config.output.show_search = show;
    }

    // Storage
    if let Some(dir) = &toml.storage.data_dir {
        config.data_dir.clone_from(dir);
    }
    if let Some(max) = toml.storage.max_log_entries {
        config.max_log_entries = max;
    }
    if let Some(mb) = toml.storage.max_image_cache_mb {
        config.max_image_cache_mb = mb;
    }
    if let Some(mb) = toml.storage.max_log_file_mb {
        config.max_log_file_mb = mb;
    }

    // Credentials
    for (index, entry) in toml.credentials.iter().enumerate() {
        let tier = match entry.tier.as_deref() {
            None => Tier::Unknown,
            Some(raw) => Tier::parse(raw).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "credentials[{index}]: unknown tier '{raw}'"
                ))
            })?,
        };
        config.credentials.push(CredentialSeed {
            secret: entry.secret.clone(),
            name: entry.name.clone().unwrap_or_default(),
            tier,
        });
    }

    Ok(())
}

fn env_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RelayConfig) {
    // Upstream settings from environment
    if let Ok(url) = std::env::var("RELAY_BASE_URL") {
        config.upstream.base_url = url.trim_end_matches('/').to_string();
        config.source = ConfigSource::Env;
    }
    if let Ok(proxy) = std::env::var("RELAY_PROXY_URL") {
        config.upstream.proxy_url = (!proxy.is_empty()).then_some(proxy);
        config.source = ConfigSource::Env;
    }
    if let Ok(timeout) = std::env::var("RELAY_CONNECT_TIMEOUT") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.upstream.connect_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("RELAY_REQUEST_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.upstream.request_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("RELAY_STREAM_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.upstream.stream_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }

    // Conversation settings from environment
    if let Ok(ttl) = std::env::var("RELAY_CONVERSATION_TTL") {
        if let Ok(secs) = ttl.parse::<u64>() {
            config.store.ttl = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(max) = std::env::var("RELAY_MAX_CONVERSATIONS") {
        if let Ok(n) = max.parse::<usize>() {
            config.store.max_per_credential = n;
            config.source = ConfigSource::Env;
        }
    }

    // Output settings from environment
    if let Ok(show) = std::env::var("RELAY_SHOW_THINKING") {
        config.output.show_thinking = env_flag(&show);
        config.source = ConfigSource::Env;
    }
    if let Ok(show) = std::env::var("RELAY_SHOW_SEARCH") {
        config.output.show_search = env_flag(&show);
        config.source = ConfigSource::Env;
    }

    // Storage settings from environment
    if let Ok(dir) = std::env::var("RELAY_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }

    // Comma-separated secrets, appended to the file's credentials
    if let Ok(secrets) = std::env::var("RELAY_CREDENTIALS") {
        let before = config.credentials.len();
        config.credentials.extend(
            secrets
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|secret| CredentialSeed {
                    secret: secret.to_string(),
                    name: String::new(),
                    tier: Tier::Unknown,
                }),
        );
        if config.credentials.len() > before {
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Upstream base URL override
    pub base_url: Option<String>,

    /// Proxy override
    pub proxy_url: Option<String>,

    /// Data directory override
    pub data_dir: Option<PathBuf>,

    /// Show-thinking override
    pub show_thinking: Option<bool>,

    /// Show-search override
    pub show_search: Option<bool>,

    /// Conversation TTL override (seconds)
    pub ttl_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set upstream base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set proxy override
    #[must_use]
    pub fn with_proxy_url(mut self, url: String) -> Self {
        self.proxy_url = Some(url);
        self
    }

    /// Set data directory override
    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    /// Set show-thinking override
    #[must_use]
    pub fn with_show_thinking(mut self, show: bool) -> Self {
        self.show_thinking = Some(show);
        self
    }

    /// Set show-search override
    #[must_use]
    pub fn with_show_search(mut self, show: bool) -> Self {
        self.show_search = Some(show);
        self
    }

    /// Set conversation TTL override
    #[must_use]
    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.base_url.is_some()
            || self.proxy_url.is_some()
            || self.data_dir.is_some()
            || self.show_thinking.is_some()
            || self.show_search.is_some()
            || self.ttl_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(url) = &self.base_url {
            config.upstream.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(proxy) = &self.proxy_url {
            config.upstream.proxy_url = Some(proxy.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir.clone_from(dir);
        }
        if let Some(show) = self.show_thinking {
            config.output.show_thinking = show;
        }
        if let Some(show) = self.show_search {
            config.output.show_search = show;
        }
        if let Some(secs) = self.ttl_secs {
            config.store.ttl = Duration::from_secs(secs);
        }
    }
}
