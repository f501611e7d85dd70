pub mod validation;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;
use crate::sieve::SieveLimits;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_body_limit_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: None,
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            http_use_env_proxy: false,
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

/// Endpoints of the collaborator that issues leases and vendor credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareConfig {
    pub url: String,
    pub release_url: String,
    #[serde(default, skip_serializing)]
    pub internal_token: Option<String>,
    #[serde(default = "default_prepare_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

fn default_prepare_timeout_secs() -> u64 {
    30
}
fn default_release_timeout_ms() -> u64 {
    1500
}

/// Vendor completion endpoint and the static headers sent with every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_completion_url")]
    pub completion_url: String,
    #[serde(default = "default_vendor_headers")]
    pub headers: BTreeMap<String, String>,
}

fn default_completion_url() -> String {
    "https://chat.deepseek.com/api/v0/chat/completion".to_string()
}

fn default_vendor_headers() -> BTreeMap<String, String> {
    [
        ("user-agent", "DeepSeek/1.0.13 Android/35"),
        ("accept", "application/json"),
        ("content-type", "application/json"),
        ("x-client-platform", "android"),
        ("x-client-version", "1.3.0-auto-resume"),
        ("x-client-locale", "zh_CN"),
        ("accept-charset", "UTF-8"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            completion_url: default_completion_url(),
            headers: default_vendor_headers(),
        }
    }
}

/// Tool-call sieve limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SieveConfig {
    #[serde(default = "default_capture_limit_bytes")]
    pub capture_limit_bytes: usize,
    #[serde(default = "default_hold_window_chars")]
    pub hold_window_chars: usize,
    #[serde(default = "default_context_tail_chars")]
    pub context_tail_chars: usize,
}

fn default_capture_limit_bytes() -> usize {
    8 * 1024
}
fn default_hold_window_chars() -> usize {
    64
}
fn default_context_tail_chars() -> usize {
    256
}

impl Default for SieveConfig {
    fn default() -> Self {
        Self {
            capture_limit_bytes: default_capture_limit_bytes(),
            hold_window_chars: default_hold_window_chars(),
            context_tail_chars: default_context_tail_chars(),
        }
    }
}

impl SieveConfig {
    #[must_use]
    pub fn limits(&self) -> SieveLimits {
        SieveLimits {
            capture_limit: self.capture_limit_bytes,
            hold_window: self.hold_window_chars,
            context_tail: self.context_tail_chars,
        }
    }
}

/// Metadata paths the classifier drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Substring matches.
    #[serde(default = "default_skip_path_patterns")]
    pub skip_path_patterns: Vec<String>,
    #[serde(default = "default_skip_exact_paths")]
    pub skip_exact_paths: Vec<String>,
}

fn default_skip_path_patterns() -> Vec<String> {
    [
        "quasi_status",
        "elapsed_secs",
        "token_usage",
        "pending_fragment",
        "conversation_mode",
        "fragments/-1/status",
        "fragments/-2/status",
        "fragments/-3/status",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_skip_exact_paths() -> Vec<String> {
    vec!["response/search_status".to_string()]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            skip_path_patterns: default_skip_path_patterns(),
            skip_exact_paths: default_skip_exact_paths(),
        }
    }
}

/// Log line format written to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Server-wide default; a prepare response may override it per request.
    #[serde(default = "default_true")]
    pub emit_early_tool_deltas: bool,
    #[serde(default = "default_true")]
    pub final_text_fallback: bool,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
            emit_early_tool_deltas: true,
            final_text_fallback: true,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub prepare: PrepareConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub sieve: SieveConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
