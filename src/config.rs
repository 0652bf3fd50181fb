use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::mapping::parse_mappings;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                field,
                value,
                reason,
            } => {
                write!(f, "Invalid value '{}' for '{}': {}", value, field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// ABCP configuration loaded from `~/.config/abcp/config.toml`.
///
/// Every field has a default; environment variables override the file and
/// CLI flags override both.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub bedrock: BedrockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Optional API key for authenticating requests to /v1/* endpoints
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Log transformed request bodies and upstream statuses
    #[serde(default)]
    pub log_requests: bool,
}

/// Bedrock Runtime connection, credentials and request rewriting rules.
///
/// Example in `config.toml`:
/// ```toml
/// [bedrock]
/// region = "us-west-2"
/// default_model = "anthropic.claude-3-5-sonnet-20241022-v2:0"
///
/// [bedrock.model_mappings]
/// "claude-3-haiku" = "anthropic.claude-3-haiku-20240307-v1:0"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockConfig {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Replaces `https://bedrock-runtime.<region>.amazonaws.com`
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Time allowed for Bedrock to answer with response headers
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_version")]
    pub default_version: String,
    #[serde(default)]
    pub model_mappings: HashMap<String, String>,
    #[serde(default)]
    pub anthropic_version_mappings: HashMap<String, String>,
    #[serde(default)]
    pub enable_computer_use: bool,
    #[serde(default = "default_computer_use_beta")]
    pub computer_use_beta: String,
    #[serde(default)]
    pub enable_output_reasoning: bool,
    #[serde(default = "default_reason_budget_tokens")]
    pub reason_budget_tokens: u32,
}

/// Smallest thinking budget Bedrock accepts.
pub const MIN_REASON_BUDGET_TOKENS: u32 = 1024;

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_model() -> String {
    "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string()
}

fn default_version() -> String {
    "bedrock-2023-05-31".to_string()
}

fn default_computer_use_beta() -> String {
    "computer-use-2024-10-22".to_string()
}

fn default_reason_budget_tokens() -> u32 {
    MIN_REASON_BUDGET_TOKENS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_key: None,
        }
    }
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            session_token: None,
            region: default_region(),
            endpoint_url: None,
            timeout_secs: default_timeout(),
            default_model: default_model(),
            default_version: default_version(),
            model_mappings: HashMap::new(),
            anthropic_version_mappings: HashMap::new(),
            enable_computer_use: false,
            computer_use_beta: default_computer_use_beta(),
            enable_output_reasoning: false,
            reason_budget_tokens: default_reason_budget_tokens(),
        }
    }
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("abcp")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    /// Load the default config file, falling back to defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply process environment overrides.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides from an arbitrary lookup (used by tests).
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(api_key) = get("API_KEY") {
            self.server.api_key = Some(api_key);
        }
        // HTTP_LIST is the older spelling of the listen variable
        if let Some(listen) = get("HTTP_LISTEN").or_else(|| get("HTTP_LIST"))
            && let Some((host, port)) = listen.rsplit_once(':')
            && let Ok(port) = port.parse::<u16>()
        {
            if !host.is_empty() {
                self.server.host = host.to_string();
            }
            self.server.port = port;
        }

        let bedrock = &mut self.bedrock;
        if let Some(v) = get("AWS_BEDROCK_ACCESS_KEY") {
            bedrock.access_key = v;
        }
        if let Some(v) = get("AWS_BEDROCK_SECRET_KEY") {
            bedrock.secret_key = v;
        }
        if let Some(v) = get("AWS_BEDROCK_SESSION_TOKEN") {
            bedrock.session_token = Some(v);
        }
        if let Some(v) = get("AWS_BEDROCK_REGION") {
            bedrock.region = v;
        }
        if let Some(v) = get("AWS_BEDROCK_ENDPOINT_URL") {
            bedrock.endpoint_url = Some(v);
        }
        if let Some(v) = get("AWS_BEDROCK_MODEL_MAPPINGS") {
            bedrock.model_mappings.extend(parse_mappings(&v));
        }
        if let Some(v) = get("AWS_BEDROCK_ANTHROPIC_VERSION_MAPPINGS") {
            bedrock.anthropic_version_mappings.extend(parse_mappings(&v));
        }
        if let Some(v) = get("AWS_BEDROCK_ANTHROPIC_DEFAULT_MODEL") {
            bedrock.default_model = v;
        }
        if let Some(v) = get("AWS_BEDROCK_ANTHROPIC_DEFAULT_VERSION") {
            bedrock.default_version = v;
        }
        if let Some(v) = get("AWS_BEDROCK_ENABLE_COMPUTER_USE") {
            bedrock.enable_computer_use = v == "true";
        }
        if let Some(v) = get("AWS_BEDROCK_ENABLE_OUTPUT_REASON") {
            bedrock.enable_output_reasoning = v == "true";
        }
        if let Some(v) = get("AWS_BEDROCK_REASON_BUDGET_TOKENS")
            && let Ok(tokens) = v.trim().parse::<u32>()
        {
            bedrock.reason_budget_tokens = tokens;
        }
        self
    }

    pub fn with_overrides(mut self, port: Option<u16>, host: Option<String>, debug: bool) -> Self {
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if debug {
            self.logging.debug = true;
        }
        self
    }

    /// Reject settings that would make every request fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("bedrock.region", &self.bedrock.region),
            ("bedrock.default_model", &self.bedrock.default_model),
            ("bedrock.default_version", &self.bedrock.default_version),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.clone(),
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.bedrock.enable_output_reasoning
            && self.bedrock.reason_budget_tokens < MIN_REASON_BUDGET_TOKENS
        {
            return Err(ConfigError::InvalidValue {
                field: "bedrock.reason_budget_tokens".to_string(),
                value: self.bedrock.reason_budget_tokens.to_string(),
                reason: format!("must be at least {MIN_REASON_BUDGET_TOKENS}"),
            });
        }

        if self.bedrock.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bedrock.timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if let Some(url) = &self.bedrock.endpoint_url
            && !(url.starts_with("https://") || url.starts_with("http://"))
        {
            return Err(ConfigError::InvalidValue {
                field: "bedrock.endpoint_url".to_string(),
                value: url.clone(),
                reason: "must start with http:// or https://".to_string(),
            });
        }

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn host(&self) -> &str {
        &self.server.host
    }

    /// Render the effective config as TOML with secrets masked.
    pub fn to_masked_toml(&self) -> String {
        let mut masked = self.clone();
        let mask = |s: &mut String| {
            if !s.is_empty() {
                *s = "****".to_string();
            }
        };
        if let Some(key) = masked.server.api_key.as_mut() {
            mask(key);
        }
        mask(&mut masked.bedrock.secret_key);
        if let Some(token) = masked.bedrock.session_token.as_mut() {
            mask(token);
        }
        toml::to_string_pretty(&masked).unwrap_or_else(|e| format!("# failed to render: {e}"))
    }
}
