use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

/// Credentials and endpoint for the single account a session logs into.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Local part only; `bob`, not `bob@example.com`.
    pub username: String,
    pub domain: String,
    pub password: String,
    /// Transport endpoint, e.g. a WebSocket or BOSH URL.
    pub service: Option<String>,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    username: Option<String>,
    domain: Option<String>,
    password: Option<String>,
    service: Option<String>,
    log_level: Option<String>,
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[account]
username = ""
domain = ""
password = ""
# service = "wss://xmpp.example.com/xmpp-websocket"
# resource = "tern"

[connection]
timeout_seconds = 30

[logging]
level = "info"

[event_bus]
channel_capacity = 1024
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("im", "tern", "tern") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. A missing file is replaced by a
/// commented default and reported as missing credentials.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(&path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec![
                    "account.username".to_string(),
                    "account.domain".to_string(),
                    "account.password".to_string(),
                ],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        username: std::env::var("TERN_USERNAME").ok(),
        domain: std::env::var("TERN_DOMAIN").ok(),
        password: std::env::var("TERN_PASSWORD").ok(),
        service: std::env::var("TERN_SERVICE").ok(),
        log_level: std::env::var("TERN_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(username) = overrides.username {
        config.account.username = username;
    }
    if let Some(domain) = overrides.domain {
        config.account.domain = domain;
    }
    if let Some(password) = overrides.password {
        config.account.password = password;
    }
    if let Some(service) = overrides.service {
        config.account.service = Some(service);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.account.username.is_empty() {
        missing.push("account.username".to_string());
    }
    if config.account.domain.is_empty() {
        missing.push("account.domain".to_string());
    }
    if config.account.password.is_empty() {
        missing.push("account.password".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if config.account.domain.contains(['@', '/']) {
        return Err(ConfigError::InvalidValue {
            field: "account.domain".to_string(),
            message: "must be a bare domain without '@' or '/'".to_string(),
        });
    }

    if config.connection.timeout_seconds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "connection.timeout_seconds".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
