// Configuration loading and parsing (bot.toml, credentials.toml).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Polling intervals at or below this many milliseconds are considered
/// unusable and replaced by [`DEFAULT_POLLING_INTERVAL_MS`].
pub const MIN_POLLING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 800;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub bot: BotConfig,
    pub trade: TradeConfig,
    pub credentials: CredentialsConfig,
    pub bridge_url: String,
    pub sentry_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: LogLevel,
    /// Non-fatal problems found while loading (e.g. an unknown log level that
    /// fell back to `info`). Logged once tracing is up.
    pub warnings: Vec<String>,
}

impl Config {
    /// Persona name the bot shows to other users.
    pub fn persona_name(&self) -> String {
        format!("{}{}", self.bot.display_name_prefix, self.bot.display_name)
    }
}

// ---------------------------------------------------------------------------
// bot.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire bot.toml file.
#[derive(Debug, Clone, Deserialize)]
struct BotFile {
    bot: BotSection,
    trade: TradeSection,
    bridge: BridgeSection,
    #[serde(default)]
    paths: PathsSection,
}

#[derive(Debug, Clone, Deserialize)]
struct BotSection {
    display_name: String,
    #[serde(default)]
    display_name_prefix: String,
    #[serde(default)]
    chat_response: Option<String>,
    #[serde(default)]
    admins: Vec<u64>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TradeSection {
    maximum_trade_time: u64,
    maximum_action_gap: u64,
    #[serde(default = "default_polling_interval")]
    polling_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeSection {
    url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PathsSection {
    sentry_dir: Option<String>,
    log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}

/// Identity and chat behaviour of the bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub display_name: String,
    pub display_name_prefix: String,
    /// Reply sent to every friend chat message, when set.
    pub chat_response: Option<String>,
    pub admins: Vec<u64>,
}

/// Time limits for a single trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeConfig {
    /// Longest a whole trade may run.
    pub maximum_trade_time: Duration,
    /// Longest the peer may stay idle between trade actions.
    pub maximum_action_gap: Duration,
    pub polling_interval: Duration,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
    pub api_key: String,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Log level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/bot.toml` and
/// `config/credentials.toml`, both relative to `base_dir`.
///
/// Relative paths inside the files are resolved against `base_dir`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");
    let mut warnings = Vec::new();

    // --- bot.toml (required) ---
    let bot_path = config_dir.join("bot.toml");
    let bot_text = read_file(&bot_path)?;
    let bot_file: BotFile = toml::from_str(&bot_text).map_err(|e| ConfigError::ParseError {
        path: bot_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (required) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials_text = read_file(&credentials_path)?;
    let credentials: CredentialsConfig =
        toml::from_str(&credentials_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?;

    let log_level = match bot_file.bot.log_level.parse::<LogLevel>() {
        Ok(level) => level,
        Err(e) => {
            warnings.push(format!("{e} in bot.log_level, defaulting to 'info'"));
            LogLevel::Info
        }
    };

    let polling_ms = if bot_file.trade.polling_interval_ms <= MIN_POLLING_INTERVAL_MS {
        warnings.push(format!(
            "trade.polling_interval_ms = {} is too small, using {DEFAULT_POLLING_INTERVAL_MS}",
            bot_file.trade.polling_interval_ms
        ));
        DEFAULT_POLLING_INTERVAL_MS
    } else {
        bot_file.trade.polling_interval_ms
    };

    let trade = TradeConfig {
        maximum_trade_time: Duration::from_secs(bot_file.trade.maximum_trade_time),
        maximum_action_gap: Duration::from_secs(bot_file.trade.maximum_action_gap),
        polling_interval: Duration::from_millis(polling_ms),
    };

    let sentry_dir = match bot_file.paths.sentry_dir {
        Some(dir) => base_dir.join(dir),
        None => default_sentry_dir(base_dir),
    };
    let log_dir = base_dir.join(bot_file.paths.log_dir.unwrap_or_else(|| "logs".to_string()));

    let chat_response = bot_file
        .bot
        .chat_response
        .filter(|reply| !reply.trim().is_empty());

    let config = Config {
        bot: BotConfig {
            display_name: bot_file.bot.display_name,
            display_name_prefix: bot_file.bot.display_name_prefix,
            chat_response,
            admins: bot_file.bot.admins,
        },
        trade,
        credentials,
        bridge_url: bot_file.bridge.url,
        sentry_dir,
        log_dir,
        log_level,
        warnings,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let mut copied = Vec::new();

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };

        // credentials.toml.example is a template the operator fills in by hand
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

/// Platform data directory for sentry files, or `base_dir/state` when the
/// platform has no notion of one.
fn default_sentry_dir(base_dir: &Path) -> PathBuf {
    directories::ProjectDirs::from("", "", "tradebot")
        .map(|dirs| dirs.data_dir().join("sentry"))
        .unwrap_or_else(|| base_dir.join("state"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let required: &[(&str, &str)] = &[
        ("credentials.username", config.credentials.username.as_str()),
        ("credentials.password", config.credentials.password.as_str()),
        ("credentials.api_key", config.credentials.api_key.as_str()),
        ("bot.display_name", config.bot.display_name.as_str()),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must not be empty".into(),
            });
        }
    }

    if config.trade.maximum_trade_time.is_zero() {
        return Err(ConfigError::ValidationError {
            field: "trade.maximum_trade_time".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.trade.maximum_action_gap.is_zero() {
        return Err(ConfigError::ValidationError {
            field: "trade.maximum_action_gap".into(),
            message: "must be greater than 0".into(),
        });
    }

    // The bridge is a local sidecar; the client is built without TLS.
    let url = &config.bridge_url;
    if !url.starts_with("ws://") {
        return Err(ConfigError::ValidationError {
            field: "bridge.url".into(),
            message: format!("must be a ws:// URL, got '{url}'"),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
