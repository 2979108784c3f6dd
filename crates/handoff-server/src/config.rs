use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff::{EnvOverrides, FailurePolicy, HandoffConfig, Network};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file at {path}")]
    FileNotFound { path: PathBuf },

    #[error("malformed TOML ({line}:{column}): {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub pid: PidConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub restart: RestartConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            address: default_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PidConfig {
    /// Relative paths resolve against the working directory.
    #[serde(default = "default_pid_path")]
    pub path: PathBuf,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            path: default_pid_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DrainConfig {
    /// Unset waits for every connection.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_policy")]
    pub on_parent_termination_failure: String,
    #[serde(default = "default_policy")]
    pub on_successor_start_failure: String,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            on_parent_termination_failure: default_policy(),
            on_successor_start_failure: default_policy(),
        }
    }
}

/// Values that take precedence over the file. Command-line flags are merged
/// over the environment with [`ConfigOverrides::or`].
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub network: Option<String>,
    pub listen_address: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub drain_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// `HANDOFF_LISTEN_ADDRESS` and `HANDOFF_LOG_LEVEL`, plus the pid file
    /// and drain timeout as the library reads them.
    pub fn from_env() -> Self {
        Self::with_library_env(EnvOverrides::capture())
            .or(Self {
                listen_address: std::env::var("HANDOFF_LISTEN_ADDRESS").ok(),
                log_level: std::env::var("HANDOFF_LOG_LEVEL").ok(),
                ..Default::default()
            })
    }

    fn with_library_env(env: EnvOverrides) -> Self {
        Self {
            pid_file: env.pid_file,
            drain_timeout_secs: env.drain_timeout.map(|d| d.as_secs()),
            ..Default::default()
        }
    }

    /// Fill every unset value from `fallback`.
    pub fn or(self, fallback: ConfigOverrides) -> Self {
        Self {
            network: self.network.or(fallback.network),
            listen_address: self.listen_address.or(fallback.listen_address),
            pid_file: self.pid_file.or(fallback.pid_file),
            drain_timeout_secs: self.drain_timeout_secs.or(fallback.drain_timeout_secs),
            log_level: self.log_level.or(fallback.log_level),
        }
    }
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("handoff-server.pid")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_policy() -> String {
    "abort".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Translate into the coordinator's configuration for this process.
    pub fn handoff_config(&self) -> Result<HandoffConfig, ConfigError> {
        let network = parse_network(&self.listen.network)?;
        let mut config = HandoffConfig::new(network, self.listen.address.clone())
            .with_pid_file(self.pid.path.clone())
            .with_parent_termination_policy(parse_policy(
                "restart.on_parent_termination_failure",
                &self.restart.on_parent_termination_failure,
            )?)
            .with_successor_start_policy(parse_policy(
                "restart.on_successor_start_failure",
                &self.restart.on_successor_start_failure,
            )?);

        if let Some(secs) = self.drain.timeout_secs {
            config = config.with_drain_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }
}

/// Load configuration from `path`, or start from defaults when no file is
/// given, then apply `overrides` and validate.
pub fn load_config(
    path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let Some(path) = path else {
        let mut config = Config::default();
        apply_overrides(&mut config, overrides);
        validate(&config)?;
        return Ok(config);
    };

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str(&contents, overrides)
}

pub fn load_config_from_str(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e
            .span()
            .map_or((0, 0), |span| line_and_column(toml_str, span.start));
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

/// One-based line and column of byte `offset` in `src`.
fn line_and_column(src: &str, offset: usize) -> (usize, usize) {
    let head = &src[..offset];
    let line_start = head.rfind('\n').map_or(0, |nl| nl + 1);
    (head.matches('\n').count() + 1, offset - line_start + 1)
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(network) = overrides.network {
        config.listen.network = network;
    }
    if let Some(address) = overrides.listen_address {
        config.listen.address = address;
    }
    if let Some(path) = overrides.pid_file {
        config.pid.path = path;
    }
    if let Some(secs) = overrides.drain_timeout_secs {
        config.drain.timeout_secs = Some(secs);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    parse_network(&config.listen.network)?;

    if config.listen.address.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "listen.address".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if config.pid.path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "pid.path".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    parse_policy(
        "restart.on_parent_termination_failure",
        &config.restart.on_parent_termination_failure,
    )?;
    parse_policy(
        "restart.on_successor_start_failure",
        &config.restart.on_successor_start_failure,
    )?;

    Ok(())
}

fn parse_network(value: &str) -> Result<Network, ConfigError> {
    value.parse::<Network>().map_err(|e| ConfigError::InvalidValue {
        field: "listen.network".to_string(),
        message: e.to_string(),
    })
}

fn parse_policy(field: &str, value: &str) -> Result<FailurePolicy, ConfigError> {
    value.parse::<FailurePolicy>().map_err(|message| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    })
}
