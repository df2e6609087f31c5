use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::firewall::BackendKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Top-level daemon configuration, merged from a YAML file and `ZAPRET_*`
/// environment variables (environment wins).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub strategy_runner: StrategyRunnerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unix socket path for the control plane; empty disables it.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// TCP bind address (`host:port` or `:port`); empty disables it.
    #[serde(default)]
    pub network_address: String,

    /// Octal file permissions for the unix socket.
    #[serde(default = "default_socket_permissions")]
    pub socket_permissions: String,

    /// Prometheus exporter port; absent disables metrics.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            network_address: String::new(),
            socket_permissions: default_socket_permissions(),
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn permissions_mode(&self) -> Result<u32, ConfigError> {
        u32::from_str_radix(self.socket_permissions.trim_start_matches("0o"), 8).map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid socket_permissions: {:?} (must be octal, e.g. 0660)",
                self.socket_permissions
            ))
        })
    }
}

fn default_socket_path() -> String {
    "/run/zapret/zapret-daemon.sock".to_string()
}

fn default_socket_permissions() -> String {
    "0660".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "invalid log level: {other} (must be one of: debug, info, warn, error)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(format!(
                "invalid log format: {other} (must be one of: json, text)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyRunnerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Path to the strategy-runner YAML.
    #[serde(default = "default_runner_config_path")]
    pub config_path: String,

    /// Reload the runner when the watched files change.
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Path to the nfqws binary.
    #[serde(default = "default_nfqws_binary")]
    pub nfqws_binary: String,
}

impl Default for StrategyRunnerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_path: default_runner_config_path(),
            watch: true,
            nfqws_binary: default_nfqws_binary(),
        }
    }
}

fn default_runner_config_path() -> String {
    "/etc/zapret/strategy.yaml".to_string()
}

fn default_nfqws_binary() -> String {
    "/usr/bin/nfqws".to_string()
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    /// Load from an optional YAML file, then overlay the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg: DaemonConfig = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_yaml_ng::from_str(&content)?
            }
            _ => serde_yaml_ng::from_str("{}")?,
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        overlay_string("ZAPRET_SOCKET_PATH", &mut self.server.socket_path);
        overlay_string("ZAPRET_NETWORK_ADDRESS", &mut self.server.network_address);
        overlay_string(
            "ZAPRET_SOCKET_PERMISSIONS",
            &mut self.server.socket_permissions,
        );
        overlay_parsed("ZAPRET_METRICS_PORT", &mut self.server.metrics_port)?;
        overlay_from_str("ZAPRET_LOG_LEVEL", &mut self.logging.level)?;
        overlay_from_str("ZAPRET_LOG_FORMAT", &mut self.logging.format)?;
        overlay_bool("ZAPRET_SR_ENABLED", &mut self.strategy_runner.enabled)?;
        overlay_string(
            "ZAPRET_SR_CONFIG_PATH",
            &mut self.strategy_runner.config_path,
        );
        overlay_bool("ZAPRET_SR_WATCH", &mut self.strategy_runner.watch)?;
        overlay_string(
            "ZAPRET_SR_NFQWS_BINARY",
            &mut self.strategy_runner.nfqws_binary,
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.socket_path.is_empty() && self.server.network_address.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one of socket_path or network_address must be configured".to_string(),
            ));
        }
        self.server.permissions_mode()?;
        Ok(())
    }
}

/// Strategy-runner configuration (its own YAML file, referenced from the
/// daemon config). The `binary_path`/`config_path`/`watch` fields are
/// carried in from the daemon config, not read from this file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Outbound interface to match, or `any` for all.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Substitute `%GameFilter%` with `gamefilter_ports`.
    #[serde(default = "default_true")]
    pub gamefilter: bool,

    #[serde(default = "default_gamefilter_ports")]
    pub gamefilter_ports: String,

    /// Path to the `.bat` strategy file.
    #[serde(default)]
    pub strategy_file: String,

    #[serde(default)]
    pub firewall: FirewallSection,

    #[serde(skip)]
    pub binary_path: String,
    #[serde(skip)]
    pub config_path: String,
    #[serde(skip)]
    pub watch: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallSection {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// nftables table name.
    #[serde(default = "default_table_name")]
    pub table_name: String,

    #[serde(default = "default_chain_name")]
    pub chain_name: String,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            table_name: default_table_name(),
            chain_name: default_chain_name(),
        }
    }
}

fn default_interface() -> String {
    "any".to_string()
}

fn default_gamefilter_ports() -> String {
    "1024-65535".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Nftables
}

fn default_table_name() -> String {
    "zapretunix".to_string()
}

fn default_chain_name() -> String {
    "output".to_string()
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg: RunnerConfig = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_yaml_ng::from_str(&content)?
        } else {
            serde_yaml_ng::from_str("{}")?
        };
        cfg.config_path = path.display().to_string();
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        overlay_string("ZAPRET_INTERFACE", &mut self.interface);
        overlay_bool("ZAPRET_GAMEFILTER", &mut self.gamefilter)?;
        overlay_string("ZAPRET_GAMEFILTER_PORTS", &mut self.gamefilter_ports);
        overlay_string("ZAPRET_STRATEGY_FILE", &mut self.strategy_file);
        overlay_from_str("ZAPRET_FIREWALL_BACKEND", &mut self.firewall.backend)?;
        overlay_string("ZAPRET_FIREWALL_TABLE_NAME", &mut self.firewall.table_name);
        overlay_string("ZAPRET_FIREWALL_CHAIN_NAME", &mut self.firewall.chain_name);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy_file.is_empty() {
            return Err(ConfigError::Invalid(
                "strategy_file must be specified".to_string(),
            ));
        }
        if !Path::new(&self.strategy_file).exists() {
            return Err(ConfigError::Invalid(format!(
                "strategy file not found: {}",
                self.strategy_file
            )));
        }
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid(
                "interface must be specified or set to 'any'".to_string(),
            ));
        }
        Ok(())
    }

    /// Outbound interface as an optional match: `any` means no predicate.
    pub fn interface_match(&self) -> Option<String> {
        if self.interface == "any" {
            None
        } else {
            Some(self.interface.clone())
        }
    }
}

fn overlay_string(var: &str, target: &mut String) {
    if let Ok(value) = std::env::var(var) {
        *target = value;
    }
}

fn overlay_bool(var: &str, target: &mut bool) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *target = match value.as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "invalid boolean for {var}: {other:?}"
                )))
            }
        };
    }
    Ok(())
}

fn overlay_parsed<T: std::str::FromStr>(
    var: &str,
    target: &mut Option<T>,
) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        let parsed = value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("invalid value for {var}: {value:?}")))?;
        *target = Some(parsed);
    }
    Ok(())
}

fn overlay_from_str<T>(var: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    if let Ok(value) = std::env::var(var) {
        *target = value.parse::<T>().map_err(ConfigError::Invalid)?;
    }
    Ok(())
}
