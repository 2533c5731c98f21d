//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    events: EventsConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_port")]
    port: u16,
    /// Force buffered JSON responses even for SSE-capable clients.
    #[serde(default)]
    json_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            json_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionConfig {
    /// Idle sessions beyond this are reaped and their event logs dropped.
    #[serde(default = "default_idle_timeout")]
    idle_timeout_secs: u64,
    /// In-flight requests beyond this fail with a timeout error.
    #[serde(default = "default_request_timeout")]
    request_timeout_secs: u64,
    #[serde(default)]
    busy_policy: BusyPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            busy_policy: BusyPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventsConfig {
    /// Events retained per session; oldest are evicted beyond this.
    #[serde(default = "default_retention")]
    retention: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoggingConfig {
    /// Path to log file (if set, logs are written there in addition to stdout)
    log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    log_level: Option<String>,
}

fn default_port() -> u16 {
    sluss_types::DEFAULT_PORT
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    300
}

fn default_retention() -> usize {
    1024
}

/// How a second concurrent request on one session is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Later requests wait for the in-flight one to finish.
    #[default]
    Queue,
    /// Later requests get a session-busy error envelope.
    Reject,
}

/// The options the running core consumes, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub busy_policy: BusyPolicy,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub retention: usize,
    pub json_only: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::default(),
            request_timeout: Duration::from_secs(default_request_timeout()),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            retention: default_retention(),
            json_only: false,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Force buffered JSON responses even for SSE-capable clients
    pub json_only: bool,
    /// Idle session timeout in seconds
    pub idle_timeout_secs: u64,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
    /// Concurrent-request policy per session
    pub busy_policy: BusyPolicy,
    /// Events retained per session
    pub retention: usize,
    /// Path to log file (if set, logs are written there in addition to stdout)
    pub log_file: Option<PathBuf>,
    /// Log level (if set, overrides the RUST_LOG environment variable)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars >
    /// config files > defaults.
    ///
    /// Config files are searched in this order:
    /// 1. `.sluss.toml` in the current directory
    /// 2. `config.toml` in the user config directory (~/.config/sluss/ on Linux)
    pub fn from_figment(
        port: Option<u16>,
        json_only: Option<bool>,
        log_level: Option<String>,
        log_file: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir().ok().map(|d| d.join(".sluss.toml"));
        let user_config = directories::ProjectDirs::from("", "", "sluss")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // Priority: defaults < user config < local config < env vars < CLI args
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile::default()));

        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // SLUSS_SERVER__PORT -> server.port, etc.
        figment = figment.merge(Env::prefixed("SLUSS_").split("__"));

        if let Some(p) = port {
            figment = figment.merge(Serialized::default("server.port", p));
        }
        if let Some(j) = json_only {
            figment = figment.merge(Serialized::default("server.json_only", j));
        }
        if let Some(ref level) = log_level {
            figment = figment.merge(Serialized::default("logging.log_level", level));
        }
        if let Some(ref file) = log_file {
            figment = figment.merge(Serialized::default("logging.log_file", file));
        }

        let config_file: ConfigFile = figment.extract()?;

        Ok(Self {
            port: config_file.server.port,
            json_only: config_file.server.json_only,
            idle_timeout_secs: config_file.session.idle_timeout_secs,
            request_timeout_secs: config_file.session.request_timeout_secs,
            busy_policy: config_file.session.busy_policy,
            retention: config_file.events.retention,
            log_file: config_file.logging.log_file,
            log_level: config_file.logging.log_level,
        })
    }

    /// The subset of configuration the core consumes at runtime.
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            busy_policy: self.busy_policy,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            retention: self.retention,
            json_only: self.json_only,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let defaults = ConfigFile::default();
        Self {
            port: defaults.server.port,
            json_only: defaults.server.json_only,
            idle_timeout_secs: defaults.session.idle_timeout_secs,
            request_timeout_secs: defaults.session.request_timeout_secs,
            busy_policy: defaults.session.busy_policy,
            retention: defaults.events.retention,
            log_file: None,
            log_level: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_from_figment_defaults() {
        std::env::remove_var("SLUSS_SERVER__PORT");
        std::env::remove_var("SLUSS_SESSION__BUSY_POLICY");

        // Run in a temp directory to avoid picking up a project .sluss.toml
        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(None, None, None, None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(config.port, sluss_types::DEFAULT_PORT);
        assert_eq!(config.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.retention, 1024);
        assert!(!config.json_only);
    }

    #[test]
    #[serial]
    fn test_from_figment_cli_args_override() {
        std::env::remove_var("SLUSS_SERVER__PORT");

        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config =
            Config::from_figment(Some(9000), Some(true), Some("debug".to_string()), None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(config.port, 9000);
        assert!(config.json_only);
        assert_eq!(config.log_level, Some("debug".to_string()));
    }

    #[test]
    #[serial]
    fn test_from_figment_config_file() {
        std::env::remove_var("SLUSS_SERVER__PORT");
        std::env::remove_var("SLUSS_SESSION__BUSY_POLICY");

        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join(".sluss.toml");

        let config_content = r#"
[server]
port = 7777

[session]
busy_policy = "reject"
idle_timeout_secs = 60

[events]
retention = 16
"#;
        fs::write(&config_file, config_content).unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(None, None, None, None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(config.port, 7777);
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.retention, 16);
    }

    #[test]
    #[serial]
    fn test_from_figment_env_vars_override_config_file() {
        let original_port = std::env::var("SLUSS_SERVER__PORT").ok();

        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join(".sluss.toml");
        fs::write(&config_file, "[server]\nport = 7777").unwrap();

        std::env::set_var("SLUSS_SERVER__PORT", "8888");

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(None, None, None, None).unwrap();

        let _ = std::env::set_current_dir(&original_dir);

        if let Some(port) = original_port {
            std::env::set_var("SLUSS_SERVER__PORT", port);
        } else {
            std::env::remove_var("SLUSS_SERVER__PORT");
        }

        assert_eq!(config.port, 8888);
    }

    #[test]
    #[serial]
    fn test_from_figment_cli_overrides_env_and_config() {
        let original_port = std::env::var("SLUSS_SERVER__PORT").ok();

        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join(".sluss.toml");
        fs::write(&config_file, "[server]\nport = 7777").unwrap();

        std::env::set_var("SLUSS_SERVER__PORT", "8888");

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config = Config::from_figment(Some(9999), None, None, None).unwrap();

        let _ = std::env::set_current_dir(&original_dir);

        if let Some(port) = original_port {
            std::env::set_var("SLUSS_SERVER__PORT", port);
        } else {
            std::env::remove_var("SLUSS_SERVER__PORT");
        }

        assert_eq!(config.port, 9999);
    }

    #[test]
    fn test_runtime_options_derivation() {
        let config = Config {
            busy_policy: BusyPolicy::Reject,
            request_timeout_secs: 10,
            idle_timeout_secs: 120,
            retention: 64,
            json_only: true,
            ..Config::default()
        };
        let options = config.runtime_options();
        assert_eq!(options.busy_policy, BusyPolicy::Reject);
        assert_eq!(options.request_timeout, Duration::from_secs(10));
        assert_eq!(options.idle_timeout, Duration::from_secs(120));
        assert_eq!(options.retention, 64);
        assert!(options.json_only);
    }
}
