use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Log verbosity level.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug messages.
    Debug,
    /// Informational messages (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// The level as a `tracing` filter directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Whether the debuggee is launched or attached to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSetting {
    /// The adapter starts the debuggee.
    #[default]
    Launch,
    /// The adapter attaches to a running debuggee.
    Attach,
}

/// How to reach the debug adapter.
///
/// Either `command` (the adapter speaks DAP on its stdio) or `port` (the
/// adapter listens on `host:port`) must be set, not both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// `adapterID` sent in `initialize`.
    #[serde(default)]
    pub adapter_id: String,
    /// Executable of a stdio adapter.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Host of a TCP adapter.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of a TCP adapter.
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adapter_id: String::new(),
            command: None,
            args: Vec::new(),
            host: default_host(),
            port: None,
        }
    }
}

/// Session tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a single request may wait for its response.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds the whole initialize/configure handshake may take.
    #[serde(default = "default_initialize_timeout")]
    pub initialize_timeout_secs: u64,
    /// Seconds to wait for the `disconnect` response.
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,
    /// Send launch/attach only after `configurationDone`.
    #[serde(default)]
    pub delay_launch: bool,
    /// Kill the debuggee on disconnect.
    #[serde(default = "default_true")]
    pub terminate_debuggee: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default)]
    pub locale: Option<String>,
}

fn default_request_timeout() -> u64 {
    10
}
fn default_initialize_timeout() -> u64 {
    30
}
fn default_disconnect_timeout() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_client_id() -> String {
    "trellis".to_string()
}
fn default_client_name() -> String {
    "Trellis".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            initialize_timeout_secs: default_initialize_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            delay_launch: false,
            terminate_debuggee: true,
            client_id: default_client_id(),
            client_name: default_client_name(),
            locale: None,
        }
    }
}

/// The launch or attach request.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub request: RequestSetting,
    /// Adapter-specific arguments, sent verbatim.
    #[serde(default)]
    pub arguments: toml::Table,
}

impl LaunchConfig {
    /// The arguments as a JSON object.
    pub fn arguments_json(&self) -> Result<serde_json::Value, ConfigError> {
        serde_json::to_value(&self.arguments).map_err(|e| ConfigError::Validation {
            field: "launch.arguments".to_string(),
            message: e.to_string(),
        })
    }
}

/// A line breakpoint registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointEntry {
    /// Location URL, e.g. `file:///src/app.js`.
    #[serde(default)]
    pub url: Option<String>,
    /// File path; relative paths are resolved against the project.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// 1-based line.
    pub line: i64,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    /// Log message; turns the breakpoint into a logpoint.
    #[serde(default)]
    pub log_message: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log verbosity level.
    #[serde(default)]
    pub level: LogLevel,
    /// Optional path to a log file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
        }
    }
}

/// Top-level debugger configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Adapter connection.
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// Session tunables.
    #[serde(default)]
    pub session: SessionConfig,
    /// Launch or attach request.
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Breakpoints registered before connecting.
    #[serde(default)]
    pub breakpoints: Vec<BreakpointEntry>,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}
