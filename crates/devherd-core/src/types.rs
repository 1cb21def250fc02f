//! Core domain type definitions

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::ansi::strip_ansi_codes;

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Not running (initial and terminal state)
    #[default]
    Stopped,
    /// Launch issued, waiting for the first sign of life
    Starting,
    /// Compiling or building
    Building,
    /// Up and serving
    Running,
    /// Launch or build failed
    Error,
}

impl ServiceStatus {
    /// Whether a process handle is expected to exist in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Building | ServiceStatus::Running
        )
    }

    /// Whether log content may still move this status
    pub fn accepts_hints(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Building)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Building => "building",
            ServiceStatus::Running => "running",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a service's process is started and stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Child process owned by the supervisor
    DirectProcess,
    /// Process owned by the external supervision daemon
    DaemonManaged,
    /// Container whose logs are followed
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::DirectProcess => "direct_process",
            BackendKind::DaemonManaged => "daemon_managed",
            BackendKind::Container => "container",
        };
        f.write_str(s)
    }
}

/// What kind of thing the service runs; selects the launch recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeTarget {
    WebService,
    ApiService,
    NativeMobileBuild,
    Infrastructure,
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeTarget::WebService => "web_service",
            RuntimeTarget::ApiService => "api_service",
            RuntimeTarget::NativeMobileBuild => "native_mobile_build",
            RuntimeTarget::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Emulator a native build is installed onto
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// Model tag matched against device AVD names and models (e.g. `Pixel_Tablet`)
    pub emulator_model_tag: String,
    /// AVD profile to launch when no matching device is attached
    pub avd: String,
    /// Preferred emulator console port; `emulator-<port>` is the fast-path serial
    pub bridge_port: u16,
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a level name, `None` for anything not error or warning flavoured
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "error" | "err" | "fatal" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            _ => None,
        }
    }

    /// Parse a free-form level name as reported by the bridge agent
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_default()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log line attributed to a service. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub service_id: String,
    pub display_name: String,
    pub message: String,
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    /// Producer label inside the service (pino `name`, or `agent` for bridge logs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEntry {
    /// Create a new log entry with current timestamp
    ///
    /// ANSI escape codes are automatically stripped from the message.
    pub fn new(
        service_id: impl Into<String>,
        display_name: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            display_name: display_name.into(),
            message: strip_ansi_codes(&message.into()),
            timestamp: Local::now(),
            level,
            source: None,
        }
    }

    pub fn info(
        service_id: impl Into<String>,
        display_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(service_id, display_name, LogLevel::Info, message)
    }

    pub fn warn(
        service_id: impl Into<String>,
        display_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(service_id, display_name, LogLevel::Warn, message)
    }

    pub fn error(
        service_id: impl Into<String>,
        display_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(service_id, display_name, LogLevel::Error, message)
    }

    /// Override the timestamp (structured logs carry their own)
    pub fn with_timestamp(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Suggested transition inferred from log text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    Building,
    Running,
    Error,
}

impl StatusHint {
    pub fn target_status(&self) -> ServiceStatus {
        match self {
            StatusHint::Building => ServiceStatus::Building,
            StatusHint::Running => ServiceStatus::Running,
            StatusHint::Error => ServiceStatus::Error,
        }
    }
}
