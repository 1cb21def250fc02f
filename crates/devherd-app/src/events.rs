//! Change notifications broadcast by the supervisor
//!
//! The presentation layer subscribes via [`crate::Supervisor::subscribe`].
//! Notifications are emitted at the registry's single mutation point, so a
//! subscriber never misses a status change that was applied.

use serde::Serialize;

use devherd_core::{BackendKind, DeviceBinding, LogEntry, RuntimeTarget, ServiceStatus};

/// Read-only view of a service record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub id: String,
    pub display_name: String,
    pub backend: BackendKind,
    pub target: RuntimeTarget,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub auto_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceBinding>,
    /// Serial a native build was installed on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub has_handle: bool,
    pub log_count: usize,
}

/// Which log buffer to clear
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ClearTarget {
    Service(String),
    Combined,
}

impl ClearTarget {
    /// `"combined"` (or nothing) clears the combined log, anything else names a service
    pub fn parse(arg: Option<&str>) -> Self {
        match arg.map(str::trim) {
            None | Some("") | Some("combined") => ClearTarget::Combined,
            Some(id) => ClearTarget::Service(id.to_string()),
        }
    }
}

/// Events emitted by the supervisor
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A record changed (status, handle, device serial)
    ServiceUpdated { service: ServiceSnapshot },

    /// A log entry was appended
    Log { entry: LogEntry },

    /// A log buffer was cleared
    LogsCleared { target: ClearTarget },

    /// A user-facing failure (launch, precondition)
    Error {
        service: Option<String>,
        message: String,
    },

    /// The supervisor is shutting down; always the last event
    Shutdown,
}

impl SupervisorEvent {
    /// Returns a short string label for this event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceUpdated { .. } => "service_updated",
            Self::Log { .. } => "log",
            Self::LogsCleared { .. } => "logs_cleared",
            Self::Error { .. } => "error",
            Self::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_target_parse() {
        assert_eq!(ClearTarget::parse(None), ClearTarget::Combined);
        assert_eq!(ClearTarget::parse(Some("combined")), ClearTarget::Combined);
        assert_eq!(
            ClearTarget::parse(Some(" api ")),
            ClearTarget::Service("api".into())
        );
    }

    #[test]
    fn test_event_type_labels() {
        assert_eq!(SupervisorEvent::Shutdown.event_type(), "shutdown");
        assert_eq!(
            SupervisorEvent::LogsCleared {
                target: ClearTarget::Combined
            }
            .event_type(),
            "logs_cleared"
        );
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let snapshot = ServiceSnapshot {
            id: "api".into(),
            display_name: "API".into(),
            backend: BackendKind::DaemonManaged,
            target: RuntimeTarget::ApiService,
            status: ServiceStatus::Running,
            port: Some(4000),
            auto_start: true,
            device: None,
            device_serial: None,
            pid: None,
            has_handle: true,
            log_count: 3,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["backend"], "daemon_managed");
        assert_eq!(json["target"], "api_service");
        assert_eq!(json["status"], "running");
        assert!(json.get("device").is_none());
    }
}
