//! Headless mode - NDJSON event output and stdin commands
//!
//! `devherd up` drives the supervisor without a UI. Every supervisor event
//! is written to stdout as one JSON object per line; commands are read from
//! stdin, one per line.
//!
//! # Example Output
//!
//! ```json
//! {"event":"service_updated","service":{"id":"api","status":"starting",...},"timestamp":1704700001000}
//! {"event":"log","service_id":"api","display_name":"API","level":"info","message":"Nest application listening on 4000","timestamp":1704700002000}
//! {"event":"error","service":"pos","message":"Failed to launch pos: ...","fatal":false,"timestamp":1704700003000}
//! ```
//!
//! # Commands
//!
//! `start <id>`, `stop <id>`, `restart <id>`, `clear [<id>|combined]`,
//! `list`, `logs [<id>]`, `quit`

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};
use tracing::error;

use devherd_app::{ClearTarget, ServiceSnapshot, SupervisorEvent};
use devherd_core::LogEntry;

/// Events emitted in headless mode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A service record changed
    ServiceUpdated {
        service: ServiceSnapshot,
        timestamp: i64,
    },

    /// A log entry was appended
    Log {
        service_id: String,
        display_name: String,
        level: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        timestamp: i64,
    },

    /// A log buffer was cleared
    LogsCleared { target: ClearTarget, timestamp: i64 },

    /// Error occurred
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        message: String,
        fatal: bool,
        timestamp: i64,
    },

    /// Reply to `list`
    ServiceList {
        services: Vec<ServiceSnapshot>,
        timestamp: i64,
    },

    /// Supervisor shut down; nothing follows
    Shutdown { timestamp: i64 },
}

impl HeadlessEvent {
    /// Serialize to a single NDJSON line (without the newline)
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                None
            }
        }
    }

    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let Some(json) = self.to_json() else {
            return;
        };

        // Write to stdout with newline (NDJSON format)
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        // Flush to ensure immediate output
        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn log(entry: &LogEntry) -> Self {
        Self::Log {
            service_id: entry.service_id.clone(),
            display_name: entry.display_name.clone(),
            level: entry.level.to_string(),
            message: entry.message.clone(),
            source: entry.source.clone(),
            timestamp: entry.timestamp.timestamp_millis(),
        }
    }

    pub fn error(service: Option<String>, message: String, fatal: bool) -> Self {
        Self::Error {
            service,
            message,
            fatal,
            timestamp: Self::now(),
        }
    }

    pub fn service_list(services: Vec<ServiceSnapshot>) -> Self {
        Self::ServiceList {
            services,
            timestamp: Self::now(),
        }
    }
}

impl From<SupervisorEvent> for HeadlessEvent {
    fn from(event: SupervisorEvent) -> Self {
        match event {
            SupervisorEvent::ServiceUpdated { service } => Self::ServiceUpdated {
                service,
                timestamp: Self::now(),
            },
            SupervisorEvent::Log { entry } => Self::log(&entry),
            SupervisorEvent::LogsCleared { target } => Self::LogsCleared {
                target,
                timestamp: Self::now(),
            },
            SupervisorEvent::Error { service, message } => Self::error(service, message, false),
            SupervisorEvent::Shutdown => Self::Shutdown {
                timestamp: Self::now(),
            },
        }
    }
}
