//! Supervisor error types with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Supervisor error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Unknown service: {id}")]
    UnknownService { id: String },

    // ─────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    #[error("Failed to launch {service}: {message}")]
    Launch { service: String, message: String },

    #[error("Failed to terminate {service}: {message}")]
    Terminate { service: String, message: String },

    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    // ─────────────────────────────────────────────────────────────
    // External Collaborator Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Process daemon error: {message}")]
    Daemon { message: String },

    #[error("Container runtime error: {message}")]
    Container { message: String },

    #[error("Bridge unreachable at {address}: {reason}")]
    BridgeUnreachable { address: String, reason: String },

    #[error("Bridge error: {message}")]
    Bridge { message: String },

    #[error("No device matching '{model}' after {attempts} attempts")]
    DeviceTimeout { model: String, attempts: u32 },

    #[error("Recipe stage '{stage}' failed: {message}")]
    RecipeStep { stage: String, message: String },

    #[error("Secret overrides unavailable: {message}")]
    Secrets { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn unknown_service(id: impl Into<String>) -> Self {
        Self::UnknownService { id: id.into() }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    pub fn launch(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Launch {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn terminate(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Terminate {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn daemon(message: impl Into<String>) -> Self {
        Self::Daemon {
            message: message.into(),
        }
    }

    pub fn container(message: impl Into<String>) -> Self {
        Self::Container {
            message: message.into(),
        }
    }

    pub fn bridge_unreachable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BridgeUnreachable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn bridge(message: impl Into<String>) -> Self {
        Self::Bridge {
            message: message.into(),
        }
    }

    pub fn recipe_step(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RecipeStep {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn secrets(message: impl Into<String>) -> Self {
        Self::Secrets {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors affect a single operation and are safe to retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BridgeUnreachable { .. }
                | Error::Bridge { .. }
                | Error::Daemon { .. }
                | Error::Secrets { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::daemon("pm2 not responding");
        assert_eq!(err.to_string(), "Process daemon error: pm2 not responding");

        let err = Error::recipe_step("install", "INSTALL_FAILED_VERSION_DOWNGRADE");
        assert!(err.to_string().contains("'install'"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_device_timeout_message() {
        let err = Error::DeviceTimeout {
            model: "Pixel_Tablet".to_string(),
            attempts: 15,
        };
        assert!(err.to_string().contains("Pixel_Tablet"));
        assert!(err.to_string().contains("15"));
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::bridge_unreachable("172.20.0.1:4040", "timeout").is_recoverable());
        assert!(Error::daemon("test").is_recoverable());
        assert!(!Error::precondition("docker is down").is_recoverable());
        assert!(!Error::config_invalid("duplicate id").is_recoverable());
    }

    #[test]
    fn test_context_preserves_error() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = result.context("reading topology").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
