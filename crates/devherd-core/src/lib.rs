//! # devherd-core - Core Domain Types
//!
//! Foundation crate for devherd. Provides the service data model, the log
//! classifier, ring buffers, error handling and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, regex, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`ServiceStatus`] - Service lifecycle state (Stopped, Starting, Building, Running, Error)
//! - [`BackendKind`] - How a service is launched (direct process, daemon-managed, container)
//! - [`RuntimeTarget`] - What a service runs (web, api, native mobile build, infrastructure)
//! - [`LogEntry`] / [`LogLevel`] - A single attributed log line
//! - [`DeviceBinding`] - Emulator binding of a native build
//!
//! ### Log Classifier (`classify`)
//! - [`classify()`] - Raw line to message, level, timestamp and source label
//! - [`infer_status_hint()`] / [`next_status()`] - Keyword status hints
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use devherd_core::prelude::*;
//! ```

pub mod ansi;
pub mod classify;
pub mod error;
pub mod events;
pub mod logging;
pub mod ring_buffer;
pub mod types;

/// Prelude for common imports used throughout all devherd crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use ansi::strip_ansi_codes;
pub use classify::{classify, infer_status_hint, next_status, ClassifiedLine};
pub use error::{Error, Result, ResultExt};
pub use events::ProcessEvent;
pub use ring_buffer::{RingBuffer, COMBINED_LOG_CAPACITY, SERVICE_LOG_CAPACITY};
pub use types::{
    BackendKind, DeviceBinding, LogEntry, LogLevel, RuntimeTarget, ServiceStatus, StatusHint,
};
