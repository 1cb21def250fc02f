//! devherd-app - Service supervision for devherd
//!
//! This crate owns everything between the topology file and the presentation
//! layer: configuration loading and validation, the process registry, the
//! output pipeline, one lifecycle backend per backend kind, the background
//! pollers, and the [`Supervisor`] façade that ties them together.
//!
//! ## Public API
//!
//! - [`Supervisor`] / [`SupervisorDeps`] - lifecycle operations and reads
//! - [`SupervisorEvent`] / [`ServiceSnapshot`] - change notifications
//! - [`config::load_topology`] - `devherd.toml` loading
//! - [`Backend`] - the per-kind start/stop strategy

pub mod backend;
pub mod config;
pub mod events;
pub mod pipeline;
mod polling;
pub mod registry;
pub mod signals;
pub mod supervisor;

// Re-export primary types
pub use backend::{Backend, LaunchOutcome, ServiceHandle};
pub use config::{load_topology, ServiceDefinition, Topology, DEFAULT_CONFIG_FILE};
pub use events::{ClearTarget, ServiceSnapshot, SupervisorEvent};
pub use pipeline::{ExitPolicy, ServiceSink};
pub use registry::Registry;
pub use supervisor::{Supervisor, SupervisorDeps, AGENT_LOG_ID, SUPERVISOR_LOG_ID};

// Re-export daemon types for the presentation layer
pub use devherd_daemon::{ToolAvailability, ToolStatus};
