//! Backend adapters
//!
//! One [`Backend`] per [`BackendKind`]. The supervisor looks the adapter up by
//! kind and never branches on the kind itself:
//!
//! - [`DirectBackend`] - child process group owned by the supervisor
//! - [`DaemonBackend`] - pm2-managed process, or the native build recipe
//! - [`ContainerBackend`] - follower attached to a running container

pub mod container;
pub mod daemon;
pub mod direct;

pub use container::ContainerBackend;
pub use daemon::DaemonBackend;
pub use direct::DirectBackend;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::task::AbortHandle;

use devherd_core::prelude::*;
use devherd_core::{BackendKind, ServiceStatus};
use devherd_daemon::{ChildProcess, StreamHandle};

use crate::config::ServiceDefinition;
use crate::pipeline::ServiceSink;

/// Live resource behind an active service, exclusively owned by its record
pub enum ServiceHandle {
    /// Child process group (direct backend)
    Process(ChildProcess),
    /// Log follower of a process living elsewhere (pm2, docker)
    Follower(StreamHandle),
    /// Native build recipe task; `serial` is set once the device is resolved
    Recipe {
        task: AbortHandle,
        serial: Arc<OnceLock<String>>,
    },
}

impl ServiceHandle {
    /// Pid of a directly owned process
    pub fn pid(&self) -> Option<u32> {
        match self {
            ServiceHandle::Process(process) => process.id(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceHandle::Process(p) => f.debug_tuple("Process").field(&p.id()).finish(),
            ServiceHandle::Follower(s) => f.debug_tuple("Follower").field(s).finish(),
            ServiceHandle::Recipe { serial, .. } => f
                .debug_struct("Recipe")
                .field("serial", &serial.get())
                .finish(),
        }
    }
}

/// Result of a successful launch
#[derive(Debug)]
pub struct LaunchOutcome {
    pub handle: ServiceHandle,
    /// Status the record enters once the handle is installed
    pub status: ServiceStatus,
}

impl LaunchOutcome {
    /// Launched; log hints decide when it is up
    pub fn starting(handle: ServiceHandle) -> Self {
        Self {
            handle,
            status: ServiceStatus::Starting,
        }
    }

    /// Already up when attached
    pub fn running(handle: ServiceHandle) -> Self {
        Self {
            handle,
            status: ServiceStatus::Running,
        }
    }
}

/// Strategy for starting and stopping one kind of service
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the service and wire its output into `sink`
    async fn launch(&self, sink: ServiceSink) -> Result<LaunchOutcome>;

    /// Release a handle produced by [`Backend::launch`] or [`Backend::attach`]
    async fn terminate(&self, definition: &ServiceDefinition, handle: ServiceHandle)
        -> Result<()>;

    /// Replace a live launch with a new one on the same sink.
    ///
    /// Defaults to [`Backend::terminate`] followed by [`Backend::launch`].
    async fn restart(&self, handle: ServiceHandle, sink: ServiceSink) -> Result<LaunchOutcome> {
        let definition = sink.definition().clone();
        self.terminate(&definition, handle).await?;
        self.launch(sink).await
    }

    /// Follow a service that is already running outside the supervisor.
    ///
    /// Only meaningful for backends whose processes outlive the supervisor.
    async fn attach(&self, sink: ServiceSink) -> Result<Option<ServiceHandle>> {
        let _ = sink;
        Ok(None)
    }
}
