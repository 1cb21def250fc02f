//! Container backend
//!
//! Containers are brought up in bulk by the supervisor. Launching one here
//! only attaches a log follower and republishes its output; terminating
//! detaches the follower and leaves the container alone.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::BackendKind;
use devherd_daemon::{ContainerRuntime, TERMINATE_GRACE};

use super::{Backend, LaunchOutcome, ServiceHandle};
use crate::config::{LaunchSpec, ServiceDefinition};
use crate::pipeline::{ExitPolicy, ServiceSink};

const FOLLOW_CHANNEL_CAPACITY: usize = 1024;

pub struct ContainerBackend {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerBackend {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn launch(&self, sink: ServiceSink) -> Result<LaunchOutcome> {
        let def = sink.definition();
        let LaunchSpec::Container { container } = &def.launch else {
            return Err(Error::launch(&def.id, "not a container service"));
        };

        let (tx, rx) = mpsc::channel(FOLLOW_CHANNEL_CAPACITY);
        let stream = self
            .runtime
            .follow_logs(container, tx)
            .map_err(|e| Error::launch(&def.id, e.to_string()))?;
        debug!("Following logs of container {} for {}", container, def.id);
        sink.spawn_pump(rx, ExitPolicy::EndsService);

        Ok(LaunchOutcome::running(ServiceHandle::Follower(stream)))
    }

    async fn terminate(
        &self,
        definition: &ServiceDefinition,
        handle: ServiceHandle,
    ) -> Result<()> {
        match handle {
            ServiceHandle::Follower(stream) => stream
                .close()
                .await
                .map_err(|e| Error::terminate(&definition.id, e.to_string())),
            ServiceHandle::Process(mut process) => process.terminate(TERMINATE_GRACE).await,
            ServiceHandle::Recipe { task, .. } => {
                task.abort();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use devherd_core::{RuntimeTarget, ServiceStatus};
    use devherd_daemon::test_utils::FakeContainerRuntime;
    use std::collections::HashMap;
    use std::time::Duration;

    fn cache() -> ServiceDefinition {
        ServiceDefinition {
            id: "cache".into(),
            display_name: "Redis".into(),
            backend: BackendKind::Container,
            target: RuntimeTarget::Infrastructure,
            port: None,
            auto_start: false,
            env: HashMap::new(),
            daemon_name: "cache".into(),
            launch: LaunchSpec::Container {
                container: "sous-redis".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_launch_follows_container_logs() {
        let runtime = Arc::new(
            FakeContainerRuntime::new().with_logs("sous-redis", &["Ready to accept connections"]),
        );
        let backend = Arc::new(ContainerBackend::new(runtime.clone()));
        let registry = Arc::new(Registry::new(vec![cache()]));
        let generation = registry.mutate("cache", |r| r.begin_launch()).unwrap();
        let sink = ServiceSink::new(
            Arc::clone(&registry),
            registry.definition("cache").unwrap(),
            generation,
            backend.clone(),
        );

        let outcome = backend.launch(sink).await.unwrap();
        assert_eq!(outcome.status, ServiceStatus::Running);
        assert_eq!(runtime.followed(), vec!["sous-redis"]);

        let mut seen = false;
        for _ in 0..100 {
            seen = registry
                .service_logs("cache")
                .unwrap()
                .iter()
                .any(|e| e.service_id == "cache" && e.display_name == "Redis");
            if seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        let definition = registry.definition("cache").unwrap();
        backend.terminate(&definition, outcome.handle).await.unwrap();
    }
}
