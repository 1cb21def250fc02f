//! Direct child-process backend
//!
//! Spawns the service command in its own process group. Termination signals
//! the whole group, so dev servers that fork watchers go down with it.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::BackendKind;
use devherd_daemon::{derive_environment, ChildProcess, CommandSpec, TERMINATE_GRACE};

use super::{Backend, LaunchOutcome, ServiceHandle};
use crate::config::{LaunchSpec, ServiceDefinition};
use crate::pipeline::{ExitPolicy, ServiceSink};

/// Output buffer between the readers and the pipeline
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
pub struct DirectBackend;

impl DirectBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectProcess
    }

    async fn launch(&self, sink: ServiceSink) -> Result<LaunchOutcome> {
        let def = sink.definition();
        let LaunchSpec::Command { command, cwd } = &def.launch else {
            return Err(Error::launch(
                &def.id,
                "direct services need a plain command",
            ));
        };

        let inherited: HashMap<String, String> = std::env::vars().collect();
        let env = derive_environment(&inherited, &def.env, def.port, None);
        let mut spec = CommandSpec::new(command.clone()).with_env(env);
        if let Some(cwd) = cwd {
            spec = spec.with_cwd(cwd);
        }

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let process = ChildProcess::spawn_shell(&spec, tx)
            .map_err(|e| Error::launch(&def.id, e.to_string()))?;
        info!("Started {} (pid {:?}): {}", def.id, process.id(), command);
        sink.spawn_pump(rx, ExitPolicy::EndsService);

        Ok(LaunchOutcome::starting(ServiceHandle::Process(process)))
    }

    async fn terminate(
        &self,
        definition: &ServiceDefinition,
        handle: ServiceHandle,
    ) -> Result<()> {
        match handle {
            ServiceHandle::Process(mut process) => process
                .terminate(TERMINATE_GRACE)
                .await
                .map_err(|e| Error::terminate(&definition.id, e.to_string())),
            ServiceHandle::Follower(stream) => stream.close().await,
            ServiceHandle::Recipe { task, .. } => {
                task.abort();
                Ok(())
            }
        }
    }
}
