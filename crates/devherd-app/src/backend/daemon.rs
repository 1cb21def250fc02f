//! Daemon-managed backend
//!
//! Plain services are handed to the supervision daemon (pm2) by name and
//! followed through its log feed; they keep running if devherd exits.
//! Native mobile builds run the build/install/launch recipe in a background
//! task instead.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::{BackendKind, DeviceBinding, LogLevel, ProcessEvent, ServiceStatus};
use devherd_daemon::{
    derive_environment, BridgeLocator, DaemonApp, NativeRecipe, ProcessDaemon, RecipeEvent,
    SecretSource, StreamHandle, TERMINATE_GRACE,
};

use super::{Backend, LaunchOutcome, ServiceHandle};
use crate::config::{LaunchSpec, ServiceDefinition};
use crate::pipeline::{ExitPolicy, ServiceSink};

const FOLLOW_CHANNEL_CAPACITY: usize = 1024;
const RECIPE_CHANNEL_CAPACITY: usize = 256;

pub struct DaemonBackend {
    daemon: Arc<dyn ProcessDaemon>,
    locator: Arc<dyn BridgeLocator>,
    secrets: Option<Arc<dyn SecretSource>>,
}

impl DaemonBackend {
    pub fn new(
        daemon: Arc<dyn ProcessDaemon>,
        locator: Arc<dyn BridgeLocator>,
        secrets: Option<Arc<dyn SecretSource>>,
    ) -> Self {
        Self {
            daemon,
            locator,
            secrets,
        }
    }

    /// Inherited env, then the service `env`, then `PORT`, then secrets.
    /// A failing secret source only costs the overrides.
    async fn environment(&self, sink: &ServiceSink) -> HashMap<String, String> {
        let def = sink.definition();
        let secrets = match &self.secrets {
            Some(source) => match source.fetch().await {
                Ok(secrets) => Some(secrets),
                Err(e) => {
                    sink.log(
                        LogLevel::Warn,
                        format!("Continuing with local environment only: {}", e),
                    );
                    None
                }
            },
            None => None,
        };
        let inherited: HashMap<String, String> = std::env::vars().collect();
        derive_environment(&inherited, &def.env, def.port, secrets.as_ref())
    }

    fn follow(&self, sink: &ServiceSink) -> Result<StreamHandle> {
        let def = sink.definition();
        let (tx, rx) = mpsc::channel(FOLLOW_CHANNEL_CAPACITY);
        let stream = self
            .daemon
            .follow_logs(&def.daemon_name, tx)
            .map_err(|e| Error::launch(&def.id, e.to_string()))?;
        sink.spawn_pump(rx, ExitPolicy::Detached);
        Ok(stream)
    }

    fn spawn_recipe(
        &self,
        sink: ServiceSink,
        device: DeviceBinding,
        recipe: NativeRecipe,
        env: HashMap<String, String>,
    ) -> ServiceHandle {
        let serial = Arc::new(OnceLock::new());
        let resolved = Arc::clone(&serial);
        let locator = Arc::clone(&self.locator);

        let task = tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(RECIPE_CHANNEL_CAPACITY);
            let run = recipe.run(locator.as_ref(), &device, &env, tx);
            let forward = async {
                while let Some(event) = rx.recv().await {
                    forward_recipe_event(&sink, &resolved, event);
                }
            };
            let (result, ()) = tokio::join!(run, forward);

            match result {
                Ok(serial) => {
                    sink.log(
                        LogLevel::Info,
                        format!("Launched {} on {}", recipe.package, serial),
                    );
                    sink.set_status(ServiceStatus::Running);
                }
                Err(e) => {
                    let id = sink.service_id().to_string();
                    sink.fail(&Error::launch(id, e.to_string()).to_string());
                }
            }
        });

        ServiceHandle::Recipe {
            task: task.abort_handle(),
            serial,
        }
    }
}

fn forward_recipe_event(sink: &ServiceSink, resolved: &OnceLock<String>, event: RecipeEvent) {
    match event {
        RecipeEvent::Progress(message) => sink.log(LogLevel::Info, message),
        RecipeEvent::DeviceResolved(serial) => {
            let _ = resolved.set(serial.clone());
            sink.set_device_serial(&serial);
            sink.log(LogLevel::Info, format!("Using device {}", serial));
        }
        RecipeEvent::StageStarted(stage) => {
            sink.set_status(ServiceStatus::Building);
            sink.log(LogLevel::Info, format!("Stage {} started", stage));
        }
        // Build chatter must not drive status; the recipe result does.
        RecipeEvent::Output(ProcessEvent::Stdout(line)) => sink.record(&line, LogLevel::Info),
        RecipeEvent::Output(ProcessEvent::Stderr(line)) => sink.record(&line, LogLevel::Warn),
        RecipeEvent::Output(ProcessEvent::Exited { .. }) => {}
    }
}

#[async_trait]
impl Backend for DaemonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DaemonManaged
    }

    async fn launch(&self, sink: ServiceSink) -> Result<LaunchOutcome> {
        let env = self.environment(&sink).await;
        let def = sink.definition().clone();

        match &def.launch {
            LaunchSpec::Command { command, cwd } => {
                let app = DaemonApp {
                    name: def.daemon_name.clone(),
                    command: command.clone(),
                    cwd: cwd.clone(),
                    env,
                };
                self.daemon
                    .start(&app)
                    .await
                    .map_err(|e| Error::launch(&def.id, e.to_string()))?;
                info!("Daemon started {} as '{}'", def.id, app.name);

                let stream = self.follow(&sink)?;
                Ok(LaunchOutcome::starting(ServiceHandle::Follower(stream)))
            }
            LaunchSpec::NativeBuild { device, recipe } => Ok(LaunchOutcome::starting(
                self.spawn_recipe(sink, device.clone(), recipe.clone(), env),
            )),
            LaunchSpec::Container { .. } => Err(Error::launch(
                &def.id,
                "container services cannot be daemon-managed",
            )),
        }
    }

    async fn terminate(
        &self,
        definition: &ServiceDefinition,
        handle: ServiceHandle,
    ) -> Result<()> {
        match handle {
            ServiceHandle::Follower(stream) => {
                if let Err(e) = stream.close().await {
                    debug!("Closing log follower of {}: {}", definition.id, e);
                }
                self.daemon
                    .stop(&definition.daemon_name)
                    .await
                    .map_err(|e| Error::terminate(&definition.id, e.to_string()))
            }
            ServiceHandle::Recipe { task, serial } => {
                task.abort();
                let (Some(serial), LaunchSpec::NativeBuild { recipe, .. }) =
                    (serial.get(), &definition.launch)
                else {
                    return Ok(());
                };
                match self.locator.locate().await {
                    Some(bridge) => {
                        if let Err(e) = recipe.force_stop(bridge.as_ref(), serial).await {
                            warn!("force-stop of {} on {} failed: {}", recipe.package, serial, e);
                        }
                    }
                    None => debug!("Bridge absent, leaving {} running on {}", recipe.package, serial),
                }
                Ok(())
            }
            ServiceHandle::Process(mut process) => process
                .terminate(TERMINATE_GRACE)
                .await
                .map_err(|e| Error::terminate(&definition.id, e.to_string())),
        }
    }

    /// pm2 processes restart by name; only the log follower is replaced
    async fn restart(&self, handle: ServiceHandle, sink: ServiceSink) -> Result<LaunchOutcome> {
        let def = sink.definition().clone();
        match handle {
            ServiceHandle::Follower(stream) if matches!(def.launch, LaunchSpec::Command { .. }) => {
                if let Err(e) = stream.close().await {
                    debug!("Closing log follower of {}: {}", def.id, e);
                }
                self.daemon
                    .restart(&def.daemon_name)
                    .await
                    .map_err(|e| Error::launch(&def.id, e.to_string()))?;
                info!("Daemon restarted {} as '{}'", def.id, def.daemon_name);

                let stream = self.follow(&sink)?;
                Ok(LaunchOutcome::starting(ServiceHandle::Follower(stream)))
            }
            other => {
                self.terminate(&def, other).await?;
                self.launch(sink).await
            }
        }
    }

    async fn attach(&self, sink: ServiceSink) -> Result<Option<ServiceHandle>> {
        match sink.definition().launch {
            LaunchSpec::Command { .. } => Ok(Some(ServiceHandle::Follower(self.follow(&sink)?))),
            _ => Ok(None),
        }
    }
}
