//! Supervisor - the façade every presentation layer drives
//!
//! Owns the registry, one backend adapter per [`BackendKind`], and the
//! background pollers. Lifecycle operations are plain async methods; state
//! changes reach subscribers through [`Supervisor::subscribe`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use devherd_core::prelude::*;
use devherd_core::{BackendKind, LogEntry, LogLevel, ServiceStatus};
use devherd_daemon::{
    BridgeLocator, CommandSecretSource, ContainerRuntime, DockerCli, GatewayBridgeLocator,
    Pm2Cli, ProcessDaemon, SecretSource, TERMINATE_GRACE,
};

use crate::backend::{
    Backend, ContainerBackend, DaemonBackend, DirectBackend, LaunchOutcome, ServiceHandle,
};
use crate::config::{InfrastructureSpec, LaunchSpec, PollingSettings, ServiceDefinition, Topology};
use crate::events::{ClearTarget, ServiceSnapshot, SupervisorEvent};
use crate::pipeline::ServiceSink;
use crate::polling::Pollers;
use crate::registry::Registry;

/// Attribution of supervisor-authored lines in the combined log
pub const SUPERVISOR_LOG_ID: &str = "devherd";

/// Attribution of bridge agent lines in the combined log
pub const AGENT_LOG_ID: &str = "agent";

/// External collaborators of the supervisor
pub struct SupervisorDeps {
    pub daemon: Arc<dyn ProcessDaemon>,
    pub containers: Arc<dyn ContainerRuntime>,
    pub locator: Arc<dyn BridgeLocator>,
    pub secrets: Option<Arc<dyn SecretSource>>,
}

impl SupervisorDeps {
    /// pm2, docker and the gateway bridge, as configured
    pub fn from_topology(topology: &Topology) -> Self {
        let bridge = &topology.bridge;
        Self {
            daemon: Arc::new(Pm2Cli::new(topology.tools.pm2.clone())),
            containers: Arc::new(DockerCli::new(topology.tools.docker.clone())),
            locator: Arc::new(GatewayBridgeLocator::new(
                bridge.port,
                bridge.host.clone(),
                bridge.request_timeout(),
            )),
            secrets: topology.secrets.command.as_ref().map(|command| {
                Arc::new(CommandSecretSource::new(command.clone())) as Arc<dyn SecretSource>
            }),
        }
    }
}

/// Process supervisor for one topology.
///
/// - Starts, stops and restarts services through their backend
/// - Brings up infrastructure and the auto-start set in bulk
/// - Reconciles daemon-managed services against the daemon
/// - Mirrors bridge agent logs into the combined log
pub struct Supervisor {
    registry: Arc<Registry>,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
    daemon: Arc<dyn ProcessDaemon>,
    containers: Arc<dyn ContainerRuntime>,
    locator: Arc<dyn BridgeLocator>,
    infrastructure: Option<InfrastructureSpec>,
    polling: PollingSettings,
    pollers: Mutex<Option<Pollers>>,
    /// Any native build in the topology
    bridge_dependent: bool,
    /// Last observed bridge reachability, to log only transitions
    bridge_reachable: Mutex<Option<bool>>,
    /// Set by `shutdown`; nothing is launched or polled afterwards
    shut_down: AtomicBool,
}

impl Supervisor {
    pub fn new(topology: Topology, deps: SupervisorDeps) -> Self {
        let SupervisorDeps {
            daemon,
            containers,
            locator,
            secrets,
        } = deps;

        let mut backends: HashMap<BackendKind, Arc<dyn Backend>> = HashMap::new();
        backends.insert(BackendKind::DirectProcess, Arc::new(DirectBackend::new()));
        backends.insert(
            BackendKind::DaemonManaged,
            Arc::new(DaemonBackend::new(
                Arc::clone(&daemon),
                Arc::clone(&locator),
                secrets,
            )),
        );
        backends.insert(
            BackendKind::Container,
            Arc::new(ContainerBackend::new(Arc::clone(&containers))),
        );

        let bridge_dependent = topology
            .services
            .iter()
            .any(ServiceDefinition::is_bridge_dependent);

        Self {
            registry: Arc::new(Registry::new(topology.services)),
            backends,
            daemon,
            containers,
            locator,
            infrastructure: topology.infrastructure,
            polling: topology.polling,
            pollers: Mutex::new(None),
            bridge_dependent,
            bridge_reachable: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Read API
    // ─────────────────────────────────────────────────────────────

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.registry.subscribe()
    }

    pub fn list(&self) -> Vec<ServiceSnapshot> {
        self.registry.list()
    }

    pub fn get(&self, id: &str) -> Option<ServiceSnapshot> {
        self.registry.get(id)
    }

    pub fn combined_logs(&self) -> Vec<LogEntry> {
        self.registry.combined_logs()
    }

    pub fn service_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        self.registry.service_logs(id)
    }

    pub fn clear_logs(&self, target: &ClearTarget) -> Result<()> {
        self.registry.clear_logs(target)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::precondition("Supervisor has shut down"));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    fn backend(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::config(format!("no backend registered for {}", kind)))
    }

    fn sink(
        &self,
        definition: &Arc<ServiceDefinition>,
        generation: u64,
        backend: &Arc<dyn Backend>,
    ) -> ServiceSink {
        ServiceSink::new(
            Arc::clone(&self.registry),
            Arc::clone(definition),
            generation,
            Arc::clone(backend),
        )
    }

    fn log_for(&self, definition: &ServiceDefinition, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(
            definition.id.clone(),
            definition.display_name.clone(),
            level,
            message,
        );
        if let Err(e) = self.registry.append_log(&definition.id, entry) {
            warn!("Dropping line for {}: {}", definition.id, e);
        }
    }

    fn log_supervisor(&self, level: LogLevel, message: impl Into<String>) {
        self.registry.append_combined(LogEntry::new(
            SUPERVISOR_LOG_ID,
            SUPERVISOR_LOG_ID,
            level,
            message,
        ));
    }

    /// Start a service. A no-op while it is already active.
    ///
    /// Launch failures leave the service in `error` with the reason logged
    /// and are returned as [`Error::Launch`].
    pub async fn start(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let launch = self.registry.mutate(id, |r| {
            if r.status().is_active() {
                None
            } else {
                Some((Arc::clone(r.definition()), r.begin_launch()))
            }
        })?;
        let Some((definition, generation)) = launch else {
            debug!("{} is already active, ignoring start", id);
            return Ok(());
        };

        info!("Starting {} ({})", definition.id, definition.backend);
        self.log_for(
            &definition,
            LogLevel::Info,
            format!("Starting {}", definition.display_name),
        );

        let backend = self.backend(definition.backend)?;
        let sink = self.sink(&definition, generation, &backend);
        match backend.launch(sink).await {
            Ok(outcome) => {
                self.install(&definition, generation, outcome, &backend)
                    .await;
                Ok(())
            }
            Err(e) => Err(self.launch_failed(&definition, generation, e)),
        }
    }

    /// Store a launch's handle, or release it when the record moved on
    async fn install(
        &self,
        definition: &Arc<ServiceDefinition>,
        generation: u64,
        outcome: LaunchOutcome,
        backend: &Arc<dyn Backend>,
    ) {
        let LaunchOutcome { handle, status } = outcome;
        let mut pending = Some(handle);
        let _ = self.registry.mutate(&definition.id, |r| {
            if self.is_shut_down() {
                return;
            }
            let Some(handle) = pending.take() else { return };
            match r.install_handle(generation, handle) {
                Ok(()) => {
                    if status != ServiceStatus::Starting {
                        r.set_status(status);
                    }
                }
                Err(handle) => pending = Some(handle),
            }
        });

        if let Some(handle) = pending {
            debug!("{} moved on during launch, releasing its handle", definition.id);
            if let Err(e) = backend.terminate(definition, handle).await {
                warn!("Failed to release superseded launch of {}: {}", definition.id, e);
            }
        }
    }

    fn launch_failed(&self, definition: &ServiceDefinition, generation: u64, e: Error) -> Error {
        let err = match e {
            Error::Launch { .. } => e,
            other => Error::launch(&definition.id, other.to_string()),
        };
        error!("{}", err);

        let applied = self
            .registry
            .mutate_current(&definition.id, generation, |r| {
                r.set_status(ServiceStatus::Error)
            });
        if let Ok(Some(())) = applied {
            let message = err.to_string();
            self.log_for(definition, LogLevel::Error, message.clone());
            self.registry.emit(SupervisorEvent::Error {
                service: Some(definition.id.clone()),
                message,
            });
        }
        err
    }

    /// Stop a service. Idempotent on a stopped service.
    ///
    /// The record is `stopped` before the backend is asked to terminate, so
    /// output still arriving from the old launch cannot move it again.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let (definition, handle, was) = self.registry.mutate(id, |r| {
            let was = r.status();
            let handle = r.take_handle();
            if was != ServiceStatus::Stopped || handle.is_some() {
                r.invalidate();
                r.set_status(ServiceStatus::Stopped);
            }
            (Arc::clone(r.definition()), handle, was)
        })?;

        let Some(handle) = handle else {
            if was != ServiceStatus::Stopped {
                self.log_for(&definition, LogLevel::Info, "Stopped");
            }
            return Ok(());
        };

        info!("Stopping {}", definition.id);
        self.log_for(
            &definition,
            LogLevel::Info,
            format!("Stopping {}", definition.display_name),
        );
        let backend = self.backend(definition.backend)?;
        if let Err(e) = backend.terminate(&definition, handle).await {
            error!("Failed to stop {}: {}", definition.id, e);
            self.log_for(&definition, LogLevel::Error, e.to_string());
            self.registry.emit(SupervisorEvent::Error {
                service: Some(definition.id.clone()),
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Restart a service.
    ///
    /// A service holding a live handle is restarted in place by its backend
    /// (pm2 restarts by name). Anything else is stopped, then started.
    pub async fn restart(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let live = self.registry.mutate(id, |r| {
            let handle = r.take_handle()?;
            let generation = r.begin_launch();
            Some((Arc::clone(r.definition()), generation, handle))
        })?;
        let Some((definition, generation, handle)) = live else {
            self.stop(id).await?;
            return self.start(id).await;
        };

        info!("Restarting {}", definition.id);
        self.log_for(
            &definition,
            LogLevel::Info,
            format!("Restarting {}", definition.display_name),
        );
        let backend = self.backend(definition.backend)?;
        let sink = self.sink(&definition, generation, &backend);
        match backend.restart(handle, sink).await {
            Ok(outcome) => {
                self.install(&definition, generation, outcome, &backend)
                    .await;
                Ok(())
            }
            Err(e) => Err(self.launch_failed(&definition, generation, e)),
        }
    }

    /// Bring up infrastructure, then start every auto-start daemon service.
    ///
    /// An unreachable container runtime aborts the whole operation. Single
    /// service failures are logged and do not stop the rest.
    pub async fn auto_start_core(&self) -> Result<()> {
        self.ensure_running()?;
        if let Some(infra) = &self.infrastructure {
            if !self.containers.is_daemon_up().await {
                let message =
                    "Container runtime is not running; start Docker and retry".to_string();
                error!("{}", message);
                self.log_supervisor(LogLevel::Error, message.clone());
                self.registry.emit(SupervisorEvent::Error {
                    service: None,
                    message: message.clone(),
                });
                return Err(Error::precondition(message));
            }

            self.log_supervisor(LogLevel::Info, "Bringing up infrastructure");
            if let Err(e) = self.containers.compose_up(&infra.compose).await {
                error!("Infrastructure bring-up failed: {}", e);
                self.log_supervisor(LogLevel::Error, e.to_string());
                self.registry.emit(SupervisorEvent::Error {
                    service: None,
                    message: e.to_string(),
                });
                return Err(e);
            }

            self.ensure_running()?;
            for id in &infra.services {
                if let Err(e) = self.start(id).await {
                    warn!("Could not attach to {}: {}", id, e);
                }
            }
        }

        let auto: Vec<String> = self
            .list()
            .into_iter()
            .filter(|s| s.auto_start && s.backend == BackendKind::DaemonManaged)
            .map(|s| s.id)
            .collect();
        for id in auto {
            self.ensure_running()?;
            if let Err(e) = self.start(&id).await {
                warn!("Auto-start of {} failed: {}", id, e);
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Background work
    // ─────────────────────────────────────────────────────────────

    /// Start the reconciliation and bridge log pollers (idempotent)
    pub fn start_polling(self: &Arc<Self>) {
        let mut pollers = match self.pollers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pollers.is_none() && !self.is_shut_down() {
            *pollers = Some(Pollers::spawn(Arc::downgrade(self), self.polling));
        }
    }

    pub fn is_polling(&self) -> bool {
        match self.pollers.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Cancel the pollers and wait for them to finish
    pub async fn stop_polling(&self) {
        let pollers = match self.pollers.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(pollers) = pollers {
            pollers.cancel().await;
        }
    }

    /// One reconciliation pass: bridge reachability, then daemon state
    pub async fn reconcile_once(&self) {
        self.check_bridge().await;
        self.reconcile_daemon().await;
    }

    /// Re-check the bridge when any service depends on it; logs transitions
    pub async fn check_bridge(&self) -> Option<bool> {
        if !self.bridge_dependent {
            return None;
        }
        let reachable = self.locator.locate().await.is_some();

        let previous = match self.bridge_reachable.lock() {
            Ok(mut last) => last.replace(reachable),
            Err(poisoned) => poisoned.into_inner().replace(reachable),
        };
        if previous != Some(reachable) {
            let address = self
                .locator
                .session()
                .map(|s| s.host_address)
                .unwrap_or_else(|| "default gateway".to_string());
            if reachable {
                info!("Bridge reachable at {}", address);
                self.log_supervisor(LogLevel::Info, format!("Bridge reachable at {}", address));
            } else {
                warn!("Bridge unreachable at {}", address);
                self.log_supervisor(
                    LogLevel::Warn,
                    format!("Bridge unreachable at {}", address),
                );
            }
        }
        Some(reachable)
    }

    /// Align daemon-managed services with what the daemon reports.
    ///
    /// `running` but offline becomes `stopped` (follower detached, the
    /// daemon is not told to stop). `stopped` but online is attached to and
    /// becomes `running`. A daemon that cannot be listed changes nothing.
    pub async fn reconcile_daemon(&self) {
        let processes = match self.daemon.list().await {
            Ok(list) => list,
            Err(e) if e.is_recoverable() => {
                debug!("Skipping daemon reconciliation: {}", e);
                return;
            }
            Err(e) => {
                warn!("Daemon reconciliation failed: {}", e);
                return;
            }
        };

        let managed: Vec<Arc<ServiceDefinition>> = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.definition(id))
            .filter(|d| {
                d.backend == BackendKind::DaemonManaged
                    && matches!(d.launch, LaunchSpec::Command { .. })
            })
            .collect();

        for definition in managed {
            let online = processes
                .iter()
                .any(|p| p.name == definition.daemon_name && p.online);
            match self.registry.status(&definition.id) {
                Some(ServiceStatus::Running) if !online => self.mark_offline(&definition).await,
                Some(ServiceStatus::Stopped) if online => self.attach(&definition).await,
                _ => {}
            }
        }
    }

    async fn mark_offline(&self, definition: &Arc<ServiceDefinition>) {
        let marked = self.registry.mutate(&definition.id, |r| {
            if r.status() != ServiceStatus::Running {
                return None;
            }
            r.invalidate();
            r.set_status(ServiceStatus::Stopped);
            Some(r.take_handle())
        });
        let Ok(Some(handle)) = marked else { return };

        warn!("{} is no longer online in the daemon", definition.id);
        self.log_for(definition, LogLevel::Warn, "Process is no longer running");
        if let Some(handle) = handle {
            detach(definition, handle).await;
        }
    }

    async fn attach(&self, definition: &Arc<ServiceDefinition>) {
        let Ok(backend) = self.backend(definition.backend) else {
            return;
        };
        let generation = self.registry.mutate(&definition.id, |r| {
            if r.status() != ServiceStatus::Stopped {
                return None;
            }
            r.invalidate();
            Some(r.generation())
        });
        let Ok(Some(generation)) = generation else {
            return;
        };

        let sink = self.sink(definition, generation, &backend);
        let handle = match backend.attach(sink).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not attach to {}: {}", definition.id, e);
                return;
            }
        };

        let mut pending = Some(handle);
        let _ = self.registry.mutate_current(&definition.id, generation, |r| {
            if self.is_shut_down() || r.status() != ServiceStatus::Stopped || r.has_handle() {
                return;
            }
            let Some(handle) = pending.take() else { return };
            r.set_status(ServiceStatus::Running);
            if let Err(handle) = r.install_handle(generation, handle) {
                r.set_status(ServiceStatus::Stopped);
                pending = Some(handle);
            }
        });

        match pending {
            None => {
                info!("Attached to {} running in the daemon", definition.id);
                self.log_for(definition, LogLevel::Info, "Attached to running process");
            }
            Some(handle) => detach(definition, handle).await,
        }
    }

    /// Pull buffered bridge agent lines into the combined log
    pub async fn drain_bridge_logs(&self) -> usize {
        if !self.bridge_dependent {
            return 0;
        }
        let Some(bridge) = self.locator.locate().await else {
            return 0;
        };
        let lines = match bridge.drain_logs().await {
            Ok(lines) => lines,
            Err(e) => {
                debug!("Bridge log drain failed: {}", e);
                return 0;
            }
        };

        let count = lines.len();
        for line in lines {
            let mut entry = LogEntry::new(
                AGENT_LOG_ID,
                AGENT_LOG_ID,
                LogLevel::from_name(&line.level),
                line.message,
            )
            .with_source(AGENT_LOG_ID);
            if let Some(ts) = line
                .timestamp
                .as_deref()
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            {
                entry = entry.with_timestamp(ts.with_timezone(&chrono::Local));
            }
            self.registry.append_combined(entry);
        }
        count
    }

    /// Stop background work and let go of every service.
    ///
    /// Direct processes are terminated. Followers and recipes are detached;
    /// daemon-managed processes and containers keep running. `Shutdown` is
    /// the last event broadcast.
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        self.shut_down.store(true, Ordering::SeqCst);
        self.stop_polling().await;

        for (definition, handle) in self.registry.drain_handles() {
            detach(&definition, handle).await;
        }
        self.registry.close();
    }
}

/// Release a handle without touching anything the supervisor does not own
async fn detach(definition: &ServiceDefinition, handle: ServiceHandle) {
    let result = match handle {
        ServiceHandle::Process(mut process) => process.terminate(TERMINATE_GRACE).await,
        ServiceHandle::Follower(stream) => stream.close().await,
        ServiceHandle::Recipe { task, .. } => {
            task.abort();
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("Failed to release {}: {}", definition.id, e);
    }
}
