//! Output pipeline: process events to classified, attributed log entries
//!
//! A [`ServiceSink`] is created per launch and carries that launch's
//! generation. Lines are appended regardless of generation, but only the
//! current launch may move the record's status.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devherd_core::prelude::*;
use devherd_core::{classify, infer_status_hint, LogEntry, LogLevel, ProcessEvent, ServiceStatus};

use crate::backend::{Backend, ServiceHandle};
use crate::config::ServiceDefinition;
use crate::events::SupervisorEvent;
use crate::registry::Registry;

/// What a stream ending means for the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// The stream is the service: its exit stops (code 0) or fails it
    EndsService,
    /// The stream only mirrors a process living elsewhere
    Detached,
}

/// Per-launch entry point into the registry
#[derive(Clone)]
pub struct ServiceSink {
    registry: Arc<Registry>,
    definition: Arc<ServiceDefinition>,
    generation: u64,
    backend: Arc<dyn Backend>,
}

impl ServiceSink {
    pub(crate) fn new(
        registry: Arc<Registry>,
        definition: Arc<ServiceDefinition>,
        generation: u64,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            registry,
            definition,
            generation,
            backend,
        }
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn service_id(&self) -> &str {
        &self.definition.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.registry.generation(self.service_id()) == Some(self.generation)
    }

    fn entry(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        LogEntry::new(
            self.definition.id.clone(),
            self.definition.display_name.clone(),
            level,
            message,
        )
    }

    fn classified(&self, raw: &str, fallback: LogLevel) -> Option<LogEntry> {
        if raw.trim().is_empty() {
            return None;
        }
        let line = classify(raw, fallback);
        let mut entry = self.entry(line.level, line.message);
        if let Some(ts) = line.timestamp {
            entry = entry.with_timestamp(ts);
        }
        if let Some(source) = line.source_label {
            entry = entry.with_source(source);
        }
        Some(entry)
    }

    /// Classify an output line, append it, and apply its status hint
    pub fn ingest(&self, raw: &str, fallback: LogLevel) {
        let Some(entry) = self.classified(raw, fallback) else {
            return;
        };
        let hint = infer_status_hint(&entry.message);
        match self
            .registry
            .append_with_hint(self.service_id(), self.generation, entry, hint)
        {
            Ok(outcome) => {
                if outcome.transitioned_to == Some(ServiceStatus::Error) {
                    warn!("{} reported an error while starting", self.service_id());
                }
                if let Some(handle) = outcome.released {
                    self.release(handle);
                }
            }
            Err(e) => warn!("Dropping line for {}: {}", self.service_id(), e),
        }
    }

    /// Classify and append an output line without status hints
    pub fn record(&self, raw: &str, fallback: LogLevel) {
        if let Some(entry) = self.classified(raw, fallback) {
            self.append(entry);
        }
    }

    /// Append a supervisor-authored line
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.append(self.entry(level, message));
    }

    fn append(&self, entry: LogEntry) {
        if let Err(e) = self.registry.append_log(self.service_id(), entry) {
            warn!("Dropping line for {}: {}", self.service_id(), e);
        }
    }

    /// Move an active record to `status` (current launch only)
    pub fn set_status(&self, status: ServiceStatus) {
        let _ = self
            .registry
            .mutate_current(self.service_id(), self.generation, |r| {
                if r.status().is_active() {
                    r.set_status(status);
                }
            });
    }

    pub fn set_device_serial(&self, serial: &str) {
        let _ = self
            .registry
            .mutate_current(self.service_id(), self.generation, |r| {
                r.set_device_serial(Some(serial.to_string()))
            });
    }

    /// Fail the current launch: `error` status, handle dropped, failure
    /// logged and broadcast
    pub fn fail(&self, message: &str) {
        self.log(LogLevel::Error, message);
        let applied = self
            .registry
            .mutate_current(self.service_id(), self.generation, |r| {
                r.set_status(ServiceStatus::Error);
                r.take_handle()
            });
        if let Ok(Some(_)) = applied {
            self.registry.emit(SupervisorEvent::Error {
                service: Some(self.service_id().to_string()),
                message: message.to_string(),
            });
        }
    }

    /// The stream feeding this sink ended
    pub fn exited(&self, code: Option<i32>, policy: ExitPolicy) {
        match policy {
            ExitPolicy::EndsService => {
                let (level, message) = match code {
                    Some(0) => (LogLevel::Info, "Process exited with code 0".to_string()),
                    Some(c) => (LogLevel::Error, format!("Process exited with code {}", c)),
                    None => (LogLevel::Info, "Process terminated by signal".to_string()),
                };
                self.log(level, message);

                let next = match code {
                    Some(0) | None => ServiceStatus::Stopped,
                    Some(_) => ServiceStatus::Error,
                };
                let _ = self
                    .registry
                    .mutate_current(self.service_id(), self.generation, |r| {
                        if r.status().is_active() {
                            // The process is gone; dropping the handle reaps nothing.
                            drop(r.take_handle());
                            r.set_status(next);
                        }
                    });
            }
            ExitPolicy::Detached => {
                debug!("Log follower for {} ended ({:?})", self.service_id(), code);
                if self.is_current() {
                    self.log(LogLevel::Warn, "Log stream ended");
                }
            }
        }
    }

    /// Pump process events into this sink until the stream closes.
    ///
    /// Stdout falls back to `info`, stderr to `warn`.
    pub fn spawn_pump(
        &self,
        mut rx: mpsc::Receiver<ProcessEvent>,
        policy: ExitPolicy,
    ) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ProcessEvent::Stdout(line) => sink.ingest(&line, LogLevel::Info),
                    ProcessEvent::Stderr(line) => sink.ingest(&line, LogLevel::Warn),
                    ProcessEvent::Exited { code } => sink.exited(code, policy),
                }
            }
        })
    }

    /// Terminate a detached handle in the background
    fn release(&self, handle: ServiceHandle) {
        let backend = Arc::clone(&self.backend);
        let definition = Arc::clone(&self.definition);
        tokio::spawn(async move {
            if let Err(e) = backend.terminate(&definition, handle).await {
                warn!("Failed to release {}: {}", definition.id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LaunchOutcome;
    use crate::config::LaunchSpec;
    use async_trait::async_trait;
    use devherd_core::{BackendKind, RuntimeTarget};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        terminated: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::DirectProcess
        }

        async fn launch(&self, _sink: ServiceSink) -> Result<LaunchOutcome> {
            Err(Error::launch("web", "not used"))
        }

        async fn terminate(&self, _: &ServiceDefinition, _: ServiceHandle) -> Result<()> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<Registry>, ServiceSink, Arc<CountingBackend>) {
        let definition = ServiceDefinition {
            id: "web".into(),
            display_name: "Web".into(),
            backend: BackendKind::DirectProcess,
            target: RuntimeTarget::WebService,
            port: None,
            auto_start: false,
            env: HashMap::new(),
            daemon_name: "web".into(),
            launch: LaunchSpec::Command {
                command: "true".into(),
                cwd: None,
            },
        };
        let registry = Arc::new(Registry::new(vec![definition]));
        let generation = registry.mutate("web", |r| r.begin_launch()).unwrap();
        let backend = Arc::new(CountingBackend::default());
        let sink = ServiceSink::new(
            Arc::clone(&registry),
            registry.definition("web").unwrap(),
            generation,
            backend.clone(),
        );
        (registry, sink, backend)
    }

    fn task_handle() -> ServiceHandle {
        let task = tokio::spawn(std::future::pending::<()>());
        ServiceHandle::Follower(devherd_daemon::StreamHandle::Task(task.abort_handle()))
    }

    #[tokio::test]
    async fn test_structured_line_is_attributed() {
        let (registry, sink, _) = setup();
        sink.ingest(
            r#"{"level":50,"time":1704067200000,"msg":"db down","name":"api"}"#,
            LogLevel::Info,
        );
        let logs = registry.service_logs("web").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].display_name, "Web");
        assert_eq!(logs[0].source.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn test_blank_lines_dropped() {
        let (registry, sink, _) = setup();
        sink.ingest("   ", LogLevel::Info);
        sink.record("", LogLevel::Info);
        assert!(registry.service_logs("web").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_hint_releases_handle() {
        let (registry, sink, backend) = setup();
        registry
            .mutate("web", |r| r.install_handle(sink.generation(), task_handle()))
            .unwrap()
            .unwrap();

        sink.ingest("Failed to compile.", LogLevel::Warn);
        assert_eq!(registry.status("web"), Some(ServiceStatus::Error));
        assert!(!registry.get("web").unwrap().has_handle);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(backend.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_skips_hints() {
        let (registry, sink, _) = setup();
        sink.record("BUILD SUCCESSFUL in 12s", LogLevel::Info);
        assert_eq!(registry.status("web"), Some(ServiceStatus::Starting));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let (registry, sink, _) = setup();
        sink.exited(Some(2), ExitPolicy::EndsService);
        assert_eq!(registry.status("web"), Some(ServiceStatus::Error));
        let logs = registry.service_logs("web").unwrap();
        assert!(logs.last().unwrap().message.contains("code 2"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_stopped() {
        let (registry, sink, _) = setup();
        sink.exited(Some(0), ExitPolicy::EndsService);
        assert_eq!(registry.status("web"), Some(ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn test_detached_exit_keeps_status() {
        let (registry, sink, _) = setup();
        sink.exited(Some(1), ExitPolicy::Detached);
        assert_eq!(registry.status("web"), Some(ServiceStatus::Starting));
    }

    #[tokio::test]
    async fn test_fail_broadcasts_error() {
        let (registry, sink, _) = setup();
        let mut rx = registry.subscribe();
        sink.fail("Recipe stage 'install' failed: boom");

        assert_eq!(registry.status("web"), Some(ServiceStatus::Error));
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let SupervisorEvent::Error { service, message } = event {
                assert_eq!(service.as_deref(), Some("web"));
                assert!(message.contains("install"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_pump_preserves_order() {
        let (registry, sink, _) = setup();
        let (tx, rx) = mpsc::channel(16);
        let pump = sink.spawn_pump(rx, ExitPolicy::EndsService);
        for i in 0..5 {
            tx.send(ProcessEvent::Stdout(format!("line {}", i)))
                .await
                .unwrap();
        }
        tx.send(ProcessEvent::Exited { code: Some(0) }).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        let messages: Vec<_> = registry
            .service_logs("web")
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(
            messages,
            vec![
                "line 0",
                "line 1",
                "line 2",
                "line 3",
                "line 4",
                "Process exited with code 0"
            ]
        );
    }
}
