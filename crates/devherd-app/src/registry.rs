//! Process registry
//!
//! In-memory map of service id to [`ServiceRecord`]; the single source of
//! truth for status, handles and logs. Every change goes through one lock and
//! is broadcast as a [`SupervisorEvent`] before the lock is released, so
//! readers and subscribers always observe mutations in the same order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use devherd_core::prelude::*;
use devherd_core::{
    next_status, LogEntry, RingBuffer, ServiceStatus, StatusHint, COMBINED_LOG_CAPACITY,
    SERVICE_LOG_CAPACITY,
};

use crate::backend::ServiceHandle;
use crate::config::ServiceDefinition;
use crate::events::{ClearTarget, ServiceSnapshot, SupervisorEvent};

/// Capacity of the notification channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One configured service
#[derive(Debug)]
pub struct ServiceRecord {
    definition: Arc<ServiceDefinition>,
    status: ServiceStatus,
    logs: RingBuffer<LogEntry>,
    handle: Option<ServiceHandle>,
    /// Bumped by every launch and stop; stale pipelines compare against it
    generation: u64,
    device_serial: Option<String>,
}

impl ServiceRecord {
    fn new(definition: ServiceDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            status: ServiceStatus::Stopped,
            logs: RingBuffer::new(SERVICE_LOG_CAPACITY),
            handle: None,
            generation: 0,
            device_serial: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<ServiceDefinition> {
        &self.definition
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ServiceStatus) {
        if self.status != status {
            debug!("{}: {} -> {}", self.definition.id, self.status, status);
            self.status = status;
        }
    }

    pub fn logs(&self) -> &RingBuffer<LogEntry> {
        &self.logs
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn device_serial(&self) -> Option<&str> {
        self.device_serial.as_deref()
    }

    pub fn set_device_serial(&mut self, serial: Option<String>) {
        self.device_serial = serial;
    }

    /// Enter `starting` for a new launch; returns its generation
    pub fn begin_launch(&mut self) -> u64 {
        self.generation += 1;
        self.device_serial = None;
        self.set_status(ServiceStatus::Starting);
        self.generation
    }

    /// Make every in-flight pipeline of this record stale
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    /// Store the handle of a live launch. Returns it back when the record
    /// moved on (stopped, failed or relaunched) in the meantime.
    pub fn install_handle(
        &mut self,
        generation: u64,
        handle: ServiceHandle,
    ) -> std::result::Result<(), ServiceHandle> {
        if generation != self.generation || !self.status.is_active() || self.handle.is_some() {
            return Err(handle);
        }
        self.handle = Some(handle);
        Ok(())
    }

    pub fn take_handle(&mut self) -> Option<ServiceHandle> {
        self.handle.take()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let def = &self.definition;
        ServiceSnapshot {
            id: def.id.clone(),
            display_name: def.display_name.clone(),
            backend: def.backend,
            target: def.target,
            status: self.status,
            port: def.port,
            auto_start: def.auto_start,
            device: def.device().cloned(),
            device_serial: self.device_serial.clone(),
            pid: self.handle.as_ref().and_then(ServiceHandle::pid),
            has_handle: self.handle.is_some(),
            log_count: self.logs.len(),
        }
    }
}

struct RegistryState {
    records: Vec<ServiceRecord>,
    combined: RingBuffer<LogEntry>,
}

impl RegistryState {
    fn record_mut(&mut self, id: &str) -> Result<&mut ServiceRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| Error::unknown_service(id))
    }

    fn record(&self, id: &str) -> Option<&ServiceRecord> {
        self.records.iter().find(|r| r.id() == id)
    }
}

/// Result of appending a line that may carry a status hint
#[derive(Debug, Default)]
pub struct HintOutcome {
    /// Status after the hint, when it changed
    pub transitioned_to: Option<ServiceStatus>,
    /// Handle detached by a transition to `error`; the caller releases it
    pub released: Option<ServiceHandle>,
}

/// The process registry
pub struct Registry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<SupervisorEvent>,
    /// Set once `Shutdown` went out; nothing is broadcast after it
    closed: AtomicBool,
}

impl Registry {
    /// One record per definition, in configuration order
    pub fn new(definitions: Vec<ServiceDefinition>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(RegistryState {
                records: definitions.into_iter().map(ServiceRecord::new).collect(),
                combined: RingBuffer::new(COMBINED_LOG_CAPACITY),
            }),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event; no subscribers is not an error
    pub fn emit(&self, event: SupervisorEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    /// Broadcast `Shutdown` and go quiet. Buffers still accept lines.
    pub fn close(&self) {
        let _state = self.lock();
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SupervisorEvent::Shutdown);
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock()
            .records
            .iter()
            .map(|r| r.id().to_string())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ServiceSnapshot> {
        self.lock().record(id).map(ServiceRecord::snapshot)
    }

    pub fn list(&self) -> Vec<ServiceSnapshot> {
        self.lock()
            .records
            .iter()
            .map(ServiceRecord::snapshot)
            .collect()
    }

    pub fn definition(&self, id: &str) -> Option<Arc<ServiceDefinition>> {
        self.lock().record(id).map(|r| Arc::clone(r.definition()))
    }

    pub fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.lock().record(id).map(ServiceRecord::status)
    }

    pub fn generation(&self, id: &str) -> Option<u64> {
        self.lock().record(id).map(ServiceRecord::generation)
    }

    /// Apply `f` to a record; the only way to change one.
    ///
    /// Broadcasts the resulting snapshot before returning when it changed.
    pub fn mutate<R>(&self, id: &str, f: impl FnOnce(&mut ServiceRecord) -> R) -> Result<R> {
        let mut state = self.lock();
        let record = state.record_mut(id)?;
        let before = record.snapshot();
        let result = f(record);
        self.notify_if_changed(before, record);
        Ok(result)
    }

    fn notify_if_changed(&self, before: ServiceSnapshot, record: &ServiceRecord) {
        let service = record.snapshot();
        if service != before {
            self.emit(SupervisorEvent::ServiceUpdated { service });
        }
    }

    /// Like [`Registry::mutate`], but only while `generation` is current
    pub fn mutate_current<R>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&mut ServiceRecord) -> R,
    ) -> Result<Option<R>> {
        let mut state = self.lock();
        let record = state.record_mut(id)?;
        if record.generation != generation {
            return Ok(None);
        }
        let before = record.snapshot();
        let result = f(record);
        self.notify_if_changed(before, record);
        Ok(Some(result))
    }

    /// Append to the service buffer and the combined buffer together
    pub fn append_log(&self, id: &str, entry: LogEntry) -> Result<()> {
        let mut state = self.lock();
        state.record_mut(id)?.logs.push(entry.clone());
        state.combined.push(entry.clone());
        self.emit(SupervisorEvent::Log { entry });
        Ok(())
    }

    /// Append an entry that belongs to no configured service
    pub fn append_combined(&self, entry: LogEntry) {
        let mut state = self.lock();
        state.combined.push(entry.clone());
        self.emit(SupervisorEvent::Log { entry });
    }

    /// Append a line and apply its status hint under the same lock.
    ///
    /// The hint only applies while `generation` is current. A transition to
    /// `error` detaches the handle so the status/handle invariant holds.
    pub fn append_with_hint(
        &self,
        id: &str,
        generation: u64,
        entry: LogEntry,
        hint: Option<StatusHint>,
    ) -> Result<HintOutcome> {
        let mut state = self.lock();
        let record = state.record_mut(id)?;
        record.logs.push(entry.clone());

        let mut outcome = HintOutcome::default();
        if record.generation == generation {
            let next = next_status(record.status, hint);
            if next != record.status {
                record.set_status(next);
                if next == ServiceStatus::Error {
                    outcome.released = record.take_handle();
                }
                outcome.transitioned_to = Some(next);
            }
        }
        let updated = outcome.transitioned_to.map(|_| record.snapshot());

        state.combined.push(entry.clone());
        self.emit(SupervisorEvent::Log { entry });
        if let Some(service) = updated {
            self.emit(SupervisorEvent::ServiceUpdated { service });
        }
        Ok(outcome)
    }

    pub fn combined_logs(&self) -> Vec<LogEntry> {
        self.lock().combined.to_vec()
    }

    pub fn service_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        self.lock()
            .record(id)
            .map(|r| r.logs.to_vec())
            .ok_or_else(|| Error::unknown_service(id))
    }

    pub fn clear_logs(&self, target: &ClearTarget) -> Result<()> {
        let mut state = self.lock();
        match target {
            ClearTarget::Combined => state.combined.clear(),
            ClearTarget::Service(id) => state.record_mut(id)?.logs.clear(),
        }
        self.emit(SupervisorEvent::LogsCleared {
            target: target.clone(),
        });
        Ok(())
    }

    /// Detach every handle and stop every record (shutdown)
    pub fn drain_handles(&self) -> Vec<(Arc<ServiceDefinition>, ServiceHandle)> {
        let mut state = self.lock();
        let mut handles = Vec::new();
        for record in state.records.iter_mut() {
            let before = record.snapshot();
            record.invalidate();
            if let Some(handle) = record.take_handle() {
                handles.push((Arc::clone(&record.definition), handle));
            }
            record.set_status(ServiceStatus::Stopped);
            self.notify_if_changed(before, record);
        }
        handles
    }
}
