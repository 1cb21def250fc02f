//! Test doubles for external collaborators
//!
//! In-memory stand-ins for the bridge, pm2 and docker. Exported with the
//! `test-helpers` feature so `devherd-app` and the end-to-end tests can drive
//! the supervisor without any of those installed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::ProcessEvent;

use crate::bridge::{AdbOutput, BridgeApi, BridgeLocator, BridgeLogLine, BridgeSession};
use crate::docker::{ComposeSpec, ContainerRuntime};
use crate::pm2::{DaemonApp, DaemonProcessInfo, ProcessDaemon};
use crate::process::StreamHandle;

/// Spawn a task that emits `lines` on stdout and then stays attached
fn scripted_follower(lines: Vec<String>, tx: mpsc::Sender<ProcessEvent>) -> StreamHandle {
    let task = tokio::spawn(async move {
        for line in lines {
            if tx.send(ProcessEvent::Stdout(line)).await.is_err() {
                return;
            }
        }
        std::future::pending::<()>().await;
    });
    StreamHandle::Task(task.abort_handle())
}

// ─────────────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────────────

/// A call received by [`FakeBridge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Ping,
    Adb(String),
    LaunchEmulator { avd: String, port: u16 },
    DrainLogs,
}

#[derive(Debug, Clone)]
struct FakeDevice {
    serial: String,
    avd: String,
    model: String,
}

/// In-memory bridge. Launching an emulator attaches it immediately.
#[derive(Debug, Default)]
pub struct FakeBridge {
    devices: Mutex<Vec<FakeDevice>>,
    calls: Mutex<Vec<BridgeCall>>,
    failures: Mutex<Vec<(String, String)>>,
    responses: Mutex<Vec<(String, String)>>,
    logs: Mutex<Vec<BridgeLogLine>>,
    unreachable: AtomicBool,
    boot_on_launch: AtomicBool,
}

impl FakeBridge {
    pub fn new() -> Self {
        let bridge = Self::default();
        bridge.boot_on_launch.store(true, Ordering::SeqCst);
        bridge
    }

    pub fn with_device(self, serial: &str, avd: &str, model: &str) -> Self {
        self.add_device(serial, avd, model);
        self
    }

    /// adb commands containing `pattern` answer `status: error` with `message`
    pub fn fail_when(self, pattern: &str, message: &str) -> Self {
        self.lock_failures()
            .push((pattern.to_string(), message.to_string()));
        self
    }

    /// adb commands containing `pattern` succeed with `stdout`
    pub fn respond_when(self, pattern: &str, stdout: &str) -> Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push((pattern.to_string(), stdout.to_string()));
        }
        self
    }

    /// Launched emulators never show up in `adb devices`
    pub fn never_boot(self) -> Self {
        self.boot_on_launch.store(false, Ordering::SeqCst);
        self
    }

    pub fn add_device(&self, serial: &str, avd: &str, model: &str) {
        if let Ok(mut d) = self.devices.lock() {
            d.push(FakeDevice {
                serial: serial.to_string(),
                avd: avd.to_string(),
                model: model.to_string(),
            });
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn push_log(&self, message: &str, level: &str) {
        if let Ok(mut l) = self.logs.lock() {
            l.push(BridgeLogLine {
                timestamp: None,
                message: message.to_string(),
                level: level.to_string(),
            });
        }
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn adb_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BridgeCall::Adb(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, Vec<(String, String)>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: BridgeCall) -> Result<()> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(call);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::bridge_unreachable(self.address(), "connection refused"));
        }
        Ok(())
    }

    fn devices(&self) -> Vec<FakeDevice> {
        self.devices.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BridgeApi for FakeBridge {
    fn address(&self) -> String {
        "fake-bridge:4040".to_string()
    }

    async fn ping(&self) -> Result<()> {
        self.record(BridgeCall::Ping)
    }

    async fn adb(&self, args: &str) -> Result<AdbOutput> {
        self.record(BridgeCall::Adb(args.to_string()))?;

        if let Some((_, message)) = self
            .lock_failures()
            .iter()
            .find(|(pattern, _)| args.contains(pattern.as_str()))
        {
            return Err(Error::bridge(message.clone()));
        }
        let scripted = self.responses.lock().ok().and_then(|r| {
            r.iter()
                .find(|(pattern, _)| args.contains(pattern.as_str()))
                .map(|(_, stdout)| stdout.clone())
        });
        if let Some(stdout) = scripted {
            return Ok(AdbOutput {
                stdout,
                stderr: String::new(),
            });
        }

        let devices = self.devices();
        let stdout = if args == "devices" {
            let mut out = String::from("List of devices attached\r\n");
            for d in &devices {
                out.push_str(&format!("{}\tdevice\r\n", d.serial));
            }
            out.push_str("\r\n");
            out
        } else if let Some(rest) = args.strip_prefix("-s ") {
            let serial = rest.split_whitespace().next().unwrap_or_default();
            let device = devices.iter().find(|d| d.serial == serial);
            if args.ends_with("getprop ro.boot.qemu.avd_name") {
                device.map(|d| format!("{}\r\n", d.avd)).unwrap_or_default()
            } else if args.ends_with("getprop ro.product.model") {
                device.map(|d| format!("{}\r\n", d.model)).unwrap_or_default()
            } else if args.contains(" install ") {
                "Performing Streamed Install\r\nSuccess\r\n".to_string()
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        Ok(AdbOutput {
            stdout,
            stderr: String::new(),
        })
    }

    async fn launch_emulator(&self, avd: &str, port: u16) -> Result<()> {
        self.record(BridgeCall::LaunchEmulator {
            avd: avd.to_string(),
            port,
        })?;
        if self.boot_on_launch.load(Ordering::SeqCst) {
            self.add_device(&format!("emulator-{}", port), avd, avd);
        }
        Ok(())
    }

    async fn drain_logs(&self) -> Result<Vec<BridgeLogLine>> {
        self.record(BridgeCall::DrainLogs)?;
        Ok(self
            .logs
            .lock()
            .map(|mut l| std::mem::take(&mut *l))
            .unwrap_or_default())
    }
}

/// Locator returning a fixed bridge when its probe succeeds
pub struct StaticBridgeLocator {
    bridge: Option<Arc<dyn BridgeApi>>,
    session: Mutex<Option<BridgeSession>>,
}

impl StaticBridgeLocator {
    pub fn new(bridge: Arc<dyn BridgeApi>) -> Self {
        Self {
            bridge: Some(bridge),
            session: Mutex::new(None),
        }
    }

    /// No bridge host at all
    pub fn absent() -> Self {
        Self {
            bridge: None,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BridgeLocator for StaticBridgeLocator {
    async fn locate(&self) -> Option<Arc<dyn BridgeApi>> {
        let bridge = self.bridge.as_ref()?;
        let reachable = bridge.ping().await.is_ok();
        if let Ok(mut s) = self.session.lock() {
            *s = Some(BridgeSession {
                host_address: bridge.address(),
                last_checked_at: chrono::Local::now(),
                reachable,
            });
        }
        reachable.then(|| Arc::clone(bridge))
    }

    fn session(&self) -> Option<BridgeSession> {
        self.session.lock().ok().and_then(|s| s.clone())
    }
}

// ─────────────────────────────────────────────────────────────────
// Process daemon
// ─────────────────────────────────────────────────────────────────

/// In-memory pm2
#[derive(Debug, Default)]
pub struct FakeProcessDaemon {
    processes: Mutex<HashMap<String, DaemonProcessInfo>>,
    started: Mutex<Vec<DaemonApp>>,
    stopped: Mutex<Vec<String>>,
    restarted: Mutex<Vec<String>>,
    log_lines: Mutex<HashMap<String, Vec<String>>>,
    fail_start: Mutex<Option<String>>,
    start_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl FakeProcessDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines replayed to followers of `name`
    pub fn with_logs(self, name: &str, lines: &[&str]) -> Self {
        if let Ok(mut l) = self.log_lines.lock() {
            l.insert(
                name.to_string(),
                lines.iter().map(|s| s.to_string()).collect(),
            );
        }
        self
    }

    /// Every `start` fails with `message`
    pub fn failing_start(self, message: &str) -> Self {
        if let Ok(mut f) = self.fail_start.lock() {
            *f = Some(message.to_string());
        }
        self
    }

    /// Every `start` takes `delay` before the app is registered
    pub fn slow_start(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.start_delay.lock() {
            *d = Some(delay);
        }
        self
    }

    /// Pretend the daemon itself is down (`list` errors)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Flip a process's online flag as if it crashed or was started outside
    pub fn set_online(&self, name: &str, online: bool) {
        if let Ok(mut p) = self.processes.lock() {
            p.insert(
                name.to_string(),
                DaemonProcessInfo {
                    name: name.to_string(),
                    online,
                    pid: online.then_some(1000),
                },
            );
        }
    }

    pub fn started(&self) -> Vec<DaemonApp> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn restarted(&self) -> Vec<String> {
        self.restarted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ProcessDaemon for FakeProcessDaemon {
    async fn start(&self, app: &DaemonApp) -> Result<()> {
        let delay = self.start_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.fail_start.lock().ok().and_then(|f| f.clone()) {
            return Err(Error::daemon(message));
        }
        if let Ok(mut s) = self.started.lock() {
            s.push(app.clone());
        }
        self.set_online(&app.name, true);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if let Ok(mut s) = self.stopped.lock() {
            s.push(name.to_string());
        }
        self.set_online(name, false);
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        if let Ok(mut r) = self.restarted.lock() {
            r.push(name.to_string());
        }
        self.set_online(name, true);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DaemonProcessInfo>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::daemon("pm2 daemon not running"));
        }
        Ok(self
            .processes
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    fn follow_logs(&self, name: &str, tx: mpsc::Sender<ProcessEvent>) -> Result<StreamHandle> {
        let lines = self
            .log_lines
            .lock()
            .ok()
            .and_then(|l| l.get(name).cloned())
            .unwrap_or_default();
        Ok(scripted_follower(lines, tx))
    }
}

// ─────────────────────────────────────────────────────────────────
// Container runtime
// ─────────────────────────────────────────────────────────────────

/// In-memory docker
#[derive(Debug, Default)]
pub struct FakeContainerRuntime {
    down: AtomicBool,
    compose_calls: Mutex<Vec<ComposeSpec>>,
    followed: Mutex<Vec<String>>,
    log_lines: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logs(self, container: &str, lines: &[&str]) -> Self {
        if let Ok(mut l) = self.log_lines.lock() {
            l.insert(
                container.to_string(),
                lines.iter().map(|s| s.to_string()).collect(),
            );
        }
        self
    }

    /// Runtime daemon not reachable
    pub fn down(self) -> Self {
        self.down.store(true, Ordering::SeqCst);
        self
    }

    pub fn compose_calls(&self) -> Vec<ComposeSpec> {
        self.compose_calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn followed(&self) -> Vec<String> {
        self.followed.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn is_daemon_up(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn compose_up(&self, spec: &ComposeSpec) -> Result<()> {
        if let Ok(mut c) = self.compose_calls.lock() {
            c.push(spec.clone());
        }
        Ok(())
    }

    fn follow_logs(
        &self,
        container: &str,
        tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<StreamHandle> {
        if let Ok(mut f) = self.followed.lock() {
            f.push(container.to_string());
        }
        let lines = self
            .log_lines
            .lock()
            .ok()
            .and_then(|l| l.get(container).cloned())
            .unwrap_or_default();
        Ok(scripted_follower(lines, tx))
    }
}
