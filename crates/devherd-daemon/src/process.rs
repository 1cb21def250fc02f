//! Child process management
//!
//! Every process the supervisor spawns (direct services, recipe steps, log
//! followers) is started in its own process group so that termination reaches
//! the whole tree. Dev-server tooling (pnpm, nest, gradle) forks freely, and a
//! signal to the parent PID alone leaves orphans holding ports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

use devherd_core::prelude::*;
use devherd_core::ProcessEvent;

/// Time between SIGTERM and SIGKILL when terminating a process group
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

const READER_DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// A shell command with its working directory and environment overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Passed to `sh -c`
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Applied on top of the inherited environment
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// A spawned child process leading its own process group.
///
/// The `Child` handle is moved into a `wait_for_exit` background task that
/// emits `ProcessEvent::Exited` with the real exit code. `ChildProcess` keeps
/// a kill channel, an exited flag for synchronous checks, and a [`Notify`] so
/// `terminate()` can await exit without polling.
pub struct ChildProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl ChildProcess {
    /// Spawn `sh -c <command>` and stream its output to `event_tx`
    pub fn spawn_shell(spec: &CommandSpec, event_tx: mpsc::Sender<ProcessEvent>) -> Result<Self> {
        let args = vec!["-c".to_string(), spec.command.clone()];
        Self::spawn_internal("sh", &args, spec.cwd.as_ref(), &spec.env, event_tx)
    }

    /// Spawn a program directly (used for log followers such as `docker logs -f`)
    pub fn spawn_program(
        program: &str,
        args: &[String],
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<Self> {
        Self::spawn_internal(program, args, None, &HashMap::new(), event_tx)
    }

    fn spawn_internal(
        program: &str,
        args: &[String],
        cwd: Option<&PathBuf>,
        env: &HashMap<String, String>,
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<Self> {
        info!("Spawning: {} {}", program, args.join(" "));

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| Error::ProcessSpawn {
            reason: format!("{}: {}", program, e),
        })?;

        let pid = child.id();
        debug!("{} started with PID: {:?}", program, pid);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(Self::stdout_reader(stdout, event_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(Self::stderr_reader(stderr, event_tx.clone())));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            readers,
            kill_rx,
            event_tx,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Ok(Self {
            pid,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
        })
    }

    /// Background task: owns `child`, waits for it to exit, emits `ProcessEvent::Exited`.
    ///
    /// Output still buffered in the pipes is drained first so `Exited` is the
    /// last event of the stream. A descendant that keeps the pipe open only
    /// delays the event by `READER_DRAIN_LIMIT`.
    async fn wait_for_exit(
        mut child: Child,
        readers: Vec<JoinHandle<()>>,
        kill_rx: oneshot::Receiver<()>,
        event_tx: mpsc::Sender<ProcessEvent>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        debug!("Process exited with status: {:?}", status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting for process: {}", e);
                        None
                    }
                }
            }
            _ = kill_rx => {
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill process (already gone?): {}", e);
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        };

        let _ = timeout(READER_DRAIN_LIMIT, join_all(readers)).await;

        // Flag before event so has_exited() is true when the event is observed.
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();

        let _ = event_tx.send(ProcessEvent::Exited { code }).await;
    }

    async fn stdout_reader(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<ProcessEvent>) {
        let mut reader = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            trace!("stdout: {}", line);
            if tx.send(ProcessEvent::Stdout(line)).await.is_err() {
                debug!("stdout channel closed");
                break;
            }
        }
    }

    async fn stderr_reader(stderr: tokio::process::ChildStderr, tx: mpsc::Sender<ProcessEvent>) {
        let mut reader = BufReader::new(stderr).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            trace!("stderr: {}", line);
            if tx.send(ProcessEvent::Stderr(line)).await.is_err() {
                debug!("stderr channel closed");
                break;
            }
        }
    }

    /// Terminate the whole process group.
    ///
    /// 1. SIGTERM to the group
    /// 2. Wait up to `grace` for exit via `exit_notify`
    /// 3. SIGKILL to the group and the direct child
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        // Register before the signal so a fast exit cannot be missed.
        let exit_notify = Arc::clone(&self.exit_notify);
        let notified = exit_notify.notified();
        self.signal_group(GroupSignal::Term);

        if self.has_exited() {
            return Ok(());
        }

        match timeout(grace, notified).await {
            Ok(()) => {
                debug!("Process group {:?} exited after SIGTERM", self.pid);
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Process group {:?} ignored SIGTERM for {:?}, killing",
                    self.pid, grace
                );
                self.force_kill();
                Ok(())
            }
        }
    }

    fn force_kill(&mut self) {
        self.signal_group(GroupSignal::Kill);
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) {
        let Some(pid) = self.pid else {
            return;
        };
        let sig = match signal {
            GroupSignal::Term => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        // Negative pid addresses the process group led by the child.
        let rc = unsafe { libc::kill(-(pid as i32), sig) };
        if rc != 0 {
            debug!(
                "kill(-{}, {}) failed: {}",
                pid,
                sig,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: GroupSignal) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            warn!("ChildProcess {:?} dropped while running, killing group", self.pid);
            self.force_kill();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

/// Owned handle to something producing a service's output: a spawned
/// process or a background task that feeds the pipeline.
pub enum StreamHandle {
    Process(ChildProcess),
    Task(AbortHandle),
}

impl StreamHandle {
    /// Release the handle, terminating the process tree or aborting the task
    pub async fn close(self) -> Result<()> {
        match self {
            StreamHandle::Process(mut process) => process.terminate(TERMINATE_GRACE).await,
            StreamHandle::Task(handle) => {
                handle.abort();
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamHandle::Process(p) => f.debug_tuple("Process").field(&p.id()).finish(),
            StreamHandle::Task(_) => f.write_str("Task"),
        }
    }
}

/// Captured output of a short-lived tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

/// Run a tool to completion with a timeout and capture its output
pub async fn run_tool(program: &str, args: &[&str], limit: Duration) -> Result<ToolOutput> {
    run_tool_with_env(program, args, &HashMap::new(), limit).await
}

/// [`run_tool`] with extra environment variables for the tool process
pub async fn run_tool_with_env(
    program: &str,
    args: &[&str],
    env: &HashMap<String, String>,
    limit: Duration,
) -> Result<ToolOutput> {
    debug!("Running: {} {}", program, args.join(" "));

    let output = timeout(
        limit,
        Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| Error::ProcessSpawn {
        reason: format!("{} {} timed out after {:?}", program, args.join(" "), limit),
    })?
    .map_err(|e| Error::ProcessSpawn {
        reason: format!("{}: {}", program, e),
    })?;

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        code: output.status.code(),
    })
}
