//! Persistent process-supervision daemon (pm2)
//!
//! Daemon-managed services are started, stopped and listed by logical name
//! through the `pm2` CLI. Processes outlive the supervisor; the supervisor
//! only follows their logs and reconciles their status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::ProcessEvent;

use crate::process::{run_tool, run_tool_with_env, ChildProcess, StreamHandle};

/// Timeout for a single pm2 control command
const PM2_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// An app definition handed to the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonApp {
    /// Logical process name inside the daemon
    pub name: String,
    /// Shell command run by the daemon
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Fully derived environment for the app
    pub env: HashMap<String, String>,
}

/// Status of one process as reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonProcessInfo {
    pub name: String,
    pub online: bool,
    pub pid: Option<u32>,
}

/// Control surface of the persistent process-supervision daemon
#[async_trait]
pub trait ProcessDaemon: Send + Sync {
    /// Start the app, or restart it with the new environment if it already exists
    async fn start(&self, app: &DaemonApp) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn restart(&self, name: &str) -> Result<()>;

    /// Every process the daemon knows about
    async fn list(&self) -> Result<Vec<DaemonProcessInfo>>;

    /// Attach to the live log feed of `name`
    fn follow_logs(&self, name: &str, tx: mpsc::Sender<ProcessEvent>) -> Result<StreamHandle>;
}

/// [`ProcessDaemon`] backed by the `pm2` CLI
#[derive(Debug, Clone)]
pub struct Pm2Cli {
    program: String,
}

impl Default for Pm2Cli {
    fn default() -> Self {
        Self::new("pm2")
    }
}

impl Pm2Cli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = run_tool(&self.program, args, PM2_COMMAND_TIMEOUT)
            .await
            .map_err(|e| Error::daemon(e.to_string()))?;
        Self::check(args, output)
    }

    fn check(args: &[&str], output: crate::process::ToolOutput) -> Result<String> {
        if output.success {
            Ok(output.stdout)
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            Err(Error::daemon(format!(
                "pm2 {} exited with {:?}: {}",
                args.first().copied().unwrap_or_default(),
                output.code,
                detail
            )))
        }
    }
}

#[async_trait]
impl ProcessDaemon for Pm2Cli {
    async fn start(&self, app: &DaemonApp) -> Result<()> {
        let exists = self.list().await?.iter().any(|p| p.name == app.name);

        // pm2 snapshots the CLI's environment on start and on --update-env.
        let output = if exists {
            info!("pm2 restart {} --update-env", app.name);
            let args = ["restart", app.name.as_str(), "--update-env"];
            let out = run_tool_with_env(&self.program, &args, &app.env, PM2_COMMAND_TIMEOUT)
                .await
                .map_err(|e| Error::daemon(e.to_string()))?;
            Self::check(&args, out)
        } else {
            info!("pm2 start {}", app.name);
            let cwd = app
                .cwd
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| ".".to_string());
            let args = [
                "start",
                "bash",
                "--name",
                app.name.as_str(),
                "--cwd",
                cwd.as_str(),
                "--",
                "-c",
                app.command.as_str(),
            ];
            let out = run_tool_with_env(&self.program, &args, &app.env, PM2_COMMAND_TIMEOUT)
                .await
                .map_err(|e| Error::daemon(e.to_string()))?;
            Self::check(&args, out)
        };

        output.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        info!("pm2 stop {}", name);
        self.run(&["stop", name]).await.map(|_| ())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        info!("pm2 restart {}", name);
        self.run(&["restart", name]).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<DaemonProcessInfo>> {
        let stdout = self.run(&["jlist"]).await?;
        parse_jlist(&stdout)
    }

    fn follow_logs(&self, name: &str, tx: mpsc::Sender<ProcessEvent>) -> Result<StreamHandle> {
        let args = vec![
            "logs".to_string(),
            name.to_string(),
            "--raw".to_string(),
            "--lines".to_string(),
            "0".to_string(),
        ];
        let process = ChildProcess::spawn_program(&self.program, &args, tx)?;
        Ok(StreamHandle::Process(process))
    }
}

#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
}

#[derive(Debug, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: String,
}

/// Parse `pm2 jlist` output.
///
/// pm2 sometimes prints update notices before the JSON array, so parsing
/// starts at the first `[`.
pub fn parse_jlist(output: &str) -> Result<Vec<DaemonProcessInfo>> {
    let Some(start) = output.find('[') else {
        if output.trim().is_empty() {
            return Ok(Vec::new());
        }
        return Err(Error::daemon("pm2 jlist returned no JSON array"));
    };

    let entries: Vec<JlistEntry> = serde_json::from_str(output[start..].trim())?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let online = e
                .pm2_env
                .as_ref()
                .map(|env| env.status == "online")
                .unwrap_or(false);
            DaemonProcessInfo {
                name: e.name,
                online,
                pid: e.pid.filter(|pid| *pid != 0),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jlist() {
        let output = r#"[
            {"pid":4242,"name":"api","pm2_env":{"status":"online","pm_uptime":1700000000000}},
            {"pid":0,"name":"web","pm2_env":{"status":"stopped"}},
            {"name":"docs","pm2_env":{"status":"errored"}}
        ]"#;
        let list = parse_jlist(output).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(
            list[0],
            DaemonProcessInfo {
                name: "api".into(),
                online: true,
                pid: Some(4242)
            }
        );
        assert!(!list[1].online);
        assert_eq!(list[1].pid, None);
        assert!(!list[2].online);
    }

    #[test]
    fn test_parse_jlist_skips_preamble() {
        let output = ">>>> In-memory PM2 is out-of-date, do:\n>>>> $ pm2 update\n[{\"name\":\"api\",\"pm2_env\":{\"status\":\"online\"}}]";
        let list = parse_jlist(output).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].online);
    }

    #[test]
    fn test_parse_jlist_empty() {
        assert!(parse_jlist("").unwrap().is_empty());
        assert!(parse_jlist("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_jlist_garbage() {
        tokio_test::assert_err!(parse_jlist("daemon not running"));
        tokio_test::assert_err!(parse_jlist("[not json"));
    }

    #[tokio::test]
    async fn test_missing_pm2_binary_is_daemon_error() {
        let pm2 = Pm2Cli::new("devherd-no-such-pm2");
        let err = pm2.list().await.unwrap_err();
        assert!(matches!(err, Error::Daemon { .. }));
        assert!(err.is_recoverable());
    }
}
