//! Container runtime (docker CLI)

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::ProcessEvent;

use crate::process::{run_tool, ChildProcess, StreamHandle};

/// `docker info` is lightweight; a slow answer means the daemon is wedged
const DAEMON_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Compose bring-up may pull images
const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines of history replayed when a follower attaches
const FOLLOW_TAIL_LINES: &str = "50";

/// Declared infrastructure to bring up in bulk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeSpec {
    pub file: Option<PathBuf>,
    pub project_name: Option<String>,
    /// Compose service names; empty means all
    pub services: Vec<String>,
}

impl ComposeSpec {
    /// Arguments for `docker compose ... up -d`
    pub fn up_args(&self) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if let Some(file) = &self.file {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        if let Some(project) = &self.project_name {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        args.push("up".to_string());
        args.push("-d".to_string());
        args.extend(self.services.iter().cloned());
        args
    }
}

/// Control surface of the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime daemon answers
    async fn is_daemon_up(&self) -> bool;

    /// Bring up declared infrastructure (detached)
    async fn compose_up(&self, spec: &ComposeSpec) -> Result<()>;

    /// Follow stdout/stderr of a named container
    fn follow_logs(&self, container: &str, tx: mpsc::Sender<ProcessEvent>)
        -> Result<StreamHandle>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn is_daemon_up(&self) -> bool {
        match run_tool(
            &self.program,
            &["info", "--format", "{{.ServerVersion}}"],
            DAEMON_CHECK_TIMEOUT,
        )
        .await
        {
            Ok(out) => {
                if !out.success {
                    debug!("docker info failed: {}", out.stderr.trim());
                }
                out.success
            }
            Err(e) => {
                debug!("docker info could not run: {}", e);
                false
            }
        }
    }

    async fn compose_up(&self, spec: &ComposeSpec) -> Result<()> {
        let args = spec.up_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        info!("docker {}", args.join(" "));

        let out = run_tool(&self.program, &arg_refs, COMPOSE_UP_TIMEOUT)
            .await
            .map_err(|e| Error::container(e.to_string()))?;
        if out.success {
            Ok(())
        } else {
            Err(Error::container(format!(
                "docker compose up exited with {:?}: {}",
                out.code,
                out.stderr.trim()
            )))
        }
    }

    fn follow_logs(
        &self,
        container: &str,
        tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<StreamHandle> {
        let args = vec![
            "logs".to_string(),
            "-f".to_string(),
            "--tail".to_string(),
            FOLLOW_TAIL_LINES.to_string(),
            container.to_string(),
        ];
        let process = ChildProcess::spawn_program(&self.program, &args, tx)
            .map_err(|e| Error::container(e.to_string()))?;
        Ok(StreamHandle::Process(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_up_args_full() {
        let spec = ComposeSpec {
            file: Some(PathBuf::from("infra/docker-compose.yml")),
            project_name: Some("sous".into()),
            services: vec!["postgres".into(), "redis".into()],
        };
        assert_eq!(
            spec.up_args(),
            vec![
                "compose",
                "-f",
                "infra/docker-compose.yml",
                "-p",
                "sous",
                "up",
                "-d",
                "postgres",
                "redis"
            ]
        );
    }

    #[test]
    fn test_compose_up_args_defaults() {
        assert_eq!(
            ComposeSpec::default().up_args(),
            vec!["compose", "up", "-d"]
        );
    }

    #[tokio::test]
    async fn test_missing_docker_is_not_up() {
        let docker = DockerCli::new("devherd-no-such-docker");
        assert!(!docker.is_daemon_up().await);
    }

    #[tokio::test]
    async fn test_follow_logs_missing_binary_is_container_error() {
        let docker = DockerCli::new("devherd-no-such-docker");
        let (tx, _rx) = mpsc::channel(4);
        let err = docker.follow_logs("cache", tx).unwrap_err();
        assert!(matches!(err, Error::Container { .. }));
    }
}
