//! Headless mode runner - supervisor event loop without a UI
//!
//! Brings up the core set, starts the pollers, then forwards supervisor
//! events to stdout while executing stdin commands until `quit`, Ctrl-C or
//! SIGTERM.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use devherd_app::config::load_topology;
use devherd_app::signals::spawn_signal_handler;
use devherd_app::{ClearTarget, Supervisor, SupervisorDeps, SupervisorEvent};
use devherd_core::prelude::*;

use super::HeadlessEvent;

/// A parsed stdin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessCommand {
    Start(String),
    Stop(String),
    Restart(String),
    Clear(ClearTarget),
    List,
    /// Dump a service's buffer, or the combined one
    Logs(Option<String>),
    Quit,
}

impl HeadlessCommand {
    /// Parse one stdin line. Blank lines are `Ok(None)`.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(None);
        };
        let arg = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(format!("too many arguments: {}", line.trim()));
        }

        let need_id = |arg: Option<String>| {
            arg.ok_or_else(|| format!("`{}` needs a service id", verb))
        };
        let command = match verb.to_ascii_lowercase().as_str() {
            "start" => Self::Start(need_id(arg)?),
            "stop" => Self::Stop(need_id(arg)?),
            "restart" => Self::Restart(need_id(arg)?),
            "clear" => Self::Clear(ClearTarget::parse(arg.as_deref())),
            "list" => Self::List,
            "logs" => Self::Logs(arg),
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command: {}", other)),
        };
        Ok(Some(command))
    }
}

/// Run in headless mode against the topology at `config_path`
pub async fn run_headless(config_path: &Path) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("devherd starting in HEADLESS mode");
    info!("Topology: {}", config_path.display());
    info!("═══════════════════════════════════════════════════════");

    let topology = match load_topology(config_path) {
        Ok(topology) => topology,
        Err(e) => {
            HeadlessEvent::error(None, e.to_string(), true).emit();
            return Err(e);
        }
    };
    let deps = SupervisorDeps::from_topology(&topology);
    let supervisor = Arc::new(Supervisor::new(topology, deps));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let (line_tx, line_rx) = mpsc::channel::<String>(64);
    std::thread::spawn(move || {
        spawn_stdin_reader_blocking(line_tx);
    });

    run_supervisor(supervisor, line_rx, shutdown_rx).await;

    info!("devherd headless mode exiting");
    Ok(())
}

/// Drive `supervisor` until quit; always ends with its shutdown
pub async fn run_supervisor(
    supervisor: Arc<Supervisor>,
    mut lines: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut events = supervisor.subscribe();

    // Bring-up runs alongside the loop so its events stream as they happen.
    let bring_up = Arc::clone(&supervisor);
    let bring_up = tokio::spawn(async move {
        if let Err(e) = bring_up.auto_start_core().await {
            warn!("Core bring-up incomplete: {}", e);
        }
        bring_up.start_polling();
    });

    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => HeadlessEvent::from(event).emit(),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Headless output lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            line = lines.recv(), if stdin_open => match line {
                Some(line) => match HeadlessCommand::parse(&line) {
                    Ok(Some(HeadlessCommand::Quit)) => {
                        info!("Quit requested");
                        break;
                    }
                    Ok(Some(command)) => dispatch(&supervisor, command),
                    Ok(None) => {}
                    Err(message) => HeadlessEvent::error(None, message, false).emit(),
                },
                None => {
                    info!("stdin closed, waiting for a signal");
                    stdin_open = false;
                }
            },

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    bring_up.abort();
    supervisor.shutdown().await;
    flush_events(&mut events);
}

/// Run one command in the background; lifecycle calls may take a while
fn dispatch(supervisor: &Arc<Supervisor>, command: HeadlessCommand) {
    let supervisor = Arc::clone(supervisor);
    tokio::spawn(async move {
        if let Err(e) = execute(&supervisor, command).await {
            HeadlessEvent::error(None, e.to_string(), false).emit();
        }
    });
}

async fn execute(supervisor: &Supervisor, command: HeadlessCommand) -> Result<()> {
    match command {
        HeadlessCommand::Start(id) => supervisor.start(&id).await,
        HeadlessCommand::Stop(id) => supervisor.stop(&id).await,
        HeadlessCommand::Restart(id) => supervisor.restart(&id).await,
        HeadlessCommand::Clear(target) => supervisor.clear_logs(&target),
        HeadlessCommand::List => {
            HeadlessEvent::service_list(supervisor.list()).emit();
            Ok(())
        }
        HeadlessCommand::Logs(id) => {
            let entries = match id {
                Some(id) => supervisor.service_logs(&id)?,
                None => supervisor.combined_logs(),
            };
            for entry in &entries {
                HeadlessEvent::log(entry).emit();
            }
            Ok(())
        }
        HeadlessCommand::Quit => Ok(()),
    }
}

/// Emit what is still queued, up to and including `Shutdown`
fn flush_events(events: &mut broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.try_recv() {
            Ok(SupervisorEvent::Shutdown) => {
                HeadlessEvent::from(SupervisorEvent::Shutdown).emit();
                break;
            }
            Ok(event) => HeadlessEvent::from(event).emit(),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Read stdin lines on a blocking thread
fn spawn_stdin_reader_blocking(tx: mpsc::Sender<String>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Error reading stdin: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devherd_app::config::parse_topology;
    use devherd_daemon::test_utils::{
        FakeBridge, FakeContainerRuntime, FakeProcessDaemon, StaticBridgeLocator,
    };
    use std::time::Duration;

    const TOPOLOGY: &str = r#"
[[services]]
id = "api"
backend = "daemon_managed"
target = "api_service"
command = "pnpm start:dev"
auto_start = true

[[services]]
id = "cache"
backend = "container"
target = "infrastructure"
"#;

    #[test]
    fn test_parse_lifecycle_commands() {
        assert_eq!(
            HeadlessCommand::parse("start api"),
            Ok(Some(HeadlessCommand::Start("api".into())))
        );
        assert_eq!(
            HeadlessCommand::parse("  stop   web "),
            Ok(Some(HeadlessCommand::Stop("web".into())))
        );
        assert_eq!(
            HeadlessCommand::parse("RESTART pos"),
            Ok(Some(HeadlessCommand::Restart("pos".into())))
        );
    }

    #[test]
    fn test_parse_clear_targets() {
        assert_eq!(
            HeadlessCommand::parse("clear"),
            Ok(Some(HeadlessCommand::Clear(ClearTarget::Combined)))
        );
        assert_eq!(
            HeadlessCommand::parse("clear combined"),
            Ok(Some(HeadlessCommand::Clear(ClearTarget::Combined)))
        );
        assert_eq!(
            HeadlessCommand::parse("clear api"),
            Ok(Some(HeadlessCommand::Clear(ClearTarget::Service(
                "api".into()
            ))))
        );
    }

    #[test]
    fn test_parse_reads_and_quit() {
        assert_eq!(HeadlessCommand::parse("list"), Ok(Some(HeadlessCommand::List)));
        assert_eq!(
            HeadlessCommand::parse("logs"),
            Ok(Some(HeadlessCommand::Logs(None)))
        );
        assert_eq!(
            HeadlessCommand::parse("logs api"),
            Ok(Some(HeadlessCommand::Logs(Some("api".into()))))
        );
        assert_eq!(HeadlessCommand::parse("quit"), Ok(Some(HeadlessCommand::Quit)));
        assert_eq!(HeadlessCommand::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(HeadlessCommand::parse("start").is_err());
        assert!(HeadlessCommand::parse("launch api").is_err());
        assert!(HeadlessCommand::parse("stop api web").is_err());
    }

    #[tokio::test]
    async fn test_quit_during_bring_up_leaves_nothing_running() {
        let daemon = Arc::new(FakeProcessDaemon::new());
        let containers = Arc::new(FakeContainerRuntime::new());
        let topology = parse_topology(TOPOLOGY, Path::new("/tmp")).unwrap();
        let supervisor = Arc::new(Supervisor::new(
            topology,
            SupervisorDeps {
                daemon: daemon.clone(),
                containers: containers.clone(),
                locator: Arc::new(StaticBridgeLocator::new(Arc::new(FakeBridge::new()))),
                secrets: None,
            },
        ));

        let (line_tx, line_rx) = mpsc::channel(4);
        line_tx.send("quit".to_string()).await.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        run_supervisor(Arc::clone(&supervisor), line_rx, shutdown_rx).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(supervisor.is_shut_down());
        assert!(!supervisor.is_polling());
        assert!(daemon.started().is_empty());
        assert!(supervisor
            .list()
            .iter()
            .all(|s| s.status == devherd_core::ServiceStatus::Stopped));
    }
}
