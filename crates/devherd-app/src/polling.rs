//! Background pollers
//!
//! Two interval tasks run while the supervisor is up:
//!
//! - Reconcile tick (every `reconcile_interval_ms`): bridge reachability,
//!   then daemon reconciliation
//! - Bridge log tick (every `bridge_log_interval_ms`): drain agent logs
//!
//! Both hold only a weak reference to the supervisor and stop on the shared
//! shutdown signal or once the supervisor is dropped.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use devherd_core::prelude::*;

use crate::config::PollingSettings;
use crate::supervisor::Supervisor;

/// How long cancellation waits for an in-flight tick before aborting it
const CANCEL_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct Pollers {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pollers {
    pub(crate) fn spawn(supervisor: Weak<Supervisor>, settings: PollingSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reconcile = spawn_loop(
            "reconcile",
            Weak::clone(&supervisor),
            settings.reconcile_interval(),
            shutdown_rx.clone(),
            |s| async move { s.reconcile_once().await },
        );
        let bridge_logs = spawn_loop(
            "bridge-logs",
            supervisor,
            settings.bridge_log_interval(),
            shutdown_rx,
            |s| async move {
                s.drain_bridge_logs().await;
            },
        );

        Self {
            shutdown_tx,
            tasks: vec![reconcile, bridge_logs],
        }
    }

    /// Signal shutdown and wait for both loops to exit
    pub(crate) async fn cancel(self) {
        let _ = self.shutdown_tx.send(true);
        for mut task in self.tasks {
            if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    supervisor: Weak<Supervisor>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Supervisor>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(supervisor) = supervisor.upgrade() else {
                        break;
                    };
                    tick(supervisor).await;
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} poller stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_topology;
    use crate::supervisor::{SupervisorDeps, AGENT_LOG_ID};
    use devherd_daemon::test_utils::{
        FakeBridge, FakeContainerRuntime, FakeProcessDaemon, StaticBridgeLocator,
    };
    use std::path::Path;

    const TOPOLOGY: &str = r#"
[[services]]
id = "pos"
backend = "daemon_managed"
target = "native_mobile_build"

[services.device]
model = "Pixel_Tablet"

[services.native]
flavor = "pos"
build_command = "true"
artifact = "app.apk"
staging_dir = "/tmp/devherd-staging"
bridge_staging_dir = 'C:\builds'
package = "tools.sous.pos"
activity = ".MainActivity"

[polling]
reconcile_interval_ms = 1000
bridge_log_interval_ms = 500
"#;

    fn supervisor(bridge: Arc<FakeBridge>) -> Arc<Supervisor> {
        let topology = parse_topology(TOPOLOGY, Path::new("/tmp")).unwrap();
        Arc::new(Supervisor::new(
            topology,
            SupervisorDeps {
                daemon: Arc::new(FakeProcessDaemon::new()),
                containers: Arc::new(FakeContainerRuntime::new()),
                locator: Arc::new(StaticBridgeLocator::new(bridge)),
                secrets: None,
            },
        ))
    }

    fn agent_lines(supervisor: &Supervisor) -> Vec<String> {
        supervisor
            .combined_logs()
            .into_iter()
            .filter(|e| e.service_id == AGENT_LOG_ID)
            .map(|e| e.message)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_logs_are_drained_periodically() {
        let bridge = Arc::new(FakeBridge::new());
        let supervisor = supervisor(Arc::clone(&bridge));

        bridge.push_log("agent started", "info");
        supervisor.start_polling();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent_lines(&supervisor), vec!["agent started"]);

        bridge.push_log("adb server restarted", "warn");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            agent_lines(&supervisor),
            vec!["agent started", "adb server restarted"]
        );

        supervisor.stop_polling().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_polling_halts_ticks() {
        let bridge = Arc::new(FakeBridge::new());
        let supervisor = supervisor(Arc::clone(&bridge));

        supervisor.start_polling();
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop_polling().await;

        bridge.push_log("late line", "info");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(agent_lines(&supervisor).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pollers_exit_when_supervisor_dropped() {
        let bridge = Arc::new(FakeBridge::new());
        let supervisor = supervisor(bridge);
        let pollers = Pollers::spawn(Arc::downgrade(&supervisor), supervisor_settings());
        drop(supervisor);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pollers.tasks.iter().all(JoinHandle::is_finished));
    }

    fn supervisor_settings() -> PollingSettings {
        parse_topology(TOPOLOGY, Path::new("/tmp")).unwrap().polling
    }
}
