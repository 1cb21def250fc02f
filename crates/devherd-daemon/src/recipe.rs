//! Native mobile build recipe
//!
//! A `native_mobile_build` service is brought up by resolving its emulator
//! through the bridge and then running five stages in order:
//!
//! | stage     | where        | what                                             |
//! |-----------|--------------|--------------------------------------------------|
//! | `sync`    | local        | sync native project assets                       |
//! | `build`   | local        | build the flavor                                 |
//! | `stage`   | local fs     | copy the artifact where the bridge host can read |
//! | `install` | bridge (adb) | `install -r` onto the resolved serial            |
//! | `launch`  | bridge (adb) | `am start -n package/activity`                   |
//!
//! The first failing stage aborts the rest with [`Error::RecipeStep`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use devherd_core::prelude::*;
use devherd_core::{DeviceBinding, ProcessEvent};

use crate::bridge::{BridgeApi, BridgeLocator};
use crate::devices::DeviceResolver;
use crate::process::{ChildProcess, CommandSpec};

/// Recipe stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeStage {
    Sync,
    Build,
    Stage,
    Install,
    Launch,
}

impl RecipeStage {
    pub const ALL: [RecipeStage; 5] = [
        RecipeStage::Sync,
        RecipeStage::Build,
        RecipeStage::Stage,
        RecipeStage::Install,
        RecipeStage::Launch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RecipeStage::Sync => "sync",
            RecipeStage::Build => "build",
            RecipeStage::Stage => "stage",
            RecipeStage::Install => "install",
            RecipeStage::Launch => "launch",
        }
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::recipe_step(self.name(), message)
    }
}

impl fmt::Display for RecipeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress reported while a recipe runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeEvent {
    /// Informational line (device resolution, stage results)
    Progress(String),
    /// The target device is known
    DeviceResolved(String),
    StageStarted(RecipeStage),
    /// Output of a local stage (`Stdout`/`Stderr` only)
    Output(ProcessEvent),
}

/// Parameters of a native build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeRecipe {
    /// Product flavor, exported as `FLAVOR`
    pub flavor: String,
    pub project_dir: PathBuf,
    pub sync_command: Option<String>,
    pub build_command: String,
    /// Built artifact, relative to `project_dir` unless absolute
    pub artifact: PathBuf,
    /// Local directory the bridge host can read
    pub staging_dir: PathBuf,
    /// The same directory as seen from the bridge host
    pub bridge_staging_dir: String,
    pub package: String,
    pub activity: String,
}

impl NativeRecipe {
    /// Resolve the device, then run every stage.
    ///
    /// Returns the serial the app was launched on.
    pub async fn run(
        &self,
        locator: &dyn BridgeLocator,
        device: &DeviceBinding,
        env: &HashMap<String, String>,
        events: mpsc::Sender<RecipeEvent>,
    ) -> Result<String> {
        let bridge = locator.locate().await.ok_or_else(|| {
            let address = locator
                .session()
                .map(|s| s.host_address)
                .unwrap_or_else(|| "default gateway".to_string());
            Error::bridge_unreachable(address, "bridge agent not reachable")
        })?;
        self.run_with_bridge(bridge, device, env, events).await
    }

    pub async fn run_with_bridge(
        &self,
        bridge: Arc<dyn BridgeApi>,
        device: &DeviceBinding,
        env: &HashMap<String, String>,
        events: mpsc::Sender<RecipeEvent>,
    ) -> Result<String> {
        let _ = events
            .send(RecipeEvent::Progress(format!(
                "Resolving device '{}' via bridge {}",
                device.emulator_model_tag,
                bridge.address()
            )))
            .await;

        let resolver = DeviceResolver::new(Arc::clone(&bridge));
        let progress_tx = events.clone();
        let progress = move |line: String| {
            let _ = progress_tx.try_send(RecipeEvent::Progress(line));
        };
        let serial = resolver.ensure_device_ready(device, &progress).await?;
        let _ = events
            .send(RecipeEvent::DeviceResolved(serial.clone()))
            .await;

        let mut stage_env = env.clone();
        stage_env.insert("FLAVOR".to_string(), self.flavor.clone());
        stage_env.insert("ANDROID_SERIAL".to_string(), serial.clone());

        let mut staged_path = String::new();
        for stage in RecipeStage::ALL {
            let _ = events.send(RecipeEvent::StageStarted(stage)).await;
            match stage {
                RecipeStage::Sync => match &self.sync_command {
                    Some(command) => {
                        self.run_local(stage, command, &stage_env, &events).await?;
                    }
                    None => {
                        let _ = events
                            .send(RecipeEvent::Progress("No sync command, skipping".into()))
                            .await;
                    }
                },
                RecipeStage::Build => {
                    self.run_local(stage, &self.build_command, &stage_env, &events)
                        .await?;
                }
                RecipeStage::Stage => {
                    staged_path = self.stage_artifact().await?;
                    let _ = events
                        .send(RecipeEvent::Progress(format!("Staged {}", staged_path)))
                        .await;
                }
                RecipeStage::Install => {
                    let args = format!("-s {} install -r \"{}\"", serial, staged_path);
                    let out = bridge
                        .adb(&args)
                        .await
                        .map_err(|e| stage.fail(e.to_string()))?;
                    if let Some(line) = failure_line(&out.stdout, "Failure") {
                        return Err(stage.fail(line));
                    }
                }
                RecipeStage::Launch => {
                    let args = format!(
                        "-s {} shell am start -n {}/{}",
                        serial, self.package, self.activity
                    );
                    let out = bridge
                        .adb(&args)
                        .await
                        .map_err(|e| stage.fail(e.to_string()))?;
                    if let Some(line) = failure_line(&out.stdout, "Error") {
                        return Err(stage.fail(line));
                    }
                }
            }
        }

        Ok(serial)
    }

    /// Run a local shell stage, forwarding its output and failing on non-zero exit
    async fn run_local(
        &self,
        stage: RecipeStage,
        command: &str,
        env: &HashMap<String, String>,
        events: &mpsc::Sender<RecipeEvent>,
    ) -> Result<()> {
        let spec = CommandSpec::new(command)
            .with_cwd(&self.project_dir)
            .with_env(env.clone());
        let (tx, mut rx) = mpsc::channel(256);
        // Dropping the process (recipe aborted) kills its group.
        let _process = ChildProcess::spawn_shell(&spec, tx).map_err(|e| stage.fail(e.to_string()))?;

        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Exited { code: Some(0) } => return Ok(()),
                ProcessEvent::Exited { code } => {
                    return Err(stage.fail(match code {
                        Some(c) => format!("`{}` exited with code {}", command, c),
                        None => format!("`{}` was terminated by a signal", command),
                    }));
                }
                output => {
                    let _ = events.send(RecipeEvent::Output(output)).await;
                }
            }
        }

        Err(stage.fail("process output closed without an exit status"))
    }

    /// Copy the artifact into the staging dir; returns the bridge-side path
    async fn stage_artifact(&self) -> Result<String> {
        let stage = RecipeStage::Stage;
        let source = self.artifact_path();
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| stage.fail(format!("artifact {} has no file name", source.display())))?;

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| stage.fail(format!("{}: {}", self.staging_dir.display(), e)))?;
        let dest = self.staging_dir.join(&file_name);
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| stage.fail(format!("copy {}: {}", source.display(), e)))?;

        Ok(bridge_path(&self.bridge_staging_dir, &file_name))
    }

    /// Local path of the built artifact
    pub fn artifact_path(&self) -> PathBuf {
        if self.artifact.is_absolute() {
            self.artifact.clone()
        } else {
            self.project_dir.join(&self.artifact)
        }
    }

    /// Best-effort stop of the app on `serial`
    pub async fn force_stop(&self, bridge: &dyn BridgeApi, serial: &str) -> Result<()> {
        let args = format!("-s {} shell am force-stop {}", serial, self.package);
        bridge.adb(&args).await.map(|_| ())
    }
}

/// Join a file name onto a bridge-side directory using that side's separator
pub fn bridge_path(dir: &str, file_name: &str) -> String {
    let sep = if dir.contains('\\') { '\\' } else { '/' };
    let trimmed = dir.trim_end_matches(['\\', '/']);
    if trimmed.is_empty() {
        return format!("{}{}", sep, file_name);
    }
    format!("{}{}{}", trimmed, sep, file_name)
}

/// First output line containing `marker` (adb reports some failures on stdout
/// with a zero exit status)
fn failure_line(stdout: &str, marker: &str) -> Option<String> {
    stdout
        .lines()
        .map(|l| l.trim())
        .find(|l| l.contains(marker))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{BridgeCall, FakeBridge};
    use std::path::Path;

    fn recipe(dir: &Path) -> NativeRecipe {
        std::fs::create_dir_all(dir.join("build")).unwrap();
        std::fs::write(dir.join("build/app-pos-debug.apk"), b"apk").unwrap();
        NativeRecipe {
            flavor: "pos".into(),
            project_dir: dir.to_path_buf(),
            sync_command: Some("echo synced $FLAVOR".into()),
            build_command: "echo built for $ANDROID_SERIAL".into(),
            artifact: PathBuf::from("build/app-pos-debug.apk"),
            staging_dir: dir.join("staging"),
            bridge_staging_dir: "C:\\builds".into(),
            package: "tools.sous.pos".into(),
            activity: ".MainActivity".into(),
        }
    }

    fn binding() -> DeviceBinding {
        DeviceBinding {
            emulator_model_tag: "Pixel_Tablet".into(),
            avd: "Pixel_Tablet".into(),
            bridge_port: 5556,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<RecipeEvent>) -> Vec<RecipeEvent> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_bridge_path_separators() {
        assert_eq!(bridge_path("C:\\builds\\", "a.apk"), "C:\\builds\\a.apk");
        assert_eq!(bridge_path("/mnt/shared", "a.apk"), "/mnt/shared/a.apk");
    }

    #[test]
    fn test_stage_names_in_order() {
        let names: Vec<_> = RecipeStage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["sync", "build", "stage", "install", "launch"]);
    }

    #[tokio::test]
    async fn test_full_recipe_runs_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FakeBridge::new().with_device(
            "emulator-5556",
            "Pixel_Tablet",
            "Pixel Tablet",
        ));
        let (tx, rx) = mpsc::channel(64);

        let serial = recipe(dir.path())
            .run_with_bridge(bridge.clone(), &binding(), &HashMap::new(), tx)
            .await
            .unwrap();
        assert_eq!(serial, "emulator-5556");

        let events = collect(rx).await;
        assert!(events.contains(&RecipeEvent::Output(ProcessEvent::Stdout(
            "synced pos".into()
        ))));
        assert!(events.contains(&RecipeEvent::Output(ProcessEvent::Stdout(
            "built for emulator-5556".into()
        ))));
        assert!(dir.path().join("staging/app-pos-debug.apk").exists());

        let adb = bridge.adb_calls();
        assert!(adb.contains(&"-s emulator-5556 install -r \"C:\\builds\\app-pos-debug.apk\"".to_string()));
        assert!(adb.contains(&"-s emulator-5556 shell am start -n tools.sous.pos/.MainActivity".to_string()));
    }

    #[tokio::test]
    async fn test_install_failure_skips_launch() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(
            FakeBridge::new()
                .with_device("emulator-5556", "Pixel_Tablet", "Pixel Tablet")
                .fail_when("install -r", "INSTALL_FAILED_VERSION_DOWNGRADE"),
        );
        let (tx, _rx) = mpsc::channel(64);

        let err = recipe(dir.path())
            .run_with_bridge(bridge.clone(), &binding(), &HashMap::new(), tx)
            .await
            .unwrap_err();

        match err {
            Error::RecipeStep { stage, message } => {
                assert_eq!(stage, "install");
                assert!(message.contains("INSTALL_FAILED_VERSION_DOWNGRADE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!bridge.adb_calls().iter().any(|c| c.contains("am start")));
    }

    #[tokio::test]
    async fn test_install_failure_reported_on_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(
            FakeBridge::new()
                .with_device("emulator-5556", "Pixel_Tablet", "Pixel Tablet")
                .respond_when("install -r", "Performing Streamed Install\r\nFailure [INSTALL_FAILED_NO_MATCHING_ABIS]\r\n"),
        );
        let (tx, _rx) = mpsc::channel(64);

        let err = recipe(dir.path())
            .run_with_bridge(bridge, &binding(), &HashMap::new(), tx)
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::RecipeStep { ref stage, ref message } if stage == "install" && message.contains("NO_MATCHING_ABIS"))
        );
    }

    #[tokio::test]
    async fn test_build_failure_stops_before_bridge_install() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FakeBridge::new().with_device(
            "emulator-5556",
            "Pixel_Tablet",
            "Pixel Tablet",
        ));
        let mut r = recipe(dir.path());
        r.build_command = "echo 'BUILD FAILED' 1>&2; exit 1".into();
        let (tx, rx) = mpsc::channel(64);

        let err = r
            .run_with_bridge(bridge.clone(), &binding(), &HashMap::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecipeStep { ref stage, .. } if stage == "build"));
        assert!(!bridge.adb_calls().iter().any(|c| c.contains("install")));

        let events = collect(rx).await;
        assert!(events.contains(&RecipeEvent::Output(ProcessEvent::Stderr(
            "BUILD FAILED".into()
        ))));
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FakeBridge::new().with_device(
            "emulator-5556",
            "Pixel_Tablet",
            "Pixel Tablet",
        ));
        let mut r = recipe(dir.path());
        r.artifact = PathBuf::from("build/missing.apk");
        let (tx, _rx) = mpsc::channel(64);

        let err = r
            .run_with_bridge(bridge, &binding(), &HashMap::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecipeStep { ref stage, .. } if stage == "stage"));
    }

    #[tokio::test]
    async fn test_unreachable_bridge_fails_before_any_stage() {
        let dir = tempfile::tempdir().unwrap();
        let locator = crate::test_utils::StaticBridgeLocator::absent();
        let (tx, rx) = mpsc::channel(64);

        let err = recipe(dir.path())
            .run(&locator, &binding(), &HashMap::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BridgeUnreachable { .. }));
        assert!(!collect(rx)
            .await
            .iter()
            .any(|e| matches!(e, RecipeEvent::StageStarted(_))));
    }

    #[tokio::test]
    async fn test_force_stop() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = FakeBridge::new();
        recipe(dir.path())
            .force_stop(&bridge, "emulator-5556")
            .await
            .unwrap();
        assert_eq!(
            bridge.calls().last(),
            Some(&BridgeCall::Adb(
                "-s emulator-5556 shell am force-stop tools.sous.pos".into()
            ))
        );
    }
}
