//! Configuration types for devherd
//!
//! Defines:
//! - `TopologyFile` - Raw `devherd.toml` contents
//! - `ServiceConfig` and its `[services.device]` / `[services.native]` tables
//! - Settings tables (`[bridge]`, `[polling]`, `[secrets]`, `[tools]`, `[infrastructure]`)
//! - `ServiceDefinition` / `LaunchSpec` - Validated, typed form used at runtime

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devherd_core::{BackendKind, DeviceBinding, RuntimeTarget};
use devherd_daemon::{ComposeSpec, NativeRecipe, DEFAULT_BRIDGE_PORT};

/// Raw topology file (`devherd.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopologyFile {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub infrastructure: Option<InfrastructureConfig>,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub secrets: SecretsSettings,

    #[serde(default)]
    pub tools: ToolSettings,
}

/// One `[[services]]` entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub id: String,

    /// Human label (defaults to the id)
    #[serde(default)]
    pub display_name: Option<String>,

    pub backend: BackendKind,

    pub target: RuntimeTarget,

    /// Working directory, relative to the topology file
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Shell command for direct and daemon-managed services
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub auto_start: bool,

    /// Process name in the supervision daemon (defaults to the id)
    #[serde(default)]
    pub daemon_name: Option<String>,

    /// Container name to follow (defaults to the id)
    #[serde(default)]
    pub container: Option<String>,

    #[serde(default)]
    pub device: Option<DeviceConfig>,

    #[serde(default)]
    pub native: Option<NativeConfig>,
}

/// `[services.device]` - emulator binding of a native build
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Model tag matched against AVD names and device models
    pub model: String,

    /// AVD profile to launch (defaults to the model tag)
    #[serde(default)]
    pub avd: Option<String>,

    /// Preferred emulator console port
    #[serde(default = "default_emulator_port")]
    pub port: u16,
}

fn default_emulator_port() -> u16 {
    5554
}

impl DeviceConfig {
    pub fn to_binding(&self) -> DeviceBinding {
        DeviceBinding {
            emulator_model_tag: self.model.clone(),
            avd: self.avd.clone().unwrap_or_else(|| self.model.clone()),
            bridge_port: self.port,
        }
    }
}

/// `[services.native]` - build/install/launch parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NativeConfig {
    pub flavor: String,

    /// Native project root (defaults to the service `cwd`)
    #[serde(default)]
    pub project_dir: Option<PathBuf>,

    #[serde(default)]
    pub sync_command: Option<String>,

    pub build_command: String,

    /// Built artifact, relative to `project_dir`
    pub artifact: PathBuf,

    /// Local directory readable by the bridge host
    pub staging_dir: PathBuf,

    /// `staging_dir` as seen from the bridge host
    pub bridge_staging_dir: String,

    pub package: String,

    pub activity: String,
}

/// `[infrastructure]` - bulk container bring-up
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InfrastructureConfig {
    #[serde(default)]
    pub compose_file: Option<PathBuf>,

    #[serde(default)]
    pub project_name: Option<String>,

    /// Container service ids marked running by bring-up
    #[serde(default)]
    pub services: Vec<String>,
}

/// `[bridge]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeSettings {
    #[serde(default = "default_bridge_port")]
    pub port: u16,

    /// Fixed bridge host; skips default-gateway discovery
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            port: default_bridge_port(),
            host: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BridgeSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_bridge_port() -> u16 {
    DEFAULT_BRIDGE_PORT
}

fn default_request_timeout_ms() -> u64 {
    5000
}

/// `[polling]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollingSettings {
    /// Daemon reconciliation and bridge reachability interval
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Bridge log drain interval
    #[serde(default = "default_bridge_log_interval_ms")]
    pub bridge_log_interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
            bridge_log_interval_ms: default_bridge_log_interval_ms(),
        }
    }
}

impl PollingSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(100))
    }

    pub fn bridge_log_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_log_interval_ms.max(100))
    }
}

fn default_reconcile_interval_ms() -> u64 {
    5000
}

fn default_bridge_log_interval_ms() -> u64 {
    3000
}

/// `[secrets]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretsSettings {
    /// Command printing dotenv lines or a JSON object
    #[serde(default)]
    pub command: Option<String>,
}

/// `[tools]` - explicit CLI locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolSettings {
    #[serde(default = "default_pm2")]
    pub pm2: String,

    #[serde(default = "default_docker")]
    pub docker: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            pm2: default_pm2(),
            docker: default_docker(),
        }
    }
}

fn default_pm2() -> String {
    "pm2".to_string()
}

fn default_docker() -> String {
    "docker".to_string()
}

// ─────────────────────────────────────────────────────────────────
// Validated topology
// ─────────────────────────────────────────────────────────────────

/// How a service is launched, per runtime target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// Plain shell command (direct or daemon-managed)
    Command {
        command: String,
        cwd: Option<PathBuf>,
    },
    /// Native mobile build recipe onto a bridged emulator
    NativeBuild {
        device: DeviceBinding,
        recipe: NativeRecipe,
    },
    /// Follow a container's logs
    Container { container: String },
}

/// A validated service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub id: String,
    pub display_name: String,
    pub backend: BackendKind,
    pub target: RuntimeTarget,
    pub port: Option<u16>,
    pub auto_start: bool,
    pub env: HashMap<String, String>,
    /// Name in the supervision daemon
    pub daemon_name: String,
    pub launch: LaunchSpec,
}

impl ServiceDefinition {
    pub fn device(&self) -> Option<&DeviceBinding> {
        match &self.launch {
            LaunchSpec::NativeBuild { device, .. } => Some(device),
            _ => None,
        }
    }

    pub fn is_bridge_dependent(&self) -> bool {
        self.target == RuntimeTarget::NativeMobileBuild
    }
}

/// Bulk bring-up settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureSpec {
    pub compose: ComposeSpec,
    /// Service ids marked running after bring-up
    pub services: Vec<String>,
}

/// Validated topology
#[derive(Debug, Clone)]
pub struct Topology {
    pub services: Vec<ServiceDefinition>,
    pub infrastructure: Option<InfrastructureSpec>,
    pub bridge: BridgeSettings,
    pub polling: PollingSettings,
    pub secrets: SecretsSettings,
    pub tools: ToolSettings,
}

impl Topology {
    pub fn service(&self, id: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_binding_defaults_avd_to_model() {
        let device = DeviceConfig {
            model: "Pixel_Tablet".into(),
            avd: None,
            port: 5556,
        };
        let binding = device.to_binding();
        assert_eq!(binding.avd, "Pixel_Tablet");
        assert_eq!(binding.bridge_port, 5556);
    }

    #[test]
    fn test_settings_defaults() {
        let file: TopologyFile = toml::from_str("").unwrap();
        assert_eq!(file.bridge.port, 4040);
        assert_eq!(file.bridge.request_timeout(), Duration::from_secs(5));
        assert_eq!(file.polling.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(file.polling.bridge_log_interval(), Duration::from_secs(3));
        assert_eq!(file.tools.pm2, "pm2");
        assert!(file.secrets.command.is_none());
    }

    #[test]
    fn test_backend_and_target_names() {
        let svc: ServiceConfig = toml::from_str(
            r#"
id = "api"
backend = "daemon_managed"
target = "api_service"
command = "pnpm dev"
"#,
        )
        .unwrap();
        assert_eq!(svc.backend, BackendKind::DaemonManaged);
        assert_eq!(svc.target, RuntimeTarget::ApiService);
        assert!(!svc.auto_start);
    }
}
