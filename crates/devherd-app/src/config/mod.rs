//! Service topology loading for devherd
//!
//! The topology lives in `devherd.toml`. Relative paths inside it resolve
//! against the directory holding the file. Loading validates the whole file
//! up front; any violation is [`Error::ConfigInvalid`] and fatal at startup.

pub mod types;

pub use types::*;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use devherd_core::prelude::*;
use devherd_core::{BackendKind, RuntimeTarget};
use devherd_daemon::{ComposeSpec, NativeRecipe};

/// Default topology file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "devherd.toml";

/// Load and validate a topology file
pub fn load_topology(path: &Path) -> Result<Topology> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let topology = parse_topology(&content, &base_dir)?;
    debug!(
        "Loaded {} services from {}",
        topology.services.len(),
        path.display()
    );
    Ok(topology)
}

/// Parse and validate topology TOML; relative paths resolve against `base_dir`
pub fn parse_topology(content: &str, base_dir: &Path) -> Result<Topology> {
    let file: TopologyFile = toml::from_str(content)?;
    validate(file, base_dir)
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Check a raw topology and convert it into its typed form
pub fn validate(file: TopologyFile, base_dir: &Path) -> Result<Topology> {
    let mut seen = HashSet::new();
    let mut services = Vec::with_capacity(file.services.len());

    for svc in &file.services {
        let id = svc.id.trim();
        if id.is_empty() {
            return Err(Error::config_invalid("service id must not be empty"));
        }
        if !seen.insert(id.to_string()) {
            return Err(Error::config_invalid(format!("duplicate service id '{}'", id)));
        }
        services.push(definition(svc, base_dir)?);
    }

    let containers: Vec<String> = services
        .iter()
        .filter(|s| s.backend == BackendKind::Container)
        .map(|s| s.id.clone())
        .collect();

    // Without an explicit list, bring-up covers every container service.
    let infrastructure = match file.infrastructure {
        Some(infra) => {
            for id in &infra.services {
                match services.iter().find(|s| &s.id == id) {
                    Some(s) if s.backend == BackendKind::Container => {}
                    Some(_) => {
                        return Err(Error::config_invalid(format!(
                            "infrastructure service '{}' must use the container backend",
                            id
                        )))
                    }
                    None => {
                        return Err(Error::config_invalid(format!(
                            "infrastructure service '{}' is not configured",
                            id
                        )))
                    }
                }
            }
            let ids = if infra.services.is_empty() {
                containers
            } else {
                infra.services
            };
            Some(InfrastructureSpec {
                compose: ComposeSpec {
                    file: infra.compose_file.as_deref().map(|f| resolve(base_dir, f)),
                    project_name: infra.project_name,
                    services: Vec::new(),
                },
                services: ids,
            })
        }
        None if !containers.is_empty() => Some(InfrastructureSpec {
            compose: ComposeSpec::default(),
            services: containers,
        }),
        None => None,
    };

    Ok(Topology {
        services,
        infrastructure,
        bridge: file.bridge,
        polling: file.polling,
        secrets: file.secrets,
        tools: file.tools,
    })
}

fn definition(svc: &ServiceConfig, base_dir: &Path) -> Result<ServiceDefinition> {
    let id = svc.id.trim().to_string();
    let cwd = svc.cwd.as_deref().map(|p| resolve(base_dir, p));
    let is_native = svc.target == RuntimeTarget::NativeMobileBuild;

    if is_native != (svc.device.is_some() && svc.native.is_some()) {
        return Err(Error::config_invalid(if is_native {
            format!(
                "service '{}': native_mobile_build requires [services.device] and [services.native]",
                id
            )
        } else {
            format!(
                "service '{}': device/native tables are only valid for native_mobile_build",
                id
            )
        }));
    }

    let launch = match (svc.backend, &svc.device, &svc.native) {
        (backend, _, _) if is_native && backend != BackendKind::DaemonManaged => {
            return Err(Error::config_invalid(format!(
                "service '{}': native builds require the daemon_managed backend",
                id
            )))
        }
        (BackendKind::Container, _, _) => LaunchSpec::Container {
            container: svc.container.clone().unwrap_or_else(|| id.clone()),
        },
        (_, Some(device), Some(native)) => {
            let project_dir = native
                .project_dir
                .as_deref()
                .map(|p| resolve(base_dir, p))
                .or_else(|| cwd.clone())
                .unwrap_or_else(|| base_dir.to_path_buf());
            LaunchSpec::NativeBuild {
                device: device.to_binding(),
                recipe: NativeRecipe {
                    flavor: native.flavor.clone(),
                    project_dir,
                    sync_command: native.sync_command.clone(),
                    build_command: native.build_command.clone(),
                    artifact: native.artifact.clone(),
                    staging_dir: resolve(base_dir, &native.staging_dir),
                    bridge_staging_dir: native.bridge_staging_dir.clone(),
                    package: native.package.clone(),
                    activity: native.activity.clone(),
                },
            }
        }
        _ => match svc.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => LaunchSpec::Command {
                command: command.to_string(),
                cwd,
            },
            _ => {
                return Err(Error::config_invalid(format!(
                    "service '{}': `command` is required for {} services",
                    id, svc.backend
                )))
            }
        },
    };

    Ok(ServiceDefinition {
        display_name: svc
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.clone()),
        backend: svc.backend,
        target: svc.target,
        port: svc.port,
        auto_start: svc.auto_start,
        env: svc.env.clone(),
        daemon_name: svc.daemon_name.clone().unwrap_or_else(|| id.clone()),
        launch,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TOPOLOGY: &str = r#"
[[services]]
id = "web"
display_name = "Web"
backend = "direct_process"
target = "web_service"
cwd = "apps/web"
command = "pnpm dev"
port = 3000

[[services]]
id = "api"
backend = "daemon_managed"
target = "api_service"
command = "pnpm start:dev"
port = 4000
auto_start = true
env = { NODE_ENV = "development" }

[[services]]
id = "pos"
display_name = "POS Tablet"
backend = "daemon_managed"
target = "native_mobile_build"
cwd = "apps/pos"

[services.device]
model = "Pixel_Tablet"
port = 5556

[services.native]
flavor = "pos"
build_command = "./gradlew assemblePosDebug"
artifact = "android/app/build/outputs/apk/pos/debug/app-pos-debug.apk"
staging_dir = "/mnt/c/builds"
bridge_staging_dir = 'C:\builds'
package = "tools.sous.pos"
activity = ".MainActivity"

[[services]]
id = "cache"
display_name = "Redis"
backend = "container"
target = "infrastructure"
container = "sous-redis"

[infrastructure]
compose_file = "docker-compose.yml"
project_name = "sous"
services = ["cache"]

[bridge]
port = 4141

[polling]
reconcile_interval_ms = 1000
"#;

    #[test]
    fn test_parse_full_topology() {
        let base = Path::new("/work/sous");
        let topology = parse_topology(TOPOLOGY, base).unwrap();
        assert_eq!(topology.services.len(), 4);

        let web = topology.service("web").unwrap();
        assert_eq!(web.display_name, "Web");
        assert_eq!(
            web.launch,
            LaunchSpec::Command {
                command: "pnpm dev".into(),
                cwd: Some(PathBuf::from("/work/sous/apps/web")),
            }
        );

        let api = topology.service("api").unwrap();
        assert_eq!(api.display_name, "api");
        assert_eq!(api.daemon_name, "api");
        assert!(api.auto_start);
        assert_eq!(api.env["NODE_ENV"], "development");

        let pos = topology.service("pos").unwrap();
        let device = pos.device().unwrap();
        assert_eq!(device.avd, "Pixel_Tablet");
        assert_eq!(device.bridge_port, 5556);
        match &pos.launch {
            LaunchSpec::NativeBuild { recipe, .. } => {
                assert_eq!(recipe.project_dir, PathBuf::from("/work/sous/apps/pos"));
                assert_eq!(recipe.bridge_staging_dir, "C:\\builds");
            }
            other => panic!("unexpected launch spec: {other:?}"),
        }
        assert!(pos.is_bridge_dependent());

        let cache = topology.service("cache").unwrap();
        assert_eq!(
            cache.launch,
            LaunchSpec::Container {
                container: "sous-redis".into()
            }
        );

        let infra = topology.infrastructure.unwrap();
        assert_eq!(infra.services, vec!["cache"]);
        assert_eq!(
            infra.compose.file,
            Some(PathBuf::from("/work/sous/docker-compose.yml"))
        );
        assert_eq!(topology.bridge.port, 4141);
        assert_eq!(topology.polling.reconcile_interval_ms, 1000);
        assert_eq!(topology.polling.bridge_log_interval_ms, 3000);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let toml = r#"
[[services]]
id = "web"
backend = "direct_process"
target = "web_service"
command = "a"

[[services]]
id = "web"
backend = "direct_process"
target = "web_service"
command = "b"
"#;
        let err = parse_topology(toml, Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_missing_command_rejected() {
        let toml = r#"
[[services]]
id = "web"
backend = "direct_process"
target = "web_service"
"#;
        let err = parse_topology(toml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("`command` is required"));
    }

    #[test]
    fn test_native_without_device_rejected() {
        let toml = r#"
[[services]]
id = "pos"
backend = "daemon_managed"
target = "native_mobile_build"
command = "echo"
"#;
        let err = parse_topology(toml, Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_infrastructure_must_name_container_service() {
        let toml = r#"
[[services]]
id = "web"
backend = "direct_process"
target = "web_service"
command = "pnpm dev"

[infrastructure]
services = ["web"]
"#;
        let err = parse_topology(toml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("container backend"));

        let toml = "[infrastructure]\nservices = [\"db\"]\n";
        let err = parse_topology(toml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn test_infrastructure_defaults_to_container_services() {
        let toml = r#"
[[services]]
id = "cache"
backend = "container"
target = "infrastructure"

[[services]]
id = "web"
backend = "direct_process"
target = "web_service"
command = "pnpm dev"
"#;
        let topology = parse_topology(toml, Path::new(".")).unwrap();
        let infra = topology.infrastructure.unwrap();
        assert_eq!(infra.services, vec!["cache"]);
        assert_eq!(infra.compose.file, None);

        let toml = r#"
[[services]]
id = "web"
backend = "direct_process"
target = "web_service"
command = "pnpm dev"
"#;
        let topology = parse_topology(toml, Path::new(".")).unwrap();
        assert!(topology.infrastructure.is_none());
    }

    #[test]
    fn test_empty_id_rejected() {
        let toml = r#"
[[services]]
id = " "
backend = "container"
target = "infrastructure"
"#;
        assert!(parse_topology(toml, Path::new(".")).is_err());
    }

    #[test]
    fn test_load_topology_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, TOPOLOGY).unwrap();

        let topology = load_topology(&path).unwrap();
        let web = topology.service("web").unwrap();
        match &web.launch {
            LaunchSpec::Command { cwd, .. } => {
                assert_eq!(cwd.as_deref(), Some(temp.path().join("apps/web").as_path()))
            }
            other => panic!("unexpected launch spec: {other:?}"),
        }
    }

    #[test]
    fn test_load_topology_missing_file() {
        let temp = tempdir().unwrap();
        let err = load_topology(&temp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_topology_unreadable_is_io() {
        let temp = tempdir().unwrap();
        let err = load_topology(temp.path()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_load_topology_invalid_toml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(matches!(load_topology(&path), Err(Error::Toml(_))));
    }
}
