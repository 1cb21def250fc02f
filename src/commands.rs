//! One-shot commands: `status` and `check`

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use devherd_app::config::{load_topology, Topology};
use devherd_app::ToolAvailability;
use devherd_core::logging;
use devherd_core::prelude::*;
use devherd_core::{BackendKind, RuntimeTarget};
use devherd_daemon::{BridgeLocator, GatewayBridgeLocator};

/// A configured service as printed by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub id: String,
    pub display_name: String,
    pub backend: BackendKind,
    pub target: RuntimeTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub auto_start: bool,
}

pub fn summarize(topology: &Topology) -> Vec<ServiceSummary> {
    topology
        .services
        .iter()
        .map(|s| ServiceSummary {
            id: s.id.clone(),
            display_name: s.display_name.clone(),
            backend: s.backend,
            target: s.target,
            port: s.port,
            auto_start: s.auto_start,
        })
        .collect()
}

/// Plain-text table of the configured services
pub fn render_table(services: &[ServiceSummary]) -> String {
    let id_width = services
        .iter()
        .map(|s| s.id.len())
        .chain(std::iter::once(2))
        .max()
        .unwrap_or(2);
    let name_width = services
        .iter()
        .map(|s| s.display_name.len())
        .chain(std::iter::once(4))
        .max()
        .unwrap_or(4);

    let mut out = format!(
        "{:<id_width$}  {:<name_width$}  {:<14}  {:<19}  {:>5}  AUTO\n",
        "ID", "NAME", "BACKEND", "TARGET", "PORT"
    );
    for s in services {
        let port = s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "{:<id_width$}  {:<name_width$}  {:<14}  {:<19}  {:>5}  {}\n",
            s.id,
            s.display_name,
            s.backend.to_string(),
            s.target.to_string(),
            port,
            if s.auto_start { "yes" } else { "no" }
        ));
    }
    out
}

/// `devherd status [--json]`: list the topology without starting anything
pub fn print_status(config_path: &Path, json: bool) -> Result<()> {
    let topology = load_topology(config_path)?;
    let services = summarize(&topology);
    if json {
        println!("{}", serde_json::to_string_pretty(&services)?);
    } else {
        print!("{}", render_table(&services));
    }
    Ok(())
}

/// `devherd check`: validate the topology and probe the environment.
///
/// Returns whether everything the topology needs is available.
pub async fn run_check(config_path: &Path) -> Result<bool> {
    let topology = load_topology(config_path)?;
    println!(
        "✅ {} is valid ({} services)",
        config_path.display(),
        topology.services.len()
    );

    let tools = ToolAvailability::check(&topology.tools.pm2, &topology.tools.docker);
    for tool in tools.all() {
        match &tool.path {
            Some(path) => println!("✅ {} found at {}", tool.name, path.display()),
            None => println!("❌ {} not found", tool.name),
        }
    }
    for message in tools.missing_messages() {
        println!("   {}", message);
    }
    println!(
        "   Diagnostics log: {}",
        logging::get_current_log_file().display()
    );

    let needs_daemon = topology
        .services
        .iter()
        .any(|s| s.backend == BackendKind::DaemonManaged);
    let needs_docker = topology.infrastructure.is_some();
    let mut ok = (!needs_daemon || tools.pm2.available()) && (!needs_docker || tools.docker.available());

    if topology.services.iter().any(|s| s.is_bridge_dependent()) {
        let bridge = &topology.bridge;
        let locator = GatewayBridgeLocator::new(
            bridge.port,
            bridge.host.clone(),
            bridge.request_timeout().min(Duration::from_secs(5)),
        );
        let reachable = locator.locate().await.is_some();
        let address = locator
            .session()
            .map(|s| s.host_address)
            .unwrap_or_else(|| "default gateway (not found)".to_string());
        if reachable {
            println!("✅ Bridge reachable at {}", address);
        } else {
            println!("❌ Bridge not reachable at {}", address);
            ok = false;
        }
    }

    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devherd_app::config::parse_topology;

    const TOPOLOGY: &str = r#"
[[services]]
id = "web"
display_name = "Web"
backend = "direct_process"
target = "web_service"
command = "pnpm dev"
port = 3000

[[services]]
id = "cache"
backend = "container"
target = "infrastructure"
"#;

    #[test]
    fn test_summarize_keeps_configuration_order() {
        let topology = parse_topology(TOPOLOGY, Path::new(".")).unwrap();
        let services = summarize(&topology);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].id, "web");
        assert_eq!(services[0].port, Some(3000));
        assert_eq!(services[1].backend, BackendKind::Container);
    }

    #[test]
    fn test_render_table() {
        let topology = parse_topology(TOPOLOGY, Path::new(".")).unwrap();
        let table = render_table(&summarize(&topology));
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].contains("direct_process"));
        assert!(lines[1].contains("3000"));
        assert!(lines[2].contains("infrastructure"));
        assert!(lines[2].ends_with("no"));
    }

    #[test]
    fn test_summary_json_uses_snake_case() {
        let topology = parse_topology(TOPOLOGY, Path::new(".")).unwrap();
        let json = serde_json::to_value(summarize(&topology)).unwrap();
        assert_eq!(json[0]["backend"], "direct_process");
        assert!(json[1].get("port").is_none());
    }
}
