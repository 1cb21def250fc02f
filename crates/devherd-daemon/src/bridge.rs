//! Device bridge discovery and HTTP client
//!
//! Mobile builds run on a secondary host (the Windows side of a WSL setup)
//! that owns adb and the Android emulator. That host runs a small agent
//! reachable at the default gateway address:
//!
//! - `POST /` `{"command":"launch-emulator","avd":..,"port":..}`
//! - `POST /` `{"command":"adb","args":"<adb subcommand>"}`
//! - `GET /logs` drains the agent's buffered log lines
//! - `GET /` bare reachability probe
//!
//! Every POST answers `{"status":"success"|"error"|"ok", message?, stdout?, stderr?}`.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use devherd_core::prelude::*;

use crate::process::run_tool;

pub const DEFAULT_BRIDGE_PORT: u16 = 4040;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const ROUTE_TIMEOUT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────
// Gateway discovery
// ─────────────────────────────────────────────────────────────────

/// Extract the gateway from `ip route show default` output
/// (`default via 172.20.0.1 dev eth0 proto kernel`).
pub fn parse_default_gateway(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("default") {
            return None;
        }
        let mut rest = fields;
        while let Some(field) = rest.next() {
            if field == "via" {
                return rest.next().and_then(|addr| addr.parse().ok());
            }
        }
        None
    })
}

/// Resolve the bridge host as the default gateway. `None` when the route
/// table has no default route or `ip` is unavailable.
pub async fn resolve_bridge_host() -> Option<IpAddr> {
    match run_tool("ip", &["route", "show", "default"], ROUTE_TIMEOUT).await {
        Ok(out) if out.success => {
            let gateway = parse_default_gateway(&out.stdout);
            if gateway.is_none() {
                debug!("No default gateway in: {}", out.stdout.trim());
            }
            gateway
        }
        Ok(out) => {
            debug!("ip route failed: {}", out.stderr.trim());
            None
        }
        Err(e) => {
            debug!("ip route could not run: {}", e);
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────

/// Output of an adb command relayed by the bridge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdbOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A log line buffered by the bridge agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeLogLine {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub message: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

impl BridgeResponse {
    fn into_result(self) -> Result<Self> {
        if self.status == "error" {
            let detail = self
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .or_else(|| self.stderr.clone().filter(|s| !s.trim().is_empty()))
                .or_else(|| self.stdout.clone())
                .unwrap_or_else(|| "bridge reported an error".to_string());
            Err(Error::bridge(detail.trim().to_string()))
        } else {
            Ok(self)
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    logs: Vec<BridgeLogLine>,
}

// ─────────────────────────────────────────────────────────────────
// Bridge API
// ─────────────────────────────────────────────────────────────────

/// Control protocol of the device bridge
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeApi: Send + Sync {
    /// `host:port` of the bridge, for log messages
    fn address(&self) -> String;

    /// Bare reachability probe
    async fn ping(&self) -> Result<()>;

    /// Run an adb subcommand on the bridge host
    async fn adb(&self, args: &str) -> Result<AdbOutput>;

    /// Launch an emulator for `avd` on console port `port`
    async fn launch_emulator(&self, avd: &str, port: u16) -> Result<()>;

    /// Fetch and clear the agent's buffered log lines
    async fn drain_logs(&self) -> Result<Vec<BridgeLogLine>>;
}

/// [`BridgeApi`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpBridge {
    client: reqwest::Client,
    base: Url,
}

impl HttpBridge {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let authority = if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let base = Url::parse(&format!("http://{}/", authority))
            .map_err(|e| Error::bridge(format!("invalid bridge address {}:{}: {}", host, port, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::bridge(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn unreachable(&self, e: reqwest::Error) -> Error {
        Error::bridge_unreachable(self.address(), e.to_string())
    }

    async fn post(&self, body: serde_json::Value) -> Result<BridgeResponse> {
        let response = self
            .client
            .post(self.base.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let parsed: BridgeResponse = response
            .json()
            .await
            .map_err(|e| Error::bridge(format!("malformed bridge response: {}", e)))?;
        parsed.into_result()
    }
}

#[async_trait]
impl BridgeApi for HttpBridge {
    fn address(&self) -> String {
        format!(
            "{}:{}",
            self.base.host_str().unwrap_or_default(),
            self.base.port_or_known_default().unwrap_or(DEFAULT_BRIDGE_PORT)
        )
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.base.clone())
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::bridge_unreachable(
                self.address(),
                format!("HTTP {}", response.status()),
            ))
        }
    }

    async fn adb(&self, args: &str) -> Result<AdbOutput> {
        trace!("bridge adb {}", args);
        let response = self.post(json!({ "command": "adb", "args": args })).await?;
        Ok(AdbOutput {
            stdout: response.stdout.unwrap_or_default(),
            stderr: response.stderr.unwrap_or_default(),
        })
    }

    async fn launch_emulator(&self, avd: &str, port: u16) -> Result<()> {
        info!("bridge launch-emulator {} on port {}", avd, port);
        // The agent passes the port straight to the emulator argv, so it must be a string.
        self.post(json!({
            "command": "launch-emulator",
            "avd": avd,
            "port": port.to_string(),
        }))
        .await
        .map(|_| ())
    }

    async fn drain_logs(&self) -> Result<Vec<BridgeLogLine>> {
        let url = self
            .base
            .join("logs")
            .map_err(|e| Error::bridge(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let parsed: LogsResponse = response
            .json()
            .await
            .map_err(|e| Error::bridge(format!("malformed logs response: {}", e)))?;
        Ok(parsed.logs)
    }
}

// ─────────────────────────────────────────────────────────────────
// Session / locator
// ─────────────────────────────────────────────────────────────────

/// Last known state of the bridge host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSession {
    pub host_address: String,
    pub last_checked_at: DateTime<Local>,
    pub reachable: bool,
}

/// Finds a reachable bridge, if any
#[async_trait]
pub trait BridgeLocator: Send + Sync {
    /// Resolve the host and probe it. `None` when absent or unreachable.
    async fn locate(&self) -> Option<Arc<dyn BridgeApi>>;

    /// Result of the most recent `locate()`
    fn session(&self) -> Option<BridgeSession>;
}

/// Locates the bridge at the default gateway (or a fixed host), re-resolving
/// on every call since the secondary host comes and goes.
#[derive(Debug)]
pub struct GatewayBridgeLocator {
    port: u16,
    fixed_host: Option<String>,
    timeout: Duration,
    session: Mutex<Option<BridgeSession>>,
}

impl GatewayBridgeLocator {
    pub fn new(port: u16, fixed_host: Option<String>, timeout: Duration) -> Self {
        Self {
            port,
            fixed_host,
            timeout,
            session: Mutex::new(None),
        }
    }

    fn record(&self, host_address: String, reachable: bool) {
        let session = BridgeSession {
            host_address,
            last_checked_at: Local::now(),
            reachable,
        };
        if let Ok(mut guard) = self.session.lock() {
            *guard = Some(session);
        }
    }
}

impl Default for GatewayBridgeLocator {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_PORT, None, DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl BridgeLocator for GatewayBridgeLocator {
    async fn locate(&self) -> Option<Arc<dyn BridgeApi>> {
        let host = match &self.fixed_host {
            Some(host) => host.clone(),
            None => resolve_bridge_host().await?.to_string(),
        };

        let bridge = match HttpBridge::new(&host, self.port, self.timeout) {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!("Bridge client for {} unavailable: {}", host, e);
                return None;
            }
        };

        match bridge.ping().await {
            Ok(()) => {
                self.record(bridge.address(), true);
                Some(Arc::new(bridge))
            }
            Err(e) => {
                debug!("Bridge probe failed: {}", e);
                self.record(bridge.address(), false);
                None
            }
        }
    }

    fn session(&self) -> Option<BridgeSession> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP/1.1 responder for exercising the client over a real socket.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned JSON body per connection, in order. Returns the
    /// request line and body of every request received.
    pub async fn serve(bodies: Vec<&'static str>) -> (u16, JoinHandle<Vec<(String, String)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let (head_end, content_length) = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break (buf.len(), 0);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(pos) = text.find("\r\n\r\n") {
                        let length = text[..pos]
                            .lines()
                            .find_map(|l| {
                                let lower = l.to_ascii_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        break (pos + 4, length);
                    }
                };
                while buf.len() < head_end + content_length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let text = String::from_utf8_lossy(&buf).to_string();
                let request_line = text.lines().next().unwrap_or_default().to_string();
                let request_body = text[head_end..].to_string();
                seen.push((request_line, request_body));

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            seen
        });

        (port, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::serve;
    use super::*;

    #[test]
    fn test_parse_default_gateway() {
        let output = "default via 172.20.0.1 dev eth0 proto kernel\n";
        assert_eq!(
            parse_default_gateway(output),
            Some("172.20.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_default_gateway_ignores_other_routes() {
        let output = "10.0.0.0/8 via 10.0.0.1 dev wg0\ndefault via 192.168.1.254 dev wlan0 metric 600\n";
        assert_eq!(
            parse_default_gateway(output),
            Some("192.168.1.254".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_default_gateway_missing() {
        assert_eq!(parse_default_gateway(""), None);
        assert_eq!(parse_default_gateway("default dev tun0 scope link"), None);
        assert_eq!(parse_default_gateway("default via not-an-ip dev eth0"), None);
    }

    #[tokio::test]
    async fn test_adb_posts_command_and_returns_stdout() {
        let (port, server) = serve(vec![
            r#"{"status":"success","stdout":"List of devices attached\r\nemulator-5554\tdevice\r\n","stderr":""}"#,
        ])
        .await;
        let bridge = HttpBridge::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();

        let out = bridge.adb("devices").await.unwrap();
        assert!(out.stdout.contains("emulator-5554\tdevice"));

        let seen = server.await.unwrap();
        assert!(seen[0].0.starts_with("POST / "));
        let body: serde_json::Value = serde_json::from_str(&seen[0].1).unwrap();
        assert_eq!(body["command"], "adb");
        assert_eq!(body["args"], "devices");
    }

    #[tokio::test]
    async fn test_error_status_is_bridge_error() {
        let (port, _server) = serve(vec![
            r#"{"status":"error","stdout":"Performing Streamed Install\r\n","stderr":"adb: failed to install app.apk: Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]"}"#,
        ])
        .await;
        let bridge = HttpBridge::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();

        let err = bridge.adb("-s emulator-5554 install -r app.apk").await.unwrap_err();
        assert!(matches!(err, Error::Bridge { .. }));
        assert!(err.to_string().contains("INSTALL_FAILED_INSUFFICIENT_STORAGE"));
    }

    #[tokio::test]
    async fn test_launch_emulator_sends_port_as_string() {
        let (port, server) =
            serve(vec![r#"{"status":"success","message":"Launched Pixel_Tablet"}"#]).await;
        let bridge = HttpBridge::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();

        bridge.launch_emulator("Pixel_Tablet", 5556).await.unwrap();

        let seen = server.await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&seen[0].1).unwrap();
        assert_eq!(body["command"], "launch-emulator");
        assert_eq!(body["avd"], "Pixel_Tablet");
        assert_eq!(body["port"], "5556");
    }

    #[tokio::test]
    async fn test_drain_logs() {
        let (port, server) = serve(vec![
            r#"{"status":"success","logs":[{"timestamp":"2024-01-01T00:00:00.000Z","message":"Received command: adb","level":"info"},{"timestamp":"2024-01-01T00:00:01.000Z","message":"ADB Error: offline","level":"warn"}]}"#,
        ])
        .await;
        let bridge = HttpBridge::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();

        let logs = bridge.drain_logs().await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, "warn");

        let seen = server.await.unwrap();
        assert!(seen[0].0.starts_with("GET /logs "));
    }

    #[tokio::test]
    async fn test_ipv6_host_is_bracketed() {
        let bridge = HttpBridge::new("fe80::1", 4040, DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(bridge.address(), "[fe80::1]:4040");
        assert_eq!(bridge.base.as_str(), "http://[fe80::1]:4040/");

        let bridge = HttpBridge::new("[::1]", 4041, DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(bridge.address(), "[::1]:4041");

        let bridge = HttpBridge::new("172.20.0.1", 4040, DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(bridge.address(), "172.20.0.1:4040");
    }

    #[tokio::test]
    async fn test_unreachable_bridge() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let bridge = HttpBridge::new("127.0.0.1", port, Duration::from_millis(500)).unwrap();

        let err = bridge.ping().await.unwrap_err();
        assert!(matches!(err, Error::BridgeUnreachable { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_locator_records_session() {
        let (port, _server) = serve(vec![r#"{"status":"ok","info":"agent"}"#]).await;
        let locator =
            GatewayBridgeLocator::new(port, Some("127.0.0.1".into()), Duration::from_secs(2));
        assert!(locator.session().is_none());

        let bridge = locator.locate().await;
        assert!(bridge.is_some());
        let session = locator.session().unwrap();
        assert!(session.reachable);
        assert_eq!(session.host_address, format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_locator_unreachable_records_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let locator =
            GatewayBridgeLocator::new(port, Some("127.0.0.1".into()), Duration::from_millis(500));

        assert!(locator.locate().await.is_none());
        assert!(!locator.session().unwrap().reachable);
    }
}
