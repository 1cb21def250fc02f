//! Secret overrides for daemon-managed launches
//!
//! Secrets come from a user-configured command (for example
//! `infisical export --env=dev --format=json`) whose stdout is either a JSON
//! object or dotenv lines.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use devherd_core::prelude::*;

use crate::process::run_tool;

const SECRET_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplies secret environment overrides
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<String, String>>;
}

/// [`SecretSource`] that runs a shell command
#[derive(Debug, Clone)]
pub struct CommandSecretSource {
    command: String,
}

impl CommandSecretSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SecretSource for CommandSecretSource {
    async fn fetch(&self) -> Result<HashMap<String, String>> {
        let out = run_tool("sh", &["-c", &self.command], SECRET_COMMAND_TIMEOUT)
            .await
            .map_err(|e| Error::secrets(e.to_string()))?;
        if !out.success {
            return Err(Error::secrets(format!(
                "secret command exited with {:?}: {}",
                out.code,
                out.stderr.trim()
            )));
        }
        parse_secret_output(&out.stdout)
    }
}

/// Parse a JSON object or dotenv lines into key/value pairs
pub fn parse_secret_output(output: &str) -> Result<HashMap<String, String>> {
    let trimmed = output.trim();
    if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| Error::secrets(format!("invalid JSON from secret command: {}", e)))?;
        let Value::Object(map) = value else {
            return Err(Error::secrets("secret command did not return an object"));
        };
        return Ok(map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect());
    }

    dotenvy::from_read_iter(trimmed.as_bytes())
        .map(|item| {
            item.map_err(|e| Error::secrets(format!("invalid dotenv from secret command: {}", e)))
        })
        .collect()
}

/// Layer the environment of a launch.
///
/// Precedence, lowest first: `inherited`, the service's `env` table, `PORT`,
/// secret overrides.
pub fn derive_environment(
    inherited: &HashMap<String, String>,
    service_env: &HashMap<String, String>,
    port: Option<u16>,
    secrets: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut env = inherited.clone();
    env.extend(service_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(port) = port {
        env.insert("PORT".to_string(), port.to_string());
    }
    if let Some(secrets) = secrets {
        env.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env
}
