//! Tool availability checking
//!
//! The supervisor drives pm2, docker and `ip` through their CLIs. This
//! module reports which of them are on `PATH` so `devherd check` can explain
//! a missing collaborator before anything is launched.

use std::path::PathBuf;

use serde::Serialize;

/// Resolved location of one external tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    pub fn available(&self) -> bool {
        self.path.is_some()
    }
}

/// Availability of the external tools the supervisor shells out to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    pub pm2: ToolStatus,
    pub docker: ToolStatus,
    pub ip: ToolStatus,
}

impl ToolAvailability {
    /// Check tool availability using the given program names or paths
    pub fn check(pm2: &str, docker: &str) -> Self {
        Self {
            pm2: locate(pm2),
            docker: locate(docker),
            ip: locate("ip"),
        }
    }

    pub fn all(&self) -> [&ToolStatus; 3] {
        [&self.pm2, &self.docker, &self.ip]
    }

    /// Get a user-friendly message for each missing tool
    pub fn missing_messages(&self) -> Vec<String> {
        let mut messages = Vec::new();
        if !self.pm2.available() {
            messages.push(format!(
                "{} not found. Install with `npm install -g pm2` to run daemon-managed services.",
                self.pm2.name
            ));
        }
        if !self.docker.available() {
            messages.push(format!(
                "{} not found. Infrastructure bring-up needs Docker with the compose plugin.",
                self.docker.name
            ));
        }
        if !self.ip.available() {
            messages.push(
                "ip not found. The bridge host cannot be discovered; set [bridge].host instead."
                    .to_string(),
            );
        }
        messages
    }
}

fn locate(program: &str) -> ToolStatus {
    let path = which::which(program).ok();
    if path.is_none() {
        tracing::debug!("{} not found on PATH", program);
    }
    ToolStatus {
        name: program.to_string(),
        path,
    }
}
