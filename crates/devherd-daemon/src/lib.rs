//! # devherd-daemon - External Collaborator Plumbing
//!
//! Everything that talks to something outside the supervisor: child process
//! groups, the pm2 CLI, the docker CLI, the device bridge agent, and secret
//! commands.
//!
//! Depends on [`devherd_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Process Management
//! - [`ChildProcess`] - Shell command in its own process group, output as [`ProcessEvent`]s
//! - [`StreamHandle`] - Handle to a log follower (child process or task)
//! - [`run_tool()`] - Run a CLI to completion with a time limit
//!
//! ### Process Daemon / Containers
//! - [`ProcessDaemon`], [`Pm2Cli`] - pm2 start/stop/list and log following
//! - [`ContainerRuntime`], [`DockerCli`] - compose up and container log following
//!
//! ### Device Bridge
//! - [`BridgeApi`], [`HttpBridge`] - HTTP client for the bridge agent
//! - [`BridgeLocator`], [`GatewayBridgeLocator`] - Find the agent at the default gateway
//! - [`DeviceResolver`] - Model tag to device serial, launching emulators on demand
//! - [`NativeRecipe`] - sync/build/stage/install/launch for native mobile builds
//!
//! ### Environment
//! - [`SecretSource`], [`derive_environment()`] - Layered launch environment
//! - [`ToolAvailability`] - Check for pm2, docker and `ip`
//!
//! [`ProcessEvent`]: devherd_core::ProcessEvent

pub mod bridge;
pub mod devices;
pub mod docker;
pub mod pm2;
pub mod process;
pub mod recipe;
pub mod secrets;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tool_availability;

// Public API re-exports
pub use bridge::{
    parse_default_gateway, resolve_bridge_host, AdbOutput, BridgeApi, BridgeLocator,
    BridgeLogLine, BridgeSession, GatewayBridgeLocator, HttpBridge, DEFAULT_BRIDGE_PORT,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use devices::{
    emulator_serial, model_matches, parse_adb_devices, DeviceResolver, DEVICE_POLL_ATTEMPTS,
    DEVICE_POLL_INTERVAL,
};
pub use docker::{ComposeSpec, ContainerRuntime, DockerCli};
pub use pm2::{DaemonApp, DaemonProcessInfo, Pm2Cli, ProcessDaemon};
pub use process::{
    run_tool, run_tool_with_env, ChildProcess, CommandSpec, StreamHandle, ToolOutput,
    TERMINATE_GRACE,
};
pub use recipe::{NativeRecipe, RecipeEvent, RecipeStage};
pub use secrets::{derive_environment, parse_secret_output, CommandSecretSource, SecretSource};
pub use tool_availability::{ToolAvailability, ToolStatus};
