//! Runtime traits - Abstract interface over the isolation technology
//!
//! This module defines the seam between the sandbox state machine and the
//! technology that actually runs a sandbox:
//! - `SandboxBackend` is the factory: it looks up, clones and lists instances
//! - `SandboxRuntime` is one instance handle with the lifecycle primitives
//!
//! The state machine in `crate::sandbox` only talks to these traits, so
//! process jails or microVMs can be substituted for containers without
//! touching it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Result;

/// State reported by the underlying runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Stopped,
    Running,
    Frozen,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Stopped => write!(f, "stopped"),
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Frozen => write!(f, "frozen"),
        }
    }
}

/// Isolation settings applied to a freshly cloned sandbox before first use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationProfile {
    /// Disable the interactive console
    #[serde(default = "default_true")]
    pub disable_console: bool,
    /// Number of ttys to allocate
    #[serde(default)]
    pub tty_count: u32,
    /// Device cgroup rules to deny (e.g. "c 5:1 rwm")
    #[serde(default = "default_denied_devices")]
    pub deny_devices: Vec<String>,
}

impl Default for IsolationProfile {
    fn default() -> Self {
        IsolationProfile {
            disable_console: true,
            tty_count: 0,
            deny_devices: default_denied_devices(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_denied_devices() -> Vec<String> {
    // /dev/console
    vec!["c 5:1 rwm".to_string()]
}

/// Factory for sandbox instances of one isolation technology
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Open an existing instance by name, `None` if it is not defined
    async fn lookup(&self, name: &str) -> Result<Option<Box<dyn SandboxRuntime>>>;

    /// Clone a new instance called `name` from `template`
    async fn clone_instance(&self, name: &str, template: &str) -> Result<Box<dyn SandboxRuntime>>;

    /// Names of all instances known to the backend
    async fn list(&self) -> Result<Vec<String>>;
}

/// Lifecycle primitives of one sandbox instance
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Instance name
    fn name(&self) -> &str;

    /// Whether the backing instance still exists
    async fn is_defined(&self) -> Result<bool>;

    /// Apply an isolation profile
    async fn configure(&mut self, profile: &IsolationProfile) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn freeze(&mut self) -> Result<()>;

    async fn unfreeze(&mut self) -> Result<()>;

    /// Current state as seen by the runtime
    async fn state(&self) -> Result<RuntimeState>;

    /// Wait until the runtime reports `target`, `false` on timeout
    async fn wait_for_state(&self, target: RuntimeState, timeout: Duration) -> Result<bool>;

    /// Addresses assigned to `interface` inside the sandbox
    async fn ip_addresses(&self, interface: &str) -> Result<Vec<IpAddr>>;

    /// Host side network device of the `index`-th network
    async fn network_device(&self, index: usize) -> Result<String>;
}
