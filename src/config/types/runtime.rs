//! Runtime backend configuration types

use serde::{Deserialize, Serialize};

/// Docker backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon socket, local defaults when unset
    #[serde(default)]
    pub socket: Option<String>,
    /// Network sandboxes are attached to
    #[serde(default = "default_network")]
    pub network: String,
    /// Pull the template image when it is missing
    #[serde(default = "default_true")]
    pub pull_missing: bool,
    /// Memory limit
    #[serde(default = "default_memory")]
    pub memory_limit: String,
    /// CPU limit (number of CPUs)
    #[serde(default = "default_cpu")]
    pub cpu_limit: f64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            socket: None,
            network: default_network(),
            pull_missing: true,
            memory_limit: default_memory(),
            cpu_limit: default_cpu(),
        }
    }
}

fn default_network() -> String {
    "bridge".to_string()
}

fn default_true() -> bool {
    true
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpu() -> f64 {
    0.5
}
