//! Docker backed sandboxes
//!
//! A sandbox is one long-lived container created from the template image.
//! Cloning only defines the container; it is created on its first start so
//! the isolation profile can still be applied to its host config. Freezing
//! maps to pause, unfreezing to unpause.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, Network};
use bollard::network::InspectNetworkOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DockerConfig;
use crate::core::{IsolationProfile, RuntimeState, SandboxBackend, SandboxRuntime};
use crate::error::{Error, Result};

/// Label carrying the template a container was cloned from
const TEMPLATE_LABEL: &str = "honeypool.template";

/// Network option naming the bridge interface on the host
const BRIDGE_NAME_OPTION: &str = "com.docker.network.bridge.name";

/// Interval between inspections while waiting for a state
const STATE_POLL: Duration = Duration::from_millis(250);

/// Grace period before a stopping container is killed
const STOP_TIMEOUT_SECS: i64 = 10;

/// Sandbox factory on top of a Docker daemon
pub struct DockerBackend {
    docker: Docker,
    config: Arc<DockerConfig>,
}

impl DockerBackend {
    /// Connect to the Docker daemon and verify it answers
    pub async fn connect(config: &DockerConfig) -> Result<Self> {
        let docker = match config.socket.as_deref() {
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, 120, API_DEFAULT_VERSION)
            }
            Some(path) => {
                Docker::connect_with_unix(path.trim_start_matches("unix://"), 120, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;

        info!("Docker backend connected (network: {})", config.network);

        Ok(DockerBackend {
            docker,
            config: Arc::new(config.clone()),
        })
    }

    /// Make sure the template image is present, pulling it if allowed
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(Error::Container(format!("Failed to inspect image {}: {}", image, e))),
        }

        if !self.config.pull_missing {
            return Err(Error::Container(format!("Template image {} is not available", image)));
        }

        info!("Pulling template image: {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Container(format!("Failed to pull image {}: {}", image, e)));
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    fn runtime(&self, name: &str, image: String, created: bool) -> DockerRuntime {
        DockerRuntime {
            docker: self.docker.clone(),
            config: Arc::clone(&self.config),
            name: name.to_string(),
            image,
            profile: IsolationProfile::default(),
            created,
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn lookup(&self, name: &str) -> Result<Option<Box<dyn SandboxRuntime>>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let image = inspect
                    .config
                    .and_then(|c| c.image)
                    .unwrap_or_default();
                Ok(Some(Box::new(self.runtime(name, image, true))))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clone_instance(&self, name: &str, template: &str) -> Result<Box<dyn SandboxRuntime>> {
        self.ensure_image(template).await?;
        debug!("Defined container {} from image {}", name, template);
        Ok(Box::new(self.runtime(name, template.to_string(), false)))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect())
    }
}

/// Handle to one sandbox container
pub struct DockerRuntime {
    docker: Docker,
    config: Arc<DockerConfig>,
    name: String,
    image: String,
    profile: IsolationProfile,
    /// Whether the container exists in the daemon yet
    created: bool,
}

impl DockerRuntime {
    async fn inspect(&self) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Container(format!("Failed to inspect {}: {}", self.name, e)))
    }

    fn container_config(&self) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(TEMPLATE_LABEL.to_string(), self.image.clone());

        Config {
            image: Some(self.image.clone()),
            hostname: Some(self.name.clone()),
            tty: Some(self.profile.tty_count > 0),
            open_stdin: Some(!self.profile.disable_console),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: parse_memory_limit(&self.config.memory_limit),
                nano_cpus: Some((self.config.cpu_limit * 1_000_000_000.0) as i64),
                network_mode: Some(self.config.network.clone()),
                // denied device nodes cannot be recreated without mknod
                cap_drop: (!self.profile.deny_devices.is_empty()).then(|| vec!["MKNOD".to_string()]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create(&mut self) -> Result<()> {
        let options = CreateContainerOptions {
            name: self.name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), self.container_config())
            .await
            .map_err(|e| Error::Container(format!("Failed to create container {}: {}", self.name, e)))?;

        debug!("Created container: {}", self.name);
        self.created = true;
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_defined(&self) -> Result<bool> {
        if !self.created {
            return Ok(true);
        }
        match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn configure(&mut self, profile: &IsolationProfile) -> Result<()> {
        if self.created {
            debug!("Container {} already exists, keeping its isolation settings", self.name);
        }
        self.profile = profile.clone();
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if !self.created {
            self.create().await?;
        }

        self.docker
            .start_container(&self.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("Failed to start container {}: {}", self.name, e)))
    }

    async fn stop(&mut self) -> Result<()> {
        let options = StopContainerOptions { t: STOP_TIMEOUT_SECS };
        self.docker
            .stop_container(&self.name, Some(options))
            .await
            .map_err(|e| Error::Container(format!("Failed to stop container {}: {}", self.name, e)))
    }

    async fn freeze(&mut self) -> Result<()> {
        self.docker
            .pause_container(&self.name)
            .await
            .map_err(|e| Error::Container(format!("Failed to pause container {}: {}", self.name, e)))
    }

    async fn unfreeze(&mut self) -> Result<()> {
        self.docker
            .unpause_container(&self.name)
            .await
            .map_err(|e| Error::Container(format!("Failed to unpause container {}: {}", self.name, e)))
    }

    async fn state(&self) -> Result<RuntimeState> {
        if !self.created {
            return Ok(RuntimeState::Stopped);
        }
        Ok(runtime_state(&self.inspect().await?))
    }

    async fn wait_for_state(&self, target: RuntimeState, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state().await? == target {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(STATE_POLL).await;
        }
    }

    async fn ip_addresses(&self, interface: &str) -> Result<Vec<IpAddr>> {
        debug!(
            "Resolving addresses of {} on network {} (interface {})",
            self.name, self.config.network, interface
        );
        let inspect = self.inspect().await?;
        Ok(network_addresses(&inspect, &self.config.network))
    }

    async fn network_device(&self, index: usize) -> Result<String> {
        let inspect = self.inspect().await?;
        let mut networks: Vec<String> = inspect
            .network_settings
            .and_then(|s| s.networks)
            .map(|n| n.into_keys().collect())
            .unwrap_or_default();
        networks.sort();

        let network = networks.into_iter().nth(index).ok_or_else(|| {
            Error::Container(format!("Container {} has no network #{}", self.name, index))
        })?;

        let details = self
            .docker
            .inspect_network(&network, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(bridge_device(&details, &network))
    }
}

/// Host side interface traffic of a network passes through
fn bridge_device(network: &Network, name: &str) -> String {
    if let Some(device) = network
        .options
        .as_ref()
        .and_then(|o| o.get(BRIDGE_NAME_OPTION))
        .filter(|d| !d.is_empty())
    {
        return device.clone();
    }

    // user defined bridges are named after the network id
    match (network.driver.as_deref(), network.id.as_deref()) {
        (Some("bridge"), Some(id)) if id.len() >= 12 => format!("br-{}", &id[..12]),
        _ => name.to_string(),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Map Docker's container state onto the runtime states
fn runtime_state(inspect: &ContainerInspectResponse) -> RuntimeState {
    let Some(state) = inspect.state.as_ref() else {
        return RuntimeState::Stopped;
    };
    if state.paused == Some(true) {
        RuntimeState::Frozen
    } else if state.running == Some(true) {
        RuntimeState::Running
    } else {
        RuntimeState::Stopped
    }
}

/// Addresses on `network`, or on every attached network if it is not attached
fn network_addresses(inspect: &ContainerInspectResponse, network: &str) -> Vec<IpAddr> {
    let Some(networks) = inspect.network_settings.as_ref().and_then(|s| s.networks.as_ref()) else {
        return Vec::new();
    };

    let endpoints: Vec<_> = match networks.get(network) {
        Some(endpoint) => vec![endpoint],
        None => networks.values().collect(),
    };

    endpoints
        .into_iter()
        .flat_map(|e| [e.ip_address.as_deref(), e.global_ipv6_address.as_deref()])
        .flatten()
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.to_lowercase();
    let limit = limit.trim_end_matches('b');
    let (num, multiplier) = match limit.chars().last()? {
        'g' => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        'm' => (&limit[..limit.len() - 1], 1024 * 1024),
        'k' => (&limit[..limit.len() - 1], 1024),
        _ => (limit, 1),
    };

    num.parse::<i64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerState, EndpointSettings, NetworkSettings};

    fn inspect_with(state: ContainerState, networks: &[(&str, &str)]) -> ContainerInspectResponse {
        let networks = networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.to_string(),
                    EndpointSettings {
                        ip_address: Some(ip.to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();

        ContainerInspectResponse {
            state: Some(state),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1GB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024k"), Some(1024 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("lots"), None);
        assert_eq!(parse_memory_limit(""), None);
    }

    #[test]
    fn test_runtime_state_mapping() {
        let paused = ContainerState {
            running: Some(true),
            paused: Some(true),
            ..Default::default()
        };
        let running = ContainerState {
            running: Some(true),
            paused: Some(false),
            ..Default::default()
        };
        let exited = ContainerState {
            running: Some(false),
            ..Default::default()
        };

        assert_eq!(runtime_state(&inspect_with(paused, &[])), RuntimeState::Frozen);
        assert_eq!(runtime_state(&inspect_with(running, &[])), RuntimeState::Running);
        assert_eq!(runtime_state(&inspect_with(exited, &[])), RuntimeState::Stopped);
        assert_eq!(runtime_state(&ContainerInspectResponse::default()), RuntimeState::Stopped);
    }

    #[test]
    fn test_network_addresses() {
        let inspect = inspect_with(
            ContainerState::default(),
            &[("bridge", "172.17.0.5"), ("traps", "10.66.0.9")],
        );

        assert_eq!(
            network_addresses(&inspect, "traps"),
            vec!["10.66.0.9".parse::<IpAddr>().unwrap()]
        );

        let mut all = network_addresses(&inspect, "missing");
        all.sort();
        assert_eq!(all.len(), 2);

        // not connected yet
        let pending = inspect_with(ContainerState::default(), &[("bridge", "")]);
        assert!(network_addresses(&pending, "bridge").is_empty());
    }

    #[test]
    fn test_bridge_device() {
        let default_bridge = Network {
            driver: Some("bridge".to_string()),
            id: Some("9f2c1e0d4b7a6c5e3d2f1a0b".to_string()),
            options: Some(HashMap::from([(BRIDGE_NAME_OPTION.to_string(), "docker0".to_string())])),
            ..Default::default()
        };
        assert_eq!(bridge_device(&default_bridge, "bridge"), "docker0");

        let user_bridge = Network {
            driver: Some("bridge".to_string()),
            id: Some("3a4b5c6d7e8f9a0b1c2d3e4f".to_string()),
            ..Default::default()
        };
        assert_eq!(bridge_device(&user_bridge, "traps"), "br-3a4b5c6d7e8f");

        let overlay = Network {
            driver: Some("overlay".to_string()),
            id: Some("3a4b5c6d7e8f9a0b1c2d3e4f".to_string()),
            ..Default::default()
        };
        assert_eq!(bridge_device(&overlay, "swarm-traps"), "swarm-traps");
    }
}
