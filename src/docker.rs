//! Container runtime client for function instances

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use tracing::debug;

/// The container operations the gateway depends on.
///
/// The runtime is a black box with possibly-delayed port binding: after
/// `start`, `host_port` may report no binding for a while, so callers poll.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container for the image, exposing `container_port` on a
    /// runtime-assigned host port. Returns the container handle.
    async fn create(
        &self,
        image: &str,
        arguments: &[String],
        container_port: u16,
    ) -> anyhow::Result<String>;

    /// Start a previously created container
    async fn start(&self, container_id: &str) -> anyhow::Result<()>;

    /// Report the host port bound to `container_port`, if one is bound yet.
    /// An unparseable binding (e.g. a "start-end" range) reports as absent.
    async fn host_port(&self, container_id: &str, container_port: u16)
        -> anyhow::Result<Option<u16>>;

    /// Forcibly remove the container and its volumes. Removing a container
    /// that no longer exists is success.
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
}

/// Container runtime backed by the Docker daemon
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority:
    /// 1. Explicit `docker_host` parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Self::connect_with_defaults().await?
        };

        // Verify connection
        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<String> = vec![
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
            format!("{}/podman/podman.sock", xdg_runtime),
        ];

        for path in &socket_paths {
            if path.contains("//") || !std::path::Path::new(path).exists() {
                continue;
            }
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            {
                if client.ping().await.is_ok() {
                    debug!(path, "Found Docker socket");
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd or set DOCKER_HOST.",
                e
            )
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(
        &self,
        image: &str,
        arguments: &[String],
        container_port: u16,
    ) -> anyhow::Result<String> {
        let port_key = format!("{}/tcp", container_port);

        // Empty binding: the daemon assigns an ephemeral host port
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(String::new()),
                host_port: Some(String::new()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let cmd = if arguments.is_empty() {
            None
        } else {
            Some(arguments.to_vec())
        };

        let container_config = Config {
            image: Some(image.to_string()),
            cmd,
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create container from image '{}': {}", image, e))?;

        debug!(container_id = %response.id, image, "Created container");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container '{}': {}", container_id, e))?;

        debug!(container_id, "Started container");
        Ok(())
    }

    async fn host_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> anyhow::Result<Option<u16>> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container '{}': {}", container_id, e))?;

        let port_key = format!("{}/tcp", container_port);
        let binding = info
            .network_settings
            .and_then(|net| net.ports)
            .and_then(|ports| ports.get(&port_key).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next());

        let Some(binding) = binding else {
            return Ok(None);
        };

        // A binding spec can be a "start-end" range; anything unparseable
        // as a single port is treated as not bound
        match binding.host_port.as_deref().map(|spec| spec.parse::<u16>()) {
            Some(Ok(port)) => Ok(Some(port)),
            Some(Err(_)) => {
                debug!(container_id, spec = ?binding.host_port, "Unparseable host port binding");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Already removed, possibly by an earlier stop or externally
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container: {}", e)),
        }
    }
}
