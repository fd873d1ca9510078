use crate::registry::FunctionSpec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Functions seeded into the registry at startup, keyed by name
    #[serde(default)]
    pub functions: HashMap<String, FunctionSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Gateway port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 8090)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Docker daemon endpoint ('unix:///...' or 'tcp://...').
    /// Falls back to DOCKER_HOST and common socket paths when unset.
    pub docker_host: Option<String>,

    /// Max time to wait for a function invocation, launch included (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            docker_host: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// A function definition as written in the config file. The routing name
/// is the table key, so it is absent here.
#[derive(Debug, Deserialize, Clone)]
pub struct FunctionSeed {
    /// Container image coordinates
    pub image: String,

    /// Arguments passed to the launched process
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Port the function listens on inside its container
    pub port: u16,

    /// Idle timeout in seconds before a released instance may be stopped
    /// (reserved, not enforced)
    #[serde(default = "default_instance_timeout")]
    pub instance_timeout_secs: u64,

    /// Max simultaneous requests per instance, <= 0 for unlimited (reserved)
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: i32,

    /// Pool lower bound (reserved)
    #[serde(default)]
    pub min_instances: u32,

    /// Pool upper bound (reserved)
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

impl FunctionSeed {
    /// Attach the routing name from the table key
    pub fn into_spec(self, name: &str) -> FunctionSpec {
        FunctionSpec {
            name: name.to_string(),
            image: self.image,
            arguments: self.arguments,
            container_port: self.port,
            instance_timeout_secs: self.instance_timeout_secs,
            concurrency_limit: self.concurrency_limit,
            min_instances: self.min_instances,
            max_instances: self.max_instances,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;
        Ok(config)
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8090
}

fn default_request_timeout() -> u64 {
    300
}

fn default_instance_timeout() -> u64 {
    60
}

fn default_concurrency_limit() -> i32 {
    -1
}

fn default_max_instances() -> u32 {
    1
}
