//! Lifecycle of one backing container instance
//!
//! A runner owns a single container episode: create, start, wait for a
//! reachable host port, serve requests, and remove the container. Runners
//! are created and stopped exclusively by the orchestrator; a stopped
//! runner is never restarted.

use crate::docker::ContainerRuntime;
use crate::error::InvokeError;
use crate::forward::{ForwardClient, GatewayBody};
use crate::probe;
use crate::registry::FunctionDefinition;
use hyper::{Request, Response};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// How many times to ask the runtime for a host port binding
pub const PORT_POLL_ATTEMPTS: u32 = 10;
/// Delay between binding polls
pub const PORT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Instances are published on the local daemon's loopback interface
const INSTANCE_HOST: &str = "127.0.0.1";

/// Externally observable runner state. Serving requests does not change
/// state; a bound runner stays `Bound` for its whole serving window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Launching,
    Bound,
    Stopping,
    Stopped,
}

pub struct Runner {
    function: Arc<FunctionDefinition>,
    runtime: Arc<dyn ContainerRuntime>,
    forwarder: Arc<ForwardClient>,
    state: Mutex<RunnerState>,
    container_id: Mutex<Option<String>>,
    /// Memoized start outcome: every concurrent caller awaits the same
    /// launch and receives the same result. Also prevents double-start by
    /// construction.
    start: OnceCell<Result<u16, InvokeError>>,
}

impl Runner {
    pub fn new(
        function: Arc<FunctionDefinition>,
        runtime: Arc<dyn ContainerRuntime>,
        forwarder: Arc<ForwardClient>,
    ) -> Self {
        Self {
            function,
            runtime,
            forwarder,
            state: Mutex::new(RunnerState::Idle),
            container_id: Mutex::new(None),
            start: OnceCell::new(),
        }
    }

    pub fn function(&self) -> &Arc<FunctionDefinition> {
        &self.function
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    /// Launch the instance and wait for it to become reachable.
    ///
    /// Returns the verified host port. The first caller runs the launch;
    /// all others await and share its outcome.
    pub async fn start(&self) -> Result<u16, InvokeError> {
        self.start.get_or_init(|| self.launch()).await.clone()
    }

    async fn launch(&self) -> Result<u16, InvokeError> {
        *self.state.lock() = RunnerState::Launching;

        // A cancelled earlier launch may have left a half-started
        // container behind; remove it before creating a fresh one
        let stale = self.container_id.lock().take();
        if let Some(stale) = stale {
            debug!(function = %self.function.name, container_id = %stale, "Removing stale container from aborted launch");
            if let Err(e) = self.runtime.remove(&stale).await {
                warn!(container_id = %stale, error = %e, "Failed to remove stale container");
            }
        }

        let container_id = self
            .runtime
            .create(
                &self.function.image,
                &self.function.arguments,
                self.function.container_port,
            )
            .await
            .map_err(|e| InvokeError::LaunchFailed(e.to_string()))?;

        // Record the handle before starting so stop() can clean up a
        // container whose start fails partway
        *self.container_id.lock() = Some(container_id.clone());
        debug!(function = %self.function.name, container_id = %container_id, "Created container");

        self.runtime
            .start(&container_id)
            .await
            .map_err(|e| InvokeError::LaunchFailed(e.to_string()))?;

        // The runtime may take a while to report the host port binding.
        // Accept the first binding that parses and is reachable.
        for attempt in 1..=PORT_POLL_ATTEMPTS {
            match self
                .runtime
                .host_port(&container_id, self.function.container_port)
                .await
            {
                Ok(Some(port)) => {
                    if probe::is_reachable(INSTANCE_HOST, port).await {
                        *self.state.lock() = RunnerState::Bound;
                        debug!(
                            function = %self.function.name,
                            container_id = %container_id,
                            host_port = port,
                            attempt,
                            "Instance is reachable"
                        );
                        return Ok(port);
                    }
                    debug!(function = %self.function.name, host_port = port, attempt, "Bound but not reachable yet");
                }
                Ok(None) => {
                    debug!(function = %self.function.name, attempt, "No host port binding yet");
                }
                Err(e) => {
                    debug!(function = %self.function.name, attempt, error = %e, "Binding inspection failed");
                }
            }

            if attempt < PORT_POLL_ATTEMPTS {
                tokio::time::sleep(PORT_POLL_INTERVAL).await;
            }
        }

        warn!(function = %self.function.name, container_id = %container_id, "Instance never became reachable");
        Err(InvokeError::InstanceNotReady)
    }

    /// Forward one request to the bound instance. Valid once `start` has
    /// succeeded; concurrent serves are allowed.
    pub async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, InvokeError> {
        let port = match self.start.get() {
            Some(Ok(port)) => *port,
            _ => return Err(InvokeError::InstanceNotReady),
        };

        self.forwarder.forward(req, INSTANCE_HOST, port).await
    }

    /// Tear down the instance. Idempotent and valid from any state: the
    /// container handle is taken exactly once, removal of an already-gone
    /// container is success, and a runner that never created a container
    /// still ends up `Stopped`.
    pub async fn stop(&self) {
        *self.state.lock() = RunnerState::Stopping;

        let container_id = self.container_id.lock().take();
        match container_id {
            Some(container_id) => {
                debug!(function = %self.function.name, container_id = %container_id, "Removing container");
                if let Err(e) = self.runtime.remove(&container_id).await {
                    warn!(container_id = %container_id, error = %e, "Failed to remove container");
                }
            }
            None => {
                debug!(function = %self.function.name, "No container to remove");
            }
        }

        *self.state.lock() = RunnerState::Stopped;
    }
}
