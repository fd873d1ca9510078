//! Invocation orchestration
//!
//! Coalesces concurrent requests for the same function onto one runner and
//! scales it to zero once the last request releases it. The reference-count
//! table is the only shared mutable state in the core; one mutex guards its
//! mutation, and every network call (container runtime, readiness polling,
//! proxying) happens outside that lock.

use crate::docker::ContainerRuntime;
use crate::error::InvokeError;
use crate::forward::{ForwardClient, GatewayBody};
use crate::registry::FunctionDefinition;
use crate::runner::{Runner, RunnerState};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Request, Response};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error};
use uuid::Uuid;

struct ActiveInstance {
    runner: Arc<Runner>,
    in_flight: usize,
}

/// Snapshot of one active instance, for the admin API
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub function_id: Uuid,
    pub function_name: String,
    pub state: RunnerState,
    pub in_flight: usize,
}

pub struct FunctionInvoker {
    runtime: Arc<dyn ContainerRuntime>,
    forwarder: Arc<ForwardClient>,
    /// Active runners keyed by the immutable function id, with the number
    /// of in-flight requests using each. An entry exists iff a runner is
    /// starting or running for that function, and its count is >= 1.
    active: Mutex<HashMap<Uuid, ActiveInstance>>,
}

impl FunctionInvoker {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            forwarder: Arc::new(ForwardClient::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Invoke `function` with `req`, launching an instance if none is
    /// active and removing it once no request is using it.
    ///
    /// The lease taken at checkout releases on every exit path. On success
    /// it moves into the response body and is held until the body is fully
    /// delivered or dropped, so teardown cannot race a streaming response;
    /// on error or cancellation it releases when the future unwinds.
    pub async fn invoke(
        self: &Arc<Self>,
        function: Arc<FunctionDefinition>,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, InvokeError> {
        let (runner, lease) = self.checkout(&function);

        runner.start().await?;
        let response = runner.serve(req).await?;
        Ok(response.map(|body| LeasedBody::new(body, lease).boxed()))
    }

    /// Join the function's active runner, or create one with a count of 1
    fn checkout(self: &Arc<Self>, function: &Arc<FunctionDefinition>) -> (Arc<Runner>, Lease) {
        let mut active = self.active.lock();

        let entry = active.entry(function.id).or_insert_with(|| {
            debug!(function = %function.name, "Creating runner");
            ActiveInstance {
                runner: Arc::new(Runner::new(
                    Arc::clone(function),
                    Arc::clone(&self.runtime),
                    Arc::clone(&self.forwarder),
                )),
                in_flight: 0,
            }
        });
        entry.in_flight += 1;
        debug!(function = %function.name, in_flight = entry.in_flight, "Checked out runner");

        let runner = Arc::clone(&entry.runner);
        let lease = Lease {
            invoker: Arc::clone(self),
            function_id: function.id,
            runner: Arc::clone(&runner),
        };
        (runner, lease)
    }

    /// Drop one reference to the function's runner; the last release
    /// removes the table entry and stops the runner
    fn release(&self, function_id: Uuid, runner: &Arc<Runner>) {
        let to_stop = {
            let mut active = self.active.lock();
            match active.entry(function_id) {
                Entry::Occupied(mut entry) => {
                    if entry.get().in_flight > 1 {
                        entry.get_mut().in_flight -= 1;
                        debug!(
                            function = %runner.function().name,
                            in_flight = entry.get().in_flight,
                            "Released runner"
                        );
                        None
                    } else {
                        debug!(function = %runner.function().name, "Releasing last reference");
                        Some(entry.remove().runner)
                    }
                }
                Entry::Vacant(_) => {
                    // Table invariant violated; stop the passed runner
                    // rather than leak its container
                    error!(
                        function = %runner.function().name,
                        "Release for function with no active entry"
                    );
                    Some(Arc::clone(runner))
                }
            }
        };

        if let Some(runner) = to_stop {
            // Stop outside the lock, and detached so cleanup survives the
            // cancellation of the invocation that triggered it
            tokio::spawn(async move {
                runner.stop().await;
            });
        }
    }

    /// Number of functions with an active instance
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot the active instances, for the admin API
    pub fn instance_statuses(&self) -> Vec<InstanceStatus> {
        self.active
            .lock()
            .iter()
            .map(|(id, instance)| InstanceStatus {
                function_id: *id,
                function_name: instance.runner.function().name.clone(),
                state: instance.runner.state(),
                in_flight: instance.in_flight,
            })
            .collect()
    }
}

/// One request's claim on an active runner. Dropping the lease performs
/// the release; this is what guarantees exactly-once cleanup on success,
/// failure, and cancellation alike.
struct Lease {
    invoker: Arc<FunctionInvoker>,
    function_id: Uuid,
    runner: Arc<Runner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.invoker.release(self.function_id, &self.runner);
    }
}

/// Response body that carries its request's lease, releasing it once the
/// body is fully delivered downstream (or dropped on client disconnect)
struct LeasedBody {
    inner: GatewayBody,
    lease: Option<Lease>,
}

impl LeasedBody {
    fn new(inner: GatewayBody, lease: Lease) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }
}

impl Body for LeasedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                // End of stream; release now rather than waiting for the
                // connection machinery to drop the body
                this.lease.take();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
