//! Admin API for function CRUD and instance inspection
//!
//! Runs on its own port so gateway routing stays purely name-based.
//! Write operations carry no authentication; keep this port private.

use crate::invoker::FunctionInvoker;
use crate::registry::{FunctionRegistry, FunctionSpec, RegistryError};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<FunctionRegistry>,
    invoker: Arc<FunctionInvoker>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<FunctionRegistry>,
        invoker: Arc<FunctionInvoker>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            invoker,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let invoker = Arc::clone(&self.invoker);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, registry, invoker).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    registry: Arc<FunctionRegistry>,
    invoker: Arc<FunctionInvoker>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let invoker = Arc::clone(&invoker);
        async move { handle_admin_request(req, registry, invoker).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<Incoming>,
    registry: Arc<FunctionRegistry>,
    invoker: Arc<FunctionInvoker>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // List functions with their live instance state
        (&Method::GET, "/functions") => {
            let statuses = invoker.instance_statuses();
            let functions: Vec<serde_json::Value> = registry
                .list()
                .into_iter()
                .map(|f| {
                    let instance = statuses.iter().find(|s| s.function_id == f.id);
                    serde_json::json!({
                        "function": &*f,
                        "instance": instance,
                    })
                })
                .collect();
            let body = serde_json::json!({
                "functions": functions,
                "count": functions.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/functions") => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<FunctionSpec>(&body) {
                Ok(spec) => match registry.create(spec) {
                    Ok(function) => {
                        info!(function = %function.name, id = %function.id, "Function created");
                        json_response(
                            StatusCode::CREATED,
                            serde_json::to_string(&*function).unwrap_or_default(),
                        )
                    }
                    Err(RegistryError::NameTaken(name)) => response(
                        StatusCode::CONFLICT,
                        format!("function already exists: {}", name),
                    ),
                    Err(RegistryError::NotFound) => {
                        response(StatusCode::NOT_FOUND, "no such function")
                    }
                },
                Err(e) => response(StatusCode::BAD_REQUEST, format!("invalid function: {}", e)),
            }
        }

        (&Method::GET, path) if path.starts_with("/functions/") => {
            let name = path.trim_start_matches("/functions/");
            match registry.get_by_name(name) {
                Some(function) => json_response(
                    StatusCode::OK,
                    serde_json::to_string(&*function).unwrap_or_default(),
                ),
                None => response(StatusCode::NOT_FOUND, "no such function"),
            }
        }

        (&Method::PUT, path) if path.starts_with("/functions/") => {
            let name = path.trim_start_matches("/functions/").to_string();
            let Some(existing) = registry.get_by_name(&name) else {
                return Ok(response(StatusCode::NOT_FOUND, "no such function"));
            };
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<FunctionSpec>(&body) {
                Ok(spec) => match registry.update(existing.id, spec) {
                    Ok(function) => {
                        info!(function = %function.name, id = %function.id, "Function updated");
                        json_response(
                            StatusCode::OK,
                            serde_json::to_string(&*function).unwrap_or_default(),
                        )
                    }
                    Err(RegistryError::NameTaken(taken)) => response(
                        StatusCode::CONFLICT,
                        format!("function already exists: {}", taken),
                    ),
                    Err(RegistryError::NotFound) => {
                        response(StatusCode::NOT_FOUND, "no such function")
                    }
                },
                Err(e) => response(StatusCode::BAD_REQUEST, format!("invalid function: {}", e)),
            }
        }

        (&Method::DELETE, path) if path.starts_with("/functions/") => {
            let name = path.trim_start_matches("/functions/");
            match registry.get_by_name(name) {
                Some(function) => match registry.delete(function.id) {
                    Ok(deleted) => {
                        info!(function = %deleted.name, id = %deleted.id, "Function deleted");
                        response(StatusCode::OK, "deleted")
                    }
                    Err(_) => response(StatusCode::NOT_FOUND, "no such function"),
                },
                None => response(StatusCode::NOT_FOUND, "no such function"),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
