//! The gateway HTTP server and request router
//!
//! Routes each request by the first segment of its path: a matching
//! function name hands the request to the orchestrator; anything else
//! falls through to the gateway's 404 without launching a container.

use crate::error::{json_error_response, GatewayErrorCode};
use crate::forward::GatewayBody;
use crate::invoker::FunctionInvoker;
use crate::registry::FunctionRegistry;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The main gateway server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    registry: Arc<FunctionRegistry>,
    invoker: Arc<FunctionInvoker>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<FunctionRegistry>,
        invoker: Arc<FunctionInvoker>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            invoker,
            request_timeout,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let invoker = Arc::clone(&self.invoker);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry, invoker, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    registry: Arc<FunctionRegistry>,
    invoker: Arc<FunctionInvoker>,
    request_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let invoker = Arc::clone(&invoker);
        async move { handle_request(req, registry, invoker, request_timeout).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<FunctionRegistry>,
    invoker: Arc<FunctionInvoker>,
    request_timeout: Duration,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let Some(name) = first_path_segment(req.uri().path()) else {
        return Ok(json_error_response(
            GatewayErrorCode::UnknownFunction,
            "request path has no function name",
        ));
    };

    let Some(function) = registry.get_by_name(name) else {
        debug!(function = name, "No function with that name");
        return Ok(json_error_response(
            GatewayErrorCode::UnknownFunction,
            format!("no function named: {}", name),
        ));
    };

    debug!(function = %function.name, method = %req.method(), uri = %req.uri(), "Invoking function");

    let req = req.map(|body| body.boxed());
    let result = tokio::time::timeout(request_timeout, invoker.invoke(function.clone(), req)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(function = %function.name, error = %e, "Invocation failed");
            Ok(json_error_response(
                GatewayErrorCode::from_invoke_error(&e),
                e.to_string(),
            ))
        }
        Err(_) => {
            error!(
                function = %function.name,
                timeout_secs = request_timeout.as_secs(),
                "Invocation timed out"
            );
            Ok(json_error_response(
                GatewayErrorCode::RequestTimeout,
                format!(
                    "invocation timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Extract the function name from a request path
fn first_path_segment(path: &str) -> Option<&str> {
    let segment = path.strip_prefix('/').unwrap_or(path).split('/').next()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_path_segment() {
        assert_eq!(first_path_segment("/name/anything"), Some("name"));
        assert_eq!(first_path_segment("/name"), Some("name"));
        assert_eq!(first_path_segment("/name/a/b?x=1"), Some("name"));
        assert_eq!(first_path_segment("/"), None);
        assert_eq!(first_path_segment(""), None);
    }
}
