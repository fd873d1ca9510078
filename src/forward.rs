//! Request forwarding to launched instances
//!
//! Forwards one in-flight request/response pair to a discovered host:port
//! over a pooled HTTP client. Bodies are streamed in both directions,
//! never materialized.

use crate::error::InvokeError;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Body type flowing through the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

const MAX_IDLE_PER_HOST: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Methods whose request body carries no semantics; forwarded without one
/// even if the client attached a body
fn strips_request_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// Rebuild the destination URI: original path, query, and scheme kept,
/// authority replaced by the discovered endpoint
fn rebuild_uri(uri: &Uri, host: &str, port: u16) -> Result<Uri, InvokeError> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme(uri.scheme_str().unwrap_or("http"))
        .authority(format!("{}:{}", host, port))
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| InvokeError::RequestRebuild(e.to_string()))
}

/// Pooled HTTP client for forwarding requests to instances
pub struct ForwardClient {
    client: Client<HttpConnector, GatewayBody>,
}

impl Default for ForwardClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(connector);

        Self { client }
    }

    /// Forward `req` to `host:port`.
    ///
    /// All request headers are forwarded as-is; host substitution happens
    /// only at the transport layer. The downstream status, headers, and
    /// body come back unmodified. Only called once the target has been
    /// confirmed reachable; any transport failure surfaces as
    /// [`InvokeError::Upstream`].
    pub async fn forward(
        &self,
        req: Request<GatewayBody>,
        host: &str,
        port: u16,
    ) -> Result<Response<GatewayBody>, InvokeError> {
        let (parts, body) = req.into_parts();
        let uri = rebuild_uri(&parts.uri, host, port)?;

        let out_body = if strips_request_body(&parts.method) {
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        } else {
            body
        };

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let out = builder
            .body(out_body)
            .map_err(|e| InvokeError::RequestRebuild(e.to_string()))?;

        debug!(uri = %uri, "Forwarding request");

        let response = self
            .client
            .request(out)
            .await
            .map_err(|e| InvokeError::Upstream(e.to_string()))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bodyless_methods() {
        assert!(strips_request_body(&Method::GET));
        assert!(strips_request_body(&Method::HEAD));
        assert!(strips_request_body(&Method::DELETE));
        assert!(strips_request_body(&Method::OPTIONS));
        assert!(strips_request_body(&Method::TRACE));

        assert!(!strips_request_body(&Method::POST));
        assert!(!strips_request_body(&Method::PUT));
        assert!(!strips_request_body(&Method::PATCH));
    }

    #[test]
    fn test_rebuild_uri_substitutes_authority() {
        let uri: Uri = "/name/anything?q=1".parse().unwrap();
        let rebuilt = rebuild_uri(&uri, "127.0.0.1", 32768).unwrap();

        assert_eq!(rebuilt.to_string(), "http://127.0.0.1:32768/name/anything?q=1");
    }

    #[test]
    fn test_rebuild_uri_defaults_path() {
        let uri: Uri = "http://gateway.local/".parse().unwrap();
        let rebuilt = rebuild_uri(&uri, "127.0.0.1", 8081).unwrap();

        assert_eq!(rebuilt.to_string(), "http://127.0.0.1:8081/");
    }

    #[test]
    fn test_rebuild_uri_keeps_scheme() {
        let uri: Uri = "https://gateway.local/fn/x".parse().unwrap();
        let rebuilt = rebuild_uri(&uri, "127.0.0.1", 8081).unwrap();

        assert_eq!(rebuilt.scheme_str(), Some("https"));
        assert_eq!(rebuilt.path(), "/fn/x");
    }
}
