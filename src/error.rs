//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failure of a single function invocation.
///
/// Cloneable because a runner's start outcome is memoized and handed to
/// every concurrent caller that joined the same launch.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// The container runtime rejected creation or start of the instance
    #[error("container launch failed: {0}")]
    LaunchFailed(String),
    /// The instance never exposed a reachable host port within the poll budget
    #[error("instance did not become ready")]
    InstanceNotReady,
    /// The instance was reachable but the proxied request failed
    #[error("upstream request failed: {0}")]
    Upstream(String),
    /// The outbound request could not be rebuilt from the inbound one
    #[error("failed to rebuild request: {0}")]
    RequestRebuild(String),
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No function is registered under the requested name
    UnknownFunction,
    /// The backing instance failed to launch
    FunctionStartFailed,
    /// The backing instance never became reachable
    InstanceNotReady,
    /// The request could not be forwarded to the instance
    UpstreamConnectionFailed,
    /// The invocation exceeded the request timeout
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownFunction => StatusCode::NOT_FOUND,
            GatewayErrorCode::FunctionStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::InstanceNotReady => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UpstreamConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownFunction => "UNKNOWN_FUNCTION",
            GatewayErrorCode::FunctionStartFailed => "FUNCTION_START_FAILED",
            GatewayErrorCode::InstanceNotReady => "INSTANCE_NOT_READY",
            GatewayErrorCode::UpstreamConnectionFailed => "UPSTREAM_CONNECTION_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Map an invocation failure to the gateway-level error code
    pub fn from_invoke_error(err: &InvokeError) -> Self {
        match err {
            InvokeError::LaunchFailed(_) => GatewayErrorCode::FunctionStartFailed,
            InvokeError::InstanceNotReady => GatewayErrorCode::InstanceNotReady,
            InvokeError::Upstream(_) => GatewayErrorCode::UpstreamConnectionFailed,
            InvokeError::RequestRebuild(_) => GatewayErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
