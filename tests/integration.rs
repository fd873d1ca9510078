//! Integration tests for faasgate
//!
//! Orchestration tests run against a mock container runtime whose
//! "containers" are plain TCP backends owned by the test, so the full
//! launch / poll / probe / proxy / teardown path is exercised without a
//! Docker daemon. The 5-second poll cadence is driven with paused tokio
//! time where it matters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faasgate::admin::AdminServer;
use faasgate::docker::ContainerRuntime;
use faasgate::error::InvokeError;
use faasgate::forward::{ForwardClient, GatewayBody};
use faasgate::invoker::FunctionInvoker;
use faasgate::proxy::GatewayServer;
use faasgate::registry::{FunctionDefinition, FunctionRegistry, FunctionSpec};
use faasgate::runner::{Runner, RunnerState};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

// ============================================================================
// Mock container runtime
// ============================================================================

/// Container runtime whose instances are test-owned TCP listeners.
/// Counts every call so tests can assert coalescing and cleanup.
struct MockRuntime {
    /// Host port to report once the binding "appears"
    host_port: Option<u16>,
    /// Inspect attempt (1-based) on which the binding first appears
    binding_on_attempt: u32,
    fail_create: bool,
    create_count: AtomicUsize,
    start_count: AtomicUsize,
    inspect_count: AtomicUsize,
    remove_count: AtomicUsize,
}

impl MockRuntime {
    fn bound_at(port: u16) -> Self {
        Self {
            host_port: Some(port),
            binding_on_attempt: 1,
            fail_create: false,
            create_count: AtomicUsize::new(0),
            start_count: AtomicUsize::new(0),
            inspect_count: AtomicUsize::new(0),
            remove_count: AtomicUsize::new(0),
        }
    }

    fn bound_at_attempt(port: u16, attempt: u32) -> Self {
        Self {
            binding_on_attempt: attempt,
            ..Self::bound_at(port)
        }
    }

    fn never_bound() -> Self {
        Self {
            host_port: None,
            ..Self::bound_at(0)
        }
    }

    fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::bound_at(0)
        }
    }

    fn creates(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    fn inspects(&self) -> usize {
        self.inspect_count.load(Ordering::SeqCst)
    }

    fn removes(&self) -> usize {
        self.remove_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(
        &self,
        _image: &str,
        _arguments: &[String],
        _container_port: u16,
    ) -> anyhow::Result<String> {
        if self.fail_create {
            anyhow::bail!("no such image");
        }
        let n = self.create_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("container-{}", n))
    }

    async fn start(&self, _container_id: &str) -> anyhow::Result<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn host_port(
        &self,
        _container_id: &str,
        _container_port: u16,
    ) -> anyhow::Result<Option<u16>> {
        let attempt = self.inspect_count.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        if attempt < self.binding_on_attempt {
            Ok(None)
        } else {
            Ok(self.host_port)
        }
    }

    async fn remove(&self, _container_id: &str) -> anyhow::Result<()> {
        self.remove_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Test helpers
// ============================================================================

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal HTTP backend: echoes the request body back, or "hello world"
/// when the request carried none. Returns the bound port.
async fn spawn_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];

                let header_end = loop {
                    let n = stream.read(&mut tmp).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        let (key, value) = line.split_once(':')?;
                        if key.eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);

                let mut body = buf[header_end..].to_vec();
                while body.len() < content_length {
                    let n = stream.read(&mut tmp).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&tmp[..n]);
                }

                let reply = if content_length > 0 {
                    body
                } else {
                    b"hello world".to_vec()
                };
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    reply.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&reply).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    port
}

/// Backend that sends the response head immediately but withholds the body
/// until the returned handle is notified. Serves one HTTP request; probe
/// connections that close without sending a request head are skipped.
async fn spawn_withholding_backend(body: &'static str) -> (u16, Arc<Notify>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);

    tokio::spawn(async move {
        'accept: loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            loop {
                let n = stream.read(&mut tmp).await.unwrap_or(0);
                if n == 0 {
                    // Readiness probe: connected and closed without a
                    // request head; wait for the real request
                    continue 'accept;
                }
                buf.extend_from_slice(&tmp[..n]);
                if find_subsequence(&buf, b"\r\n\r\n").is_some() {
                    break;
                }
            }

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            gate.notified().await;
            let _ = stream.write_all(body.as_bytes()).await;
            let _ = stream.shutdown().await;
            return;
        }
    });

    (port, release)
}

fn echo_function(registry: &FunctionRegistry) -> Arc<FunctionDefinition> {
    registry
        .create(FunctionSpec {
            name: "name".to_string(),
            image: "hashicorp/http-echo".to_string(),
            arguments: vec!["-listen=:8081".to_string(), "-text=hello world".to_string()],
            container_port: 8081,
            instance_timeout_secs: 60,
            concurrency_limit: -1,
            min_instances: 0,
            max_instances: 1,
        })
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<GatewayBody> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap()
}

fn request_with_body(method: Method, uri: &str, body: &str) -> Request<GatewayBody> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

async fn body_string(body: GatewayBody) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Poll `check` until it holds or the budget runs out
async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Send a raw HTTP request and return the full response text
async fn http_request(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(port: u16, path: &str) -> String {
    http_request(
        port,
        &format!(
            "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            path, port
        ),
    )
    .await
}

async fn http_post(port: u16, path: &str, body: &str) -> String {
    http_request(
        port,
        &format!(
            "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            path, port, body.len(), body
        ),
    )
    .await
}

// ============================================================================
// Orchestration tests
// ============================================================================

#[tokio::test]
async fn test_invoke_launches_serves_and_scales_to_zero() {
    let backend_port = spawn_backend().await;
    let mock = Arc::new(MockRuntime::bound_at(backend_port));
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let response = invoker
        .invoke(function, empty_request(Method::GET, "/name/anything"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response.into_body()).await, "hello world");
    assert_eq!(mock.creates(), 1);
    assert_eq!(mock.start_count.load(Ordering::SeqCst), 1);

    // The container is removed once the response is delivered
    assert!(wait_until(|| mock.removes() == 1).await);
    assert_eq!(invoker.active_count(), 0);
}

#[tokio::test]
async fn test_removal_waits_for_response_body_delivery() {
    let (backend_port, release_body) = spawn_withholding_backend("hello").await;
    let mock = Arc::new(MockRuntime::bound_at(backend_port));
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let response = invoker
        .invoke(function, empty_request(Method::GET, "/name/anything"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Headers have arrived but the body is still in flight; the instance
    // must stay up until the last byte is delivered
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.removes(), 0);
    assert_eq!(invoker.active_count(), 1);

    release_body.notify_one();
    assert_eq!(body_string(response.into_body()).await, "hello");

    assert!(wait_until(|| mock.removes() == 1).await);
    assert_eq!(invoker.active_count(), 0);
}

#[tokio::test]
async fn test_dropping_undelivered_response_still_releases() {
    let (backend_port, _release_body) = spawn_withholding_backend("hello").await;
    let mock = Arc::new(MockRuntime::bound_at(backend_port));
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let response = invoker
        .invoke(function, empty_request(Method::GET, "/name/anything"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Client goes away before the body arrives
    drop(response);

    assert!(wait_until(|| mock.removes() == 1).await);
    assert_eq!(invoker.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_invocations_share_one_launch() {
    let backend_port = spawn_backend().await;
    // Binding appears on the second poll, keeping the launch window open
    // long enough for both requests to check out the same runner
    let mock = Arc::new(MockRuntime::bound_at_attempt(backend_port, 2));
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let (a, b) = tokio::join!(
        invoker.invoke(function.clone(), empty_request(Method::GET, "/name/a")),
        invoker.invoke(function.clone(), empty_request(Method::GET, "/name/b")),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(body_string(a.into_body()).await, "hello world");
    assert_eq!(body_string(b.into_body()).await, "hello world");

    // One launch served both requests, and teardown ran exactly once
    assert_eq!(mock.creates(), 1);
    assert!(wait_until(|| mock.removes() == 1).await);
    assert_eq!(invoker.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_binding_accepted_on_third_attempt() {
    let backend_port = spawn_backend().await;
    let mock = Arc::new(MockRuntime::bound_at_attempt(backend_port, 3));
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let response = invoker
        .invoke(function, empty_request(Method::GET, "/name/anything"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Polling stopped at the first reachable binding
    assert_eq!(mock.inspects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_poll_exhaustion_fails_before_serve() {
    let mock = Arc::new(MockRuntime::never_bound());
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let err = invoker
        .invoke(function, empty_request(Method::GET, "/name/anything"))
        .await
        .unwrap_err();

    assert!(matches!(err, InvokeError::InstanceNotReady));
    assert_eq!(mock.inspects(), 10);

    // The created container is still cleaned up
    assert!(wait_until(|| mock.removes() == 1).await);
    assert_eq!(invoker.active_count(), 0);
}

#[tokio::test]
async fn test_launch_failure_releases_entry() {
    let mock = Arc::new(MockRuntime::failing_create());
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    let err = invoker
        .invoke(function, empty_request(Method::GET, "/name/anything"))
        .await
        .unwrap_err();

    assert!(matches!(err, InvokeError::LaunchFailed(_)));
    assert_eq!(invoker.active_count(), 0);

    // No container was ever created, so there is nothing to remove
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.removes(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let backend_port = spawn_backend().await;
    let mock = Arc::new(MockRuntime::bound_at(backend_port));
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);
    let runner = Runner::new(function, mock.clone(), Arc::new(ForwardClient::new()));

    runner.start().await.unwrap();
    assert_eq!(runner.state(), RunnerState::Bound);

    runner.stop().await;
    runner.stop().await;

    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(mock.removes(), 1);
}

#[tokio::test]
async fn test_stop_before_start_is_a_noop() {
    let mock = Arc::new(MockRuntime::bound_at(0));
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);
    let runner = Runner::new(function, mock.clone(), Arc::new(ForwardClient::new()));

    runner.stop().await;

    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(mock.removes(), 0);
}

#[tokio::test]
async fn test_get_body_stripped_and_post_body_streamed() {
    let backend_port = spawn_backend().await;
    let mock = Arc::new(MockRuntime::bound_at(backend_port));
    let invoker = FunctionInvoker::new(mock);
    let registry = FunctionRegistry::new();
    let function = echo_function(&registry);

    // A GET with an attached body is forwarded without one; the backend
    // sees no body and replies with its default text
    let get = invoker
        .invoke(
            function.clone(),
            request_with_body(Method::GET, "/name/anything", "should be dropped"),
        )
        .await
        .unwrap();
    assert_eq!(body_string(get.into_body()).await, "hello world");

    // A POST body goes through byte-for-byte
    let post = invoker
        .invoke(
            function,
            request_with_body(Method::POST, "/name/anything", "payload bytes"),
        )
        .await
        .unwrap();
    assert_eq!(body_string(post.into_body()).await, "payload bytes");
}

// ============================================================================
// Gateway end-to-end tests
// ============================================================================

#[tokio::test]
async fn test_gateway_routes_and_falls_through() {
    let gateway_port = 18470;
    let backend_port = spawn_backend().await;
    let mock = Arc::new(MockRuntime::bound_at(backend_port));
    let invoker = FunctionInvoker::new(mock.clone());
    let registry = Arc::new(FunctionRegistry::new());
    echo_function(&registry);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = GatewayServer::new(
        format!("127.0.0.1:{}", gateway_port).parse().unwrap(),
        Arc::clone(&registry),
        Arc::clone(&invoker),
        Duration::from_secs(30),
        shutdown_rx,
    );
    tokio::spawn(gateway.run());
    assert!(wait_until_port_open(gateway_port).await);

    // Unknown function falls through without launching anything
    let response = http_get(gateway_port, "/unknown-function/x").await;
    assert!(response.contains("404"));
    assert!(response.contains("UNKNOWN_FUNCTION"));
    assert_eq!(mock.creates(), 0);

    // Known function launches, serves, and scales back to zero
    let response = http_get(gateway_port, "/name/anything").await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("hello world"));
    assert_eq!(mock.creates(), 1);
    assert!(wait_until(|| mock.removes() == 1).await);
    assert_eq!(invoker.active_count(), 0);
}

#[tokio::test]
async fn test_gateway_reports_start_failure() {
    let gateway_port = 18471;
    let mock = Arc::new(MockRuntime::failing_create());
    let invoker = FunctionInvoker::new(mock);
    let registry = Arc::new(FunctionRegistry::new());
    echo_function(&registry);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = GatewayServer::new(
        format!("127.0.0.1:{}", gateway_port).parse().unwrap(),
        registry,
        invoker,
        Duration::from_secs(30),
        shutdown_rx,
    );
    tokio::spawn(gateway.run());
    assert!(wait_until_port_open(gateway_port).await);

    let response = http_get(gateway_port, "/name/anything").await;
    assert!(response.contains("503"));
    assert!(response.contains("FUNCTION_START_FAILED"));
}

#[tokio::test]
async fn test_admin_function_crud() {
    let admin_port = 18472;
    let mock = Arc::new(MockRuntime::bound_at(0));
    let invoker = FunctionInvoker::new(mock);
    let registry = Arc::new(FunctionRegistry::new());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin = AdminServer::new(
        format!("127.0.0.1:{}", admin_port).parse().unwrap(),
        Arc::clone(&registry),
        invoker,
        shutdown_rx,
    );
    tokio::spawn(admin.run());
    assert!(wait_until_port_open(admin_port).await);

    let response = http_get(admin_port, "/health").await;
    assert!(response.contains("200 OK"));

    let response = http_post(
        admin_port,
        "/functions",
        r#"{"name":"name","image":"hashicorp/http-echo","arguments":["-listen=:8081","-text=hello world"],"container_port":8081}"#,
    )
    .await;
    assert!(response.contains("201"));
    assert!(registry.get_by_name("name").is_some());

    // Duplicate names are rejected
    let response = http_post(
        admin_port,
        "/functions",
        r#"{"name":"name","image":"hashicorp/http-echo","container_port":8081}"#,
    )
    .await;
    assert!(response.contains("409"));

    let response = http_get(admin_port, "/functions").await;
    assert!(response.contains("\"count\":1"));
    assert!(response.contains("hashicorp/http-echo"));

    let response = http_request(
        admin_port,
        &format!(
            "DELETE /functions/name HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            admin_port
        ),
    )
    .await;
    assert!(response.contains("200 OK"));
    assert!(registry.get_by_name("name").is_none());
}

/// Wait for a locally spawned server to start listening
async fn wait_until_port_open(port: u16) -> bool {
    for _ in 0..100 {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
