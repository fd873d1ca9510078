use faasgate::admin::AdminServer;
use faasgate::config::Config;
use faasgate::docker::DockerRuntime;
use faasgate::invoker::FunctionInvoker;
use faasgate::proxy::GatewayServer;
use faasgate::registry::FunctionRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("faasgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "No config file found, using defaults");
        Config::default()
    };

    // Seed the registry from configuration
    let registry = Arc::new(FunctionRegistry::new());
    for (name, seed) in config.functions.clone() {
        match registry.create(seed.into_spec(&name)) {
            Ok(function) => info!(function = %function.name, id = %function.id, "Seeded function"),
            Err(e) => error!(function = %name, error = %e, "Failed to seed function"),
        }
    }

    // Connect to the container runtime
    let runtime = DockerRuntime::connect(config.server.docker_host.as_deref()).await?;
    let invoker = FunctionInvoker::new(Arc::new(runtime));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Admin API
    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;
    let admin = AdminServer::new(
        admin_addr,
        Arc::clone(&registry),
        Arc::clone(&invoker),
        shutdown_rx.clone(),
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin server failed");
        }
    });

    // Gateway
    let gateway_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid gateway bind address: {}", e))?;
    let gateway = GatewayServer::new(
        gateway_addr,
        Arc::clone(&registry),
        Arc::clone(&invoker),
        config.server.request_timeout(),
        shutdown_rx,
    );
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server failed");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = gateway_handle.await;
    let _ = admin_handle.await;

    info!("Shutdown complete");
    Ok(())
}
