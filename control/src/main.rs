use anyhow::{Context, Result};
use control::apis::service::{
    watch_services, KubeStatusWriter, ServiceEventHandler, ServiceReconciler, ServiceWatch,
};
use control::cloudflared::{CloudflaredDaemon, ConfigSync};
use control::config::ControllerConfig;
use control::controller::ServiceController;
use control::error::ControllerError;
use control::queue::{ControllerRateLimiter, RateLimitingQueue};
use control::server::{self, HealthState};
use control::tracker::IngressTracker;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// cflb controller
///
/// Assigns tunnel hostnames to LoadBalancer Services and keeps the
/// cloudflared ingress configuration in step with them.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env().context("Invalid controller configuration")?;
    info!("Starting {}", config.controller_name);
    info!("   Config file: {}", config.config_path.display());
    info!("   Tunnel: {}", config.tunnel_id.as_deref().unwrap_or("<quick tunnel>"));
    info!("   Workers: {}", config.workers);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    let tracker = Arc::new(IngressTracker::new());
    let health = Arc::new(HealthState::new());
    let queue = RateLimitingQueue::new(ControllerRateLimiter::from_config(&config.queue));
    let (reader, writer) = reflector::store::<Service>();
    let mut handles = vec![];

    // Service cache and event ingest
    let watch = ServiceWatch::new(writer, ServiceEventHandler::new(queue.clone()));
    let watch_client = client.clone();
    let watch_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        tokio::select! {
            _ = watch_services(watch_client, watch) => warn!("Service watcher ended"),
            _ = watch_shutdown.cancelled() => {}
        }
    }));

    // Tunnel configuration file
    let sync = Arc::new(ConfigSync::new(tracker.clone(), &config));
    handles.push(tokio::spawn(sync.run(config.sync_interval(), shutdown.clone())));

    // Metrics and health
    let listener = TcpListener::bind(&config.metrics_bind_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", config.metrics_bind_addr))?;
    handles.push(tokio::spawn(server::serve(
        listener,
        health.clone(),
        shutdown.clone(),
    )));

    if config.daemon.enabled {
        let daemon = CloudflaredDaemon::from_config(&config);
        let daemon_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = daemon.run(daemon_shutdown).await {
                error!("cloudflared supervisor error: {}", e);
            }
        }));
    }

    let reconciler = ServiceReconciler::new(
        reader.clone(),
        KubeStatusWriter::new(client, config.controller_name.clone()),
        tracker,
        config.domain.clone(),
    );
    let controller = Arc::new(ServiceController::new(
        queue,
        Arc::new(reconciler),
        config.queue.max_retries,
    ));

    let cache_ready = {
        let health = health.clone();
        async move {
            reader
                .wait_until_ready()
                .await
                .map_err(|e| ControllerError::Cache(e.to_string()))?;
            health.set_ready(true);
            Ok(())
        }
    };

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_shutdown.cancel();
    });

    info!("Press Ctrl-C to exit.");
    let result = controller
        .run(config.workers, cache_ready, shutdown.clone())
        .await;

    // Stop the remaining tasks if the controller returned on its own
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    result.context("Service controller failed")
}
