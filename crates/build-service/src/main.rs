//! Build Service
//!
//! REST API for golden image builds on a KubeVirt cluster

use anyhow::{Context, Result};
use build_service::{
    create_router, AppState, BuildOrchestrator, CallContext, ClusterApi, ClusterBackend, Config,
    ControlPlaneMode, InMemoryCluster, KubeCluster, VmControlPlane,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Build Service");
    info!("  Namespace: {}", config.namespace);
    info!("  Storage class: {}", config.storage_class);
    info!("  Cluster backend: {:?}", config.cluster_backend);
    info!("  Control plane: {:?}", config.control_plane);
    info!("  Max concurrent builds: {}", config.max_concurrent_builds);

    let cluster: Arc<dyn ClusterApi> = match config.cluster_backend {
        ClusterBackend::Kubernetes => Arc::new(
            KubeCluster::connect(
                config.kubeconfig.as_deref(),
                &config.namespace,
                &config.storage_class,
            )
            .await
            .context("Failed to initialize Kubernetes client")?,
        ),
        ClusterBackend::Memory => {
            warn!("Using the in-memory cluster backend, nothing is persisted");
            Arc::new(InMemoryCluster::new())
        }
    };

    let control_plane = match config.control_plane {
        ControlPlaneMode::Live => VmControlPlane::live(cluster.clone()),
        ControlPlaneMode::Stub => {
            warn!(
                "Using the stub VM control plane, builds report ready after {}s",
                config.stub_ready_after_secs
            );
            VmControlPlane::stub(config.stub_ready_after())
        }
    };

    let orchestrator = Arc::new(BuildOrchestrator::new(
        config.build_settings(),
        cluster,
        control_plane,
    ));

    let startup = CallContext::background().with_timeout(config.request_timeout());
    if let Err(e) = orchestrator.resync_admission(&startup).await {
        warn!("Failed to resync admission counter, starting from zero: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(orchestrator, config.request_timeout(), shutdown_rx);

    // Create router
    let app = create_router(state);

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Build Service API running on http://{}/api/v1", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining requests");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    info!("Build Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
