//! Build Service
//!
//! Golden image build orchestration for a KubeVirt cluster. A build request
//! provisions an image volume, boots a transient builder VM carrying
//! first-boot provisioning data, and records the build so its status can be
//! polled until the builder VM reports ready or failed.

pub mod admission;
pub mod cluster;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod handlers;
pub mod metadata;
pub mod orchestrator;
pub mod status;
pub mod storage;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use cluster::{ClusterApi, InMemoryCluster, KubeCluster};
pub use config::{ClusterBackend, Config, ControlPlaneMode};
pub use context::CallContext;
pub use control_plane::VmControlPlane;
pub use handlers::AppState;
pub use orchestrator::{BuildOrchestrator, BuildSettings};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    let api = Router::new()
        .route(
            "/images",
            post(handlers::create_image_handler).get(handlers::list_images_handler),
        )
        .route(
            "/images/{name}",
            get(handlers::get_image_handler).delete(handlers::delete_image_handler),
        )
        .route(
            "/images/{name}/status",
            get(handlers::get_image_status_handler),
        )
        .route("/vms", get(handlers::list_vms_handler))
        .route(
            "/vms/{name}",
            get(handlers::get_vm_handler).delete(handlers::delete_vm_handler),
        )
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler));

    Router::new()
        .nest("/api/v1", api)
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
