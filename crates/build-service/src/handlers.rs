//! API handlers for the build service

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use goldenpipe_common::{
    BuildRequest, BuildStatusResponse, Error, GoldenImageRecord, Metrics, VmSummary,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::CallContext;
use crate::orchestrator::BuildOrchestrator;

/// Shared application state
pub struct AppState {
    pub orchestrator: Arc<BuildOrchestrator>,

    /// Deadline given to every request
    pub request_timeout: Duration,

    /// Flips to `true` when the server shuts down
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<BuildOrchestrator>,
        request_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            request_timeout,
            shutdown,
        }
    }

    fn context(&self) -> CallContext {
        CallContext::background()
            .with_timeout(self.request_timeout)
            .with_cancellation(self.shutdown.clone())
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ExternalUnavailable(_) | Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid request body: {}", rejection.body_text()),
        }
    }
}

fn audit(action: &str, details: &str) {
    info!(target: "audit", audit_event = true, action, details, "audit");
}

/// Start a golden image build
pub async fn create_image_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        audit("image_create_rejected", &rejection.body_text());
        ApiError::from(rejection)
    })?;

    let name = request.name.clone();
    audit(
        "image_create_requested",
        &format!("name={} os_type={}", name, request.os_type),
    );

    let record = match state.orchestrator.create(request, &state.context()).await {
        Ok(record) => record,
        Err(e) => {
            let action = match &e {
                Error::Validation(_) => "image_create_rejected",
                _ => "image_create_failed",
            };
            audit(action, &format!("name={} error={}", name, e));
            return Err(e.into());
        }
    };

    audit(
        "image_create_accepted",
        &format!(
            "name={} vm={}",
            record.name,
            record.vm_name.as_deref().unwrap_or_default()
        ),
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "Golden image creation started",
            "image": record
        })),
    ))
}

/// List golden images
pub async fn list_images_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let images = state.orchestrator.list_images(&state.context()).await?;

    Ok(Json(serde_json::json!({
        "count": images.len(),
        "images": images
    })))
}

/// Get a golden image record
pub async fn get_image_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<GoldenImageRecord>, ApiError> {
    let record = state.orchestrator.get_image(&name, &state.context()).await?;
    Ok(Json(record))
}

/// Get build status
pub async fn get_image_status_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<BuildStatusResponse>, ApiError> {
    let status = state.orchestrator.get_status(&name, &state.context()).await?;
    Ok(Json(status))
}

/// Delete a golden image and its resources
pub async fn delete_image_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    info!("Deleting golden image: {}", name);
    audit("image_delete_requested", &format!("name={}", name));

    state.orchestrator.delete(&name, &state.context()).await?;

    audit("image_delete_started", &format!("name={}", name));
    Ok(Json(serde_json::json!({
        "message": "Image deletion started"
    })))
}

/// List builder VMs
pub async fn list_vms_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let vms = state.orchestrator.list_vms(&state.context()).await?;

    Ok(Json(serde_json::json!({
        "count": vms.len(),
        "vms": vms
    })))
}

pub async fn get_vm_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<VmSummary>, ApiError> {
    let vm = state.orchestrator.get_vm(&name, &state.context()).await?;
    Ok(Json(vm))
}

pub async fn delete_vm_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.delete_vm(&name, &state.context()).await?;
    audit("vm_delete_started", &format!("name={}", name));

    Ok(Json(serde_json::json!({
        "message": "VM deletion started"
    })))
}

/// Health check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.health(&state.context()).await {
        Ok(()) => Json(serde_json::json!({
            "status": "healthy",
            "service": "build-service"
        }))
        .into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string()
                })),
            )
                .into_response()
        }
    }
}

/// Aggregate counters
pub async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Metrics>, ApiError> {
    let metrics = state.orchestrator.metrics(&state.context()).await?;
    Ok(Json(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use goldenpipe_common::ResourceKind;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                Error::NotFound {
                    kind: ResourceKind::Image,
                    name: "web01".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (Error::Conflict("busy".into()), StatusCode::CONFLICT),
            (
                Error::CapacityExceeded {
                    active: 5,
                    limit: 5,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::ExternalUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Cancelled("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (
                Error::Other(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}
