use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::ActorId;
use crate::error::ReleaseError;
use crate::models::*;
use crate::pipeline::ReleaseAction;
use crate::service::ReleaseService;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Map a release error to a response. Storage failures are logged in full
/// and reported to the client without internal detail.
fn release_error(e: ReleaseError) -> (StatusCode, String) {
    let status = match &e {
        ReleaseError::InvalidTransition { .. } | ReleaseError::Conflict(_) => StatusCode::CONFLICT,
        ReleaseError::PreconditionFailed(_) | ReleaseError::Validation(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ReleaseError::NotFound { .. } => StatusCode::NOT_FOUND,
        ReleaseError::Forbidden { .. } => StatusCode::FORBIDDEN,
        ReleaseError::StorageUnavailable(_) => {
            tracing::error!("Storage error: {}", e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage unavailable, retry later".to_string(),
            );
        }
    };

    tracing::warn!("Rejected request: {}", e);
    (status, e.to_string())
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Games
// ============================================================

pub async fn list_games(State(service): State<Arc<ReleaseService>>) -> ApiResult<Json<Vec<Game>>> {
    service.list_games().map(Json).map_err(release_error)
}

pub async fn get_game(
    State(service): State<Arc<ReleaseService>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Game>> {
    service.get_game(id).map(Json).map_err(release_error)
}

pub async fn create_game(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Json(input): Json<CreateGameInput>,
) -> ApiResult<(StatusCode, Json<Game>)> {
    service
        .create_game(input, &actor)
        .map(|g| (StatusCode::CREATED, Json(g)))
        .map_err(release_error)
}

pub async fn update_game(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateGameInput>,
) -> ApiResult<Json<Game>> {
    service
        .update_game(id, input, &actor)
        .map(Json)
        .map_err(release_error)
}

pub async fn delete_game(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    service
        .delete_game(id, &actor)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(release_error)
}

pub async fn disable_game(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Game>> {
    service
        .set_disabled(id, true, &actor)
        .await
        .map(Json)
        .map_err(release_error)
}

pub async fn enable_game(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Game>> {
    service
        .set_disabled(id, false, &actor)
        .await
        .map(Json)
        .map_err(release_error)
}

pub async fn update_rollout(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
    Json(input): Json<RolloutInput>,
) -> ApiResult<Json<Game>> {
    service
        .update_rollout(id, input.rollout_percentage, &actor)
        .map(Json)
        .map_err(release_error)
}

pub async fn reset_game(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Game>> {
    service
        .reset(id, &actor)
        .await
        .map(Json)
        .map_err(release_error)
}

pub async fn activate_version(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path((id, version_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Game>> {
    service
        .activate(id, version_id, &actor)
        .await
        .map(Json)
        .map_err(release_error)
}

// ============================================================
// Versions
// ============================================================

pub async fn list_versions(
    State(service): State<Arc<ReleaseService>>,
    Path(game_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Version>>> {
    service
        .list_versions(game_id)
        .map(Json)
        .map_err(release_error)
}

pub async fn create_version(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(game_id): Path<Uuid>,
    Json(input): Json<CreateVersionInput>,
) -> ApiResult<(StatusCode, Json<Version>)> {
    service
        .create_version(game_id, input, &actor)
        .map(|v| (StatusCode::CREATED, Json(v)))
        .map_err(release_error)
}

pub async fn get_version(
    State(service): State<Arc<ReleaseService>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Version>> {
    service.get_version(id).map(Json).map_err(release_error)
}

pub async fn update_version(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateVersionInput>,
) -> ApiResult<Json<Version>> {
    service
        .update_version(id, input, &actor)
        .map(Json)
        .map_err(release_error)
}

pub async fn delete_version(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    service
        .delete_version(id, &actor)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(release_error)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionsResponse {
    pub status: VersionStatus,
    pub actions: Vec<ReleaseAction>,
}

pub async fn list_actions(
    State(service): State<Arc<ReleaseService>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionsResponse>> {
    let version = service.get_version(id).map_err(release_error)?;
    Ok(Json(ActionsResponse {
        status: version.status,
        actions: service.valid_actions(version.status),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub action: String,
}

pub async fn transition_version(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Json<Version>> {
    let action = ReleaseAction::from_str(&request.action).ok_or_else(|| {
        release_error(ReleaseError::Validation(format!(
            "unknown action '{}'",
            request.action
        )))
    })?;

    service
        .transition(id, action, &actor)
        .await
        .map(Json)
        .map_err(release_error)
}

// ============================================================
// Audit
// ============================================================

pub async fn query_audit(
    State(service): State<Arc<ReleaseService>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    service.audit_log(&query).map(Json).map_err(release_error)
}

// ============================================================
// Registry
// ============================================================

pub async fn get_registry(State(service): State<Arc<ReleaseService>>) -> Json<RegistrySnapshot> {
    Json(service.registry_snapshot())
}

pub async fn sync_registry(
    State(service): State<Arc<ReleaseService>>,
    ActorId(actor): ActorId,
) -> ApiResult<Json<RegistrySnapshot>> {
    service
        .request_sync(&actor)
        .await
        .map(Json)
        .map_err(release_error)
}

pub async fn get_consumer_registry(
    State(service): State<Arc<ReleaseService>>,
    Path(consumer_id): Path<String>,
) -> Json<Vec<RegistryEntry>> {
    Json(service.registry_for_consumer(&consumer_id))
}
