use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use perimeter_shared::{
    AdminActionKind, CreateForwarderRequest, ForwarderConfig, PerimeterError,
    UpdateForwarderRequest,
};
use uuid::Uuid;

use crate::handlers::handle_error;
use crate::middleware::auth::AdminUser;
use crate::services::audit_service::AuditService;
use crate::services::forwarder_service::ForwarderService;
use crate::state::AppState;

pub async fn list_forwarders(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<ForwarderConfig>>, (StatusCode, Json<serde_json::Value>)> {
    let configs = ForwarderService::new(state.db.pool().clone())
        .list_forwarders()
        .await
        .map_err(handle_error)?;
    Ok(Json(configs))
}

pub async fn create_forwarder(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(request): Json<CreateForwarderRequest>,
) -> Result<(StatusCode, Json<ForwarderConfig>), (StatusCode, Json<serde_json::Value>)> {
    let config = ForwarderService::new(state.db.pool().clone())
        .create_forwarder(request)
        .await
        .map_err(handle_error)?;

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::ForwarderCreate,
            &config.forwarder_id.to_string(),
            Some(&config.name),
        )
        .await
        .map_err(handle_error)?;

    Ok((StatusCode::CREATED, Json(config)))
}

pub async fn update_forwarder(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(forwarder_id): Path<Uuid>,
    Json(request): Json<UpdateForwarderRequest>,
) -> Result<Json<ForwarderConfig>, (StatusCode, Json<serde_json::Value>)> {
    let config = ForwarderService::new(state.db.pool().clone())
        .update_forwarder(forwarder_id, request)
        .await
        .map_err(handle_error)?;

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::ForwarderUpdate,
            &forwarder_id.to_string(),
            None,
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(config))
}

pub async fn delete_forwarder(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(forwarder_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let deleted = ForwarderService::new(state.db.pool().clone())
        .delete_forwarder(forwarder_id)
        .await
        .map_err(handle_error)?;

    if !deleted {
        return Err(handle_error(PerimeterError::NotFound(format!(
            "forwarder {forwarder_id}"
        ))));
    }

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::ForwarderDelete,
            &forwarder_id.to_string(),
            None,
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn test_forwarder(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(forwarder_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let reachable = ForwarderService::new(state.db.pool().clone())
        .test_ping(forwarder_id)
        .await
        .map_err(handle_error)?;
    Ok(Json(
        serde_json::json!({ "success": true, "reachable": reachable }),
    ))
}
