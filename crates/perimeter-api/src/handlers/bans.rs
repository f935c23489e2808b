use axum::{extract::State, http::StatusCode, Json};
use perimeter_shared::{
    AdminActionKind, BanRequest, BanSubjectKind, PerimeterError, UnbanRequest,
};
use uuid::Uuid;

use crate::handlers::handle_error;
use crate::middleware::auth::AdminUser;
use crate::services::audit_service::AuditService;
use crate::services::ban_service::BanService;
use crate::state::AppState;

pub async fn create_ban(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(request): Json<BanRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let subject = validate_subject(&state, request.subject_kind, &request.subject)
        .await
        .map_err(handle_error)?;

    let ban = BanService::new(state.db.pool().clone())
        .create_ban(
            request.subject_kind,
            &subject,
            &request.reason,
            request.expires_at,
        )
        .await
        .map_err(handle_error)?;

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::ManualBan,
            &subject,
            Some(&request.reason),
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(serde_json::json!({ "success": true, "ban": ban })))
}

pub async fn remove_ban(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Json(request): Json<UnbanRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let lifted = BanService::new(state.db.pool().clone())
        .lift_ban(request.subject_kind, &request.subject)
        .await
        .map_err(handle_error)?;

    if !lifted {
        return Err(handle_error(PerimeterError::NotFound(format!(
            "no active ban for {}",
            request.subject
        ))));
    }

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::ManualUnban,
            &request.subject,
            None,
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(serde_json::json!({ "success": true })))
}

/// Principal subjects must be real principal ids; address subjects must be
/// non-empty. Returns the canonical subject string.
async fn validate_subject(
    state: &AppState,
    subject_kind: BanSubjectKind,
    subject: &str,
) -> perimeter_shared::Result<String> {
    match subject_kind {
        BanSubjectKind::Principal => {
            let principal_id: Uuid = subject.parse().map_err(|_| {
                PerimeterError::InvalidInput("principal subject must be a UUID".to_string())
            })?;
            state
                .user_service()
                .find_by_id(principal_id)
                .await?
                .ok_or(PerimeterError::PrincipalNotFound)?;
            Ok(principal_id.to_string())
        }
        BanSubjectKind::Address => {
            let trimmed = subject.trim();
            if trimmed.is_empty() {
                return Err(PerimeterError::InvalidInput(
                    "address subject must not be empty".to_string(),
                ));
            }
            Ok(trimmed.to_string())
        }
    }
}
