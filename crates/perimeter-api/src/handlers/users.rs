use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use perimeter_shared::{
    AlertFilter, BanSubjectKind, ListResponse, PerimeterError, PrincipalActivity,
    PrincipalRole, PrincipalSummary,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::handle_error;
use crate::middleware::auth::AdminUser;
use crate::services::alert_service::AlertService;
use crate::services::ban_service::BanService;
use crate::services::offense_service::OffenseService;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UsersQuery {
    pub q: Option<String>,
    pub role: Option<PrincipalRole>,
    pub active: Option<bool>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<UsersQuery>,
) -> Result<Json<ListResponse<PrincipalSummary>>, (StatusCode, Json<serde_json::Value>)> {
    let skip = params.skip.unwrap_or(0).max(0);
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let (principals, total) = state
        .user_service()
        .list_principals(params.q.as_deref(), params.role, params.active, skip, limit)
        .await
        .map_err(handle_error)?;

    let offense = OffenseService::new(state.db.pool().clone());
    let bans = BanService::new(state.db.pool().clone());

    let mut results = Vec::with_capacity(principals.len());
    for principal in principals {
        let offense_count = offense
            .count_all_cached(principal.principal_id)
            .await
            .map_err(handle_error)?;
        let is_banned = bans
            .active_ban(BanSubjectKind::Principal, &principal.principal_id.to_string())
            .await
            .map_err(handle_error)?
            .is_some();
        let is_suspended = !principal.is_active && !is_banned;
        results.push(PrincipalSummary {
            principal,
            offense_count,
            is_suspended,
            is_banned,
        });
    }

    Ok(Json(ListResponse {
        skip,
        limit,
        total,
        results,
    }))
}

pub async fn user_activity(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(principal_id): Path<Uuid>,
) -> Result<Json<PrincipalActivity>, (StatusCode, Json<serde_json::Value>)> {
    let principal = state
        .user_service()
        .find_by_id(principal_id)
        .await
        .map_err(handle_error)?
        .ok_or_else(|| handle_error(PerimeterError::PrincipalNotFound))?;

    let filter = AlertFilter {
        principal_id: Some(principal_id),
        ..AlertFilter::default()
    };
    let alert_service = AlertService::new(state.db.pool().clone());
    let (activity, attack_count) = alert_service
        .query_alerts(&filter, 0, 50)
        .await
        .map_err(handle_error)?;

    let is_banned = BanService::new(state.db.pool().clone())
        .active_ban(BanSubjectKind::Principal, &principal_id.to_string())
        .await
        .map_err(handle_error)?
        .is_some();

    Ok(Json(PrincipalActivity {
        activity,
        attack_count,
        is_suspended: !principal.is_active && !is_banned,
        is_banned,
    }))
}
