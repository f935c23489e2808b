use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use perimeter_shared::{AdminActionKind, ListResponse, WebRequest};
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::handle_error;
use crate::middleware::auth::AdminUser;
use crate::services::audit_service::AuditService;
use crate::services::web_request_service::{WebRequestFilter, WebRequestService};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RequestsQuery {
    pub method: Option<String>,
    pub status: Option<i32>,
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

impl RequestsQuery {
    fn filter(&self) -> WebRequestFilter {
        WebRequestFilter {
            method: self.method.clone(),
            status: self.status,
            principal_id: self.principal_id,
            remote_address: self.remote_address.clone(),
            after: self.after,
            before: self.before,
        }
    }
}

pub async fn list_requests(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<RequestsQuery>,
) -> Result<Json<ListResponse<WebRequest>>, (StatusCode, Json<serde_json::Value>)> {
    let skip = params.skip.unwrap_or(0).max(0);
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let (results, total) = WebRequestService::new(state.db.pool().clone())
        .query_requests(&params.filter(), skip, limit)
        .await
        .map_err(handle_error)?;

    Ok(Json(ListResponse {
        skip,
        limit,
        total,
        results,
    }))
}

pub async fn clear_requests(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(params): Query<RequestsQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let deleted = WebRequestService::new(state.db.pool().clone())
        .delete_by_filter(&params.filter())
        .await
        .map_err(handle_error)?;

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::BulkClear,
            "web_requests",
            Some(&format!("deleted {deleted} request rows")),
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(
        serde_json::json!({ "success": true, "deleted_count": deleted }),
    ))
}
