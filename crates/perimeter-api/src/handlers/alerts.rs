use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use perimeter_shared::{
    AdminActionKind, Alert, AlertFilter, AlertKind, AlertStatus, ListResponse, PerimeterError,
    Severity, UpdateAlertStatusRequest,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::handlers::handle_error;
use crate::middleware::auth::AdminUser;
use crate::services::alert_service::{AlertService, ExportFormat};
use crate::services::audit_service::AuditService;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub severity: Option<Severity>,
    pub kind: Option<AlertKind>,
    pub status: Option<AlertStatus>,
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

impl AlertsQuery {
    fn filter(&self) -> AlertFilter {
        AlertFilter {
            severity: self.severity,
            kind: self.kind,
            status: self.status,
            principal_id: self.principal_id,
            remote_address: self.remote_address.clone(),
            after: self.after,
            before: self.before,
        }
    }
}

pub async fn list_alerts(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<ListResponse<Alert>>, (StatusCode, Json<serde_json::Value>)> {
    let skip = params.skip.unwrap_or(0).max(0);
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let alert_service = AlertService::new(state.db.pool().clone());
    let (results, total) = alert_service
        .query_alerts(&params.filter(), skip, limit)
        .await
        .map_err(handle_error)?;

    Ok(Json(ListResponse {
        skip,
        limit,
        total,
        results,
    }))
}

pub async fn get_alert(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(alert_id): Path<Uuid>,
) -> Result<Json<Alert>, (StatusCode, Json<serde_json::Value>)> {
    let alert_service = AlertService::new(state.db.pool().clone());
    let alert = alert_service
        .get_alert(alert_id)
        .await
        .map_err(handle_error)?
        .ok_or_else(|| handle_error(PerimeterError::NotFound(format!("alert {alert_id}"))))?;
    Ok(Json(alert))
}

pub async fn update_alert_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<UpdateAlertStatusRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let alert_service = AlertService::new(state.db.pool().clone());
    let alert = alert_service
        .update_status(alert_id, request.status)
        .await
        .map_err(handle_error)?;

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::StatusChange,
            &alert_id.to_string(),
            Some(&format!("status -> {:?}", request.status)),
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(serde_json::json!({ "success": true, "alert": alert })))
}

pub async fn clear_alerts(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let alert_service = AlertService::new(state.db.pool().clone());
    let deleted = alert_service
        .delete_by_filter(&params.filter())
        .await
        .map_err(handle_error)?;

    AuditService::new(state.db.pool().clone())
        .append(
            Some(admin.principal_id),
            AdminActionKind::BulkClear,
            "alerts",
            Some(&format!("deleted {deleted} alerts")),
        )
        .await
        .map_err(handle_error)?;

    Ok(Json(
        serde_json::json!({ "success": true, "deleted_count": deleted }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    pub cursor: Option<String>,
    pub severity: Option<Severity>,
    pub kind: Option<AlertKind>,
    pub status: Option<AlertStatus>,
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

pub async fn export_alerts(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<ExportQuery>,
) -> Result<Response, (StatusCode, Json<serde_json::Value>)> {
    let format = match params.format.as_deref() {
        None | Some("json") => ExportFormat::Json,
        Some("csv") => ExportFormat::Csv,
        Some(other) => {
            return Err(handle_error(PerimeterError::InvalidInput(format!(
                "unknown export format {other}"
            ))))
        }
    };
    let filter = AlertFilter {
        severity: params.severity,
        kind: params.kind,
        status: params.status,
        principal_id: params.principal_id,
        remote_address: params.remote_address.clone(),
        after: params.after,
        before: params.before,
    };

    let alert_service = AlertService::new(state.db.pool().clone());
    let chunk = alert_service
        .export(&filter, format, params.cursor.as_deref())
        .await
        .map_err(handle_error)?;

    let (content_type, filename) = match format {
        ExportFormat::Json => ("application/x-ndjson", "alerts.ndjson"),
        ExportFormat::Csv => ("text/csv", "alerts.csv"),
    };

    let mut response = (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        chunk.content,
    )
        .into_response();

    if let Some(cursor) = chunk.next_cursor {
        if let Ok(value) = cursor.parse() {
            response.headers_mut().insert("X-Export-Cursor", value);
        }
    }

    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub after: Option<Uuid>,
}

/// Server-sent events: replay everything newer than `after`, then go live on
/// the broadcast hub. Heartbeat keeps intermediaries from closing the pipe.
pub async fn stream_alerts(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let backlog = match params.after {
        Some(after) => {
            let alert_service = AlertService::new(state.db.pool().clone());
            alert_service.alerts_after(after).await.unwrap_or_default()
        }
        None => Vec::new(),
    };

    let rx = state.stream.subscribe();
    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(alert) => return Some((Ok(alert_event(&alert)), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "alert stream subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let events = stream::iter(
        backlog
            .into_iter()
            .map(|alert| Ok::<_, Infallible>(alert_event(&alert)))
            .collect::<Vec<_>>(),
    )
    .chain(live);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

fn alert_event(alert: &Alert) -> Event {
    Event::default()
        .id(alert.alert_id.to_string())
        .event("alert")
        .json_data(alert)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
