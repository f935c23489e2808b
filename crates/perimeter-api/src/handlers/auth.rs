use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use perimeter_shared::{
    AlertContext, AlertKind, AuthResponse, BanSubjectKind, ErrorCode, LoginRequest,
    PerimeterError, Principal, RegisterRequest, Severity,
};

use crate::handlers::handle_error;
use crate::middleware::auth::AuthUser;
use crate::services::ban_service::BanService;
use crate::services::classifier::{self, ClassifyInput};
use crate::state::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), (StatusCode, Json<serde_json::Value>)> {
    let principal = state
        .user_service()
        .create_principal(request)
        .await
        .map_err(handle_error)?;

    let token = state
        .auth_service()
        .generate_token(principal.principal_id)
        .map_err(handle_error)?;

    Ok((StatusCode::CREATED, Json(AuthResponse { token, principal })))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<LoginRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), (StatusCode, Json<serde_json::Value>)> {
    let principal = state
        .user_service()
        .verify_credentials(&request.email, &request.password)
        .await
        .map_err(handle_error)?;

    match principal {
        Some(principal) if principal.is_active => {
            let token = state
                .auth_service()
                .generate_token(principal.principal_id)
                .map_err(handle_error)?;
            Ok((StatusCode::OK, Json(AuthResponse { token, principal })))
        }
        Some(principal) => {
            // Correct password, inactive account: distinguish ban from
            // suspension in the reason code.
            let banned = BanService::new(state.db.pool().clone())
                .active_ban(BanSubjectKind::Principal, &principal.principal_id.to_string())
                .await
                .map(|ban| ban.is_some())
                .unwrap_or(false);
            let code = if banned {
                ErrorCode::BannedPrincipal
            } else {
                ErrorCode::Suspended
            };
            Err((
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "success": false,
                    "error_code": code.as_str(),
                    "message": "Account is not active",
                })),
            ))
        }
        None => {
            emit_brute_force(&state, &request, &headers, connect_info).await;
            Err(handle_error(PerimeterError::AuthenticationFailed))
        }
    }
}

pub async fn me(AuthUser(principal): AuthUser) -> Json<Principal> {
    Json(principal)
}

/// A failed credential check is an offense in its own right, attributed to
/// the targeted account when the directory knows it. When the credentials
/// themselves carry an attack payload the enforcement middleware already
/// records that finding; emitting brute force too would double-count one
/// attack event.
async fn emit_brute_force(
    state: &AppState,
    request: &LoginRequest,
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) {
    let email = &request.email;
    let probe = format!("email={} password={}", request.email, request.password);
    let already_classified = !state
        .classifier
        .classify(&ClassifyInput {
            method: "POST",
            route: "/auth/login",
            query: "",
            body: probe.as_bytes(),
            user_agent: None,
            referer: None,
            remote_address: None,
        })
        .is_empty();
    if already_classified {
        return;
    }

    let victim = state
        .user_service()
        .find_by_email(email)
        .await
        .ok()
        .flatten()
        .map(|p| p.principal_id);

    let remote_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()));

    // Minute-bucketed fragment: repeats inside the dedupe window collapse,
    // attempts a minute apart count separately.
    let finding = classifier::finding_for(
        AlertKind::BruteForce,
        Severity::Medium,
        &format!(
            "failed credential check for {} @ {}",
            email.trim().to_lowercase(),
            Utc::now().format("%Y-%m-%d %H:%M")
        ),
    );
    let ctx = AlertContext {
        principal_id: victim,
        remote_address,
        route: "/auth/login".to_string(),
        method: "POST".to_string(),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        payload: format!("failed credential check for {email}"),
        metadata: serde_json::json!({ "attempted_email": email }),
    };

    state.pipeline().process_findings(&[finding], &ctx).await;
}
