use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use perimeter_shared::{ErrorCode, Principal, PrincipalRole};
use uuid::Uuid;

use crate::state::AppState;

type Rejection = (StatusCode, Json<serde_json::Value>);

fn reject(status: StatusCode, code: ErrorCode, message: &str) -> Rejection {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error_code": code.as_str(),
            "message": message,
        })),
    )
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Authenticated principal. Suspended accounts do not authenticate.
pub struct AuthUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Rejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            reject(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Forbidden,
                "Missing authorization header",
            )
        })?;

        let claims = state.auth_service().verify_token(token).map_err(|_| {
            reject(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Forbidden,
                "Invalid token",
            )
        })?;

        let principal_id = Uuid::parse_str(&claims.sub).map_err(|_| {
            reject(
                StatusCode::UNAUTHORIZED,
                ErrorCode::Forbidden,
                "Invalid principal id in token",
            )
        })?;

        let principal = state
            .user_service()
            .find_by_id(principal_id)
            .await
            .map_err(|_| {
                reject(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Internal,
                    "Database error",
                )
            })?
            .ok_or_else(|| {
                reject(
                    StatusCode::UNAUTHORIZED,
                    ErrorCode::Forbidden,
                    "Principal not found",
                )
            })?;

        if !principal.is_active {
            return Err(reject(
                StatusCode::FORBIDDEN,
                ErrorCode::Suspended,
                "Account is suspended",
            ));
        }

        Ok(AuthUser(principal))
    }
}

/// Admin guard: a plain role check on top of `AuthUser`.
pub struct AdminUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = Rejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(principal) = AuthUser::from_request_parts(parts, state).await?;
        if principal.role != PrincipalRole::Admin {
            return Err(reject(
                StatusCode::FORBIDDEN,
                ErrorCode::Forbidden,
                "Admin role required",
            ));
        }
        Ok(AdminUser(principal))
    }
}
