pub mod alerts;
pub mod auth;
pub mod bans;
pub mod forwarders;
pub mod health;
pub mod requests;
pub mod users;

use axum::{http::StatusCode, Json};
use perimeter_shared::PerimeterError;

/// Map a pipeline error onto the `{success, error_code, message}` envelope.
pub(crate) fn handle_error(error: PerimeterError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        PerimeterError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        PerimeterError::Forbidden(_) => StatusCode::FORBIDDEN,
        PerimeterError::PrincipalNotFound | PerimeterError::NotFound(_) => StatusCode::NOT_FOUND,
        PerimeterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PerimeterError::Conflict(_) => StatusCode::CONFLICT,
        PerimeterError::DatabaseError(_) | PerimeterError::InternalError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error_code": error.error_code().as_str(),
            "message": error.to_string(),
        })),
    )
}
