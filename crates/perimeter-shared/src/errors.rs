use thiserror::Error;

/// Machine-readable error codes surfaced in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BannedPrincipal,
    BannedAddress,
    Suspended,
    RateLimited,
    Forbidden,
    InvalidInput,
    Conflict,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BannedPrincipal => "BANNED_PRINCIPAL",
            ErrorCode::BannedAddress => "BANNED_ADDRESS",
            ErrorCode::Suspended => "SUSPENDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum PerimeterError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl PerimeterError {
    /// The error code carried in the `{success:false, error_code, message}` body.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PerimeterError::AuthenticationFailed | PerimeterError::Forbidden(_) => {
                ErrorCode::Forbidden
            }
            PerimeterError::PrincipalNotFound | PerimeterError::NotFound(_) => {
                ErrorCode::InvalidInput
            }
            PerimeterError::InvalidInput(_) => ErrorCode::InvalidInput,
            PerimeterError::Conflict(_) => ErrorCode::Conflict,
            PerimeterError::DatabaseError(_) | PerimeterError::InternalError(_) => {
                ErrorCode::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PerimeterError>;
