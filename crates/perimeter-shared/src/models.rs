use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use uuid::Uuid;

use crate::alert_models::{Alert, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PrincipalRole {
    Admin,
    User,
    Org,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Principal {
    pub principal_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: PrincipalRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BanSubjectKind {
    Principal,
    Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ban {
    pub ban_id: Uuid,
    pub subject_kind: BanSubjectKind,
    pub subject: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdminActionKind {
    AutoSuspend,
    AutoBan,
    AutoIpBan,
    ManualBan,
    ManualUnban,
    StatusChange,
    BulkClear,
    ForwarderCreate,
    ForwarderUpdate,
    ForwarderDelete,
}

/// Append-only audit row for every state-changing admin call and every
/// automatic penalty transition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminAction {
    pub action_id: Uuid,
    pub actor_principal_id: Option<Uuid>,
    pub kind: AdminActionKind,
    pub target: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ForwarderConfig {
    pub forwarder_id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub secret: String,
    pub event_kinds: Vec<String>,
    pub min_severity: Severity,
    pub enabled: bool,
    pub max_retries: i32,
    pub timeout_secs: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per inbound request, written by the enforcement middleware for
/// operator introspection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebRequest {
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: i32,
    pub latency_ms: i64,
    pub remote_address: String,
    pub principal_id: Option<Uuid>,
}

// Request/response DTOs for the HTTP surface

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub principal: Principal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BanRequest {
    pub subject_kind: BanSubjectKind,
    pub subject: String,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnbanRequest {
    pub subject_kind: BanSubjectKind,
    pub subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateForwarderRequest {
    pub name: String,
    pub endpoint: String,
    pub secret: String,
    pub event_kinds: Vec<String>,
    pub min_severity: Severity,
    pub enabled: Option<bool>,
    pub max_retries: Option<i32>,
    pub timeout_secs: Option<i32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateForwarderRequest {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub secret: Option<String>,
    pub event_kinds: Option<Vec<String>>,
    pub min_severity: Option<Severity>,
    pub enabled: Option<bool>,
    pub max_retries: Option<i32>,
    pub timeout_secs: Option<i32>,
}

/// Listing envelope returned by every paged admin endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub skip: i64,
    pub limit: i64,
    pub total: i64,
    pub results: Vec<T>,
}

/// Principal row decorated with enforcement state for the admin listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct PrincipalSummary {
    #[serde(flatten)]
    pub principal: Principal,
    pub offense_count: i64,
    pub is_suspended: bool,
    pub is_banned: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrincipalActivity {
    pub activity: Vec<Alert>,
    pub attack_count: i64,
    pub is_suspended: bool,
    pub is_banned: bool,
}
