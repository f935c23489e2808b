use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// Multiplier applied to a finding's score base when computing risk.
    pub fn multiplier(&self) -> f64 {
        match self {
            Severity::Low => 0.5,
            Severity::Medium => 0.75,
            Severity::High => 1.0,
            Severity::Critical => 1.25,
        }
    }
}

/// Closed set of attack families the pipeline recognizes. New kinds are
/// additive only; existing slugs are part of the persisted format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Xss,
    SqlInjection,
    CommandInjection,
    BruteForce,
    UnauthorizedAccess,
    RateLimitExceeded,
    ApiAbuse,
    PenTestTool,
    ForwarderOverflow,
    Internal,
}

impl AlertKind {
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "xss" => Some(AlertKind::Xss),
            "sql_injection" => Some(AlertKind::SqlInjection),
            "command_injection" => Some(AlertKind::CommandInjection),
            "brute_force" => Some(AlertKind::BruteForce),
            "unauthorized_access" => Some(AlertKind::UnauthorizedAccess),
            "rate_limit_exceeded" => Some(AlertKind::RateLimitExceeded),
            "api_abuse" => Some(AlertKind::ApiAbuse),
            "pen_test_tool" => Some(AlertKind::PenTestTool),
            "forwarder_overflow" => Some(AlertKind::ForwarderOverflow),
            "internal" => Some(AlertKind::Internal),
            _ => None,
        }
    }

    pub fn as_slug(&self) -> &'static str {
        match self {
            AlertKind::Xss => "xss",
            AlertKind::SqlInjection => "sql_injection",
            AlertKind::CommandInjection => "command_injection",
            AlertKind::BruteForce => "brute_force",
            AlertKind::UnauthorizedAccess => "unauthorized_access",
            AlertKind::RateLimitExceeded => "rate_limit_exceeded",
            AlertKind::ApiAbuse => "api_abuse",
            AlertKind::PenTestTool => "pen_test_tool",
            AlertKind::ForwarderOverflow => "forwarder_overflow",
            AlertKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Reviewed,
    Ignored,
    FalsePositive,
    Banned,
}

impl AlertStatus {
    /// Once an alert leaves `New` its status is a sink; it never reverts.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AlertStatus::New)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub alert_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub route: String,
    pub method: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub risk_score: i32,
    pub signature: String,
    pub payload: String,
    pub user_agent: Option<String>,
    pub status: AlertStatus,
    pub metadata: serde_json::Value,
}

/// One classified hit, before it becomes a persisted alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: AlertKind,
    pub severity: Severity,
    pub signature: String,
    pub fragment: String,
    pub score_base: u8,
}

/// Request-side context attached to every alert the pipeline writes.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub route: String,
    pub method: String,
    pub user_agent: Option<String>,
    /// Offending request excerpt; bounded and sanitized before persisting.
    pub payload: String,
    pub metadata: serde_json::Value,
}

/// Filter shared by the listing, export, and bulk-clear surfaces.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub kind: Option<AlertKind>,
    pub status: Option<AlertStatus>,
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateAlertStatusRequest {
    pub status: AlertStatus,
}
