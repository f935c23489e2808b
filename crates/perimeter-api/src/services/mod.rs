pub mod alert_service;
pub mod alert_stream;
pub mod audit_service;
pub mod auth_service;
pub mod ban_service;
pub mod classifier;
pub mod forwarder_service;
pub mod identity_service;
pub mod offense_service;
pub mod penalty_service;
pub mod pipeline_service;
pub mod rate_limit;
pub mod subject_locks;
pub mod user_service;
pub mod web_request_service;
