use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::{
    handlers::{alerts, auth, bans, forwarders, requests, users},
    state::AppState,
};

pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .nest("/auth", auth_routes())
        .nest("/admin", admin_routes())
}

fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/me", get(auth::me))
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        // Alerts
        .route("/alerts", get(alerts::list_alerts).delete(alerts::clear_alerts))
        .route("/alerts/stream", get(alerts::stream_alerts))
        .route("/alerts/export", get(alerts::export_alerts))
        .route("/alerts/:alert_id", get(alerts::get_alert))
        .route("/alerts/:alert_id/status", patch(alerts::update_alert_status))
        // Bans
        .route("/ban", post(bans::create_ban))
        .route("/unban", post(bans::remove_ban))
        // Principals
        .route("/users", get(users::list_users))
        .route("/users/:principal_id/activity", get(users::user_activity))
        // Incident forwarders
        .route(
            "/forwarders",
            get(forwarders::list_forwarders).post(forwarders::create_forwarder),
        )
        .route(
            "/forwarders/:forwarder_id",
            patch(forwarders::update_forwarder).delete(forwarders::delete_forwarder),
        )
        .route("/forwarders/:forwarder_id/test", post(forwarders::test_forwarder))
        // Request introspection
        .route(
            "/requests",
            get(requests::list_requests).delete(requests::clear_requests),
        )
}
