//! Full-stack enforcement tests: requests go through `create_app`, so the
//! middleware pre-check, classification, and the auth handlers all run.
//! Gated on `DATABASE_URL_TEST`, like the other integration suites.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use perimeter_api::config::Config;
use perimeter_api::database::Database;
use perimeter_api::services::auth_service::AuthService;
use perimeter_api::services::offense_service::OffenseService;
use perimeter_api::services::user_service::UserService;
use perimeter_api::{create_app, AppState};
use perimeter_shared::RegisterRequest;
use tower::ServiceExt;
use uuid::Uuid;

fn test_config() -> Config {
    Config {
        database_url: String::new(),
        jwt_secret: "test-secret-key".to_string(),
        port: 0,
        suspend_threshold: 2,
        ban_threshold: 10,
        addr_burst_threshold: 10,
        addr_ban_duration_secs: 3600,
        dedupe_window_secs: 5,
        rate_limit_n: 100,
        rate_limit_window_secs: 60,
        testing: false,
        whitelist_addrs: vec!["127.0.0.1/32".parse().unwrap()],
        forwarder_queue_cap: 100,
    }
}

async fn test_state() -> Option<AppState> {
    let url = match std::env::var("DATABASE_URL_TEST") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: DATABASE_URL_TEST not set");
            return None;
        }
    };
    let database = Database::new(&url)
        .await
        .expect("Failed to connect to test database");
    Some(AppState::new(database, Arc::new(test_config())))
}

async fn register_victim(state: &AppState) -> (Uuid, String) {
    let email = format!("victim-{}@x.test", Uuid::new_v4().simple());
    let users = UserService::new(
        state.db.pool().clone(),
        AuthService::new("test-secret-key".to_string()),
    );
    let principal = users
        .create_principal(RegisterRequest {
            email: email.clone(),
            display_name: "Victim".to_string(),
            password: "correct-horse-9".to_string(),
        })
        .await
        .expect("failed to register victim");
    (principal.principal_id, email)
}

fn login_request(email: &str, password: &str, address: &str) -> Request<Body> {
    let body = serde_json::json!({ "email": email, "password": password }).to_string();
    Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", address)
        .body(Body::from(body))
        .unwrap()
}

fn unique_address() -> String {
    format!("addr-{}", Uuid::new_v4().simple())
}

/// S1 end to end: an injection payload on the login route fails
/// authentication normally (401, not an enforcement 403), produces exactly
/// one alert attributed to the victim, and leaves the account active.
#[tokio::test]
async fn sqli_login_fails_normally_with_one_alert() {
    let Some(state) = test_state().await else { return };
    let (victim, email) = register_victim(&state).await;
    let app = create_app(state.clone()).await;

    let response = app
        .oneshot(login_request(&email, "' OR 1=1 --", &unique_address()))
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        StatusCode::UNAUTHORIZED,
        "auth must fail normally, not via an enforcement rejection"
    );

    let offense = OffenseService::new(state.db.pool().clone());
    assert_eq!(
        offense.count_all(victim).await.unwrap(),
        1,
        "one attack event, one alert row"
    );
    let kind = sqlx::query_scalar::<_, String>(
        "SELECT kind FROM alerts WHERE principal_id = $1",
    )
    .bind(victim)
    .fetch_one(state.db.pool())
    .await
    .unwrap();
    assert_eq!(kind, "sql_injection");

    let is_active =
        sqlx::query_scalar::<_, bool>("SELECT is_active FROM principals WHERE principal_id = $1")
            .bind(victim)
            .fetch_one(state.db.pool())
            .await
            .unwrap();
    assert!(is_active, "a single alert must not suspend the account");
}

/// A plain wrong password (no attack payload) is a brute-force offense,
/// attributed to the targeted account.
#[tokio::test]
async fn wrong_password_login_emits_brute_force() {
    let Some(state) = test_state().await else { return };
    let (victim, email) = register_victim(&state).await;
    let app = create_app(state.clone()).await;

    let response = app
        .oneshot(login_request(&email, "just-a-bad-guess", &unique_address()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let offense = OffenseService::new(state.db.pool().clone());
    assert_eq!(offense.count_all(victim).await.unwrap(), 1);
    let kind = sqlx::query_scalar::<_, String>(
        "SELECT kind FROM alerts WHERE principal_id = $1",
    )
    .bind(victim)
    .fetch_one(state.db.pool())
    .await
    .unwrap();
    assert_eq!(kind, "brute_force");
}

/// A correct login from a clean source passes the gate untouched.
#[tokio::test]
async fn clean_login_succeeds() {
    let Some(state) = test_state().await else { return };
    let (victim, email) = register_victim(&state).await;
    let app = create_app(state.clone()).await;

    let response = app
        .oneshot(login_request(&email, "correct-horse-9", &unique_address()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let offense = OffenseService::new(state.db.pool().clone());
    assert_eq!(offense.count_all(victim).await.unwrap(), 0);
}
