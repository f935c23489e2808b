pub mod config;
pub mod database;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;

pub use routes::create_api_routes;
pub use state::AppState;

use axum::{http::StatusCode, response::Response, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

async fn metrics_handler() -> Response<String> {
    match telemetry::get_metrics() {
        Ok(metrics) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(metrics)
            .unwrap(),
        Err(e) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(format!("Failed to get metrics: {}", e))
            .unwrap(),
    }
}

pub async fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(metrics_handler))
        .merge(create_api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(telemetry::trace_middleware))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::enforcement::enforce,
                ))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
