use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use perimeter_api::{config::Config, create_app, database::Database, telemetry, AppState};
use perimeter_api::services::ban_service::BanService;
use perimeter_api::services::forwarder_service::run_forwarder_worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    telemetry::init_telemetry()?;

    let config = Config::from_env()?;
    let database = Database::new(&config.database_url).await?;
    let port = config.port;
    let state = AppState::new(database, Arc::new(config));

    // Background workers: webhook delivery, ban expiry, limiter hygiene.
    tokio::spawn(run_forwarder_worker(state.forwarder_queue.clone()));
    {
        let pool = state.db.pool().clone();
        tokio::spawn(async move {
            let bans = BanService::new(pool);
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                if let Err(e) = bans.sweep_expired().await {
                    tracing::error!(error = %e, "ban expiry sweep failed");
                }
            }
        });
    }
    {
        let limiter = state.rate_limiter.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                limiter.sweep().await;
            }
        });
    }

    let app = create_app(state).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Perimeter API server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    telemetry::shutdown_telemetry();

    result?;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    tracing::info!("Received shutdown signal");
}
