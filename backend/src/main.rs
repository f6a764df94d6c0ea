use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod analytics;
mod channels;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod sequences;
mod webhooks;

pub use error::{ApiError, ApiResult, AppError};

use analytics::AnalyticsAggregator;
use channels::{EmailProvider, SmsProvider};
use sequences::{MessageDispatcher, SequenceWorker, TriggerService};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub worker: Arc<SequenceWorker>,
    pub triggers: TriggerService,
    pub aggregator: AnalyticsAggregator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let email = EmailProvider::new(&config.smtp)
        .map_err(|e| anyhow::anyhow!("email provider init failed: {}", e))?;
    let sms = SmsProvider::new(&config.sms)
        .map_err(|e| anyhow::anyhow!("sms provider init failed: {}", e))?;

    let dispatcher = MessageDispatcher::new(
        db_pool.clone(),
        email,
        sms,
        config.public_base_url.clone(),
    );
    let worker = Arc::new(SequenceWorker::new(db_pool.clone(), dispatcher));

    // Resume any runs left in flight by a previous process.
    worker
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("run recovery failed: {}", e))?;

    let triggers = TriggerService::new(db_pool.clone(), Arc::clone(&worker));
    let aggregator = AnalyticsAggregator::new(db_pool.clone(), config.raw_retention_days);

    let scheduler = jobs::JobScheduler::new(aggregator.clone()).await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        worker: Arc::clone(&worker),
        triggers,
        aggregator,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Engage Patient Communication API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/sequences", handlers::sequence_routes())
        .nest("/api/v1/triggers", handlers::trigger_routes())
        .nest("/api/v1/runs", handlers::run_routes())
        .nest("/api/v1/analytics", handlers::analytics_routes())
        .nest("/webhooks", webhooks::webhook_routes())
        .merge(webhooks::public_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight runs checkpoint before the process exits.
    worker.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
