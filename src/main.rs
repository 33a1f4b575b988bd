use axum::Router;
use marten::api::{self, ApiState};
use marten::{
    Config, DataMartStore, EngineClient, MessageConsumer, RefreshService, ReportAggregator,
    RetryPolicy, Scheduler, WorkerPool,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marten=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Starting Marten replicator on {}:{}", config.host, config.port);

    // Open the data mart
    let store = Arc::new(DataMartStore::new(&config.database_path)?);
    info!("Data mart at {}", store.db_path);

    // Resolution engine client
    let engine = Arc::new(EngineClient::http(
        config.engine_url.clone(),
        config.engine_api_key.clone(),
        config.engine_timeout,
    ));
    info!("Resolution engine at {}", config.engine_url);

    // Scheduler and worker pool
    let (scheduler, task_rx) = Scheduler::new(
        config.task_queue_capacity,
        config.task_queue_high_water,
        config.task_queue_low_water,
    );
    let refresher = RefreshService::new(store.clone(), engine.clone());
    let aggregator = ReportAggregator::new(store.clone(), engine.clone());
    WorkerPool::start(
        config.worker_parallelism,
        task_rx,
        scheduler.clone(),
        refresher,
        aggregator,
        RetryPolicy {
            limit: config.task_retry_limit,
            base: config.task_retry_base,
        },
    );

    // Message consumers fed by the admin ingress (or any bus adapter
    // pointed at the same channel)
    let (ingest_tx, ingest_rx) = tokio::sync::mpsc::channel(config.task_queue_capacity);
    let consumer = MessageConsumer::new(engine.clone(), scheduler.clone());
    consumer.start(ingest_rx, config.consumer_parallelism);

    // Admin surface
    let state = ApiState {
        store,
        engine,
        scheduler,
        ingest_tx,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(api::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Marten admin surface listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
