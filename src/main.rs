//! VeloMarket Order Backend Server
//!
//! Order settlement service for the VeloMarket bicycle marketplace:
//! escrow collection, seller confirmation, fulfillment tracking, and
//! scheduled reservation-expiry and funds-release sweeps.

use axum::http::{HeaderValue, Method};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::{Any, CorsLayer};

use velomarket_server::config::Config;
use velomarket_server::handlers::health_check;
use velomarket_server::middleware::{rate_limit_layer, request_tracing, security_headers, RateLimiter};
use velomarket_server::orders::{OrderService, SettlementScheduler};
use velomarket_server::policy::SystemClock;
use velomarket_server::state::AppState;
use velomarket_server::{db, routes};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    // Connect to the database and bring the schema up to date
    let pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::run_migrations(&pool).await {
        tracing::error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    // Order settlement service
    let order_service = Arc::new(OrderService::from_pool(pool.clone()));

    // Settlement sweep on a cron schedule
    let sweeper = SettlementScheduler::new(order_service.clone(), Arc::new(SystemClock));
    let scheduler = JobScheduler::new()
        .await
        .expect("Failed to create job scheduler");
    let sweep_job = Job::new_async(
        config.settlement_sweep_schedule.as_str(),
        move |_id, _lock| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                sweeper.run_once().await;
            })
        },
    )
    .expect("Invalid settlement sweep schedule");
    scheduler
        .add(sweep_job)
        .await
        .expect("Failed to register settlement sweep");
    scheduler
        .start()
        .await
        .expect("Failed to start job scheduler");
    tracing::info!(
        schedule = %config.settlement_sweep_schedule,
        "Settlement sweep scheduled"
    );

    let app_state = AppState::new(pool.clone(), config.clone(), order_service);

    // Rate limiter with periodic bucket cleanup
    let rate_limiter = RateLimiter::new(config.rate_limit_rps);
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup(Duration::from_secs(600)).await;
        }
    });

    // Create the app router
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(routes::order_routes())
        .with_state(app_state)
        .layer(axum::middleware::from_fn(security_headers))
        .layer(axum::middleware::from_fn(request_tracing))
        .layer(axum::middleware::from_fn(move |req, next| {
            let limiter = rate_limiter.clone();
            rate_limit_layer(limiter)(req, next)
        }))
        .layer(configure_cors(&config));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check at http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind server address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Server shutdown complete");
}

async fn root() -> &'static str {
    "VeloMarket Order API Server"
}

fn configure_cors(config: &Config) -> CorsLayer {
    let allowed = config.cors_allowed_origins.as_deref().unwrap_or_default();

    if allowed.is_empty() {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (permissive)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
