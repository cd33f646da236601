//! PrepBuddy API server

use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use prepbuddy_api::{routes::create_router, AppState, Config};
use prepbuddy_billing::{BillingService, PgBillingStore};
use prepbuddy_shared::{create_pool, run_migrations};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("prepbuddy_api=info,prepbuddy_billing=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Database migrations applied");

    let billing = config
        .stripe_config()
        .map(|stripe| BillingService::new(stripe, pool.clone()));
    if billing.is_none() {
        tracing::warn!("Billing disabled (ENABLE_BILLING=false)");
    }

    let bind_address = config.bind_address.clone();
    let cors = cors_layer(&config);
    let state = AppState::new(config, Arc::new(PgBillingStore::new(pool)), billing);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "PrepBuddy API listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
