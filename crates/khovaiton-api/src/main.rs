mod config;
mod error;
mod routes;
mod store;

use std::sync::Arc;

use config::ApiConfig;
use routes::{app_router, AppState};
use store::MappingRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "khovaiton_api=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ApiConfig::from_env()?;
    tracing::info!("Starting khovaiton-api with config: {:?}", config);

    let registry = Arc::new(MappingRegistry::open(config.mappings_file.clone()).await?);
    let state = AppState::new(registry);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("khovaiton-api listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
