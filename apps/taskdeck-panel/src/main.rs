mod auth;
mod cli;
mod error;
mod handlers;
mod services;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use tracing::info;

use taskdeck_db::store::{PgStore, Store};

use cli::{Cli, Command};
use services::merge_service::MergeService;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub merge_service: MergeService,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set in .env")?;
    if !database_url.starts_with("postgres://") && !database_url.starts_with("postgresql://") {
        anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
    }

    let pool = taskdeck_db::connect(&database_url).await?;

    match cli.command {
        Command::Serve { bind } => serve(pool, database_url, &bind).await,
        Command::ApiKey {
            user,
            name,
            expires_days,
        } => cli::create_api_key(&pool, user, &name, expires_days).await,
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/orgs", get(handlers::api::orgs::list_organizations))
        .route(
            "/api/orgs/merge",
            post(handlers::api::orgs::merge_organizations),
        )
        .route(
            "/api/orgs/merge/{event_id}/revert",
            post(handlers::api::orgs::revert_merge),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve(pool: PgPool, database_url: String, bind: &str) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone(), database_url));
    let state = AppState {
        pool,
        merge_service: MergeService::new(store),
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("taskdeck panel listening on {}", bind);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
