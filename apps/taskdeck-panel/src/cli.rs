use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rand::Rng;
use rand::distr::Alphanumeric;
use sqlx::PgPool;

#[derive(Parser)]
#[command(name = "taskdeck-panel", about = "Taskdeck control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP API server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Issue a bearer API key for a user. The token is printed once; only its
    /// hash is stored.
    ApiKey {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        expires_days: Option<i64>,
    },
}

pub async fn create_api_key(
    pool: &PgPool,
    user_id: i64,
    name: &str,
    expires_days: Option<i64>,
) -> Result<()> {
    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    let hash = bcrypt::hash(&token, bcrypt::DEFAULT_COST).context("Failed to hash API key")?;
    let expires_at = expires_days.map(|days| Utc::now() + Duration::days(days));

    sqlx::query(
        "INSERT INTO api_keys (user_id, name, key_hash, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(user_id)
    .bind(name)
    .bind(&hash)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("Failed to store API key")?;

    println!("API key '{}' for user {}: {}", name, user_id, token);
    println!("Save it now; it cannot be recovered later.");
    Ok(())
}
