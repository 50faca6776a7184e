use anyhow::{Context, Result};
use axum::http::HeaderMap;
use chrono::Utc;
use sqlx::PgPool;

use taskdeck_db::models::api_key::ApiKey;

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolves the bearer token to a user id. Tokens are stored hashed, so every
/// active key is checked until one verifies. `Ok(None)` means the token is
/// missing or matches nothing; a store failure surfaces as an error.
pub async fn resolve_actor(pool: &PgPool, headers: &HeaderMap) -> Result<Option<i64>> {
    let Some(token) = extract_bearer_token(headers) else {
        return Ok(None);
    };
    if token.trim().is_empty() {
        return Ok(None);
    }

    let keys: Vec<ApiKey> = sqlx::query_as("SELECT * FROM api_keys WHERE is_active = TRUE")
        .fetch_all(pool)
        .await
        .context("Failed to fetch API keys")?;

    for key in keys {
        if let Some(expires_at) = key.expires_at {
            if expires_at < Utc::now() {
                continue;
            }
        }
        if bcrypt::verify(token, &key.key_hash).unwrap_or(false) {
            return Ok(Some(key.user_id));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bearer(token: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_token_is_extracted_from_authorization_header() {
        assert_eq!(extract_bearer_token(&bearer("abc123")), Some("abc123"));
    }

    #[test]
    fn non_bearer_schemes_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic abc123"));
        assert_eq!(extract_bearer_token(&headers), None);
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn missing_token_is_anonymous_not_an_error() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/taskdeck")
            .unwrap();
        // No Authorization header: resolved without ever touching the store.
        let actor = resolve_actor(&pool, &HeaderMap::new()).await.unwrap();
        assert_eq!(actor, None);
    }

    #[tokio::test]
    async fn store_failure_propagates_instead_of_masquerading_as_unauthorized() {
        // Port 1 is never a reachable Postgres; the key query must fail.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/taskdeck")
            .unwrap();
        let result = resolve_actor(&pool, &bearer("sometoken")).await;
        assert!(result.is_err());
    }
}
