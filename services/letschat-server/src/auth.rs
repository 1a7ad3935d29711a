//! Minimal bearer-token auth. Real registration, password hashing, and OTP
//! activation are owned by an external service; this module only resolves
//! an already-issued token to a user id so the WebSocket core has
//! something to authenticate against.

use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

pub struct TokenClaims {
    pub user_id: Uuid,
}

fn hash_token(raw_token: &str) -> Vec<u8> {
    Sha256::digest(raw_token.as_bytes()).to_vec()
}

pub async fn validate_token(pool: &PgPool, raw_token: &str) -> Option<TokenClaims> {
    let hash = hash_token(raw_token);
    let row = sqlx::query!(
        r#"SELECT user_id FROM device_tokens WHERE token_hash = $1 AND revoked_at IS NULL"#,
        hash
    )
    .fetch_optional(pool)
    .await
    .ok()??;
    Some(TokenClaims {
        user_id: row.user_id,
    })
}

/// Issue a new bearer token for `user_id`. Stands in for the externally
/// owned `POST /tokens/authentication` flow (no password check here — see
/// module doc comment).
pub async fn issue_token(pool: &PgPool, user_id: Uuid) -> Result<String, sqlx::Error> {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let raw_token = hex::encode(raw);
    let hash = hash_token(&raw_token);
    sqlx::query!(
        "INSERT INTO device_tokens (user_id, token_hash) VALUES ($1, $2)",
        user_id,
        hash
    )
    .execute(pool)
    .await?;
    Ok(raw_token)
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
