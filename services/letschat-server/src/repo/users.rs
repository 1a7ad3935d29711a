use sqlx::PgPool;
use uuid::Uuid;

pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub last_online: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn register_user(pool: &PgPool, name: &str, email: &str) -> Result<Uuid, sqlx::Error> {
    let row = sqlx::query!(
        "INSERT INTO users (name, email) VALUES ($1, $2) RETURNING id",
        name,
        email
    )
    .fetch_one(pool)
    .await?;
    Ok(row.id)
}

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<UserRow>, sqlx::Error> {
    let row = sqlx::query_as!(
        UserRow,
        "SELECT id, name, email, last_online FROM users WHERE id = $1",
        id
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRow>, sqlx::Error> {
    let row = sqlx::query_as!(
        UserRow,
        "SELECT id, name, email, last_online FROM users WHERE email = $1",
        email
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Set or clear `last_online`: NULL while a mailbox is open, `now()` once
/// it closes.
pub async fn set_last_online(
    pool: &PgPool,
    user_id: Uuid,
    online_since: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query!(
        "UPDATE users SET last_online = $1, version = version + 1 WHERE id = $2",
        online_since,
        user_id
    )
    .execute(pool)
    .await?;
    Ok(())
}
