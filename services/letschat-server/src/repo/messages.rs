use letschat_protocol::{Message, Operation};
use sqlx::PgPool;
use uuid::Uuid;

fn operation_to_text(op: Operation) -> &'static str {
    match op {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::UserOnline => "user_online",
        Operation::UserOffline => "user_offline",
        Operation::UserTyping => "user_typing",
        Operation::Local => "create", // never persisted; guarded by callers
    }
}

fn operation_from_text(s: &str) -> Operation {
    match s {
        "update" => Operation::Update,
        "delete" => Operation::Delete,
        "user_online" => Operation::UserOnline,
        "user_offline" => Operation::UserOffline,
        "user_typing" => Operation::UserTyping,
        _ => Operation::Create,
    }
}

pub struct MessageRow {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub body: Option<String>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
    pub operation: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            body: row.body,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            operation: operation_from_text(&row.operation),
        }
    }
}

/// Idempotent upsert by message id, merging business fields rather than
/// overwriting — an `Update` frame (no body) must not blank out the
/// `Create` row's body.
pub async fn upsert(pool: &PgPool, msg: &Message) -> Result<(), sqlx::Error> {
    let operation = operation_to_text(msg.operation);
    sqlx::query!(
        r#"INSERT INTO messages (id, sender_id, receiver_id, body, sent_at, delivered_at, read_at, operation)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
           ON CONFLICT (id) DO UPDATE SET
               body = COALESCE(EXCLUDED.body, messages.body),
               sent_at = COALESCE(messages.sent_at, EXCLUDED.sent_at),
               delivered_at = COALESCE(EXCLUDED.delivered_at, messages.delivered_at),
               read_at = COALESCE(EXCLUDED.read_at, messages.read_at),
               operation = EXCLUDED.operation,
               version = messages.version + 1"#,
        msg.id,
        msg.sender_id,
        msg.receiver_id,
        msg.body,
        msg.sent_at,
        msg.delivered_at,
        msg.read_at,
        operation,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark that this row's frame has been routed to an open mailbox
/// (server-side bookkeeping, distinct from the business `delivered_at`).
pub async fn mark_routed(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query!(
        "UPDATE messages SET routed_at = now() WHERE id = $1 AND routed_at IS NULL",
        id
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Business-level delivery confirmation: a `Create` message routed to an
/// online receiver is delivered at that instant.
pub async fn mark_delivered(
    pool: &PgPool,
    id: Uuid,
    delivered_at: chrono::DateTime<chrono::Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query!(
        "UPDATE messages SET delivered_at = $2 WHERE id = $1 AND delivered_at IS NULL",
        id,
        delivered_at
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Messages persisted for `receiver_id` while it had no open mailbox,
/// ordered by original `sent_at` ascending.
pub async fn get_unrouted_for(
    pool: &PgPool,
    receiver_id: Uuid,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    let rows = sqlx::query_as!(
        MessageRow,
        r#"SELECT id, sender_id, receiver_id, body, sent_at, delivered_at, read_at, operation
           FROM messages
           WHERE receiver_id = $1 AND routed_at IS NULL
           ORDER BY sent_at ASC NULLS LAST"#,
        receiver_id
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Distinct users `user_id` has ever exchanged a message with — used to
/// scope presence broadcasts to users with an open conversation rather
/// than every online user.
pub async fn conversation_partners(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query!(
        r#"SELECT DISTINCT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END AS "partner!"
           FROM messages
           WHERE sender_id = $1 OR receiver_id = $1"#,
        user_id
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.partner).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_text_roundtrips_for_all_non_local_variants() {
        for op in [
            Operation::Create,
            Operation::Update,
            Operation::Delete,
            Operation::UserOnline,
            Operation::UserOffline,
            Operation::UserTyping,
        ] {
            assert_eq!(operation_from_text(operation_to_text(op)), op);
        }
    }
}
