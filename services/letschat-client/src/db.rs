use letschat_protocol::{Confirmation, Message, Operation, PageMetadata};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("EditConflict: stale version for message {0}")]
    EditConflict(Uuid),
    #[error("RecordNotFound")]
    RecordNotFound,
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub server_url: String,
    pub token: String,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub body: Option<String>,
    /// When this row was first drafted locally. Unlike `sent_at` (cleared
    /// to `None` whenever a send attempt is unacked) this never changes
    /// once set, so the reconciler can replay a retried send with its
    /// original timestamp.
    pub drafted_at: chrono::DateTime<chrono::Utc>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
    pub operation: Operation,
    pub confirmation: Confirmation,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub user_id: Uuid,
    pub username: String,
    pub latest_msg: Option<String>,
    pub latest_msg_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_online: Option<chrono::DateTime<chrono::Utc>>,
    pub unread_count: i64,
}

fn operation_to_text(op: Operation) -> &'static str {
    match op {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::UserOnline => "user_online",
        Operation::UserOffline => "user_offline",
        Operation::UserTyping => "user_typing",
        Operation::Local => "create",
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

fn confirmation_to_i64(c: Confirmation) -> i64 {
    match c {
        Confirmation::None => 0,
        Confirmation::DeliveredConfirmed => 1,
        Confirmation::ReadConfirmed => 2,
    }
}

fn confirmation_from_i64(v: i64) -> Confirmation {
    match v {
        1 => Confirmation::DeliveredConfirmed,
        2 => Confirmation::ReadConfirmed,
        _ => Confirmation::None,
    }
}

fn row_to_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    let id: String = row.get(0)?;
    let sender_id: String = row.get(1)?;
    let receiver_id: String = row.get(2)?;
    let drafted_at: String = row.get(4)?;
    let operation: String = row.get(8)?;
    Ok(MessageRow {
        id: id.parse().unwrap_or_default(),
        sender_id: sender_id.parse().unwrap_or_default(),
        receiver_id: receiver_id.parse().unwrap_or_default(),
        body: row.get(3)?,
        drafted_at: drafted_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
        sent_at: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| s.parse().ok()),
        delivered_at: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| s.parse().ok()),
        read_at: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| s.parse().ok()),
        operation: operation_from_text(&operation),
        confirmation: confirmation_from_i64(row.get(9)?),
        version: row.get(10)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, body, drafted_at, sent_at, delivered_at, read_at, operation, confirmation, version";

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> DbResult<Self> {
        let c = Connection::open(path)?;
        let d = Self { conn: c };
        d.apply_pragmas()?;
        d.apply_schema()?;
        d.integrity_check()?;
        Ok(d)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let c = Connection::open_in_memory()?;
        let d = Self { conn: c };
        d.apply_pragmas()?;
        d.apply_schema()?;
        d.integrity_check()?;
        Ok(d)
    }

    pub fn integrity_check(&self) -> DbResult<()> {
        let r: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(DbError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    fn apply_pragmas(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn load_profile(&self) -> DbResult<Option<Profile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT server_url, token, user_id, name, email FROM profile LIMIT 1")?;
        let mut rows = stmt.query_map([], |r| {
            let user_id: String = r.get(2)?;
            Ok(Profile {
                server_url: r.get(0)?,
                token: r.get(1)?,
                user_id: user_id.parse().unwrap_or_default(),
                name: r.get(3)?,
                email: r.get(4)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn save_profile(&self, profile: &Profile) -> DbResult<()> {
        self.conn.execute_batch("DELETE FROM profile")?;
        self.conn.execute(
            "INSERT INTO profile (server_url, token, user_id, name, email) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                profile.server_url,
                profile.token,
                profile.user_id.to_string(),
                profile.name,
                profile.email,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_user(
        &self,
        id: Uuid,
        name: &str,
        email: &str,
        last_online: Option<chrono::DateTime<chrono::Utc>>,
    ) -> DbResult<()> {
        self.conn.execute(
            "INSERT INTO users (id, name, email, last_online) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 last_online = excluded.last_online,
                 version = users.version + 1",
            rusqlite::params![id.to_string(), name, email, last_online.map(|t| t.to_rfc3339())],
        )?;
        Ok(())
    }

    /// Updates presence for a user already known locally; a no-op if the
    /// user has no row yet (mirrors the original client only patching
    /// conversations already present in its list, not inserting new ones).
    pub fn set_user_last_online(
        &self,
        id: Uuid,
        last_online: Option<chrono::DateTime<chrono::Utc>>,
    ) -> DbResult<()> {
        self.conn.execute(
            "UPDATE users SET last_online = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), last_online.map(|t| t.to_rfc3339())],
        )?;
        Ok(())
    }

    /// Upsert by `id`. On an insert of a `Create`
    /// message not sent by `current_user`, the caller is responsible for
    /// incrementing the peer's unread count — `conversations` here is
    /// recomputed by query, so there is nothing to bump separately.
    pub fn save_msg(&self, msg: &MessageRow) -> DbResult<()> {
        self.conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, body, drafted_at, sent_at, delivered_at, read_at, operation, confirmation, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 body = COALESCE(excluded.body, messages.body),
                 sent_at = excluded.sent_at,
                 delivered_at = COALESCE(excluded.delivered_at, messages.delivered_at),
                 read_at = COALESCE(excluded.read_at, messages.read_at),
                 operation = excluded.operation,
                 confirmation = excluded.confirmation,
                 version = messages.version + 1",
            rusqlite::params![
                msg.id.to_string(),
                msg.sender_id.to_string(),
                msg.receiver_id.to_string(),
                msg.body,
                msg.drafted_at.to_rfc3339(),
                msg.sent_at.map(|t| t.to_rfc3339()),
                msg.delivered_at.map(|t| t.to_rfc3339()),
                msg.read_at.map(|t| t.to_rfc3339()),
                operation_to_text(msg.operation),
                confirmation_to_i64(msg.confirmation),
                msg.version,
            ],
        )?;
        Ok(())
    }

    /// Compare-and-set on `version`. The caller retries on `EditConflict`
    /// up to 5 times.
    pub fn update_msg(&self, msg: &MessageRow) -> DbResult<()> {
        let rows = self.conn.execute(
            "UPDATE messages SET
                 body = COALESCE(?4, body),
                 delivered_at = COALESCE(?5, delivered_at),
                 read_at = COALESCE(?6, read_at),
                 operation = ?7,
                 confirmation = ?8,
                 version = version + 1
             WHERE id = ?1 AND version = ?2",
            rusqlite::params![
                msg.id.to_string(),
                msg.version,
                (),
                msg.body,
                msg.delivered_at.map(|t| t.to_rfc3339()),
                msg.read_at.map(|t| t.to_rfc3339()),
                operation_to_text(msg.operation),
                confirmation_to_i64(msg.confirmation),
            ],
        )?;
        if rows == 0 {
            if self.get_msg_by_id(msg.id)?.is_none() {
                return Err(DbError::RecordNotFound);
            }
            return Err(DbError::EditConflict(msg.id));
        }
        Ok(())
    }

    pub fn get_msg_by_id(&self, id: Uuid) -> DbResult<Option<MessageRow>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        self.conn
            .query_row(&sql, [id.to_string()], row_to_message_row)
            .optional()
            .map_err(DbError::from)
    }

    pub fn get_msgs_as_page(
        &self,
        peer_id: Uuid,
        current_user: Uuid,
        page: u32,
        page_size: u32,
    ) -> DbResult<(Vec<MessageRow>, PageMetadata)> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let total_records: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)",
            rusqlite::params![current_user.to_string(), peer_id.to_string()],
            |r| r.get(0),
        )?;
        let last_page = total_records.div_ceil(page_size as u64).max(1) as u32;
        let offset = (page - 1) as u64 * page_size as u64;

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY sent_at DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    current_user.to_string(),
                    peer_id.to_string(),
                    page_size,
                    offset
                ],
                row_to_message_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((
            rows,
            PageMetadata {
                page,
                page_size,
                first_page: 1,
                last_page,
                total_records,
            },
        ))
    }

    /// Idempotent: a subsequent `get_msg_by_id` must return not-found
    /// regardless of prior state.
    pub fn delete_msg(&self, id: Uuid) -> DbResult<()> {
        self.conn
            .execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }

    /// Drafted-but-unsent rows, oldest draft first so the reconciler
    /// replays them in original composition order.
    pub fn get_pending_outbound(&self) -> DbResult<Vec<MessageRow>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sent_at IS NULL ORDER BY drafted_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_message_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Recomputed view, most-recent-message-descending. A conversation is
    /// derived from the messages table, not stored.
    pub fn get_conversations(&self, current_user: Uuid) -> DbResult<Vec<Conversation>> {
        let sql = "
            SELECT
                u.id, u.name, u.last_online,
                (SELECT m.body FROM messages m
                 WHERE (m.sender_id = u.id AND m.receiver_id = ?1) OR (m.sender_id = ?1 AND m.receiver_id = u.id)
                 ORDER BY m.sent_at DESC LIMIT 1) AS latest_msg,
                (SELECT m.sent_at FROM messages m
                 WHERE (m.sender_id = u.id AND m.receiver_id = ?1) OR (m.sender_id = ?1 AND m.receiver_id = u.id)
                 ORDER BY m.sent_at DESC LIMIT 1) AS latest_msg_at,
                (SELECT COUNT(*) FROM messages m
                 WHERE m.sender_id = u.id AND m.receiver_id = ?1
                   AND m.operation = 'create' AND m.read_at IS NULL) AS unread_count
            FROM users u
            WHERE EXISTS (
                SELECT 1 FROM messages m
                WHERE (m.sender_id = u.id AND m.receiver_id = ?1) OR (m.sender_id = ?1 AND m.receiver_id = u.id)
            )
            ORDER BY latest_msg_at DESC
        ";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([current_user.to_string()], |r| {
                let user_id: String = r.get(0)?;
                Ok(Conversation {
                    user_id: user_id.parse().unwrap_or_default(),
                    username: r.get(1)?,
                    last_online: r
                        .get::<_, Option<String>>(2)?
                        .and_then(|s| s.parse().ok()),
                    latest_msg: r.get(3)?,
                    latest_msg_at: r
                        .get::<_, Option<String>>(4)?
                        .and_then(|s| s.parse().ok()),
                    unread_count: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
