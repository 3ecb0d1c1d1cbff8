use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{MessageId, RoomId, UserId};

/// Durable record of chat messages, queryable per room. The single mutation
/// point for message state; the live fan-out layer holds nothing durable.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Latest message of a room plus the viewer's unread count for it.
#[derive(Debug, Clone)]
pub struct RoomActivityRow {
    pub last_message: StoredMessage,
    pub unread_count: i64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, display_name: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (display_name) VALUES (?)
             ON CONFLICT(display_name) DO UPDATE SET display_name=excluded.display_name
             RETURNING id",
        )
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn display_name_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Persists a new message. The room id is derived from the participant
    /// pair and the timestamp is assigned here, so both are server
    /// authoritative.
    pub async fn append_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        body: &str,
    ) -> Result<StoredMessage> {
        if body.trim().is_empty() {
            bail!("message body must not be empty");
        }

        let room_id = RoomId::direct(sender_id, receiver_id);
        let sent_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (room_id, sender_id, receiver_id, body, sent_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(room_id.as_str())
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .bind(body)
        .bind(sent_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            room_id,
            sender_id,
            receiver_id,
            body: body.to_string(),
            sent_at,
            read_at: None,
        })
    }

    /// All messages of a room, ascending by (sent_at, id). Concurrent
    /// appends may commit in either order; this read-time ordering is what
    /// gives every participant the same view.
    pub async fn list_room_messages(&self, room_id: &RoomId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, room_id, sender_id, receiver_id, body, sent_at, read_at
             FROM messages
             WHERE room_id = ?
             ORDER BY sent_at ASC, id ASC",
        )
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_message_from_row).collect()
    }

    /// Marks every unread message addressed to the viewer in the room as
    /// read. Idempotent: re-marking updates zero rows.
    pub async fn mark_room_read(&self, room_id: &RoomId, viewer_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET read_at = ?
             WHERE room_id = ? AND receiver_id = ? AND read_at IS NULL",
        )
        .bind(Utc::now())
        .bind(room_id.as_str())
        .bind(viewer_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Irreversibly deletes every message of the room.
    pub async fn clear_room(&self, room_id: &RoomId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE room_id = ?")
            .bind(room_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// One row per room the user participates in, each carrying the room's
    /// latest message and the user's unread count, newest room first.
    pub async fn list_active_rooms_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<RoomActivityRow>> {
        let rows = sqlx::query(
            "SELECT m.id, m.room_id, m.sender_id, m.receiver_id, m.body, m.sent_at, m.read_at
             FROM messages m
             INNER JOIN (
                 SELECT room_id, MAX(id) AS last_id
                 FROM messages
                 WHERE sender_id = ? OR receiver_id = ?
                 GROUP BY room_id
             ) latest ON latest.last_id = m.id
             ORDER BY m.sent_at DESC, m.id DESC",
        )
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let unread_rows = sqlx::query(
            "SELECT room_id, COUNT(*) AS unread
             FROM messages
             WHERE receiver_id = ? AND read_at IS NULL
             GROUP BY room_id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut unread_by_room: HashMap<String, i64> = HashMap::new();
        for row in unread_rows {
            unread_by_room.insert(row.get::<String, _>(0), row.get::<i64, _>(1));
        }

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let last_message = stored_message_from_row(row)?;
            let unread_count = unread_by_room
                .get(last_message.room_id.as_str())
                .copied()
                .unwrap_or(0);
            summaries.push(RoomActivityRow {
                last_message,
                unread_count,
            });
        }
        Ok(summaries)
    }
}

fn stored_message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: MessageId(row.get::<i64, _>("id")),
        room_id: RoomId(row.get::<String, _>("room_id")),
        sender_id: UserId(row.get::<i64, _>("sender_id")),
        receiver_id: UserId(row.get::<i64, _>("receiver_id")),
        body: row.get::<String, _>("body"),
        sent_at: row.get::<DateTime<Utc>, _>("sent_at"),
        read_at: row.get::<Option<DateTime<Utc>>, _>("read_at"),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_file_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
