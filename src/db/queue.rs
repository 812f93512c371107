//! Shared play queue and settings store.
//!
//! The queue is a time-ordered set of entry ids (`play_queue`) plus one record
//! per entry (`queue_items`) and its artist set (`queue_item_artists`). The
//! scheduler writes the future part of it, the dispatcher and executors advance
//! statuses, and the selector reads recent entries as its repetition ledger.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::models::{
    from_millis, to_millis, PlayQueueItem, QueueEvent, QueuePayload, QueueStatus,
};
use crate::error::{AutomationError, Result};

pub const RUNNING_KEY: &str = "running";
pub const PID_KEY: &str = "automation_pid";

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Write a complete entry as `queued`. The record is stored before the
    /// entry becomes visible in the time index.
    async fn enqueue(&self, due: DateTime<Local>, payload: QueuePayload) -> Result<PlayQueueItem>;

    /// Ids and due times in `[from, to]`, ordered by due time. May include ids
    /// whose record has already vanished.
    async fn due_between(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<(Uuid, DateTime<Local>)>>;

    async fn item(&self, id: Uuid) -> Result<Option<PlayQueueItem>>;

    /// Complete entries due in `[from, to]`, ordered by due time.
    async fn items_between(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<PlayQueueItem>>;

    /// Move an entry forward to `status`. Returns false when the entry is gone
    /// or already at or past `status`.
    async fn advance_status(&self, id: Uuid, status: QueueStatus) -> Result<bool>;

    /// Drop an id from the time index.
    async fn remove(&self, id: Uuid) -> Result<()>;

    /// Delete entries due before `cutoff`. Returns how many went.
    async fn remove_before(&self, cutoff: DateTime<Local>) -> Result<u64>;

    /// Delete entries due after `cutoff`. Returns how many went.
    async fn remove_after(&self, cutoff: DateTime<Local>) -> Result<u64>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn delete_setting(&self, key: &str) -> Result<()>;

    fn publish(&self, event: QueueEvent);
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    async fn is_running(&self) -> Result<bool> {
        Ok(self.get_setting(RUNNING_KEY).await?.is_some())
    }

    async fn set_running(&self, running: bool) -> Result<()> {
        if running {
            self.set_setting(RUNNING_KEY, "1").await
        } else {
            self.delete_setting(RUNNING_KEY).await
        }
    }
}

// ── SQLite implementation ─────────────────────────────────────────────────────

pub struct SqliteQueueStore {
    pool: SqlitePool,
    updates: broadcast::Sender<QueueEvent>,
}

impl SqliteQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self { pool, updates }
    }

    async fn artists_of(&self, id: &str) -> Result<Vec<i64>> {
        let artists = sqlx::query_scalar(
            "SELECT artist_id FROM queue_item_artists WHERE item_id = ? ORDER BY artist_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(artists)
    }

    async fn row_to_item(&self, r: &SqliteRow) -> Result<PlayQueueItem> {
        let id_text: String = r.get("id");
        let id = Uuid::parse_str(&id_text)
            .map_err(|e| AutomationError::InvalidData(format!("queue id '{id_text}': {e}")))?;
        let rank: i64 = r.get("status");
        let status = QueueStatus::from_rank(rank).ok_or_else(|| {
            AutomationError::InvalidData(format!("queue item {id} has status {rank}"))
        })?;
        let kind: String = r.get("kind");
        let event_id = || -> Result<i64> {
            r.get::<Option<i64>, _>("event_id")
                .ok_or_else(|| AutomationError::InvalidData(format!("queue item {id} has no event")))
        };
        let payload = match kind.as_str() {
            "song" => QueuePayload::Song {
                song_id: r.get::<Option<i64>, _>("song_id").ok_or_else(|| {
                    AutomationError::InvalidData(format!("queue item {id} has no song"))
                })?,
                filename: r.get::<Option<String>, _>("filename").unwrap_or_default(),
                start: Duration::milliseconds(r.get("start_ms")),
                length: Duration::milliseconds(r.get("length_ms")),
                album: r.get("album"),
                artists: self.artists_of(&id_text).await?,
            },
            "audio" => QueuePayload::Audio {
                event_item_id: r.get::<Option<i64>, _>("event_item_id").ok_or_else(|| {
                    AutomationError::InvalidData(format!("queue item {id} has no event item"))
                })?,
                length: Duration::milliseconds(r.get("length_ms")),
            },
            "stop" => QueuePayload::Stop { event_id: event_id()? },
            "event_start" => QueuePayload::EventStart { event_id: event_id()? },
            "event_end" => QueuePayload::EventEnd { event_id: event_id()? },
            other => {
                return Err(AutomationError::InvalidData(format!(
                    "queue item {id} has unknown kind '{other}'"
                )))
            }
        };
        Ok(PlayQueueItem {
            id,
            due: from_millis(r.get("due_ms"))?,
            status,
            payload,
        })
    }

    async fn delete_items(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM queue_item_artists WHERE item_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM queue_items WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM play_queue WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, due: DateTime<Local>, payload: QueuePayload) -> Result<PlayQueueItem> {
        let id = Uuid::new_v4();
        let id_text = id.to_string();

        let (song_id, event_id, event_item_id, filename, start, album) = match &payload {
            QueuePayload::Song {
                song_id,
                filename,
                start,
                album,
                ..
            } => (
                Some(*song_id),
                None,
                None,
                Some(filename.clone()),
                *start,
                album.clone(),
            ),
            QueuePayload::Audio { event_item_id, .. } => {
                (None, None, Some(*event_item_id), None, Duration::zero(), None)
            }
            QueuePayload::Stop { event_id }
            | QueuePayload::EventStart { event_id }
            | QueuePayload::EventEnd { event_id } => {
                (None, Some(*event_id), None, None, Duration::zero(), None)
            }
        };

        sqlx::query(
            "INSERT INTO queue_items (id, status, kind, song_id, event_id, event_item_id, filename, start_ms, length_ms, album)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id_text)
        .bind(QueueStatus::Queued.rank())
        .bind(payload.kind())
        .bind(song_id)
        .bind(event_id)
        .bind(event_item_id)
        .bind(filename)
        .bind(start.num_milliseconds())
        .bind(payload.length().num_milliseconds())
        .bind(album)
        .execute(&self.pool)
        .await?;

        if let QueuePayload::Song { artists, .. } = &payload {
            for artist in artists {
                sqlx::query(
                    "INSERT OR IGNORE INTO queue_item_artists (item_id, artist_id) VALUES (?, ?)",
                )
                .bind(&id_text)
                .bind(*artist)
                .execute(&self.pool)
                .await?;
            }
        }

        sqlx::query("INSERT INTO play_queue (id, due_ms) VALUES (?, ?)")
            .bind(&id_text)
            .bind(to_millis(due))
            .execute(&self.pool)
            .await?;

        Ok(PlayQueueItem {
            id,
            due,
            status: QueueStatus::Queued,
            payload,
        })
    }

    async fn due_between(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<(Uuid, DateTime<Local>)>> {
        let rows = sqlx::query(
            "SELECT id, due_ms FROM play_queue WHERE due_ms >= ? AND due_ms <= ? ORDER BY due_ms, id",
        )
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let id: String = r.get("id");
                let id = Uuid::parse_str(&id)
                    .map_err(|e| AutomationError::InvalidData(format!("queue id '{id}': {e}")))?;
                Ok((id, from_millis(r.get("due_ms"))?))
            })
            .collect()
    }

    async fn item(&self, id: Uuid) -> Result<Option<PlayQueueItem>> {
        let row = sqlx::query(
            "SELECT qi.*, pq.due_ms FROM queue_items qi JOIN play_queue pq ON pq.id = qi.id
             WHERE qi.id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(self.row_to_item(&r).await?)),
            None => Ok(None),
        }
    }

    async fn items_between(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<PlayQueueItem>> {
        let rows = sqlx::query(
            "SELECT qi.*, pq.due_ms FROM play_queue pq JOIN queue_items qi ON qi.id = pq.id
             WHERE pq.due_ms >= ? AND pq.due_ms <= ? ORDER BY pq.due_ms, pq.id",
        )
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for r in &rows {
            items.push(self.row_to_item(r).await?);
        }
        Ok(items)
    }

    async fn advance_status(&self, id: Uuid, status: QueueStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE queue_items SET status = ? WHERE id = ? AND status < ?")
            .bind(status.rank())
            .bind(id.to_string())
            .bind(status.rank())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM play_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_before(&self, cutoff: DateTime<Local>) -> Result<u64> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM play_queue WHERE due_ms < ?")
            .bind(to_millis(cutoff))
            .fetch_all(&self.pool)
            .await?;
        self.delete_items(&ids).await?;
        Ok(ids.len() as u64)
    }

    async fn remove_after(&self, cutoff: DateTime<Local>) -> Result<u64> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM play_queue WHERE due_ms > ?")
            .bind(to_millis(cutoff))
            .fetch_all(&self.pool)
            .await?;
        self.delete_items(&ids).await?;
        Ok(ids.len() as u64)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn publish(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.updates.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.updates.subscribe()
    }
}
