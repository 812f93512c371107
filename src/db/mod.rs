pub mod catalog;
pub mod models;
pub mod queue;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Initialise (or migrate) the SQLite database at `db_path`.
/// Creates all catalog, queue and settings tables if they don't exist.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let url = format!("sqlite:{db_path}?mode=rwc");
    let pool = SqlitePool::connect(&url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Private in-memory database. A single connection so every query sees the
/// same memory store.
pub async fn init_memory_db() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artists (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS songs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            category_id INTEGER NOT NULL REFERENCES categories(id),
            name        TEXT    NOT NULL,
            album       TEXT,
            start_ms    INTEGER NOT NULL DEFAULT 0,
            end_ms      INTEGER NOT NULL,
            min_end_ms  INTEGER NOT NULL,
            max_end_ms  INTEGER NOT NULL,
            filename    TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS song_artists (
            song_id   INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            artist_id INTEGER NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            PRIMARY KEY (song_id, artist_id)
        );

        CREATE TABLE IF NOT EXISTS sequences (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sequence_items (
            sequence_id INTEGER NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
            number      INTEGER NOT NULL,
            category_id INTEGER NOT NULL REFERENCES categories(id),
            PRIMARY KEY (sequence_id, number)
        );

        CREATE TABLE IF NOT EXISTS schedule_hours (
            day         INTEGER NOT NULL,
            hour        INTEGER NOT NULL,
            sequence_id INTEGER NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
            PRIMARY KEY (day, hour)
        );

        CREATE TABLE IF NOT EXISTS events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT    NOT NULL DEFAULT '',
            start_ms        INTEGER NOT NULL,
            error_margin_ms INTEGER NOT NULL DEFAULT 0,
            kind            TEXT    NOT NULL DEFAULT 'play',
            sequence_id     INTEGER REFERENCES sequences(id) ON DELETE SET NULL,
            end_ms          INTEGER,
            weekly          INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_ms);

        CREATE TABLE IF NOT EXISTS event_items (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id        INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            item_order      INTEGER NOT NULL,
            start_ms        INTEGER,
            error_margin_ms INTEGER,
            kind            TEXT    NOT NULL DEFAULT 'song',
            song_id         INTEGER REFERENCES songs(id),
            length_ms       INTEGER
        );

        CREATE TABLE IF NOT EXISTS plays (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            stream      TEXT    NOT NULL,
            time_ms     INTEGER NOT NULL,
            length_ms   INTEGER NOT NULL,
            kind        TEXT    NOT NULL,
            song_id     INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_plays_time ON plays(time_ms);

        -- Shared queue: sorted set, per-item record, per-item artist set
        CREATE TABLE IF NOT EXISTS play_queue (
            id      TEXT    PRIMARY KEY,
            due_ms  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_play_queue_due ON play_queue(due_ms);

        CREATE TABLE IF NOT EXISTS queue_items (
            id            TEXT    PRIMARY KEY,
            status        INTEGER NOT NULL DEFAULT 0,
            kind          TEXT    NOT NULL,
            song_id       INTEGER,
            event_id      INTEGER,
            event_item_id INTEGER,
            filename      TEXT,
            start_ms      INTEGER NOT NULL DEFAULT 0,
            length_ms     INTEGER NOT NULL DEFAULT 0,
            album         TEXT
        );

        CREATE TABLE IF NOT EXISTS queue_item_artists (
            item_id   TEXT    NOT NULL,
            artist_id INTEGER NOT NULL,
            PRIMARY KEY (item_id, artist_id)
        );

        CREATE TABLE IF NOT EXISTS settings (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = init_memory_db().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('songs', 'play_queue', 'settings')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 3);
    }

    #[tokio::test]
    async fn file_database_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("automation.db");
        let pool = init_db(path.to_str().unwrap()).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
