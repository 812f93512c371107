//! Catalog Store
//!
//! Read-side access to songs, rotations, the weekly hour grid and events, plus
//! the play log. Editing the catalog happens elsewhere; the engine only reads.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    QueryBuilder, Row, Sqlite,
};

use super::models::{
    from_millis, to_millis, Category, Event, EventItem, EventItemContent, EventKind, Play,
    PlayKind, Sequence, SequenceItem, Song,
};
use crate::error::{AutomationError, Result};

/// Filters for an eligible-song lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SongQuery {
    pub category_id: Option<i64>,
    pub excluded_songs: HashSet<i64>,
    pub excluded_artists: HashSet<i64>,
    pub excluded_albums: HashSet<String>,
    /// When set, only songs whose `[min_length, max_length]` range contains it.
    pub length: Option<Duration>,
}

impl SongQuery {
    /// Whether `song` passes every filter of this query.
    pub fn matches(&self, song: &Song) -> bool {
        if !song.has_valid_trim() {
            return false;
        }
        if self.category_id.is_some_and(|c| c != song.category_id) {
            return false;
        }
        if self.excluded_songs.contains(&song.id) {
            return false;
        }
        if song.artists.iter().any(|a| self.excluded_artists.contains(a)) {
            return false;
        }
        if let Some(album) = &song.album {
            if self.excluded_albums.contains(album) {
                return false;
            }
        }
        if let Some(length) = self.length {
            if song.min_length() > length || song.max_length() < length {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn song(&self, id: i64) -> Result<Option<Song>>;

    /// Ids of every song passing `query`, in id order. Only songs with a
    /// consistent trim (`start ≤ min_end ≤ end ≤ max_end`) are ever eligible.
    async fn eligible_songs(&self, query: &SongQuery) -> Result<Vec<i64>>;

    async fn category(&self, id: i64) -> Result<Option<Category>>;

    /// A sequence with all its items in order.
    async fn sequence(&self, id: i64) -> Result<Option<Sequence>>;

    /// Id of the sequence assigned to `hour` of `day` (0 = Monday).
    async fn scheduled_sequence(&self, day: u8, hour: u8) -> Result<Option<i64>>;

    /// Earliest event occurrence starting in `(after, until]`.
    async fn next_event(
        &self,
        after: DateTime<Local>,
        until: DateTime<Local>,
    ) -> Result<Option<Event>>;

    async fn record_play(&self, play: &Play) -> Result<()>;

    async fn plays_between(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Play>>;
}

// ── SQLite implementation ─────────────────────────────────────────────────────

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn song_artists(&self, song_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT artist_id FROM song_artists WHERE song_id = ? ORDER BY artist_id",
        )
        .bind(song_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn event_items(&self, event_id: i64, weeks: i64) -> Result<Vec<EventItem>> {
        let rows = sqlx::query(
            "SELECT id, item_order, start_ms, error_margin_ms, kind, song_id, length_ms
             FROM event_items WHERE event_id = ? ORDER BY item_order, id",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for r in rows {
            let id: i64 = r.get("id");
            let kind: String = r.get("kind");
            let content = match kind.as_str() {
                "song" => {
                    let song_id: Option<i64> = r.get("song_id");
                    match song_id {
                        Some(song_id) => match self.song(song_id).await? {
                            Some(song) => EventItemContent::Song(song),
                            None => {
                                log::warn!("[catalog] event item {id} references missing song {song_id}");
                                continue;
                            }
                        },
                        None => {
                            log::warn!("[catalog] song event item {id} has no song");
                            continue;
                        }
                    }
                }
                "recording" => EventItemContent::Recording {
                    length: Duration::milliseconds(r.get::<Option<i64>, _>("length_ms").unwrap_or(0)),
                },
                other => {
                    return Err(AutomationError::InvalidData(format!(
                        "event item {id} has unknown kind '{other}'"
                    )))
                }
            };
            items.push(EventItem {
                id,
                order: r.get("item_order"),
                start_time: r
                    .get::<Option<i64>, _>("start_ms")
                    .map(|ms| from_millis(ms).map(|t| shift_weeks(t, weeks)))
                    .transpose()?,
                error_margin: r
                    .get::<Option<i64>, _>("error_margin_ms")
                    .map(Duration::milliseconds),
                content,
            });
        }
        Ok(items)
    }

    async fn row_to_event(&self, r: &SqliteRow, weeks: i64) -> Result<Event> {
        let id: i64 = r.get("id");
        let kind: String = r.get("kind");
        let kind = match kind.as_str() {
            "stop" => EventKind::Stop,
            "play" => {
                let sequence = match r.get::<Option<i64>, _>("sequence_id") {
                    Some(seq_id) => self.sequence(seq_id).await?,
                    None => None,
                };
                EventKind::Play {
                    sequence,
                    end_time: r
                        .get::<Option<i64>, _>("end_ms")
                        .map(|ms| from_millis(ms).map(|t| shift_weeks(t, weeks)))
                        .transpose()?,
                    items: self.event_items(id, weeks).await?,
                }
            }
            other => {
                return Err(AutomationError::InvalidData(format!(
                    "event {id} has unknown kind '{other}'"
                )))
            }
        };
        Ok(Event {
            id,
            name: r.get("name"),
            start_time: shift_weeks(from_millis(r.get("start_ms"))?, weeks),
            error_margin: Duration::milliseconds(r.get("error_margin_ms")),
            kind,
        })
    }
}

fn row_to_song(r: &SqliteRow, artists: Vec<i64>) -> Song {
    Song {
        id: r.get("id"),
        category_id: r.get("category_id"),
        name: r.get("name"),
        album: r.get("album"),
        start: Duration::milliseconds(r.get("start_ms")),
        end: Duration::milliseconds(r.get("end_ms")),
        min_end: Duration::milliseconds(r.get("min_end_ms")),
        max_end: Duration::milliseconds(r.get("max_end_ms")),
        filename: r.get("filename"),
        artists,
    }
}

/// Move `time` by whole weeks of wall-clock time, so a weekly event keeps its
/// local hour across daylight-saving changes.
fn shift_weeks(time: DateTime<Local>, weeks: i64) -> DateTime<Local> {
    if weeks == 0 {
        return time;
    }
    (time.naive_local() + Duration::weeks(weeks))
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or(time + Duration::weeks(weeks))
}

/// Number of weeks to shift a weekly event starting at `start` so its
/// occurrence falls strictly after `after`.
fn weeks_until_after(start: DateTime<Local>, after: DateTime<Local>) -> i64 {
    if start > after {
        return 0;
    }
    let mut weeks = (after - start).num_weeks();
    while shift_weeks(start, weeks) <= after {
        weeks += 1;
    }
    weeks
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn song(&self, id: i64) -> Result<Option<Song>> {
        let row = sqlx::query(
            "SELECT id, category_id, name, album, start_ms, end_ms, min_end_ms, max_end_ms, filename
             FROM songs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => {
                let artists = self.song_artists(id).await?;
                Ok(Some(row_to_song(&r, artists)))
            }
            None => Ok(None),
        }
    }

    async fn eligible_songs(&self, query: &SongQuery) -> Result<Vec<i64>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT s.id FROM songs s WHERE s.start_ms >= 0 \
             AND s.start_ms <= s.min_end_ms AND s.min_end_ms <= s.end_ms AND s.end_ms <= s.max_end_ms",
        );

        if let Some(category_id) = query.category_id {
            qb.push(" AND s.category_id = ").push_bind(category_id);
        }

        if !query.excluded_songs.is_empty() {
            qb.push(" AND s.id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in &query.excluded_songs {
                separated.push_bind(*id);
            }
            drop(separated);
            qb.push(")");
        }

        if !query.excluded_artists.is_empty() {
            qb.push(
                " AND NOT EXISTS (SELECT 1 FROM song_artists sa WHERE sa.song_id = s.id AND sa.artist_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in &query.excluded_artists {
                separated.push_bind(*id);
            }
            drop(separated);
            qb.push("))");
        }

        if !query.excluded_albums.is_empty() {
            qb.push(" AND (s.album IS NULL OR s.album NOT IN (");
            let mut separated = qb.separated(", ");
            for album in &query.excluded_albums {
                separated.push_bind(album.clone());
            }
            drop(separated);
            qb.push("))");
        }

        if let Some(length) = query.length {
            let ms = length.num_milliseconds();
            qb.push(" AND s.min_end_ms - s.start_ms <= ").push_bind(ms);
            qb.push(" AND s.max_end_ms - s.start_ms >= ").push_bind(ms);
        }

        qb.push(" ORDER BY s.id");
        let ids = qb.build_query_scalar::<i64>().fetch_all(&self.pool).await?;
        Ok(ids)
    }

    async fn category(&self, id: i64) -> Result<Option<Category>> {
        let row = sqlx::query("SELECT id, name FROM categories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Category {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }

    async fn sequence(&self, id: i64) -> Result<Option<Sequence>> {
        let Some(row) = sqlx::query("SELECT id, name FROM sequences WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let items = sqlx::query(
            "SELECT si.number, c.id AS category_id, c.name AS category_name
             FROM sequence_items si JOIN categories c ON c.id = si.category_id
             WHERE si.sequence_id = ? ORDER BY si.number",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| SequenceItem {
            number: r.get("number"),
            category: Category {
                id: r.get("category_id"),
                name: r.get("category_name"),
            },
        })
        .collect();

        Ok(Some(Sequence {
            id: row.get("id"),
            name: row.get("name"),
            items,
        }))
    }

    async fn scheduled_sequence(&self, day: u8, hour: u8) -> Result<Option<i64>> {
        let id = sqlx::query_scalar(
            "SELECT sequence_id FROM schedule_hours WHERE day = ? AND hour = ?",
        )
        .bind(day as i64)
        .bind(hour as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn next_event(
        &self,
        after: DateTime<Local>,
        until: DateTime<Local>,
    ) -> Result<Option<Event>> {
        let one_off = sqlx::query(
            "SELECT * FROM events WHERE weekly = 0 AND start_ms > ? AND start_ms <= ?
             ORDER BY start_ms, id LIMIT 1",
        )
        .bind(to_millis(after))
        .bind(to_millis(until))
        .fetch_optional(&self.pool)
        .await?;

        let mut best: Option<(DateTime<Local>, SqliteRow, i64)> = match one_off {
            Some(r) => Some((from_millis(r.get("start_ms"))?, r, 0)),
            None => None,
        };

        let weekly = sqlx::query("SELECT * FROM events WHERE weekly = 1 AND start_ms <= ? ORDER BY id")
            .bind(to_millis(until))
            .fetch_all(&self.pool)
            .await?;
        for r in weekly {
            let start = from_millis(r.get("start_ms"))?;
            let weeks = weeks_until_after(start, after);
            let occurrence = shift_weeks(start, weeks);
            if occurrence > until {
                continue;
            }
            if best.as_ref().map_or(true, |(t, _, _)| occurrence < *t) {
                best = Some((occurrence, r, weeks));
            }
        }

        match best {
            Some((_, row, weeks)) => Ok(Some(self.row_to_event(&row, weeks).await?)),
            None => Ok(None),
        }
    }

    async fn record_play(&self, play: &Play) -> Result<()> {
        let kind = match play.kind {
            PlayKind::Song => "song",
            PlayKind::Audio => "audio",
        };
        sqlx::query(
            "INSERT INTO plays (stream, time_ms, length_ms, kind, song_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&play.stream)
        .bind(to_millis(play.time))
        .bind(play.length_ms)
        .bind(kind)
        .bind(play.song_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn plays_between(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Play>> {
        let rows = sqlx::query(
            "SELECT stream, time_ms, length_ms, kind, song_id FROM plays
             WHERE time_ms >= ? AND time_ms < ? ORDER BY time_ms, id",
        )
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let kind: String = r.get("kind");
                let kind = match kind.as_str() {
                    "song" => PlayKind::Song,
                    "audio" => PlayKind::Audio,
                    other => {
                        return Err(AutomationError::InvalidData(format!(
                            "play has unknown kind '{other}'"
                        )))
                    }
                };
                Ok(Play {
                    stream: r.get("stream"),
                    time: from_millis(r.get("time_ms"))?,
                    length_ms: r.get("length_ms"),
                    kind,
                    song_id: r.get("song_id"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use chrono::TimeZone;

    async fn seeded() -> (SqlitePool, SqliteCatalog) {
        let pool = init_memory_db().await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO categories (id, name) VALUES (1, 'Hits'), (2, 'Oldies');
            INSERT INTO artists (id, name) VALUES (10, 'A'), (11, 'B');
            INSERT INTO songs (id, category_id, name, album, start_ms, end_ms, min_end_ms, max_end_ms, filename)
            VALUES
                (1, 1, 'One',   'First', 0,    180000, 150000, 210000, 'one.mp3'),
                (2, 1, 'Two',   NULL,    2000, 182000, 152000, 212000, 'two.mp3'),
                (3, 2, 'Three', 'First', 0,    240000, 230000, 250000, 'three.mp3'),
                (4, 2, 'Bad',   NULL,    0,    100000, 120000, 130000, 'bad.mp3');
            INSERT INTO song_artists (song_id, artist_id) VALUES (1, 10), (2, 11), (3, 10);
            INSERT INTO sequences (id, name) VALUES (1, 'Daytime');
            INSERT INTO sequence_items (sequence_id, number, category_id) VALUES (1, 2, 2), (1, 1, 1);
            INSERT INTO schedule_hours (day, hour, sequence_id) VALUES (0, 9, 1);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        (pool.clone(), SqliteCatalog::new(pool))
    }

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn song_is_fully_populated() {
        let (_, catalog) = seeded().await;
        let song = catalog.song(2).await.unwrap().unwrap();
        assert_eq!(song.start, Duration::seconds(2));
        assert_eq!(song.length(), Duration::seconds(180));
        assert_eq!(song.artists, vec![11]);
        assert!(catalog.song(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eligible_songs_apply_every_filter() {
        let (_, catalog) = seeded().await;

        let all = catalog.eligible_songs(&SongQuery::default()).await.unwrap();
        assert_eq!(all, vec![1, 2, 3], "song with broken trim points is never eligible");

        let q = SongQuery {
            category_id: Some(1),
            ..Default::default()
        };
        assert_eq!(catalog.eligible_songs(&q).await.unwrap(), vec![1, 2]);

        let q = SongQuery {
            excluded_artists: HashSet::from([10]),
            ..Default::default()
        };
        assert_eq!(catalog.eligible_songs(&q).await.unwrap(), vec![2]);

        let q = SongQuery {
            excluded_songs: HashSet::from([2]),
            excluded_albums: HashSet::from(["First".to_string()]),
            ..Default::default()
        };
        assert!(catalog.eligible_songs(&q).await.unwrap().is_empty());

        let q = SongQuery {
            length: Some(Duration::seconds(235)),
            ..Default::default()
        };
        assert_eq!(catalog.eligible_songs(&q).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn sequence_items_come_back_in_order() {
        let (_, catalog) = seeded().await;
        let seq = catalog.sequence(1).await.unwrap().unwrap();
        let numbers: Vec<i64> = seq.items.iter().map(|i| i.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(seq.items[0].category.name, "Hits");
        assert_eq!(catalog.scheduled_sequence(0, 9).await.unwrap(), Some(1));
        assert_eq!(catalog.scheduled_sequence(0, 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn next_event_is_bounded_and_populated() {
        let (pool, catalog) = seeded().await;
        sqlx::query(
            "INSERT INTO events (id, name, start_ms, error_margin_ms, kind, sequence_id, end_ms)
             VALUES (1, 'News', ?, 5000, 'play', 1, ?), (2, 'Off air', ?, 0, 'stop', NULL, NULL)",
        )
        .bind(to_millis(at(10, 0)))
        .bind(to_millis(at(11, 0)))
        .bind(to_millis(at(12, 0)))
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO event_items (event_id, item_order, kind, song_id) VALUES (1, 2, 'song', 3);
             INSERT INTO event_items (event_id, item_order, kind, length_ms, start_ms) VALUES (1, 1, 'recording', 60000, NULL);",
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(catalog.next_event(at(8, 0), at(9, 0)).await.unwrap().is_none());

        let event = catalog.next_event(at(9, 30), at(10, 30)).await.unwrap().unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.error_margin, Duration::seconds(5));
        match &event.kind {
            EventKind::Play { sequence, end_time, items } => {
                assert_eq!(sequence.as_ref().map(|s| s.id), Some(1));
                assert_eq!(*end_time, Some(at(11, 0)));
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].length(), Duration::seconds(60));
                assert!(matches!(items[1].content, EventItemContent::Song(ref s) if s.id == 3));
            }
            EventKind::Stop => panic!("expected a play event"),
        }

        // The search floor is exclusive.
        let stop = catalog.next_event(at(10, 0), at(13, 0)).await.unwrap().unwrap();
        assert_eq!(stop.kind, EventKind::Stop);
    }

    #[tokio::test]
    async fn weekly_events_expand_to_next_occurrence() {
        let (pool, catalog) = seeded().await;
        sqlx::query(
            "INSERT INTO events (id, name, start_ms, error_margin_ms, kind, end_ms, weekly)
             VALUES (5, 'Weekly show', ?, 0, 'play', ?, 1)",
        )
        .bind(to_millis(at(10, 0)))
        .bind(to_millis(at(11, 0)))
        .execute(&pool)
        .await
        .unwrap();

        let later = at(9, 30) + Duration::weeks(2);
        let event = catalog
            .next_event(later, later + Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.start_time, at(10, 0) + Duration::weeks(2));
        assert_eq!(event.end_time(), Some(at(11, 0) + Duration::weeks(2)));
    }

    #[tokio::test]
    async fn play_log_round_trips() {
        let (_, catalog) = seeded().await;
        let play = Play {
            stream: "main".into(),
            time: at(9, 15),
            length_ms: 180_000,
            kind: PlayKind::Song,
            song_id: Some(1),
        };
        catalog.record_play(&play).await.unwrap();
        let plays = catalog.plays_between(at(9, 0), at(10, 0)).await.unwrap();
        assert_eq!(plays, vec![play]);
        assert!(catalog.plays_between(at(10, 0), at(11, 0)).await.unwrap().is_empty());
    }
}
