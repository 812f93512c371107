//! Data-transfer types handed out by the catalog and queue stores.
//!
//! Every struct here is fully populated when returned; nothing lazily reaches
//! back into the database.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AutomationError, Result};

// ── Catalog ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// A catalog song with its trim points, all measured from the start of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
    pub album: Option<String>,
    pub start: Duration,
    pub end: Duration,
    pub min_end: Duration,
    pub max_end: Duration,
    pub filename: String,
    pub artists: Vec<i64>,
}

impl Song {
    /// Nominal playing time between the trim-in and trim-out points.
    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    pub fn min_length(&self) -> Duration {
        self.min_end - self.start
    }

    pub fn max_length(&self) -> Duration {
        self.max_end - self.start
    }

    /// `0 ≤ start ≤ min_end ≤ end ≤ max_end`
    pub fn has_valid_trim(&self) -> bool {
        Duration::zero() <= self.start
            && self.start <= self.min_end
            && self.min_end <= self.end
            && self.end <= self.max_end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceItem {
    pub number: i64,
    pub category: Category,
}

/// A rotation pattern with its items already ordered by `number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub id: i64,
    pub name: String,
    pub items: Vec<SequenceItem>,
}

/// Default sequence for one hour of one weekday (`day` 0 = Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleHour {
    pub day: u8,
    pub hour: u8,
    pub sequence_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventItemContent {
    Song(Song),
    /// A pre-recorded segment stored under the event audio directory as `<item id>`.
    Recording { length: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventItem {
    pub id: i64,
    pub order: i64,
    pub start_time: Option<DateTime<Local>>,
    pub error_margin: Option<Duration>,
    pub content: EventItemContent,
}

impl EventItem {
    pub fn length(&self) -> Duration {
        match &self.content {
            EventItemContent::Song(song) => song.length(),
            EventItemContent::Recording { length } => *length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Hard stop of the automation.
    Stop,
    Play {
        sequence: Option<Sequence>,
        end_time: Option<DateTime<Local>>,
        items: Vec<EventItem>,
    },
}

/// A single occurrence of an event. Weekly events are expanded by the catalog,
/// so `start_time` is always the concrete occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub start_time: DateTime<Local>,
    pub error_margin: Duration,
    pub kind: EventKind,
}

impl Event {
    pub fn end_time(&self) -> Option<DateTime<Local>> {
        match &self.kind {
            EventKind::Play { end_time, .. } => *end_time,
            EventKind::Stop => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayKind {
    Song,
    Audio,
}

/// One row of the play log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Play {
    pub stream: String,
    pub time: DateTime<Local>,
    pub length_ms: i64,
    pub kind: PlayKind,
    pub song_id: Option<i64>,
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Lifecycle of a queue entry. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Preparing,
    Playing,
    Played,
}

impl QueueStatus {
    pub fn rank(self) -> i64 {
        match self {
            QueueStatus::Queued => 0,
            QueueStatus::Preparing => 1,
            QueueStatus::Playing => 2,
            QueueStatus::Played => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(QueueStatus::Queued),
            1 => Some(QueueStatus::Preparing),
            2 => Some(QueueStatus::Playing),
            3 => Some(QueueStatus::Played),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePayload {
    Song {
        song_id: i64,
        filename: String,
        start: Duration,
        length: Duration,
        album: Option<String>,
        /// Copied from the song so repetition checks never go back to the catalog.
        artists: Vec<i64>,
    },
    Audio {
        event_item_id: i64,
        length: Duration,
    },
    Stop {
        event_id: i64,
    },
    EventStart {
        event_id: i64,
    },
    EventEnd {
        event_id: i64,
    },
}

impl QueuePayload {
    pub fn song(song: &Song, length: Duration) -> Self {
        QueuePayload::Song {
            song_id: song.id,
            filename: song.filename.clone(),
            start: song.start,
            length,
            album: song.album.clone(),
            artists: song.artists.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueuePayload::Song { .. } => "song",
            QueuePayload::Audio { .. } => "audio",
            QueuePayload::Stop { .. } => "stop",
            QueuePayload::EventStart { .. } => "event_start",
            QueuePayload::EventEnd { .. } => "event_end",
        }
    }

    /// Time the payload occupies on air. Markers take none.
    pub fn length(&self) -> Duration {
        match self {
            QueuePayload::Song { length, .. } | QueuePayload::Audio { length, .. } => *length,
            _ => Duration::zero(),
        }
    }

    pub fn is_playable(&self) -> bool {
        matches!(self, QueuePayload::Song { .. } | QueuePayload::Audio { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayQueueItem {
    pub id: Uuid,
    pub due: DateTime<Local>,
    pub status: QueueStatus,
    pub payload: QueuePayload,
}

impl PartialOrd for PlayQueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PlayQueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then_with(|| self.id.cmp(&other.id))
    }
}

/// Published on the "queue changed" channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEvent {
    Updated,
}

// ── Time helpers ──────────────────────────────────────────────────────────────

pub fn to_millis(time: DateTime<Local>) -> i64 {
    time.timestamp_millis()
}

/// Stored epoch milliseconds back to local time. Out-of-range values mean a
/// corrupt row.
pub fn from_millis(ms: i64) -> Result<DateTime<Local>> {
    use chrono::TimeZone;
    Local
        .timestamp_millis_opt(ms)
        .earliest()
        .ok_or_else(|| AutomationError::InvalidData(format!("timestamp {ms} ms is out of range")))
}
