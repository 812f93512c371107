//! Configuration: command-line arguments, the persisted engine settings and
//! the repetition limits kept in the key/value store.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Local};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::db::queue::QueueStore;
use crate::error::{AutomationError, Result};

// ── Command line ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug, Clone)]
#[command(name = "airtime")]
#[command(about = "Broadcast automation engine")]
#[command(version)]
pub struct Args {
    /// Stream name, recorded with every play
    pub stream: String,

    /// SQLite database holding the catalog, queue and settings
    #[arg(long, default_value = "airtime.db", env = "AIRTIME_DB")]
    pub db: String,

    /// Directory containing song files
    #[arg(long, default_value = "songs", env = "AIRTIME_SONG_PATH")]
    pub song_path: PathBuf,

    /// Directory containing event recordings
    #[arg(long, default_value = "events", env = "AIRTIME_AUDIO_PATH")]
    pub audio_path: PathBuf,

    /// Where mixed audio goes
    #[arg(long, value_enum, default_value_t = OutputKind::Null)]
    pub output: OutputKind,

    /// WAV file written when `--output wav`
    #[arg(long, default_value = "airtime.wav")]
    pub record_path: PathBuf,

    /// Overrides the stored stop policy
    #[arg(long, value_enum)]
    pub stop_policy: Option<StopPolicy>,

    /// Also keep albums out of the repetition window
    #[arg(long)]
    pub enforce_album_limit: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler and dispatcher (default)
    Run,
    /// Print the queue around now as JSON
    Queue {
        /// Minutes of history to include
        #[arg(long, default_value_t = 60)]
        history: i64,
        /// Minutes ahead to include
        #[arg(long, default_value_t = 60)]
        ahead: i64,
    },
    /// Print one day's play log as JSON
    Log {
        /// Day to print, YYYY-MM-DD (defaults to today)
        #[arg(long)]
        date: Option<chrono::NaiveDate>,
    },
    /// Show or change repetition limits, in seconds
    Limits {
        #[arg(long)]
        song: Option<i64>,
        #[arg(long)]
        artist: Option<i64>,
        #[arg(long)]
        album: Option<i64>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Render in real time and discard
    Null,
    /// Render in real time into a WAV file
    Wav,
    /// System audio device
    Device,
}

// ── Engine configuration ──────────────────────────────────────────────────────

/// What the scheduler does after queuing a stop marker.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Stop scheduling; the stop marker ends the run when it comes due.
    #[default]
    Halt,
    /// Keep scheduling past the stop marker.
    Continue,
}

pub const ENGINE_CONFIG_KEY: &str = "engine_config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How far ahead of now the first item is queued
    pub lead_time_ms: i64,
    /// How far ahead to look for the next event
    pub event_horizon_secs: i64,
    /// Scheduling pauses while the queue reaches further ahead than this
    pub pause_threshold_secs: i64,
    pub pause_interval_secs: i64,
    pub dispatch_poll_ms: i64,
    pub dispatch_lookahead_secs: i64,
    pub attempts_per_batch: usize,
    pub max_plan_batches: usize,
    /// Remaining gaps up to this long ask the selector for an exact fit
    pub exact_fit_window_secs: i64,
    /// Consecutive empty picks before a plan attempt gives up
    pub max_pick_failures: u32,
    /// Concurrent catalog workers for planning
    pub worker_permits: usize,
    pub enforce_album_limit: bool,
    pub stop_policy: StopPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lead_time_ms: 5_000,
            event_horizon_secs: 3_600,
            pause_threshold_secs: 1_800,
            pause_interval_secs: 300,
            dispatch_poll_ms: 10,
            dispatch_lookahead_secs: 10,
            attempts_per_batch: 10,
            max_plan_batches: 20,
            exact_fit_window_secs: 600,
            max_pick_failures: 10,
            worker_permits: 8,
            enforce_album_limit: false,
            stop_policy: StopPolicy::Halt,
        }
    }
}

impl EngineConfig {
    pub fn normalized(mut self) -> Self {
        self.lead_time_ms = self.lead_time_ms.max(0);
        self.event_horizon_secs = self.event_horizon_secs.max(60);
        self.pause_threshold_secs = self.pause_threshold_secs.max(60);
        self.pause_interval_secs = self.pause_interval_secs.clamp(1, self.pause_threshold_secs);
        self.dispatch_poll_ms = self.dispatch_poll_ms.clamp(1, 1_000);
        self.dispatch_lookahead_secs = self.dispatch_lookahead_secs.max(2);
        self.attempts_per_batch = self.attempts_per_batch.max(1);
        self.max_plan_batches = self.max_plan_batches.max(1);
        self.exact_fit_window_secs = self.exact_fit_window_secs.max(0);
        self.max_pick_failures = self.max_pick_failures.max(1);
        self.worker_permits = self.worker_permits.max(1);
        self
    }

    /// Load the stored configuration, falling back to defaults when absent.
    pub async fn load(store: &dyn QueueStore) -> Result<Self> {
        match store.get_setting(ENGINE_CONFIG_KEY).await? {
            Some(json) => Ok(serde_json::from_str::<EngineConfig>(&json)?.normalized()),
            None => Ok(EngineConfig::default()),
        }
    }

    pub async fn save(&self, store: &dyn QueueStore) -> Result<()> {
        let json = serde_json::to_string(self)?;
        store.set_setting(ENGINE_CONFIG_KEY, &json).await
    }

    /// Apply command-line overrides.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(policy) = args.stop_policy {
            self.stop_policy = policy;
        }
        if args.enforce_album_limit {
            self.enforce_album_limit = true;
        }
        self
    }

    pub fn lead_time(&self) -> Duration {
        Duration::milliseconds(self.lead_time_ms)
    }

    pub fn event_horizon(&self) -> Duration {
        Duration::seconds(self.event_horizon_secs)
    }

    pub fn pause_threshold(&self) -> Duration {
        Duration::seconds(self.pause_threshold_secs)
    }

    pub fn pause_interval(&self) -> Duration {
        Duration::seconds(self.pause_interval_secs)
    }

    pub fn dispatch_poll(&self) -> Duration {
        Duration::milliseconds(self.dispatch_poll_ms)
    }

    pub fn dispatch_lookahead(&self) -> Duration {
        Duration::seconds(self.dispatch_lookahead_secs)
    }

    pub fn exact_fit_window(&self) -> Duration {
        Duration::seconds(self.exact_fit_window_secs)
    }
}

// ── Repetition limits ─────────────────────────────────────────────────────────

pub const SONG_LIMIT_KEY: &str = "song_limit";
pub const ARTIST_LIMIT_KEY: &str = "artist_limit";
pub const ALBUM_LIMIT_KEY: &str = "album_limit";
pub const DEFAULT_LIMIT_SECS: i64 = 3_600;
/// Longer windows are cut to ten years; no queue history reaches that far.
pub const MAX_LIMIT_SECS: i64 = 10 * 366 * 86_400;

/// A repetition window from a number of seconds, clamped to
/// `0..=MAX_LIMIT_SECS`.
pub fn limit_from_secs(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(0, MAX_LIMIT_SECS))
}

/// Start of the window of length `span` ending at `end`. Spans reaching past
/// the representable range start at the Unix epoch.
pub fn window_start(end: DateTime<Local>, span: Duration) -> DateTime<Local> {
    end.checked_sub_signed(span)
        .unwrap_or_else(|| DateTime::from(std::time::UNIX_EPOCH))
}

/// Sliding windows during which a queued song, artist or album may not be
/// queued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepetitionLimits {
    #[serde(serialize_with = "serialize_secs")]
    pub song: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub artist: Duration,
    #[serde(serialize_with = "serialize_opt_secs")]
    pub album: Option<Duration>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_seconds())
}

fn serialize_opt_secs<S: serde::Serializer>(
    d: &Option<Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.num_seconds()),
        None => s.serialize_none(),
    }
}

impl Default for RepetitionLimits {
    fn default() -> Self {
        Self {
            song: Duration::seconds(DEFAULT_LIMIT_SECS),
            artist: Duration::seconds(DEFAULT_LIMIT_SECS),
            album: None,
        }
    }
}

impl RepetitionLimits {
    pub async fn load(store: &dyn QueueStore) -> Result<Self> {
        let song = read_secs(store, SONG_LIMIT_KEY).await?;
        let artist = read_secs(store, ARTIST_LIMIT_KEY).await?;
        let album = read_secs(store, ALBUM_LIMIT_KEY).await?;
        Ok(Self {
            song: song.unwrap_or(Duration::seconds(DEFAULT_LIMIT_SECS)),
            artist: artist.unwrap_or(Duration::seconds(DEFAULT_LIMIT_SECS)),
            album,
        })
    }

    /// Write defaults for any missing song/artist limit.
    pub async fn ensure_defaults(store: &dyn QueueStore) -> Result<()> {
        for key in [SONG_LIMIT_KEY, ARTIST_LIMIT_KEY] {
            if store.get_setting(key).await?.is_none() {
                store.set_setting(key, &DEFAULT_LIMIT_SECS.to_string()).await?;
            }
        }
        Ok(())
    }

    pub async fn save(&self, store: &dyn QueueStore) -> Result<()> {
        store
            .set_setting(SONG_LIMIT_KEY, &self.song.num_seconds().to_string())
            .await?;
        store
            .set_setting(ARTIST_LIMIT_KEY, &self.artist.num_seconds().to_string())
            .await?;
        match self.album {
            Some(album) => {
                store
                    .set_setting(ALBUM_LIMIT_KEY, &album.num_seconds().to_string())
                    .await
            }
            None => store.delete_setting(ALBUM_LIMIT_KEY).await,
        }
    }

    /// The window history must be kept for. The album window only counts when
    /// it is enforced.
    pub fn longest(&self, include_album: bool) -> Duration {
        let mut longest = self.song.max(self.artist);
        if include_album {
            if let Some(album) = self.album {
                longest = longest.max(album);
            }
        }
        longest.max(Duration::zero())
    }
}

async fn read_secs(store: &dyn QueueStore, key: &str) -> Result<Option<Duration>> {
    match store.get_setting(key).await? {
        Some(raw) => {
            let secs: i64 = raw.trim().parse().map_err(|_| {
                AutomationError::Config(format!("setting '{key}' is not a number of seconds: {raw}"))
            })?;
            if secs > MAX_LIMIT_SECS {
                log::warn!("[config] '{key}' of {secs}s cut to {MAX_LIMIT_SECS}s");
            }
            Ok(Some(limit_from_secs(secs)))
        }
        None => Ok(None),
    }
}
