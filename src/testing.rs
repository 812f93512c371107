//! In-memory stand-ins for the stores, the media player and the clock.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, TimeZone};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    audio::{MediaPlayer, PlayerFactory, PlayerState},
    config::EngineConfig,
    db::{
        catalog::{Catalog, SongQuery},
        models::{
            Category, Event, Play, PlayQueueItem, QueueEvent, QueuePayload, QueueStatus, Sequence,
            SequenceItem, Song,
        },
        queue::QueueStore,
    },
    error::Result,
    state::{AppState, Clock, MediaPaths},
};

/// Monday 2024-06-03 12:00 local time.
pub fn base_time() -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2024, 6, 3, 12, 0, 0)
        .earliest()
        .expect("valid base time")
}

pub fn song(id: i64, category_id: i64, artist: i64, len: i64, min: i64, max: i64) -> Song {
    Song {
        id,
        category_id,
        name: format!("Song {id}"),
        album: None,
        start: Duration::zero(),
        end: Duration::seconds(len),
        min_end: Duration::seconds(min),
        max_end: Duration::seconds(max),
        filename: format!("{id}.mp3"),
        artists: vec![artist],
    }
}

pub fn sequence(id: i64, categories: &[i64]) -> Sequence {
    Sequence {
        id,
        name: format!("Sequence {id}"),
        items: categories
            .iter()
            .enumerate()
            .map(|(i, c)| SequenceItem {
                number: i as i64 + 1,
                category: Category {
                    id: *c,
                    name: format!("Category {c}"),
                },
            })
            .collect(),
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Wall clock that follows tokio's (possibly paused) time from a fixed base.
pub struct TestClock {
    base: DateTime<Local>,
    started: tokio::time::Instant,
}

impl TestClock {
    pub fn new(base: DateTime<Local>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Local> {
        let elapsed = tokio::time::Instant::now() - self.started;
        self.base + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCatalog {
    pub songs: Mutex<Vec<Song>>,
    pub sequences: Mutex<HashMap<i64, Sequence>>,
    pub schedule: Mutex<HashMap<(u8, u8), i64>>,
    pub events: Mutex<Vec<Event>>,
    pub plays: Mutex<Vec<Play>>,
}

impl MemoryCatalog {
    pub fn add_song(&self, song: Song) {
        self.songs.lock().unwrap().push(song);
    }

    pub fn add_sequence(&self, sequence: Sequence) {
        self.sequences.lock().unwrap().insert(sequence.id, sequence);
    }

    pub fn schedule_every_hour(&self, sequence_id: i64) {
        let mut schedule = self.schedule.lock().unwrap();
        for day in 0..7 {
            for hour in 0..24 {
                schedule.insert((day, hour), sequence_id);
            }
        }
    }

    pub fn add_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn song(&self, id: i64) -> Result<Option<Song>> {
        Ok(self.songs.lock().unwrap().iter().find(|s| s.id == id).cloned())
    }

    async fn eligible_songs(&self, query: &SongQuery) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .songs
            .lock()
            .unwrap()
            .iter()
            .filter(|s| query.matches(s))
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn category(&self, id: i64) -> Result<Option<Category>> {
        let sequences = self.sequences.lock().unwrap();
        Ok(sequences
            .values()
            .flat_map(|s| s.items.iter())
            .find(|i| i.category.id == id)
            .map(|i| i.category.clone()))
    }

    async fn sequence(&self, id: i64) -> Result<Option<Sequence>> {
        Ok(self.sequences.lock().unwrap().get(&id).cloned())
    }

    async fn scheduled_sequence(&self, day: u8, hour: u8) -> Result<Option<i64>> {
        Ok(self.schedule.lock().unwrap().get(&(day, hour)).copied())
    }

    async fn next_event(
        &self,
        after: DateTime<Local>,
        until: DateTime<Local>,
    ) -> Result<Option<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.start_time > after && e.start_time <= until)
            .min_by_key(|e| (e.start_time, e.id))
            .cloned())
    }

    async fn record_play(&self, play: &Play) -> Result<()> {
        self.plays.lock().unwrap().push(play.clone());
        Ok(())
    }

    async fn plays_between(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Play>> {
        Ok(self
            .plays
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.time >= from && p.time < to)
            .cloned()
            .collect())
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueInner {
    index: BTreeMap<(DateTime<Local>, Uuid), ()>,
    records: HashMap<Uuid, PlayQueueItem>,
    settings: HashMap<String, String>,
}

pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    updates: broadcast::Sender<QueueEvent>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(QueueInner::default()),
            updates,
        }
    }
}

impl MemoryQueue {
    /// Drop an entry's record but leave its id in the time index.
    pub fn forget_record(&self, id: Uuid) {
        self.inner.lock().unwrap().records.remove(&id);
    }

    pub fn all(&self) -> Vec<PlayQueueItem> {
        let inner = self.inner.lock().unwrap();
        inner
            .index
            .keys()
            .filter_map(|(_, id)| inner.records.get(id).cloned())
            .collect()
    }

    pub fn index_len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn enqueue(&self, due: DateTime<Local>, payload: QueuePayload) -> Result<PlayQueueItem> {
        let item = PlayQueueItem {
            id: Uuid::new_v4(),
            due,
            status: QueueStatus::Queued,
            payload,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(item.id, item.clone());
        inner.index.insert((due, item.id), ());
        Ok(item)
    }

    async fn due_between(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<(Uuid, DateTime<Local>)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index
            .keys()
            .filter(|(due, _)| *due >= from && *due <= to)
            .map(|(due, id)| (*id, *due))
            .collect())
    }

    async fn item(&self, id: Uuid) -> Result<Option<PlayQueueItem>> {
        let inner = self.inner.lock().unwrap();
        let indexed = inner.index.keys().any(|(_, i)| *i == id);
        Ok(inner.records.get(&id).filter(|_| indexed).cloned())
    }

    async fn items_between(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
    ) -> Result<Vec<PlayQueueItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index
            .keys()
            .filter(|(due, _)| *due >= from && *due <= to)
            .filter_map(|(_, id)| inner.records.get(id).cloned())
            .collect())
    }

    async fn advance_status(&self, id: Uuid, status: QueueStatus) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.records.get_mut(&id) {
            Some(item) if item.status < status => {
                item.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().index.retain(|(_, i), _| *i != id);
        Ok(())
    }

    async fn remove_before(&self, cutoff: DateTime<Local>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let gone: Vec<(DateTime<Local>, Uuid)> =
            inner.index.keys().filter(|(due, _)| *due < cutoff).copied().collect();
        for key in &gone {
            inner.index.remove(key);
            inner.records.remove(&key.1);
        }
        Ok(gone.len() as u64)
    }

    async fn remove_after(&self, cutoff: DateTime<Local>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let gone: Vec<(DateTime<Local>, Uuid)> =
            inner.index.keys().filter(|(due, _)| *due > cutoff).copied().collect();
        for key in &gone {
            inner.index.remove(key);
            inner.records.remove(&key.1);
        }
        Ok(gone.len() as u64)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().settings.remove(key);
        Ok(())
    }

    fn publish(&self, event: QueueEvent) {
        let _ = self.updates.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.updates.subscribe()
    }
}

// ── Player ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCall {
    Load(PathBuf),
    Play,
    Seek(Duration),
    Volume(u8),
    Stop,
    Release,
}

pub type CallLog = Arc<Mutex<Vec<(DateTime<Local>, PlayerCall)>>>;

pub struct FakePlayer {
    clock: Arc<dyn Clock>,
    calls: CallLog,
    state: PlayerState,
}

impl FakePlayer {
    fn log(&self, call: PlayerCall) {
        self.calls.lock().unwrap().push((self.clock.now(), call));
    }
}

impl MediaPlayer for FakePlayer {
    fn load(&mut self, path: &Path) -> Result<()> {
        self.log(PlayerCall::Load(path.to_path_buf()));
        self.state = PlayerState::Ready;
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.log(PlayerCall::Play);
        self.state = PlayerState::Playing;
        Ok(())
    }

    fn pause(&mut self) {
        self.state = PlayerState::Paused;
    }

    fn seek(&mut self, offset: Duration) -> Result<()> {
        self.log(PlayerCall::Seek(offset));
        Ok(())
    }

    fn set_volume(&mut self, volume: u8) {
        self.log(PlayerCall::Volume(volume));
    }

    fn state(&self) -> PlayerState {
        self.state
    }

    fn position(&self) -> Duration {
        Duration::zero()
    }

    fn stop(&mut self) {
        self.log(PlayerCall::Stop);
        self.state = PlayerState::Stopped;
    }

    fn release(&mut self) {
        self.log(PlayerCall::Release);
    }
}

pub struct FakePlayerFactory {
    clock: Arc<dyn Clock>,
    pub calls: CallLog,
}

impl PlayerFactory for FakePlayerFactory {
    fn create(&self) -> Box<dyn MediaPlayer> {
        Box::new(FakePlayer {
            clock: Arc::clone(&self.clock),
            calls: Arc::clone(&self.calls),
            state: PlayerState::Idle,
        })
    }
}

// ── Assembled context ─────────────────────────────────────────────────────────

pub struct TestEnv {
    pub state: Arc<AppState>,
    pub catalog: Arc<MemoryCatalog>,
    pub queue: Arc<MemoryQueue>,
    pub calls: CallLog,
}

pub fn test_state() -> TestEnv {
    test_state_with(EngineConfig::default())
}

pub fn test_state_with(config: EngineConfig) -> TestEnv {
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new(base_time()));
    let catalog = Arc::new(MemoryCatalog::default());
    let queue = Arc::new(MemoryQueue::default());
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let players = Arc::new(FakePlayerFactory {
        clock: Arc::clone(&clock),
        calls: Arc::clone(&calls),
    });
    let state = AppState::new(
        catalog.clone(),
        queue.clone(),
        players,
        config,
        MediaPaths {
            song_dir: PathBuf::from("/songs"),
            audio_dir: PathBuf::from("/events"),
        },
        "test",
    )
    .with_clock(clock);
    TestEnv {
        state: Arc::new(state),
        catalog,
        queue,
        calls,
    }
}
