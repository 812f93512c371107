use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local};
use tokio::sync::Semaphore;

use crate::{
    audio::PlayerFactory,
    config::{EngineConfig, RepetitionLimits},
    db::{
        catalog::Catalog,
        queue::{QueueStore, PID_KEY},
    },
    error::Result,
};

/// Wall-clock source. Everything that compares against due times asks this.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Sleep on the tokio timer for a chrono span. Negative spans return at once.
pub async fn sleep(span: Duration) {
    if let Ok(span) = span.to_std() {
        tokio::time::sleep(span).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPaths {
    pub song_dir: PathBuf,
    pub audio_dir: PathBuf,
}

/// Handle shared by the scheduler, planner, dispatcher and executors.
/// Built once at startup; there is no other shared state.
pub struct AppState {
    pub catalog: Arc<dyn Catalog>,
    pub queue: Arc<dyn QueueStore>,
    pub players: Arc<dyn PlayerFactory>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub paths: MediaPaths,
    /// Stream name written into the play log
    pub stream: String,
    /// Bounds concurrent catalog work from planning attempts
    pub workers: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        queue: Arc<dyn QueueStore>,
        players: Arc<dyn PlayerFactory>,
        config: EngineConfig,
        paths: MediaPaths,
        stream: impl Into<String>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_permits));
        Self {
            catalog,
            queue,
            players,
            clock: Arc::new(SystemClock),
            config,
            paths,
            stream: stream.into(),
            workers,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    /// Claim the queue for this process: liveness marker, default limits,
    /// no leftover future entries, running flag set.
    pub async fn setup(&self) -> Result<()> {
        self.queue
            .set_setting(PID_KEY, &std::process::id().to_string())
            .await?;
        RepetitionLimits::ensure_defaults(self.queue.as_ref()).await?;
        let flushed = self.queue.remove_after(self.now()).await?;
        if flushed > 0 {
            log::info!("[setup] flushed {flushed} future queue entries");
        }
        self.queue.set_running(true).await?;
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        self.queue.set_running(false).await?;
        self.queue.delete_setting(PID_KEY).await?;
        Ok(())
    }
}
