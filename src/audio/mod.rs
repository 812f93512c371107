pub mod deck;
pub mod decoder;
pub mod mixer;
pub mod output;

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Player states as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Opening,
    Ready,
    Playing,
    Paused,
    /// Media ran out before being stopped.
    Ended,
    Stopped,
}

impl PlayerState {
    /// Still opening or buffering; not ready to seek or play.
    pub fn is_loading(self) -> bool {
        matches!(self, PlayerState::Idle | PlayerState::Opening)
    }
}

/// One controllable playback voice.
pub trait MediaPlayer: Send {
    fn load(&mut self, path: &Path) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
    /// Jump to `offset` from the start of the media.
    fn seek(&mut self, offset: Duration) -> Result<()>;
    /// 0 – 100
    fn set_volume(&mut self, volume: u8);
    fn state(&self) -> PlayerState;
    fn position(&self) -> Duration;
    fn stop(&mut self);
    /// Give back any decoder or output resources. The player is unusable after.
    fn release(&mut self);
}

pub trait PlayerFactory: Send + Sync {
    fn create(&self) -> Box<dyn MediaPlayer>;
}
