use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Duration;
use ringbuf::traits::Consumer as _;

use super::{
    decoder::{spawn_decoder, DecoderHandle},
    mixer::Mixer,
    MediaPlayer, PlayerFactory, PlayerState,
};
use crate::error::{AutomationError, Result};

/// Render-side state of one voice.
///
/// The deck does not own an output thread. The mixer calls `mix_into()` each
/// time the output sink needs audio.
pub struct Deck {
    pub state: PlayerState,
    decoder: Option<DecoderHandle>,
    pub file_path: Option<PathBuf>,
    pub sample_rate: u32,
    /// Frames pulled by the mixer since the last seek
    pub frames_consumed: u64,
    /// Where the current decoder started, in ms from the start of the file
    pub offset_ms: u64,
    /// Linear gain, 0.0 – 1.0
    pub gain: f32,
}

impl Default for Deck {
    fn default() -> Self {
        Self {
            state: PlayerState::Idle,
            decoder: None,
            file_path: None,
            sample_rate: 44100,
            frames_consumed: 0,
            offset_ms: 0,
            gain: 1.0,
        }
    }
}

impl Deck {
    /// Stop any existing playback and mark `path` as opening.
    fn begin_load(&mut self, path: &Path) {
        self.stop_decoder();
        self.state = PlayerState::Opening;
        self.file_path = Some(path.to_path_buf());
    }

    fn finish_load(&mut self, opened: Result<DecoderHandle>) -> Result<()> {
        match opened {
            Ok(handle) => {
                self.attach(handle, 0);
                self.state = PlayerState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = PlayerState::Idle;
                Err(e)
            }
        }
    }

    /// Swap in a decoder started at `position_ms`. A failed open keeps the
    /// current one.
    fn finish_seek(&mut self, opened: Result<DecoderHandle>, position_ms: u64) -> Result<()> {
        let handle = opened?;
        self.stop_decoder();
        self.attach(handle, position_ms);
        if self.state != PlayerState::Playing && self.state != PlayerState::Paused {
            self.state = PlayerState::Ready;
        }
        Ok(())
    }

    pub fn play(&mut self) {
        if matches!(self.state, PlayerState::Ready | PlayerState::Paused) {
            self.state = PlayerState::Playing;
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
        }
    }

    pub fn stop(&mut self) {
        self.stop_decoder();
        self.state = PlayerState::Stopped;
    }

    pub fn position_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return self.offset_ms;
        }
        self.offset_ms + self.frames_consumed * 1000 / self.sample_rate as u64
    }

    /// Add this deck's next `output.len() / 2` stereo frames, scaled by
    /// `gain`, onto `output`. Underruns contribute silence.
    pub fn mix_into(&mut self, output: &mut [f32]) {
        if self.state != PlayerState::Playing {
            return;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        let mut pulled = 0usize;
        for slot in output.iter_mut() {
            match decoder.consumer.try_pop() {
                Some(s) => {
                    *slot += s * self.gain;
                    pulled += 1;
                }
                None => break,
            }
        }
        self.frames_consumed += (pulled / 2) as u64;

        if decoder.is_drained() {
            self.state = PlayerState::Ended;
        }
    }

    fn attach(&mut self, handle: DecoderHandle, offset_ms: u64) {
        self.sample_rate = handle.sample_rate;
        self.frames_consumed = 0;
        self.offset_ms = offset_ms;
        self.decoder = Some(handle);
    }

    fn stop_decoder(&mut self) {
        if let Some(d) = self.decoder.take() {
            d.stop();
        }
    }
}

impl Drop for Deck {
    fn drop(&mut self) {
        self.stop_decoder();
    }
}

/// Control handle for a deck registered with the mixer.
pub struct DeckPlayer {
    deck: Arc<Mutex<Deck>>,
    mixer: Arc<Mixer>,
    released: bool,
}

impl DeckPlayer {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        let deck = Arc::new(Mutex::new(Deck::default()));
        mixer.attach(&deck);
        Self {
            deck,
            mixer,
            released: false,
        }
    }

    fn with_deck<T>(&self, f: impl FnOnce(&mut Deck) -> T) -> Result<T> {
        let mut deck = self
            .deck
            .lock()
            .map_err(|_| AutomationError::Audio("deck lock poisoned".into()))?;
        Ok(f(&mut deck))
    }
}

impl MediaPlayer for DeckPlayer {
    // Files are probed outside the deck lock so the mixer keeps rendering.
    fn load(&mut self, path: &Path) -> Result<()> {
        self.with_deck(|d| d.begin_load(path))?;
        let opened = spawn_decoder(path, 0);
        self.with_deck(|d| d.finish_load(opened))?
    }

    fn play(&mut self) -> Result<()> {
        self.with_deck(|d| d.play())
    }

    fn pause(&mut self) {
        let _ = self.with_deck(|d| d.pause());
    }

    fn seek(&mut self, offset: Duration) -> Result<()> {
        let ms = offset.num_milliseconds().max(0) as u64;
        let path = self
            .with_deck(|d| d.file_path.clone())?
            .ok_or_else(|| AutomationError::Audio("No media loaded".into()))?;
        let opened = spawn_decoder(&path, ms);
        self.with_deck(|d| d.finish_seek(opened, ms))?
    }

    fn set_volume(&mut self, volume: u8) {
        let gain = f32::from(volume.min(100)) / 100.0;
        let _ = self.with_deck(|d| d.gain = gain);
    }

    fn state(&self) -> PlayerState {
        self.with_deck(|d| d.state).unwrap_or(PlayerState::Stopped)
    }

    fn position(&self) -> Duration {
        let ms = self.with_deck(|d| d.position_ms()).unwrap_or(0);
        Duration::milliseconds(ms as i64)
    }

    fn stop(&mut self) {
        let _ = self.with_deck(|d| d.stop());
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop();
        self.mixer.detach(&self.deck);
        self.released = true;
    }
}

impl Drop for DeckPlayer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Hands out decks that all feed the same mixer.
pub struct DeckFactory {
    mixer: Arc<Mixer>,
}

impl DeckFactory {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        Self { mixer }
    }
}

impl PlayerFactory for DeckFactory {
    fn create(&self) -> Box<dyn MediaPlayer> {
        Box::new(DeckPlayer::new(Arc::clone(&self.mixer)))
    }
}
