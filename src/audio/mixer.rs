use std::sync::{Arc, Mutex, Weak};

use super::deck::Deck;

/// Sums every registered deck into one interleaved stereo bus (L R L R …).
///
/// Decks register on creation and drop out when released or dropped; the
/// mixer only holds weak references.
pub struct Mixer {
    sample_rate: u32,
    voices: Mutex<Vec<Weak<Mutex<Deck>>>>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            voices: Mutex::new(Vec::new()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn attach(&self, deck: &Arc<Mutex<Deck>>) {
        if let Ok(mut voices) = self.voices.lock() {
            voices.push(Arc::downgrade(deck));
        }
    }

    pub fn detach(&self, deck: &Arc<Mutex<Deck>>) {
        let target = Arc::downgrade(deck);
        if let Ok(mut voices) = self.voices.lock() {
            voices.retain(|v| v.strong_count() > 0 && !v.ptr_eq(&target));
        }
    }

    pub fn voice_count(&self) -> usize {
        self.voices
            .lock()
            .map(|v| v.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Fill `output` with the next block of the mix.
    ///
    /// Runs on the output thread: a deck that is busy with a control call is
    /// skipped for this block rather than waited on.
    pub fn render(&self, output: &mut [f32]) {
        output.fill(0.0);

        let live: Vec<Arc<Mutex<Deck>>> = match self.voices.try_lock() {
            Ok(voices) => voices.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => return,
        };

        for deck in live {
            if let Ok(mut deck) = deck.try_lock() {
                deck.mix_into(output);
            }
        }

        for s in output.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}
