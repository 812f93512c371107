//! Consumable rotation state for the active sequence.
//!
//! The cursor owns a fully materialised copy of the pending items, so a plan
//! attempt can pop from a clone without touching the scheduler's copy.

use std::collections::VecDeque;

use chrono::{DateTime, Datelike, Local, Timelike};

use crate::{
    db::{
        catalog::Catalog,
        models::{Sequence, SequenceItem},
    },
    error::Result,
};

/// Items of `sequence` in rotation order. No sequence means no rotation.
pub fn items(sequence: Option<&Sequence>) -> VecDeque<SequenceItem> {
    sequence
        .map(|s| s.items.iter().cloned().collect())
        .unwrap_or_default()
}

/// The sequence the schedule grid assigns to the hour containing `at`.
pub async fn default_sequence(catalog: &dyn Catalog, at: DateTime<Local>) -> Result<Option<Sequence>> {
    let day = at.weekday().num_days_from_monday() as u8;
    let hour = at.hour() as u8;
    match catalog.scheduled_sequence(day, hour).await? {
        Some(id) => catalog.sequence(id).await,
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCursor {
    sequence: Option<Sequence>,
    items: VecDeque<SequenceItem>,
}

impl SequenceCursor {
    pub fn new(sequence: Option<Sequence>) -> Self {
        let items = items(sequence.as_ref());
        Self { sequence, items }
    }

    pub fn sequence(&self) -> Option<&Sequence> {
        self.sequence.as_ref()
    }

    pub fn sequence_id(&self) -> Option<i64> {
        self.sequence.as_ref().map(|s| s.id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    pub fn pop(&mut self) -> Option<SequenceItem> {
        self.items.pop_front()
    }

    /// Start the rotation over once every item has been used.
    pub fn refill_if_exhausted(&mut self) {
        if self.items.is_empty() {
            self.items = items(self.sequence.as_ref());
        }
    }

    /// Switch to `sequence` when it differs from the active one, otherwise
    /// only refill. Returns whether the sequence changed.
    pub fn adopt(&mut self, sequence: Option<Sequence>) -> bool {
        let changed = sequence.as_ref().map(|s| s.id) != self.sequence_id();
        if changed {
            log::info!(
                "[sequence] switching to {}",
                sequence.as_ref().map(|s| s.name.as_str()).unwrap_or("<none>")
            );
            *self = Self::new(sequence);
        } else {
            self.refill_if_exhausted();
        }
        changed
    }
}
