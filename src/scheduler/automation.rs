//! The scheduling loop.
//!
//! A `next_time` cursor walks forward through the queue. Each cycle either
//! drains the entered event's items, plans ahead to the next event, or
//! improvises one song from the rotation, and then pauses while the queue
//! already reaches far enough ahead.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local};

use super::{
    planner::{self, PlanOutcome},
    selector::{self, Exclusions},
    sequence::{default_sequence, SequenceCursor},
};
use crate::{
    config::{window_start, RepetitionLimits, StopPolicy},
    db::models::{Event, EventItem, EventItemContent, EventKind, QueueEvent, QueuePayload, Song},
    error::Result,
    state::{self, AppState},
};

/// Wait before the next cycle when nothing could be picked.
const EMPTY_PICK_BACKOFF_SECS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Improvising,
    PlanningEvent,
    DrainingEventItems,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// A stop event was queued and the stop policy ends scheduling.
    Halt,
}

pub struct Scheduler {
    state: Arc<AppState>,
    next_time: DateTime<Local>,
    current_event: Option<Event>,
    /// Items of the current event not yet queued
    pending_items: VecDeque<EventItem>,
    next_event: Option<Event>,
    /// Start of the last stop event, so it is not found again
    last_stop_start: Option<DateTime<Local>>,
    cursor: SequenceCursor,
    phase: Phase,
}

impl Scheduler {
    pub async fn new(state: Arc<AppState>) -> Result<Self> {
        let next_time = state.now() + state.config.lead_time();
        let cursor = SequenceCursor::new(default_sequence(state.catalog.as_ref(), next_time).await?);
        let mut scheduler = Self {
            state,
            next_time,
            current_event: None,
            pending_items: VecDeque::new(),
            next_event: None,
            last_stop_start: None,
            cursor,
            phase: Phase::Improvising,
        };
        scheduler.next_event = scheduler.find_next_event().await?;
        Ok(scheduler)
    }

    pub fn next_time(&self) -> DateTime<Local> {
        self.next_time
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.current_event.as_ref()
    }

    /// Cycle until the running flag is cleared or a stop event halts the
    /// loop. A failure clears the flag before it is returned.
    pub async fn run(mut self) -> Result<()> {
        log::info!("[scheduler] started, first item at {}", self.next_time);
        let result = self.run_cycles().await;
        if let Err(e) = &result {
            log::error!("[scheduler] stopped on error: {e}");
            if let Err(clear) = self.state.queue.set_running(false).await {
                log::error!("[scheduler] could not clear the running flag: {clear}");
            }
        }
        result
    }

    async fn run_cycles(&mut self) -> Result<()> {
        while self.state.queue.is_running().await? {
            if self.cycle().await? == CycleOutcome::Halt {
                log::info!("[scheduler] stop event queued, scheduling halted");
                break;
            }
        }
        Ok(())
    }

    pub async fn cycle(&mut self) -> Result<CycleOutcome> {
        self.trim().await?;
        self.catch_up();

        if let Some(item) = self.pending_items.pop_front() {
            self.phase = Phase::DrainingEventItems;
            self.drain_items(item).await?;
        } else if let Some(event) = self.next_event.take() {
            self.phase = Phase::PlanningEvent;
            if self.enter_event(event).await? == CycleOutcome::Halt {
                return Ok(CycleOutcome::Halt);
            }
        } else {
            self.phase = Phase::Improvising;
            self.improvise().await?;
        }

        self.pause_while_ahead().await?;
        self.close_or_refill().await?;
        self.next_event = self.find_next_event().await?;
        Ok(CycleOutcome::Continue)
    }

    /// Drop queue history older than every repetition window.
    async fn trim(&self) -> Result<()> {
        let limits = RepetitionLimits::load(self.state.queue.as_ref()).await?;
        let longest = limits.longest(self.state.config.enforce_album_limit);
        let removed = self
            .state
            .queue
            .remove_before(window_start(self.state.now(), longest))
            .await?;
        if removed > 0 {
            log::debug!("[scheduler] trimmed {removed} old queue entries");
        }
        Ok(())
    }

    /// After a stall the cursor may have fallen behind the clock; entries due
    /// before the dispatch window would never play.
    fn catch_up(&mut self) {
        let earliest = self.state.now() + self.state.config.lead_time();
        if self.next_time < self.state.now() {
            log::warn!("[scheduler] queue ran dry, restarting at {earliest}");
            self.next_time = earliest;
        }
    }

    async fn improvise(&mut self) -> Result<()> {
        let category = self.cursor.pop().map(|item| item.category.id);
        let picked = {
            let _permit = self.state.workers.acquire().await?;
            selector::pick(
                &self.state,
                self.next_time,
                category,
                &Exclusions::default(),
                None,
            )
            .await?
        };
        match picked {
            Some(song) => {
                let length = song.length();
                self.queue_song(&song, length).await?;
            }
            None => {
                log::warn!(
                    "[scheduler] nothing eligible for {} (category {:?}), retrying in {}s",
                    self.next_time,
                    category,
                    EMPTY_PICK_BACKOFF_SECS
                );
                state::sleep(Duration::seconds(EMPTY_PICK_BACKOFF_SECS)).await;
            }
        }
        Ok(())
    }

    async fn enter_event(&mut self, event: Event) -> Result<CycleOutcome> {
        log::info!("[scheduler] planning ahead to '{}' at {}", event.name, event.start_time);
        self.plan_to(event.start_time, event.error_margin).await?;

        let (sequence, items) = match &event.kind {
            EventKind::Stop => {
                self.enqueue_marker(QueuePayload::Stop { event_id: event.id }).await?;
                self.last_stop_start = Some(event.start_time);
                return Ok(match self.state.config.stop_policy {
                    StopPolicy::Halt => CycleOutcome::Halt,
                    StopPolicy::Continue => CycleOutcome::Continue,
                });
            }
            EventKind::Play { sequence, items, .. } => (sequence.clone(), items.clone()),
        };

        if let Some(previous) = self.current_event.take() {
            self.enqueue_marker(QueuePayload::EventEnd { event_id: previous.id }).await?;
        }
        self.enqueue_marker(QueuePayload::EventStart { event_id: event.id }).await?;

        let sequence = match sequence {
            Some(sequence) => Some(sequence),
            None => default_sequence(self.state.catalog.as_ref(), self.next_time).await?,
        };
        self.cursor.adopt(sequence);
        self.pending_items = items.into();
        self.current_event = Some(event);

        let leading = self
            .pending_items
            .front()
            .is_some_and(|item| item.start_time.is_none());
        if leading {
            if let Some(item) = self.pending_items.pop_front() {
                self.drain_items(item).await?;
            }
        }
        Ok(CycleOutcome::Continue)
    }

    /// Queue `first`, planning ahead to it when it has a fixed start, then
    /// every following item that has none.
    async fn drain_items(&mut self, first: EventItem) -> Result<()> {
        let mut item = first;
        loop {
            if let Some(start) = item.start_time {
                let margin = item
                    .error_margin
                    .or(self.current_event.as_ref().map(|e| e.error_margin))
                    .unwrap_or_else(Duration::zero);
                self.plan_to(start, margin).await?;
            }
            self.queue_event_item(&item).await?;

            let follows = self
                .pending_items
                .front()
                .is_some_and(|next| next.start_time.is_none());
            match self.pending_items.pop_front() {
                Some(next) if follows => item = next,
                Some(next) => {
                    self.pending_items.push_front(next);
                    break;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn plan_to(&mut self, target: DateTime<Local>, error_margin: Duration) -> Result<()> {
        let outcome = planner::plan(
            &self.state,
            target,
            error_margin,
            self.next_time,
            &self.cursor,
            self.reset_deadline(),
        )
        .await?;
        match outcome {
            PlanOutcome::PlayImmediately => {
                log::warn!("[scheduler] target {target} already passed, playing immediately");
            }
            PlanOutcome::Planned(plan) => {
                for planned in &plan.songs {
                    self.queue_song(&planned.song, planned.length).await?;
                }
                self.cursor = plan.cursor;
            }
        }
        Ok(())
    }

    /// When planned runs leave the current rotation for the schedule grid.
    fn reset_deadline(&self) -> Option<DateTime<Local>> {
        match &self.current_event {
            Some(event) => event.end_time(),
            None => Some(self.next_time),
        }
    }

    async fn pause_while_ahead(&mut self) -> Result<()> {
        let threshold = self.state.config.pause_threshold();
        while self.next_time - self.state.now() > threshold && self.state.queue.is_running().await? {
            self.phase = Phase::Paused;
            self.state.queue.publish(QueueEvent::Updated);
            log::info!(
                "[scheduler] queued {}s ahead, sleeping",
                (self.next_time - self.state.now()).num_seconds()
            );
            state::sleep(self.state.config.pause_interval()).await;
        }
        Ok(())
    }

    async fn close_or_refill(&mut self) -> Result<()> {
        let over = match &self.current_event {
            Some(event) => match event.end_time() {
                Some(end) => self.next_time > end,
                None => self.pending_items.is_empty(),
            },
            None => false,
        };

        if over {
            if let Some(event) = self.current_event.take() {
                log::info!("[scheduler] '{}' is over, back to the default sequence", event.name);
                if !self.pending_items.is_empty() {
                    log::warn!(
                        "[scheduler] dropping {} unplayed items of '{}'",
                        self.pending_items.len(),
                        event.name
                    );
                    self.pending_items.clear();
                }
                self.enqueue_marker(QueuePayload::EventEnd { event_id: event.id }).await?;
            }
            let fallback = default_sequence(self.state.catalog.as_ref(), self.next_time).await?;
            self.cursor = SequenceCursor::new(fallback);
        } else if self.current_event.is_none() {
            let scheduled = default_sequence(self.state.catalog.as_ref(), self.next_time).await?;
            self.cursor.adopt(scheduled);
        } else {
            self.cursor.refill_if_exhausted();
        }
        Ok(())
    }

    async fn find_next_event(&self) -> Result<Option<Event>> {
        let floor = self
            .current_event
            .as_ref()
            .map(|e| e.start_time)
            .unwrap_or(self.next_time);
        let floor = self.last_stop_start.map_or(floor, |stop| floor.max(stop));
        self.state
            .catalog
            .next_event(floor, self.next_time + self.state.config.event_horizon())
            .await
    }

    async fn queue_song(&mut self, song: &Song, length: Duration) -> Result<()> {
        self.state
            .queue
            .enqueue(self.next_time, QueuePayload::song(song, length))
            .await?;
        log::info!(
            "[scheduler] queued '{}' at {} for {}s",
            song.name,
            self.next_time,
            length.num_seconds()
        );
        self.next_time = self.next_time + length;
        Ok(())
    }

    async fn queue_event_item(&mut self, item: &EventItem) -> Result<()> {
        let payload = match &item.content {
            EventItemContent::Song(song) => QueuePayload::song(song, song.length()),
            EventItemContent::Recording { length } => QueuePayload::Audio {
                event_item_id: item.id,
                length: *length,
            },
        };
        self.state.queue.enqueue(self.next_time, payload).await?;
        log::info!(
            "[scheduler] queued event item {} at {} for {}s",
            item.id,
            self.next_time,
            item.length().num_seconds()
        );
        self.next_time = self.next_time + item.length();
        Ok(())
    }

    async fn enqueue_marker(&self, payload: QueuePayload) -> Result<()> {
        log::info!("[scheduler] queued {} marker at {}", payload.kind(), self.next_time);
        self.state.queue.enqueue(self.next_time, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::models::PlayQueueItem;
    use crate::db::queue::QueueStore;
    use crate::testing::{base_time, sequence, song, test_state, test_state_with, TestEnv};

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    fn play_event(id: i64, start: DateTime<Local>, items: Vec<EventItem>) -> Event {
        Event {
            id,
            name: format!("Event {id}"),
            start_time: start,
            error_margin: secs(5),
            kind: EventKind::Play {
                sequence: None,
                end_time: None,
                items,
            },
        }
    }

    fn recording(id: i64, length: i64) -> EventItem {
        EventItem {
            id,
            order: id,
            start_time: None,
            error_margin: None,
            content: EventItemContent::Recording {
                length: secs(length),
            },
        }
    }

    fn songs_of(items: &[PlayQueueItem]) -> Vec<(i64, DateTime<Local>, Duration)> {
        items
            .iter()
            .filter_map(|i| match &i.payload {
                QueuePayload::Song { song_id, length, .. } => Some((*song_id, i.due, *length)),
                _ => None,
            })
            .collect()
    }

    fn markers_of(items: &[PlayQueueItem], kind: &str) -> Vec<DateTime<Local>> {
        items
            .iter()
            .filter(|i| i.payload.kind() == kind)
            .map(|i| i.due)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_cycles_through_categories_in_order() {
        let TestEnv { state, catalog, queue, .. } = test_state();
        for category in 1..=3 {
            for n in 0..3 {
                let id = category * 10 + n;
                catalog.add_song(song(id, category, id, 180, 150, 210));
            }
        }
        catalog.add_sequence(sequence(1, &[1, 2, 3]));
        catalog.schedule_every_hour(1);

        let mut scheduler = Scheduler::new(state).await.unwrap();
        let first = scheduler.next_time();
        for _ in 0..9 {
            assert_eq!(scheduler.cycle().await.unwrap(), CycleOutcome::Continue);
            assert_eq!(scheduler.phase(), Phase::Improvising);
        }

        let queued = songs_of(&queue.all());
        let categories: Vec<i64> = queued.iter().map(|(id, _, _)| id / 10).collect();
        assert_eq!(categories, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
        for (n, (_, due, length)) in queued.iter().enumerate() {
            assert_eq!(*due, first + secs(180 * n as i64));
            assert_eq!(*length, secs(180));
        }
        assert_eq!(scheduler.next_time(), first + secs(9 * 180));
    }

    #[tokio::test(start_paused = true)]
    async fn event_in_the_past_is_queued_without_planning() {
        let TestEnv { state, catalog, queue, .. } = test_state();
        catalog.add_song(song(1, 1, 1, 180, 150, 210));

        let mut scheduler = Scheduler::new(state).await.unwrap();
        let at = scheduler.next_time();
        scheduler.next_event = Some(play_event(7, at - secs(30), vec![recording(70, 60)]));

        scheduler.cycle().await.unwrap();
        let all = queue.all();
        assert!(songs_of(&all).is_empty());
        assert_eq!(markers_of(&all, "event_start"), vec![at]);
        assert_eq!(markers_of(&all, "audio"), vec![at]);
        // no end time and nothing left to drain: the event closes right away
        assert_eq!(markers_of(&all, "event_end"), vec![at + secs(60)]);
        assert!(scheduler.current_event().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn upcoming_event_is_hit_within_its_margin() {
        let TestEnv { state, catalog, queue, .. } = test_state();
        for id in 1..=6 {
            catalog.add_song(song(id, 1, id, 180, 150, 210));
        }
        catalog.add_sequence(sequence(1, &[1]));
        catalog.schedule_every_hour(1);
        let start = base_time() + secs(5) + secs(300);
        catalog.add_event(play_event(3, start, vec![recording(30, 120), recording(31, 60)]));

        let mut scheduler = Scheduler::new(state).await.unwrap();
        scheduler.cycle().await.unwrap();
        assert_eq!(scheduler.phase(), Phase::PlanningEvent);

        let all = queue.all();
        let planned = songs_of(&all);
        assert!(!planned.is_empty());
        let run_end = planned
            .iter()
            .map(|(_, due, length)| *due + *length)
            .max()
            .unwrap();
        assert!(run_end >= start - secs(5) && run_end <= start + secs(5), "run ends {run_end}");

        let entered = markers_of(&all, "event_start");
        assert_eq!(entered, vec![run_end]);
        assert_eq!(markers_of(&all, "audio"), vec![run_end, run_end + secs(120)]);
        assert_eq!(markers_of(&all, "event_end"), vec![run_end + secs(180)]);
        assert_eq!(scheduler.next_time(), run_end + secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_event_items_are_drained_one_per_cycle() {
        let TestEnv { state, catalog, queue, .. } = test_state();
        for id in 1..=6 {
            catalog.add_song(song(id, 1, id, 180, 150, 210));
        }
        let mut scheduler = Scheduler::new(state).await.unwrap();
        let at = scheduler.next_time();
        let mut timed = recording(41, 60);
        timed.start_time = Some(at + secs(60) + secs(300));
        scheduler.next_event = Some(play_event(4, at, vec![recording(40, 60), timed]));

        scheduler.cycle().await.unwrap();
        assert_eq!(markers_of(&queue.all(), "audio"), vec![at]);
        assert!(scheduler.current_event().is_some());

        scheduler.cycle().await.unwrap();
        assert_eq!(scheduler.phase(), Phase::DrainingEventItems);
        let all = queue.all();
        let audio = markers_of(&all, "audio");
        assert_eq!(audio.len(), 2);
        let target = at + secs(360);
        assert!(audio[1] >= target - secs(5) && audio[1] <= target + secs(5));
        assert_eq!(markers_of(&all, "event_end"), vec![audio[1] + secs(60)]);
    }

    #[tokio::test(start_paused = true)]
    async fn event_sequence_applies_until_the_end_time() {
        let TestEnv { state, catalog, queue, .. } = test_state();
        catalog.add_song(song(1, 1, 1, 180, 150, 210));
        for id in 21..=23 {
            catalog.add_song(song(id, 2, id, 180, 150, 210));
        }
        catalog.add_sequence(sequence(1, &[1]));
        catalog.schedule_every_hour(1);

        let mut scheduler = Scheduler::new(state).await.unwrap();
        let at = scheduler.next_time();
        let mut show = play_event(5, at, vec![]);
        show.kind = EventKind::Play {
            sequence: Some(sequence(2, &[2])),
            end_time: Some(at + secs(400)),
            items: vec![],
        };
        scheduler.next_event = Some(show);

        for _ in 0..5 {
            scheduler.cycle().await.unwrap();
        }
        let all = queue.all();
        let categories: Vec<i64> = songs_of(&all).iter().map(|(id, _, _)| id / 10).collect();
        assert_eq!(categories, vec![2, 2, 2, 0]);
        assert_eq!(markers_of(&all, "event_end"), vec![at + secs(540)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_event_halts_or_continues_by_policy() {
        for policy in [StopPolicy::Halt, StopPolicy::Continue] {
            let TestEnv { state, catalog, queue, .. } = test_state_with(EngineConfig {
                stop_policy: policy,
                ..Default::default()
            });
            catalog.add_song(song(1, 1, 1, 180, 150, 210));
            catalog.add_song(song(2, 1, 2, 180, 150, 210));

            let mut scheduler = Scheduler::new(state).await.unwrap();
            let at = scheduler.next_time();
            catalog.add_event(Event {
                id: 9,
                name: "Sign off".into(),
                start_time: at,
                error_margin: secs(5),
                kind: EventKind::Stop,
            });
            scheduler.next_event = catalog.events.lock().unwrap().first().cloned();

            let outcome = scheduler.cycle().await.unwrap();
            assert_eq!(markers_of(&queue.all(), "stop"), vec![at]);
            match policy {
                StopPolicy::Halt => assert_eq!(outcome, CycleOutcome::Halt),
                StopPolicy::Continue => {
                    assert_eq!(outcome, CycleOutcome::Continue);
                    scheduler.cycle().await.unwrap();
                    assert_eq!(scheduler.phase(), Phase::Improvising);
                    assert_eq!(markers_of(&queue.all(), "stop").len(), 1);
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_with_notifications_when_far_ahead() {
        let TestEnv { state, catalog, queue, .. } = test_state();
        catalog.add_song(song(1, 1, 1, 600, 600, 600));
        catalog.add_song(song(2, 1, 2, 600, 600, 600));
        queue.set_setting("song_limit", "0").await.unwrap();
        queue.set_setting("artist_limit", "0").await.unwrap();
        queue.set_running(true).await.unwrap();
        let mut updates = queue.subscribe();

        let scheduler = Scheduler::new(Arc::clone(&state)).await.unwrap();
        let task = tokio::spawn(scheduler.run());

        updates.recv().await.unwrap();
        let first = state.now();
        // three 600 s songs put the cursor past the 30 minute threshold
        assert_eq!(songs_of(&queue.all()).len(), 3);
        updates.recv().await.unwrap();
        assert_eq!(state.now() - first, secs(300));
        updates.recv().await.unwrap();
        assert_eq!(state.now() - first, secs(600));

        queue.set_running(false).await.unwrap();
        task.await.unwrap().unwrap();
        let ahead = songs_of(&queue.all())
            .iter()
            .map(|(_, due, length)| *due + *length)
            .max()
            .unwrap();
        assert!(ahead - state.now() <= secs(1800 + 600));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_rotation_backs_off_between_cycles() {
        let TestEnv { state, queue, .. } = test_state();
        let mut scheduler = Scheduler::new(Arc::clone(&state)).await.unwrap();
        let before = state.now();

        scheduler.cycle().await.unwrap();
        scheduler.cycle().await.unwrap();
        assert_eq!(state.now() - before, secs(2 * EMPTY_PICK_BACKOFF_SECS));
        assert!(queue.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_clears_the_running_flag() {
        let TestEnv { state, queue, .. } = test_state();
        queue.set_running(true).await.unwrap();
        queue.set_setting("song_limit", "soon").await.unwrap();

        let scheduler = Scheduler::new(state).await.unwrap();
        assert!(scheduler.run().await.is_err());
        assert!(!queue.is_running().await.unwrap());
    }
}
