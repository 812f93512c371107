//! Elastic run planning ahead of a fixed start time.
//!
//! Each attempt assembles songs from the rotation until the gap is covered,
//! then the best candidate is trimmed (`shorten`) or stretched with its last
//! song dropped (`lengthen`) so the run ends within the target's error margin.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local};
use tokio::task::JoinSet;

use super::{
    selector::{self, Exclusions},
    sequence::{default_sequence, SequenceCursor},
};
use crate::{
    db::models::Song,
    error::{AutomationError, Result},
    state::AppState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSong {
    pub song: Song,
    /// Assigned on-air length, between the song's min and max length
    pub length: Duration,
}

/// Result of one randomized attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub songs: Vec<PlannedSong>,
    /// Rotation state after the last pick
    pub cursor: SequenceCursor,
    pub length: Duration,
    pub min_length: Duration,
    pub max_length: Duration,
    /// Overshoot of the full run
    pub distance: Duration,
    /// Shortfall of the run without its last song
    pub mls_distance: Duration,
    pub can_shorten: bool,
    pub can_lengthen: bool,
    /// False when the attempt gave up before covering the target
    pub complete: bool,
}

impl Candidate {
    fn new(
        songs: Vec<PlannedSong>,
        cursor: SequenceCursor,
        target: Duration,
        error_margin: Duration,
        complete: bool,
    ) -> Self {
        let sum = |f: fn(&Song) -> Duration| {
            songs
                .iter()
                .fold(Duration::zero(), |acc, p| acc + f(&p.song))
        };
        let length = sum(Song::length);
        let min_length = sum(Song::min_length);
        let max_length = sum(Song::max_length);
        let (last_length, last_max) = songs
            .last()
            .map(|p| (p.song.length(), p.song.max_length()))
            .unwrap_or((Duration::zero(), Duration::zero()));

        let usable = complete && !songs.is_empty();
        Self {
            can_shorten: usable && min_length <= target + error_margin,
            can_lengthen: usable && max_length - last_max >= target - error_margin,
            distance: length - target,
            mls_distance: target - (length - last_length),
            songs,
            cursor,
            length,
            min_length,
            max_length,
            complete: usable,
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.can_shorten || self.can_lengthen
    }

    fn rank_distance(&self) -> Duration {
        if self.complete {
            self.distance.min(self.mls_distance)
        } else {
            magnitude(self.distance)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Shorten,
    Lengthen,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub songs: Vec<PlannedSong>,
    pub cursor: SequenceCursor,
    pub adjustment: Adjustment,
    /// Whether the run ends within the error margin
    pub feasible: bool,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Planned(Plan),
    /// The target is already at or before the start time.
    PlayImmediately,
}

/// One randomized pass over the rotation, covering `target_length` from
/// `start_time`. Once the simulated clock passes `reset_deadline` the
/// rotation follows the schedule grid instead of the given cursor.
pub async fn attempt(
    state: &AppState,
    target_length: Duration,
    error_margin: Duration,
    start_time: DateTime<Local>,
    mut cursor: SequenceCursor,
    reset_deadline: Option<DateTime<Local>>,
) -> Result<Candidate> {
    let with_album = state.config.enforce_album_limit;
    let mut songs: Vec<PlannedSong> = Vec::new();
    let mut held = Exclusions::default();
    let mut length = Duration::zero();
    let mut next_time = start_time;
    let mut failures = 0u32;
    let mut complete = true;

    while length < target_length {
        if failures >= state.config.max_pick_failures {
            complete = false;
            break;
        }

        let remaining = target_length - length;
        let fit = (remaining <= state.config.exact_fit_window()).then_some(remaining);
        let category = cursor.pop().map(|item| item.category.id);

        let song = match selector::pick(state, next_time, category, &held, fit).await? {
            Some(song) if song.length() > Duration::zero() => song,
            _ => {
                failures += 1;
                continue;
            }
        };
        failures = 0;

        held.add(&song, with_album);
        length = length + song.length();
        next_time = next_time + song.length();
        songs.push(PlannedSong {
            length: song.length(),
            song,
        });

        match reset_deadline {
            Some(deadline) if next_time > deadline => {
                let fallback = default_sequence(state.catalog.as_ref(), next_time).await?;
                cursor.adopt(fallback);
            }
            _ => cursor.refill_if_exhausted(),
        }
    }

    Ok(Candidate::new(
        songs,
        cursor,
        target_length,
        error_margin,
        complete,
    ))
}

/// Fill the gap between `start_time` and `target_time` so the run ends within
/// `error_margin` of the target.
pub async fn plan(
    state: &Arc<AppState>,
    target_time: DateTime<Local>,
    error_margin: Duration,
    start_time: DateTime<Local>,
    cursor: &SequenceCursor,
    reset_deadline: Option<DateTime<Local>>,
) -> Result<PlanOutcome> {
    if target_time <= start_time {
        return Ok(PlanOutcome::PlayImmediately);
    }
    let target_length = target_time - start_time;

    let mut candidates = Vec::new();
    for batch in 0..state.config.max_plan_batches {
        let results = run_batch(
            state,
            target_length,
            error_margin,
            start_time,
            cursor,
            reset_deadline,
        )
        .await?;
        candidates.extend(results);
        if candidates.iter().any(Candidate::is_feasible) {
            break;
        }
        log::debug!("[planner] batch {} found no feasible run", batch + 1);
    }

    rank(&mut candidates);
    let Some(best) = candidates.into_iter().next() else {
        return Err(AutomationError::Config(
            "planning ran without any attempts".into(),
        ));
    };
    let plan = finish(best, target_length, error_margin);

    if plan.feasible {
        log::info!(
            "[planner] {:?} {} songs to {}s for a {}s gap",
            plan.adjustment,
            plan.songs.len(),
            plan.total.num_seconds(),
            target_length.num_seconds()
        );
    } else {
        log::warn!(
            "[planner] no run fits {}s within ±{}s, best effort is {}s",
            target_length.num_seconds(),
            error_margin.num_seconds(),
            plan.total.num_seconds()
        );
    }
    Ok(PlanOutcome::Planned(plan))
}

async fn run_batch(
    state: &Arc<AppState>,
    target_length: Duration,
    error_margin: Duration,
    start_time: DateTime<Local>,
    cursor: &SequenceCursor,
    reset_deadline: Option<DateTime<Local>>,
) -> Result<Vec<Candidate>> {
    let mut set = JoinSet::new();
    for index in 0..state.config.attempts_per_batch {
        let state = Arc::clone(state);
        let cursor = cursor.clone();
        set.spawn(async move {
            let _permit = Arc::clone(&state.workers).acquire_owned().await?;
            let candidate = attempt(
                &state,
                target_length,
                error_margin,
                start_time,
                cursor,
                reset_deadline,
            )
            .await?;
            Ok::<_, AutomationError>((index, candidate))
        });
    }

    let mut results = Vec::with_capacity(state.config.attempts_per_batch);
    while let Some(joined) = set.join_next().await {
        results.push(joined??);
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, c)| c).collect())
}

/// Feasible candidates first, then by closeness. Stable, so attempt order
/// breaks ties.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|c| (!c.is_feasible(), c.rank_distance()));
}

fn finish(best: Candidate, target_length: Duration, error_margin: Duration) -> Plan {
    let Candidate {
        mut songs,
        cursor,
        distance,
        mls_distance,
        can_shorten,
        can_lengthen,
        complete,
        ..
    } = best;

    let adjustment = match (can_shorten, can_lengthen) {
        (true, false) => Adjustment::Shorten,
        (false, true) => Adjustment::Lengthen,
        _ if !complete => Adjustment::Lengthen,
        _ => {
            if magnitude(distance) <= magnitude(mls_distance) {
                Adjustment::Shorten
            } else {
                Adjustment::Lengthen
            }
        }
    };

    let left = match adjustment {
        Adjustment::Shorten => shorten(&mut songs, distance, error_margin),
        // An incomplete run keeps every song and stretches toward the target.
        Adjustment::Lengthen if !complete => lengthen(&mut songs, -distance, error_margin),
        Adjustment::Lengthen => {
            songs.pop();
            lengthen(&mut songs, mls_distance, error_margin)
        }
    };

    let total = songs.iter().fold(Duration::zero(), |acc, p| acc + p.length);
    Plan {
        feasible: complete && left <= error_margin && magnitude(total - target_length) <= error_margin,
        songs,
        cursor,
        adjustment,
        total,
    }
}

/// Take up to `distance` out of the run in one-second round-robin steps,
/// never below a song's min length. Returns what could not be removed.
pub fn shorten(songs: &mut [PlannedSong], mut distance: Duration, error_margin: Duration) -> Duration {
    let step = Duration::seconds(1);
    while distance > error_margin {
        let mut moved = Duration::zero();
        for planned in songs.iter_mut() {
            let slack = planned.length - planned.song.min_length();
            let by = distance.min(slack).min(step).max(Duration::zero());
            planned.length = planned.length - by;
            distance = distance - by;
            moved = moved + by;
        }
        if moved == Duration::zero() {
            break;
        }
    }
    distance
}

/// Add up to `distance` to the run in one-second round-robin steps, never
/// beyond a song's max length. Returns what could not be added.
pub fn lengthen(songs: &mut [PlannedSong], mut distance: Duration, error_margin: Duration) -> Duration {
    let step = Duration::seconds(1);
    while distance > error_margin {
        let mut moved = Duration::zero();
        for planned in songs.iter_mut() {
            let slack = planned.song.max_length() - planned.length;
            let by = distance.min(slack).min(step).max(Duration::zero());
            planned.length = planned.length + by;
            distance = distance - by;
            moved = moved + by;
        }
        if moved == Duration::zero() {
            break;
        }
    }
    distance
}

fn magnitude(d: Duration) -> Duration {
    if d < Duration::zero() {
        -d
    } else {
        d
    }
}
