//! Real-time playback of one queue entry.
//!
//! Volume follows keyframes pinned to wall-clock time: an optional pre-roll
//! at 40 % from two seconds before the due time, full volume from the due
//! time to the end of the assigned length, then a five second fade to
//! silence. Executors run detached, so failures are logged here.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local};
use tokio::runtime::RuntimeFlavor;

use crate::{
    audio::{MediaPlayer, PlayerState},
    db::{
        models::{Play, PlayKind, PlayQueueItem, QueueEvent, QueuePayload, QueueStatus},
        queue::PID_KEY,
    },
    error::{AutomationError, Result},
    state::{self, AppState},
};

const PREROLL: i64 = 2;
const PREROLL_VOLUME: u8 = 40;
const FADE_OUT: i64 = 5;
/// Volume update interval during fades
const STEP_MS: i64 = 10;
/// Give up on media that never leaves the opening state
const OPEN_TIMEOUT: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyframe {
    pub at: DateTime<Local>,
    /// 0 – 100
    pub volume: u8,
}

pub fn keyframes(due: DateTime<Local>, start: Duration, length: Duration) -> Vec<Keyframe> {
    let mut frames = Vec::with_capacity(4);
    if start >= Duration::seconds(PREROLL) {
        frames.push(Keyframe {
            at: due - Duration::seconds(PREROLL),
            volume: PREROLL_VOLUME,
        });
    }
    frames.push(Keyframe { at: due, volume: 100 });
    frames.push(Keyframe {
        at: due + length,
        volume: 100,
    });
    frames.push(Keyframe {
        at: due + length + Duration::seconds(FADE_OUT),
        volume: 0,
    });
    frames
}

/// Linear interpolation between two keyframes, clamped to their span.
pub fn volume_at(previous: Keyframe, next: Keyframe, now: DateTime<Local>) -> u8 {
    let span = (next.at - previous.at).num_milliseconds();
    if span <= 0 {
        return next.volume;
    }
    let elapsed = (now - previous.at).num_milliseconds().clamp(0, span);
    let from = i64::from(previous.volume);
    let delta = i64::from(next.volume) - from;
    (from + delta * elapsed / span).clamp(0, 100) as u8
}

/// Play a song or recording entry through to its fade-out.
pub async fn play_item(state: Arc<AppState>, item: PlayQueueItem) {
    if let Err(e) = run_item(&state, &item).await {
        log::error!("[executor] {} {} failed: {e}", item.payload.kind(), item.id);
        if let Err(e) = state.queue.advance_status(item.id, QueueStatus::Played).await {
            log::error!("[executor] could not retire {}: {e}", item.id);
        }
        state.queue.publish(QueueEvent::Updated);
    }
}

/// Wait for a marker entry to come due and retire it. A stop marker ends the run.
pub async fn handle_marker(state: Arc<AppState>, item: PlayQueueItem) {
    if let Err(e) = run_marker(&state, &item).await {
        log::error!("[executor] {} marker {} failed: {e}", item.payload.kind(), item.id);
    }
}

async fn run_marker(state: &AppState, item: &PlayQueueItem) -> Result<()> {
    state::sleep(item.due - state.now()).await;
    state.queue.advance_status(item.id, QueueStatus::Played).await?;
    state.queue.publish(QueueEvent::Updated);
    if let QueuePayload::Stop { event_id } = item.payload {
        log::info!("[executor] stop event {event_id} reached, automation stopping");
        state.queue.set_running(false).await?;
        state.queue.delete_setting(PID_KEY).await?;
    }
    Ok(())
}

fn media_path(state: &AppState, payload: &QueuePayload) -> Result<(PathBuf, Duration, Duration)> {
    match payload {
        QueuePayload::Song {
            filename,
            start,
            length,
            ..
        } => Ok((state.paths.song_dir.join(filename), *start, *length)),
        QueuePayload::Audio {
            event_item_id,
            length,
        } => Ok((
            state.paths.audio_dir.join(event_item_id.to_string()),
            Duration::zero(),
            *length,
        )),
        other => Err(AutomationError::InvalidData(format!(
            "{} entries have no media",
            other.kind()
        ))),
    }
}

async fn run_item(state: &AppState, item: &PlayQueueItem) -> Result<()> {
    let (path, start, length) = media_path(state, &item.payload)?;
    let mut player = state.players.create();
    let result = drive(state, item, player.as_mut(), &path, start, length).await;
    player.stop();
    player.release();
    result?;

    if !state.queue.is_running().await? {
        state.queue.delete_setting(PID_KEY).await?;
    }
    Ok(())
}

async fn drive(
    state: &AppState,
    item: &PlayQueueItem,
    player: &mut dyn MediaPlayer,
    path: &std::path::Path,
    start: Duration,
    length: Duration,
) -> Result<()> {
    player.set_volume(0);
    off_worker(|| player.load(path))?;
    let opened_by = state.now() + Duration::seconds(OPEN_TIMEOUT);
    while player.state().is_loading() {
        if state.now() > opened_by {
            return Err(AutomationError::Audio(format!(
                "timed out opening {}",
                path.display()
            )));
        }
        state::sleep(Duration::milliseconds(STEP_MS)).await;
    }

    let frames = keyframes(item.due, start, length);
    // when the top of the file must be playing for the trim-in to land on the due time
    let play_time = item.due - start;
    let now = state.now();
    let mut previous = if play_time >= now {
        off_worker(|| player.seek(Duration::zero()))?;
        player.set_volume(frames[0].volume);
        state::sleep(play_time - now).await;
        Keyframe {
            at: play_time,
            volume: frames[0].volume,
        }
    } else {
        let into = now - play_time;
        log::warn!(
            "[executor] {} started late, joining {}ms into the file",
            item.id,
            into.num_milliseconds()
        );
        off_worker(|| player.seek(into))?;
        Keyframe { at: now, volume: 0 }
    };
    player.play()?;

    for next in frames {
        if !wait_for(state, player, previous, next).await {
            log::info!("[executor] {} media ended early", item.id);
            break;
        }
        if next.at == item.due {
            reached_due(state, item, length).await?;
        }
        previous = next;
    }

    state.queue.advance_status(item.id, QueueStatus::Played).await?;
    state.queue.publish(QueueEvent::Updated);
    log::info!("[executor] {} {} played", item.payload.kind(), item.id);
    Ok(())
}

/// Run a player call that opens files without stalling the other tasks on
/// this worker. Single-threaded runtimes just run it in place.
fn off_worker<T>(call: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(call),
        _ => call(),
    }
}

/// Ramp towards `next` until its time passes. False if the media ran out first.
async fn wait_for(
    state: &AppState,
    player: &mut dyn MediaPlayer,
    previous: Keyframe,
    next: Keyframe,
) -> bool {
    let second = Duration::seconds(1);
    loop {
        if player.state() == PlayerState::Ended {
            return false;
        }
        let now = state.now();
        if now > next.at {
            player.set_volume(next.volume);
            return true;
        }
        if previous.volume == next.volume && next.at - now > second {
            state::sleep(second).await;
            continue;
        }
        player.set_volume(volume_at(previous, next, now));
        state::sleep(Duration::milliseconds(STEP_MS)).await;
    }
}

async fn reached_due(state: &AppState, item: &PlayQueueItem, length: Duration) -> Result<()> {
    state.queue.advance_status(item.id, QueueStatus::Playing).await?;
    state.queue.publish(QueueEvent::Updated);
    if let QueuePayload::Song { song_id, .. } = item.payload {
        state
            .catalog
            .record_play(&Play {
                stream: state.stream.clone(),
                time: state.now(),
                length_ms: length.num_milliseconds(),
                kind: PlayKind::Song,
                song_id: Some(song_id),
            })
            .await?;
    }
    Ok(())
}
