//! Polls the queue for entries coming due and hands each one to a detached
//! executor task exactly once.
use std::sync::Arc;

use chrono::Duration;

use super::executor;
use crate::{
    db::models::QueueStatus,
    error::Result,
    state::{self, AppState},
};

/// Launch every queued entry due within the lookahead window. Returns how
/// many were launched.
pub async fn poll_once(state: &Arc<AppState>) -> Result<usize> {
    let now = state.now();
    let due = state
        .queue
        .due_between(now - Duration::seconds(1), now + state.config.dispatch_lookahead())
        .await?;

    let mut launched = 0;
    for (id, _) in due {
        let Some(item) = state.queue.item(id).await? else {
            log::debug!("[dispatcher] {id} vanished, dropping it from the queue");
            state.queue.remove(id).await?;
            continue;
        };
        if item.status != QueueStatus::Queued {
            continue;
        }
        // another poll got there first
        if !state.queue.advance_status(id, QueueStatus::Preparing).await? {
            continue;
        }

        log::info!("[dispatcher] launching {} {} due {}", item.payload.kind(), id, item.due);
        let task_state = Arc::clone(state);
        if item.payload.is_playable() {
            tokio::spawn(executor::play_item(task_state, item));
        } else {
            tokio::spawn(executor::handle_marker(task_state, item));
        }
        launched += 1;
    }
    Ok(launched)
}

/// Poll until the running flag is cleared. A failure clears the flag before
/// it is returned. Launched executors are left to finish on their own.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    log::info!("[dispatcher] started");
    let result: Result<()> = async {
        while state.queue.is_running().await? {
            poll_once(&state).await?;
            state::sleep(state.config.dispatch_poll()).await;
        }
        Ok(())
    }
    .await;

    if let Err(e) = &result {
        log::error!("[dispatcher] stopped on error: {e}");
        if let Err(clear) = state.queue.set_running(false).await {
            log::error!("[dispatcher] could not clear the running flag: {clear}");
        }
    }
    result
}
