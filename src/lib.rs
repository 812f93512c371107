pub mod audio;
pub mod config;
pub mod db;
pub mod error;
pub mod playout;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use chrono::{Duration, Local, NaiveDate, TimeZone};
use clap::Parser;

use audio::{deck::DeckFactory, output::start_output};
use config::{
    limit_from_secs, window_start, Args, Command, EngineConfig, RepetitionLimits, MAX_LIMIT_SECS,
};
use db::{
    catalog::{Catalog, SqliteCatalog},
    models::QueueStatus,
    queue::{QueueStore, SqliteQueueStore},
};
use error::{AutomationError, Result};
use scheduler::Scheduler;
use state::{AppState, MediaPaths};

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[startup] failed to build the Tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_command(args)) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run_command(args: Args) -> Result<()> {
    // ── Stores ───────────────────────────────────────────────────────────────
    let pool = db::init_db(&args.db).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::new(pool.clone()));
    let queue: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::new(pool));
    let config = EngineConfig::load(queue.as_ref()).await?.with_args(&args);

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => automate(&args, catalog, queue, config).await,
        Command::Queue { history, ahead } => {
            let now = Local::now();
            let minutes = |m: i64| Duration::minutes(m.clamp(0, MAX_LIMIT_SECS / 60));
            let view = playout::queue_view(
                catalog.as_ref(),
                queue.as_ref(),
                window_start(now, minutes(history)),
                now + minutes(ahead),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Command::Log { date } => {
            let day = date.unwrap_or_else(|| Local::now().date_naive());
            let plays = catalog
                .plays_between(start_of_day(day)?, start_of_day(next_day(day)?)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&plays)?);
            Ok(())
        }
        Command::Limits {
            song,
            artist,
            album,
        } => {
            let mut limits = RepetitionLimits::load(queue.as_ref()).await?;
            if song.is_some() || artist.is_some() || album.is_some() {
                if let Some(secs) = song {
                    limits.song = limit_from_secs(secs);
                }
                if let Some(secs) = artist {
                    limits.artist = limit_from_secs(secs);
                }
                if let Some(secs) = album {
                    // zero or less switches the album window off
                    limits.album = (secs > 0).then(|| limit_from_secs(secs));
                }
                limits.save(queue.as_ref()).await?;
                log::info!("[limits] saved");
            }
            println!("{}", serde_json::to_string_pretty(&limits)?);
            Ok(())
        }
    }
}

fn start_of_day(day: NaiveDate) -> Result<chrono::DateTime<Local>> {
    day.and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .ok_or_else(|| AutomationError::Config(format!("no local midnight on {day}")))
}

fn next_day(day: NaiveDate) -> Result<NaiveDate> {
    day.succ_opt()
        .ok_or_else(|| AutomationError::Config(format!("no day after {day}")))
}

/// Run the scheduler and dispatcher until the running flag is cleared by a
/// stop marker, an interrupt or a failure, then let playing items finish.
async fn automate(
    args: &Args,
    catalog: Arc<dyn Catalog>,
    queue: Arc<dyn QueueStore>,
    config: EngineConfig,
) -> Result<()> {
    // ── Audio ────────────────────────────────────────────────────────────────
    let (mixer, output) = start_output(args.output, &args.record_path)?;
    let players = Arc::new(DeckFactory::new(mixer));

    // ── Context ──────────────────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        catalog,
        queue,
        players,
        config,
        MediaPaths {
            song_dir: args.song_path.clone(),
            audio_dir: args.audio_path.clone(),
        },
        args.stream.clone(),
    ));
    state.setup().await?;
    log::info!(
        "[startup] automating '{}' (stop policy {:?}, album limit {})",
        state.stream,
        state.config.stop_policy,
        if state.config.enforce_album_limit { "on" } else { "off" }
    );

    let interrupt_state = Arc::clone(&state);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[shutdown] interrupt received, stopping");
            if let Err(e) = interrupt_state.queue.set_running(false).await {
                log::error!("[shutdown] could not clear the running flag: {e}");
            }
        }
    });

    // ── Loops ────────────────────────────────────────────────────────────────
    let supervised = supervise(&state).await;

    tokio::select! {
        _ = finish_playback(&state) => {}
        _ = tokio::signal::ctrl_c() => log::info!("[shutdown] not waiting for playback"),
    }

    state.teardown().await?;
    tokio::task::spawn_blocking(move || output.stop()).await??;
    log::info!("[shutdown] done");
    supervised
}

/// How long a stopped dispatcher waits for the scheduler to wind down.
const SCHEDULER_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Run the scheduler task and the dispatcher until the running flag is
/// cleared. A scheduler failure is returned even when the dispatcher stopped
/// cleanly.
async fn supervise(state: &Arc<AppState>) -> Result<()> {
    let scheduler = Scheduler::new(Arc::clone(state)).await?;
    let mut scheduler_task = tokio::spawn(scheduler.run());
    let dispatched = playout::dispatcher::run(Arc::clone(state)).await;

    // A paused scheduler only notices the flag after its sleep.
    let scheduled = match tokio::time::timeout(SCHEDULER_GRACE, &mut scheduler_task).await {
        Ok(joined) => joined?,
        Err(_) => {
            log::info!("[shutdown] scheduler still paused, cancelling it");
            scheduler_task.abort();
            Ok(())
        }
    };
    scheduled.and(dispatched)
}

/// Wait until nothing launched by the dispatcher is still on air.
async fn finish_playback(state: &AppState) {
    loop {
        let now = state.now();
        let on_air = match state
            .queue
            .items_between(now - Duration::hours(1), now + state.config.dispatch_lookahead())
            .await
        {
            Ok(items) => items
                .iter()
                .filter(|i| matches!(i.status, QueueStatus::Preparing | QueueStatus::Playing))
                .filter(|i| i.payload.is_playable())
                .count(),
            Err(e) => {
                log::error!("[shutdown] could not read the queue: {e}");
                return;
            }
        };
        if on_air == 0 {
            return;
        }
        log::info!("[shutdown] waiting for {on_air} items to finish");
        state::sleep(Duration::seconds(1)).await;
    }
}
