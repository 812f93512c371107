//! Repetition-aware song selection.
//!
//! Recent queue entries act as the repetition ledger: anything queued within
//! the song, artist (and optionally album) windows before the queue time is
//! kept out of the candidates, together with whatever the caller is already
//! holding back.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Local};
use rand::seq::SliceRandom;

use crate::{
    config::{window_start, RepetitionLimits},
    db::{
        catalog::SongQuery,
        models::{QueuePayload, Song},
    },
    error::Result,
    state::AppState,
};

/// Songs, artists and albums that may not be picked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub songs: HashSet<i64>,
    pub artists: HashSet<i64>,
    pub albums: HashSet<String>,
}

impl Exclusions {
    /// Hold back `song` and its artists (and album, when tracked).
    pub fn add(&mut self, song: &Song, with_album: bool) {
        self.songs.insert(song.id);
        self.artists.extend(song.artists.iter().copied());
        if with_album {
            if let Some(album) = &song.album {
                self.albums.insert(album.clone());
            }
        }
    }

    pub fn merge(&mut self, other: &Exclusions) {
        self.songs.extend(other.songs.iter().copied());
        self.artists.extend(other.artists.iter().copied());
        self.albums.extend(other.albums.iter().cloned());
    }
}

/// Everything inside the live repetition windows ending at `queue_time`.
pub async fn ledger_exclusions(
    state: &AppState,
    limits: &RepetitionLimits,
    queue_time: DateTime<Local>,
) -> Result<Exclusions> {
    let with_album = state.config.enforce_album_limit && limits.album.is_some();
    let longest = limits.longest(with_album);
    let recent = state
        .queue
        .items_between(window_start(queue_time, longest), queue_time)
        .await?;

    let mut excluded = Exclusions::default();
    for item in recent {
        let QueuePayload::Song {
            song_id,
            album,
            artists,
            ..
        } = item.payload
        else {
            continue;
        };
        let age = queue_time - item.due;
        if age <= limits.song {
            excluded.songs.insert(song_id);
        }
        if age <= limits.artist {
            excluded.artists.extend(artists);
        }
        if let (true, Some(window), Some(album)) = (with_album, limits.album, album) {
            if age <= window {
                excluded.albums.insert(album);
            }
        }
    }
    Ok(excluded)
}

/// Pick one eligible song for `queue_time`, uniformly at random.
///
/// With a `target_length`, songs that can be trimmed or stretched to exactly
/// that length are tried first. `None` means nothing is eligible.
pub async fn pick(
    state: &AppState,
    queue_time: DateTime<Local>,
    category_id: Option<i64>,
    excluded: &Exclusions,
    target_length: Option<Duration>,
) -> Result<Option<Song>> {
    let limits = RepetitionLimits::load(state.queue.as_ref()).await?;
    let mut blocked = ledger_exclusions(state, &limits, queue_time).await?;
    blocked.merge(excluded);
    if !state.config.enforce_album_limit {
        blocked.albums.clear();
    }

    let mut query = SongQuery {
        category_id,
        excluded_songs: blocked.songs,
        excluded_artists: blocked.artists,
        excluded_albums: blocked.albums,
        length: None,
    };

    if let Some(length) = target_length {
        query.length = Some(length);
        if let Some(song) = choose(state, &query).await? {
            return Ok(Some(song));
        }
        query.length = None;
    }

    let picked = choose(state, &query).await?;
    if picked.is_none() {
        log::debug!(
            "[selector] nothing eligible at {queue_time} (category {:?})",
            category_id
        );
    }
    Ok(picked)
}

async fn choose(state: &AppState, query: &SongQuery) -> Result<Option<Song>> {
    let ids = state.catalog.eligible_songs(query).await?;
    let chosen = ids.choose(&mut rand::thread_rng()).copied();
    match chosen {
        Some(id) => state.catalog.song(id).await,
        None => Ok(None),
    }
}
