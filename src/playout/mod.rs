pub mod dispatcher;
pub mod executor;

use std::collections::HashMap;

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{
        catalog::Catalog,
        models::{QueuePayload, QueueStatus},
        queue::QueueStore,
    },
    error::Result,
};

/// One queue entry as shown to listeners and the admin pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntryView {
    pub id: Uuid,
    pub due: DateTime<Local>,
    pub status: QueueStatus,
    pub kind: &'static str,
    pub song_id: Option<i64>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub length_ms: i64,
}

/// Queue entries due in `[from, to]`, joined with their catalog songs.
pub async fn queue_view(
    catalog: &dyn Catalog,
    queue: &dyn QueueStore,
    from: DateTime<Local>,
    to: DateTime<Local>,
) -> Result<Vec<QueueEntryView>> {
    let items = queue.items_between(from, to).await?;
    let mut titles: HashMap<i64, Option<String>> = HashMap::new();
    let mut view = Vec::with_capacity(items.len());

    for item in items {
        let (song_id, album) = match &item.payload {
            QueuePayload::Song { song_id, album, .. } => (Some(*song_id), album.clone()),
            _ => (None, None),
        };
        let title = match song_id {
            Some(id) => {
                if !titles.contains_key(&id) {
                    let name = catalog.song(id).await?.map(|s| s.name);
                    titles.insert(id, name);
                }
                titles.get(&id).cloned().flatten()
            }
            None => None,
        };
        view.push(QueueEntryView {
            id: item.id,
            due: item.due,
            status: item.status,
            kind: item.payload.kind(),
            song_id,
            title,
            album,
            length_ms: item.payload.length().num_milliseconds(),
        });
    }
    Ok(view)
}
