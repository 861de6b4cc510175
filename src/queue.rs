//! The persistent play queue.
//!
//! An in-memory ordered list mirroring the `queue` table, with a cursor
//! pointing at the current song. The database write always lands first;
//! the memory view follows, so a crash can lose at most an in-memory
//! cursor bump that [`Queue::load`] re-reads at startup. The lock is never
//! held across an await.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    db::Database,
    tracks::{QueuedItem, Song},
};

/// Shorthand for a [`Result`] with a queue error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors which occur while manipulating the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database failure: {0}")]
    Db(#[from] sqlx::Error),

    #[error("no more songs in the queue")]
    NoNext,
}

/// Notifications emitted towards the supervisor.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A song landed in the queue at the given position.
    TrackAdded { song: Song, position: i64 },
}

#[derive(Debug, Default)]
struct View {
    items: Vec<QueuedItem>,
    cursor: usize,
}

/// Thread-safe queue handle.
pub struct Queue {
    db: Database,
    view: RwLock<View>,
    events: mpsc::Sender<QueueEvent>,
}

impl Queue {
    /// Builds the queue and loads the persisted rows and cursor.
    pub async fn load(db: Database, events: mpsc::Sender<QueueEvent>) -> Result<Arc<Self>> {
        let items = db.queue().await?;
        let cursor = db.current_position().await?.max(0) as usize;

        debug!(items = items.len(), cursor, "queue loaded");

        Ok(Arc::new(Self {
            db,
            view: RwLock::new(View {
                // A stale cursor past the end means "finished"; keep it
                // clamped to size so `current` returns nothing.
                cursor: cursor.min(items.len()),
                items,
            }),
            events,
        }))
    }

    /// Adds a song, deduplicating by URL at the storage layer, and
    /// announces the addition.
    pub async fn add(&self, song: Song) -> Result<QueuedItem> {
        let song_id = self.db.add_song(&song).await?;
        let queue_id = self.db.add_to_queue(song_id).await?;

        let mut stored = song;
        stored.id = song_id;

        let item = {
            let mut view = self.view.write();
            let position = view.items.last().map_or(1, |last| last.position + 1);
            let item = QueuedItem {
                queue_id,
                position,
                song: stored,
            };
            view.items.push(item.clone());
            item
        };

        let _ = self
            .events
            .send(QueueEvent::TrackAdded {
                song: item.song.clone(),
                position: item.position,
            })
            .await;

        Ok(item)
    }

    /// The song under the cursor, if the cursor is in range.
    pub fn current(&self) -> Option<Song> {
        let view = self.view.read();
        view.items.get(view.cursor).map(|item| item.song.clone())
    }

    /// Moves the cursor forward and persists it.
    ///
    /// Errors with [`Error::NoNext`] at the end of the queue, leaving the
    /// cursor untouched.
    pub async fn advance(&self) -> Result<Song> {
        let (next_cursor, song) = {
            let view = self.view.read();
            let next = view.cursor + 1;
            match view.items.get(next) {
                Some(item) => (next, item.song.clone()),
                None => return Err(Error::NoNext),
            }
        };

        self.db.set_current_position(next_cursor as i64).await?;
        self.view.write().cursor = next_cursor;

        Ok(song)
    }

    pub fn has_next(&self) -> bool {
        let view = self.view.read();
        view.cursor + 1 < view.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.read().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.view.read().items.len()
    }

    /// The current cursor index.
    pub fn position(&self) -> usize {
        self.view.read().cursor
    }

    /// Snapshot copy of every queued item.
    pub fn items(&self) -> Vec<QueuedItem> {
        self.view.read().items.clone()
    }

    /// Up to `limit` songs after the current one.
    pub fn upcoming(&self, limit: usize) -> Vec<Song> {
        let view = self.view.read();
        view.items
            .iter()
            .skip(view.cursor + 1)
            .take(limit)
            .map(|item| item.song.clone())
            .collect()
    }

    /// Truncates the queue and resets the cursor to zero, durably first.
    ///
    /// Safe to call while playback is stopping; readers just see an empty
    /// view from then on.
    pub async fn clear(&self) -> Result<()> {
        self.db.clear_queue().await?;

        let mut view = self.view.write();
        view.items.clear();
        view.cursor = 0;

        Ok(())
    }

    /// Removes one row and reloads the view so positions resync.
    pub async fn remove(&self, queue_id: i64) -> Result<()> {
        self.db.remove_from_queue(queue_id).await?;

        let items = self.db.queue().await?;
        let mut view = self.view.write();
        view.cursor = view.cursor.min(items.len());
        view.items = items;

        Ok(())
    }
}
