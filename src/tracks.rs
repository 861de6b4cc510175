//! Core track types shared between the downloader, the queue
//! and the playback engine.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::broker::protocol::DownloadedTrack;

/// Where a song currently stands in its download lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    /// Requested from the worker, no completion observed yet.
    #[default]
    Pending,

    /// Downloaded; `file_path` points at a readable file.
    Completed,

    /// The worker reported a failure.
    Failed,
}

impl DownloadStatus {
    /// The textual form stored in the `songs` table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the stored form, defaulting unknown strings to [`Self::Pending`].
    pub fn parse(text: &str) -> Self {
        match text {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A playable song, as persisted in the `songs` table.
///
/// A song with [`DownloadStatus::Completed`] has a non-empty `file_path`;
/// a song with `is_stream` set has no file and a duration of zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    /// Row id from the database, `0` until inserted.
    pub id: i64,

    pub title: String,
    pub artist: String,

    /// Duration in whole seconds. Zero for live streams.
    pub duration_secs: u32,

    /// Local media file, present once the download completed.
    pub file_path: Option<PathBuf>,

    /// Source URL, the song's logical identity.
    pub url: String,

    /// Source platform tag (e.g. `youtube`).
    pub platform: String,

    pub thumbnail_url: String,

    /// Live streams are routed to the radio streamer, not the track player.
    pub is_stream: bool,

    /// Display name of whoever asked for the song.
    pub requested_by: String,

    /// Unix seconds at request time.
    pub added_at: i64,

    pub status: DownloadStatus,
}

impl Song {
    /// Builds a completed song from a worker download payload.
    pub fn from_download(track: &DownloadedTrack, url: &str, requested_by: &str) -> Self {
        let is_stream = track.is_stream;

        Self {
            id: 0,
            title: track.title.clone(),
            artist: track.artist.clone(),
            duration_secs: if is_stream { 0 } else { track.duration },
            file_path: (!is_stream && !track.filename.is_empty())
                .then(|| PathBuf::from(&track.filename)),
            url: url.to_owned(),
            platform: track.platform.clone().unwrap_or_default(),
            thumbnail_url: track.thumbnail_url.clone(),
            is_stream,
            requested_by: requested_by.to_owned(),
            added_at: Utc::now().timestamp(),
            status: DownloadStatus::Completed,
        }
    }

    /// The media file path, if the song has one.
    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

/// One row of the queue: a song at a position.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    /// The `queue` table row id, unique per insertion.
    pub queue_id: i64,

    /// Strictly increasing within a queue.
    pub position: i64,

    pub song: Song,
}

/// A selectable radio source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOption {
    pub name: String,
    pub url: String,
}

impl StreamOption {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}
