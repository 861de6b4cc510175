//! Application-wide error type.
//!
//! Components define their own error enums; this aggregates them for the
//! binary's task plumbing. User-facing conversion happens in the
//! supervisor, not here.

use crate::{broker, config, playback, queue, supervisor, voice};

/// Result alias using the crate-wide `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Central application error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration failure")]
    Config(#[from] config::Error),

    #[error("database failure")]
    Db(#[from] sqlx::Error),

    #[error("downloader broker failure")]
    Broker(#[from] broker::Error),

    #[error("playback failure")]
    Playback(#[from] playback::Error),

    #[error("voice connection failure")]
    Voice(#[from] voice::Error),

    #[error("queue failure")]
    Queue(#[from] queue::Error),

    #[error("supervisor failure")]
    Supervisor(#[from] supervisor::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("join error")]
    Join(#[from] tokio::task::JoinError),
}
