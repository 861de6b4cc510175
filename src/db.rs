//! SQLite persistence for songs, the queue, and key/value config.
//!
//! Everything here is plain `sqlx` queries over a shared pool. The queue
//! component keeps an in-memory mirror of the `queue` table; this module is
//! the durable side of that mirror plus the startup maintenance sweep.

use std::path::{Path, PathBuf};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    query, Row, SqlitePool,
};
use tracing::{debug, warn};

use crate::tracks::{DownloadStatus, QueuedItem, Song};

/// Shorthand for a [`Result`] with an sqlx error.
type Result<T> = std::result::Result<T, sqlx::Error>;

/// Key under which the cursor lives in `queue_state`.
const POSITION_KEY: &str = "current_position";

/// Values stored under the `config` table.
#[derive(Debug, Clone, Default)]
pub struct StoredConfig {
    pub volume: Option<f32>,
    pub stream: Option<String>,
}

/// Handle to the embedded database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if missing) the database at `path` and ensures the
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;

        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        query(
            "CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        query(
            "CREATE TABLE IF NOT EXISTS songs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                duration INTEGER NOT NULL DEFAULT 0,
                file_path TEXT,
                url TEXT NOT NULL,
                platform TEXT NOT NULL DEFAULT '',
                thumbnail_url TEXT NOT NULL DEFAULT '',
                is_stream INTEGER NOT NULL DEFAULT 0,
                requested_by TEXT NOT NULL DEFAULT '',
                added_at INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                play_count INTEGER NOT NULL DEFAULT 0,
                last_played INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        query("CREATE INDEX IF NOT EXISTS idx_songs_url ON songs(url)")
            .execute(&self.pool)
            .await?;

        query(
            "CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                song_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY(song_id) REFERENCES songs(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        query(
            "CREATE TABLE IF NOT EXISTS queue_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the persisted key/value config (volume, stream).
    pub async fn load_config(&self) -> Result<StoredConfig> {
        let rows = query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;

        let mut config = StoredConfig::default();
        for row in rows {
            let key: String = row.get(0);
            let value: String = row.get(1);

            match key.as_str() {
                "volume" => config.volume = value.parse().ok(),
                "stream" => config.stream = Some(value),
                _ => {}
            }
        }

        Ok(config)
    }

    pub async fn save_volume(&self, volume: f32) -> Result<()> {
        self.save_config("volume", &volume.to_string()).await
    }

    pub async fn save_stream(&self, url: &str) -> Result<()> {
        self.save_config("stream", url).await
    }

    async fn save_config(&self, key: &str, value: &str) -> Result<()> {
        query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Inserts a song, reusing an existing row with the same URL.
    ///
    /// Returns the row id either way, so callers can treat a repeated
    /// request for the same source as idempotent.
    pub async fn add_song(&self, song: &Song) -> Result<i64> {
        if let Some(existing) = self.song_by_url(&song.url).await? {
            return Ok(existing.id);
        }

        let result = query(
            "INSERT INTO songs
                (title, artist, duration, file_path, url, platform,
                 thumbnail_url, is_stream, requested_by, added_at, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&song.title)
        .bind(&song.artist)
        .bind(i64::from(song.duration_secs))
        .bind(song.file_path.as_ref().and_then(|p| p.to_str()))
        .bind(&song.url)
        .bind(&song.platform)
        .bind(&song.thumbnail_url)
        .bind(song.is_stream)
        .bind(&song.requested_by)
        .bind(song.added_at)
        .bind(song.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Looks a song up by its source URL.
    pub async fn song_by_url(&self, url: &str) -> Result<Option<Song>> {
        let row = query(
            "SELECT id, title, artist, duration, file_path, url, platform,
                    thumbnail_url, is_stream, requested_by, added_at, status
             FROM songs WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| song_from_row(&row)))
    }

    /// Appends a song to the queue at `max(position) + 1`.
    ///
    /// Returns the new queue row id.
    pub async fn add_to_queue(&self, song_id: i64) -> Result<i64> {
        let result = query(
            "INSERT INTO queue (song_id, position)
             VALUES (?, COALESCE((SELECT MAX(position) FROM queue), 0) + 1)",
        )
        .bind(song_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// The whole queue, joined with songs, ordered by position.
    pub async fn queue(&self) -> Result<Vec<QueuedItem>> {
        let rows = query(
            "SELECT q.id, q.position,
                    s.id, s.title, s.artist, s.duration, s.file_path, s.url,
                    s.platform, s.thumbnail_url, s.is_stream, s.requested_by,
                    s.added_at, s.status
             FROM queue q
             JOIN songs s ON s.id = q.song_id
             ORDER BY q.position",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| QueuedItem {
                queue_id: row.get(0),
                position: row.get(1),
                song: Song {
                    id: row.get(2),
                    title: row.get(3),
                    artist: row.get(4),
                    duration_secs: row.get::<i64, _>(5) as u32,
                    file_path: row.get::<Option<String>, _>(6).map(PathBuf::from),
                    url: row.get(7),
                    platform: row.get(8),
                    thumbnail_url: row.get(9),
                    is_stream: row.get(10),
                    requested_by: row.get(11),
                    added_at: row.get(12),
                    status: DownloadStatus::parse(row.get(13)),
                },
            })
            .collect())
    }

    /// The persisted queue cursor, zero if never written.
    pub async fn current_position(&self) -> Result<i64> {
        let row = query("SELECT value FROM queue_state WHERE key = ?")
            .bind(POSITION_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map_or(0, |row| row.get(0)))
    }

    pub async fn set_current_position(&self, position: i64) -> Result<()> {
        query("INSERT OR REPLACE INTO queue_state (key, value) VALUES (?, ?)")
            .bind(POSITION_KEY)
            .bind(position)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes all queue rows and resets the cursor in one transaction.
    pub async fn clear_queue(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        query("DELETE FROM queue").execute(&mut *tx).await?;
        query("INSERT OR REPLACE INTO queue_state (key, value) VALUES (?, 0)")
            .bind(POSITION_KEY)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Removes one queue row by id.
    pub async fn remove_from_queue(&self, queue_id: i64) -> Result<()> {
        query("DELETE FROM queue WHERE id = ?")
            .bind(queue_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Bumps a song's play statistics.
    pub async fn mark_played(&self, song_id: i64) -> Result<()> {
        query(
            "UPDATE songs
             SET play_count = play_count + 1, last_played = ?
             WHERE id = ?",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(song_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Startup maintenance: drop song rows whose media file disappeared,
    /// unless they're still queued, and cap the library size by evicting
    /// the least-played, oldest songs first.
    ///
    /// Failures here are logged by the caller and never fatal.
    pub async fn maintenance_sweep(&self, cap: u32) -> Result<u64> {
        let rows = query(
            "SELECT id, file_path FROM songs
             WHERE file_path IS NOT NULL
               AND id NOT IN (SELECT song_id FROM queue)",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0u64;
        for row in rows {
            let id: i64 = row.get(0);
            let path: String = row.get(1);

            if tokio::fs::metadata(&path).await.is_ok() {
                continue;
            }

            warn!(song = id, %path, "media file missing, dropping song row");
            query("DELETE FROM songs WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            removed += 1;
        }

        let evicted = query(
            "DELETE FROM songs WHERE id IN (
                SELECT id FROM songs
                WHERE id NOT IN (SELECT song_id FROM queue)
                ORDER BY play_count ASC, added_at ASC
                LIMIT max(0, (SELECT COUNT(*) FROM songs) - ?)
            )",
        )
        .bind(i64::from(cap))
        .execute(&self.pool)
        .await?
        .rows_affected();

        debug!(removed, evicted, "maintenance sweep done");
        Ok(removed + evicted)
    }
}

fn song_from_row(row: &sqlx::sqlite::SqliteRow) -> Song {
    Song {
        id: row.get(0),
        title: row.get(1),
        artist: row.get(2),
        duration_secs: row.get::<i64, _>(3) as u32,
        file_path: row.get::<Option<String>, _>(4).map(PathBuf::from),
        url: row.get(5),
        platform: row.get(6),
        thumbnail_url: row.get(7),
        is_stream: row.get(8),
        requested_by: row.get(9),
        added_at: row.get(10),
        status: DownloadStatus::parse(row.get(11)),
    }
}
