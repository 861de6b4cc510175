//! Configuration file loading.
//!
//! The service reads a single JSON object at startup. Every key except
//! `discord_token` has a default, so a minimal config is just the token.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Shorthand for a [`Result`] with a config error.
type Result<T> = std::result::Result<T, Error>;

/// Errors which occur while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("`discord_token` is required and must be non-empty")]
    MissingToken,

    #[error("`{0}` is not a valid platform id")]
    BadId(String),
}

/// The parsed configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway token. Required; checked by [`Config::load`].
    pub discord_token: String,

    pub client_id: String,

    /// Initial playback volume, clamped by the state store on use.
    pub volume: f32,

    pub default_guild_id: String,

    /// The "idle" voice channel the service parks in.
    pub default_vc_id: String,

    /// Default live radio source.
    pub radio_url: String,

    /// Seconds of inactivity before the service returns to the idle channel.
    pub idle_timeout: u64,

    /// Unix socket the downloader worker listens on.
    pub uds_path: PathBuf,

    /// SQLite database file, created if missing.
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            client_id: String::new(),
            volume: 0.05,
            default_guild_id: String::new(),
            default_vc_id: String::new(),
            radio_url: "https://listen.moe/stream".to_owned(),
            idle_timeout: 30,
            uds_path: PathBuf::from("/tmp/downloader.sock"),
            db_path: PathBuf::from("bot.db"),
        }
    }
}

impl Config {
    /// Reads and validates the config file at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;

        if config.discord_token.trim().is_empty() {
            return Err(Error::MissingToken);
        }

        Ok(config)
    }

    /// The configured guild, parsed from its decimal string form.
    pub fn guild_id(&self) -> Result<u64> {
        parse_id(&self.default_guild_id)
    }

    /// The configured idle voice channel.
    pub fn idle_channel_id(&self) -> Result<u64> {
        parse_id(&self.default_vc_id)
    }
}

/// Platform ids arrive as decimal strings in the config file.
fn parse_id(text: &str) -> Result<u64> {
    text.parse().map_err(|_| Error::BadId(text.to_owned()))
}
