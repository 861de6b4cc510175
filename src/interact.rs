//! Component custom-id encoding for interactive messages.
//!
//! Buttons attached to search results carry which result they select,
//! plus the guild and user that may press them. The id must survive the
//! round trip through the platform untouched.

use std::{fmt, str::FromStr};

/// Prefix distinguishing our buttons from anything else in the wild.
const PREFIX: &str = "pick";

/// Errors from parsing a button custom id.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("custom id has the wrong shape")]
    Shape,

    #[error("custom id field is not a number: {0}")]
    Field(String),
}

/// The identity baked into one selection button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonId {
    /// Which search result the button selects.
    pub index: usize,

    pub guild_id: u64,
    pub user_id: u64,
}

impl ButtonId {
    pub fn new(index: usize, guild_id: u64, user_id: u64) -> Self {
        Self {
            index,
            guild_id,
            user_id,
        }
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}:{}:{}:{}",
            self.index, self.guild_id, self.user_id
        )
    }
}

impl FromStr for ButtonId {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.split(':');

        if parts.next() != Some(PREFIX) {
            return Err(ParseError::Shape);
        }

        let index = parts.next().ok_or(ParseError::Shape)?;
        let guild = parts.next().ok_or(ParseError::Shape)?;
        let user = parts.next().ok_or(ParseError::Shape)?;

        if parts.next().is_some() {
            return Err(ParseError::Shape);
        }

        Ok(Self {
            index: parse_number(index)?,
            guild_id: parse_number(guild)?,
            user_id: parse_number(user)?,
        })
    }
}

fn parse_number<T: FromStr>(text: &str) -> Result<T, ParseError> {
    text.parse()
        .map_err(|_| ParseError::Field(text.to_owned()))
}
