//! A voice-channel music service: DJ queue, live radio, one connection.
//!
//! The crate wires seven pieces together: a shared state store, SQLite
//! persistence, an RPC broker for the downloader worker, the persistent
//! queue, the playback engine (track player + radio streamer), the voice
//! connection slot, and the mode supervisor that orchestrates them. The
//! chat platform itself stays outside; adapters implement
//! [`voice::Gateway`] and drive [`supervisor::Supervisor`]'s command
//! methods.

#![warn(clippy::all, clippy::pedantic)]

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod interact;
pub mod playback;
pub mod queue;
pub mod state;
pub mod supervisor;
pub mod tasks;
pub mod tracks;
pub mod voice;


pub use error::{Error, Result};
