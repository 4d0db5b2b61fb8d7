//! Ticker payloads carried inside data frames.

use serde::{Deserialize, Serialize};

/// A price update pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub sequence: u64,
    pub symbol: String,
    pub price: f64,
}

/// Something the client asks the server to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Echo `text` back as a note.
    Say { text: String },
}

/// Everything the server pushes as a data payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    Tick(Tick),
    Note { text: String },
}
