//! In-memory conversation transcript.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Ai => write!(f, "ai"),
        }
    }
}

/// One user or AI contribution to the conversation.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Turn {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

/// Append-only list of turns for the current session. Never persisted.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn and returns a copy of it.
    pub fn push(&mut self, role: Role, content: impl Into<String>) -> Turn {
        self.next_id += 1;
        let turn = Turn {
            id: self.next_id,
            role,
            content: content.into(),
            timestamp: Local::now(),
        };
        self.turns.push(turn.clone());
        turn
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
