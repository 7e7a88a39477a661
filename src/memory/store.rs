//! Conversation turn log
//!
//! Stores a bounded, time-ordered sequence of user/assistant turns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Who produced a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// A single message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub turn_id: Uuid,
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, text)
    }
}

/// Per-session turn log with a FIFO size bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// Append a turn, evicting the oldest once the bound is exceeded.
    ///
    /// A turn stamped before the newest stored turn is clamped to that
    /// timestamp so the log stays time-ordered.
    pub fn append(&mut self, mut turn: ConversationTurn) {
        if let Some(last) = self.turns.back() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }

        self.turns.push_back(turn);

        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// The `n` most recent turns, newest first
    pub fn recent(&self, n: usize) -> impl DoubleEndedIterator<Item = &ConversationTurn> {
        self.turns.iter().rev().take(n)
    }

    /// Every stored turn, oldest first
    pub fn transcript(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
