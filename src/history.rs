//! bounded conversation memory.
//!
//! entries are plain strings tagged by prefix (`Human: ` / `AI: `) so they
//! persist as-is and can be replayed into either request mode.

use bevy::prelude::*;

pub const HUMAN_PREFIX: &str = "Human: ";
pub const AI_PREFIX: &str = "AI: ";

pub const DEFAULT_MAX_HISTORY: usize = 10;
pub const MIN_HISTORY: usize = 1;
pub const MAX_HISTORY: usize = 100;

/// capped list of exchange entries, oldest first.
///
/// holds at most `2 * max_len` entries (one human + one ai per exchange).
#[derive(Component, Clone, Debug, PartialEq)]
pub struct ChatHistory {
    entries: Vec<String>,
    max_len: usize,
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl ChatHistory {
    pub fn new(max_len: usize) -> Self {
        Self { entries: Vec::new(), max_len: clamp_len(max_len) }
    }

    /// restore from persisted entries, trimming to the cap.
    pub fn with_entries(entries: Vec<String>, max_len: usize) -> Self {
        let mut h = Self { entries, max_len: clamp_len(max_len) };
        h.enforce_cap();
        h
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn capacity_entries(&self) -> usize {
        self.max_len * 2
    }

    pub fn push_exchange(&mut self, prompt: &str, response: &str) {
        self.entries.push(format!("{HUMAN_PREFIX}{prompt}"));
        self.entries.push(format!("{AI_PREFIX}{response}"));
        self.enforce_cap();
    }

    /// change the cap; shrinking drops the oldest entries right away.
    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = clamp_len(max_len);
        self.enforce_cap();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn enforce_cap(&mut self) {
        let cap = self.capacity_entries();
        if self.entries.len() > cap {
            let excess = self.entries.len() - cap;
            self.entries.drain(..excess);
        }
    }
}

fn clamp_len(n: usize) -> usize {
    n.clamp(MIN_HISTORY, MAX_HISTORY)
}
