//! per-session settings and the rendered chat transcript.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// which ollama endpoint a session talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// `POST /chat` with a role-tagged message list.
    #[default]
    Chat,
    /// `POST /generate` with a single flattened prompt.
    Generate,
}

/// sampling knobs forwarded as ollama `options`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    /// sent as `num_predict`.
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl GenerationOptions {
    /// keep values inside what the server accepts.
    pub fn clamped(self) -> Self {
        Self {
            temperature: self.temperature.clamp(0.0, 2.0),
            top_p: self.top_p.clamp(0.0, 1.0),
            top_k: self.top_k.max(1),
            max_tokens: self.max_tokens.max(1),
        }
    }
}

/// everything the worker needs to know about "who" it is talking as.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSettings {
    pub model: String,
    pub role: String,
    pub personality: String,
    pub options: GenerationOptions,
}

/// whether the session is written back to disk on exit / clear.
#[derive(Component, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Persistence(pub bool);

/// the visible chat log.
///
/// kept as one string so it can be persisted and restored verbatim.
#[derive(Component, Clone, Debug, Default, PartialEq)]
pub struct Transcript {
    log: String,
    replying: bool,
}

impl Transcript {
    pub fn from_log(log: impl Into<String>) -> Self {
        Self { log: log.into(), replying: false }
    }

    pub fn as_str(&self) -> &str {
        &self.log
    }

    pub fn is_replying(&self) -> bool {
        self.replying
    }

    pub fn push_user(&mut self, text: &str) {
        self.close_reply();
        self.log.push_str("You: ");
        self.log.push_str(text);
        self.log.push('\n');
    }

    pub fn begin_reply(&mut self) {
        if !self.replying {
            self.log.push_str("Bot: ");
            self.replying = true;
        }
    }

    pub fn push_delta(&mut self, text: &str) {
        self.begin_reply();
        self.log.push_str(text);
    }

    pub fn end_reply(&mut self) {
        self.close_reply();
    }

    pub fn push_error(&mut self, error: &str) {
        self.close_reply();
        self.log.push_str("Error: ");
        self.log.push_str(error);
        self.log.push('\n');
    }

    pub fn clear(&mut self) {
        self.log.clear();
        self.replying = false;
    }

    fn close_reply(&mut self) {
        if self.replying {
            self.log.push_str("\n\n");
            self.replying = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn transcript_renders_a_streamed_turn() {
        let mut t = Transcript::default();
        t.push_user("hi");
        for chunk in ["hel", "lo", " there"] {
            t.push_delta(chunk);
        }
        t.end_reply();
        assert_eq!(t.as_str(), "You: hi\nBot: hello there\n\n");
        assert!(!t.is_replying());
    }

    #[test]
    fn error_closes_an_open_reply() {
        let mut t = Transcript::default();
        t.push_user("hi");
        t.push_delta("par");
        t.push_error("server returned http 500");
        assert_eq!(t.as_str(), "You: hi\nBot: par\n\nError: server returned http 500\n");
    }

    #[test]
    fn options_are_clamped() {
        let o = GenerationOptions { temperature: 9.0, top_p: -1.0, top_k: 0, max_tokens: 0 }.clamped();
        assert_eq!(o, GenerationOptions { temperature: 2.0, top_p: 0.0, top_k: 1, max_tokens: 1 });
    }
}
