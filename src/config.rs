//! the on-disk session file (`config.json`).
//!
//! written wholesale, read wholesale. every key has its own default so
//! files written by older clients load without complaint.

use crate::error::ConfigError;
use crate::history::{ChatHistory, DEFAULT_MAX_HISTORY};
use crate::session::{
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P, GenerationOptions,
    Persistence, SessionSettings, Transcript,
};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

/// where the plugin reads and writes the session file.
#[derive(Resource, Clone, Debug, PartialEq, Eq)]
pub struct ConfigPath(pub PathBuf);

impl Default for ConfigPath {
    fn default() -> Self {
        Self(PathBuf::from(CONFIG_FILE))
    }
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}
fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}
fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}
fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub chat_log: String,
    #[serde(default)]
    pub persistence: bool,
    #[serde(default)]
    pub chat_history: Vec<String>,
    #[serde(default = "default_max_history")]
    pub max_history_length: usize,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            chat_log: String::new(),
            persistence: false,
            chat_history: Vec::new(),
            max_history_length: default_max_history(),
            role: String::new(),
            personality: String::new(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl PersistedConfig {
    /// `Ok(None)` when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        let text = match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// never fails: a missing file is silent, anything else is logged.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(Some(cfg)) => {
                info!(target: "bevy_ollama", "loaded config from {}", path.display());
                cfg
            }
            Ok(None) => Self::default(),
            Err(err) => {
                error!(target: "bevy_ollama", "error loading config {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    pub fn capture(
        settings: &SessionSettings,
        history: &ChatHistory,
        transcript: &Transcript,
        persistence: Persistence,
    ) -> Self {
        Self {
            model: settings.model.clone(),
            chat_log: transcript.as_str().to_string(),
            persistence: persistence.0,
            chat_history: history.entries().to_vec(),
            max_history_length: history.max_len(),
            role: settings.role.clone(),
            personality: settings.personality.trim().to_string(),
            temperature: settings.options.temperature,
            top_p: settings.options.top_p,
            top_k: settings.options.top_k,
            max_tokens: settings.options.max_tokens,
        }
    }

    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            model: self.model.clone(),
            role: self.role.clone(),
            personality: self.personality.clone(),
            options: GenerationOptions {
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                max_tokens: self.max_tokens,
            }
            .clamped(),
        }
    }

    /// history restored and trimmed to the stored cap.
    pub fn history(&self) -> ChatHistory {
        ChatHistory::with_entries(self.chat_history.clone(), self.max_history_length)
    }

    pub fn transcript(&self) -> Transcript {
        Transcript::from_log(self.chat_log.clone())
    }

    pub fn persistence(&self) -> Persistence {
        Persistence(self.persistence)
    }
}
