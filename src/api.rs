//! blocking client for the ollama http api.
//!
//! endpoints used:
//!   - `GET  /tags`      model list
//!   - `POST /show`      model parameters
//!   - `POST /chat`      role-tagged messages, ndjson stream of `message.content`
//!   - `POST /generate`  flat prompt, ndjson stream of `response`
//!
//! api docs: https://github.com/ollama/ollama/blob/main/docs/api.md

use crate::error::OllamaError;
use crate::session::GenerationOptions;
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/api";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// ollama's `options` object.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WireOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_predict: u32,
}

impl From<GenerationOptions> for WireOptions {
    fn from(o: GenerationOptions) -> Self {
        let o = o.clamped();
        Self {
            temperature: o.temperature,
            top_p: o.top_p,
            top_k: o.top_k,
            num_predict: o.max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatBody<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    pub options: WireOptions,
}

#[derive(Debug, Serialize)]
pub struct GenerateBody<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
    pub options: WireOptions,
}

/// one ndjson object from `/chat` or `/generate`.
///
/// both shapes decode into this; unknown fields are ignored.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamLine {
    pub message: Option<LineMessage>,
    pub response: Option<String>,
    pub done: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LineMessage {
    pub content: String,
}

impl StreamLine {
    /// the incremental text carried by this line, if any.
    pub fn fragment(&self) -> Option<&str> {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .or(self.response.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// decode one raw line. blank lines are `Ok(None)`; invalid utf-8 is a json error.
pub fn decode_line(line: impl AsRef<[u8]>) -> Result<Option<StreamLine>, serde_json::Error> {
    let line = line.as_ref().trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(line).map(Some)
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// handle to an ollama server. cheap to clone (shares the connection pool).
#[derive(Resource, Clone)]
pub struct OllamaClient {
    base_url: String,
    agent: ureq::Agent,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient").field("base_url", &self.base_url).finish()
    }
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, agent: ureq::Agent::new_with_defaults() }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// `GET /tags` → model names.
    pub fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        let url = self.url("tags");
        debug!(target: "bevy_ollama", "list_models -> {}", url);
        let resp = self.agent.get(&url).call().map_err(OllamaError::from_ureq)?;
        let tags: TagsResponse = resp.into_body().read_json().map_err(OllamaError::from_ureq)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// `POST /show` → ordered `(key, value)` parameter pairs.
    pub fn show_parameters(&self, model: &str) -> Result<Vec<(String, String)>, OllamaError> {
        let url = self.url("show");
        debug!(target: "bevy_ollama", "show_parameters -> {} (model='{}')", url, model);
        let resp = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({ "name": model }))
            .map_err(OllamaError::from_ureq)?;
        let text = resp.into_body().read_to_string().map_err(OllamaError::from_ureq)?;
        let body: serde_json::Value = serde_json::from_str(&text)?;
        Ok(body.get("parameters").map(parse_parameters).unwrap_or_default())
    }

    /// post `body` and return the response as raw newline-split chunks.
    ///
    /// non-2xx and connect failures surface here; read failures surface
    /// per line. lines stay bytes so a bad one can be skipped, not fatal.
    pub fn post_lines<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<impl Iterator<Item = std::io::Result<Vec<u8>>> + use<B>, OllamaError> {
        let url = self.url(endpoint);
        let resp = self.agent.post(&url).send_json(body).map_err(OllamaError::from_ureq)?;
        Ok(BufReader::new(resp.into_body().into_reader()).split(b'\n'))
    }
}

/// `/show` returns `parameters` as a json object on some versions and as
/// `key value` lines on others.
pub fn parse_parameters(value: &serde_json::Value) -> Vec<(String, String)> {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), display_value(v)))
            .collect(),
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(inner @ serde_json::Value::Object(_)) => parse_parameters(&inner),
            _ => parse_parameter_text(s),
        },
        _ => Vec::new(),
    }
}

fn display_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            items.iter().map(display_value).collect::<Vec<_>>().join(", ")
        }
        other => other.to_string(),
    }
}

/// modelfile-style `key value` lines; repeated keys are joined.
pub fn parse_parameter_text(text: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => (line, ""),
        };
        match out.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => out.push((key.to_string(), value.to_string())),
        }
    }
    out
}

/// `num_ctx` → `Num Ctx: 4096`, one per line.
pub fn readable_params(params: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in params {
        let title = key
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut c = w.chars();
                match c.next() {
                    Some(first) => first.to_uppercase().chain(c.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ");
        out.push_str(&title);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out
}
