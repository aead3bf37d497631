//! the request worker: one exchange, start to finish, on the calling thread.
//!
//! the plugin runs this on a detached std thread and forwards every
//! `WorkerEvent` to the main thread. nothing here touches the ecs.

use crate::api::{ChatBody, GenerateBody, OllamaClient, decode_line};
use crate::error::OllamaError;
use crate::prompt::{build_generate_prompt, build_messages};
use crate::session::{ApiMode, SessionSettings};
use bevy::prelude::*;

/// snapshot of everything one request needs, taken when the user sends.
#[derive(Clone, Debug, PartialEq)]
pub struct Exchange {
    pub settings: SessionSettings,
    pub mode: ApiMode,
    pub stream: bool,
    pub history: Vec<String>,
    pub prompt: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    /// incremental text, in arrival order.
    Delta(String),
    /// full reply; equals the concatenation of all deltas.
    Done(String),
    /// the exchange ended without a reply. always the last event.
    Failed(String),
}

/// run one exchange and report through `emit`.
///
/// emits zero or more `Delta`s followed by exactly one `Done` or `Failed`.
pub fn run_exchange(client: &OllamaClient, exchange: &Exchange, mut emit: impl FnMut(WorkerEvent)) {
    info!(target: "bevy_ollama",
        "run_exchange: model='{}' mode={:?} stream={} history={} prompt_len={}",
        exchange.settings.model, exchange.mode, exchange.stream, exchange.history.len(), exchange.prompt.len()
    );
    match request_reply(client, exchange, &mut emit) {
        Ok(text) => {
            if !exchange.stream {
                emit(WorkerEvent::Delta(text.clone()));
            }
            info!(target: "bevy_ollama", "exchange completed: final_len={}", text.len());
            emit(WorkerEvent::Done(text));
        }
        Err(err) => {
            error!(target: "bevy_ollama", "exchange failed: {}", err);
            emit(WorkerEvent::Failed(err.to_string()));
        }
    }
}

fn request_reply(
    client: &OllamaClient,
    exchange: &Exchange,
    emit: &mut impl FnMut(WorkerEvent),
) -> Result<String, OllamaError> {
    let settings = &exchange.settings;
    match exchange.mode {
        ApiMode::Chat => {
            let messages = build_messages(
                &settings.role,
                &settings.personality,
                &exchange.history,
                &exchange.prompt,
            );
            let body = ChatBody {
                model: &settings.model,
                messages: &messages,
                stream: exchange.stream,
                options: settings.options.into(),
            };
            let lines = client.post_lines("chat", &body)?;
            collect_reply(lines, exchange.stream, emit)
        }
        ApiMode::Generate => {
            let prompt = build_generate_prompt(&settings.personality, &exchange.history, &exchange.prompt);
            debug!(target: "bevy_ollama", "generate prompt: {}", prompt);
            let body = GenerateBody {
                model: &settings.model,
                prompt: &prompt,
                stream: exchange.stream,
                options: settings.options.into(),
            };
            let lines = client.post_lines("generate", &body)?;
            collect_reply(lines, exchange.stream, emit)
        }
    }
}

/// read ndjson lines until the stream ends or a line says `done`.
fn collect_reply(
    lines: impl Iterator<Item = std::io::Result<Vec<u8>>>,
    forward: bool,
    emit: &mut impl FnMut(WorkerEvent),
) -> Result<String, OllamaError> {
    let mut full = String::new();
    for line in lines {
        let line = line?;
        let mut parsed = match decode_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(err) => {
                warn!(target: "bevy_ollama",
                    "skipping malformed stream line ({}): {}", err, String::from_utf8_lossy(&line)
                );
                continue;
            }
        };
        if let Some(err) = parsed.error.take() {
            return Err(OllamaError::Server(err));
        }
        if let Some(text) = parsed.fragment() {
            full.push_str(text);
            if forward {
                emit(WorkerEvent::Delta(text.to_string()));
            }
        }
        if parsed.done {
            break;
        }
    }
    if full.is_empty() {
        return Err(OllamaError::Empty);
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GenerationOptions;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn exchange(mode: ApiMode, stream: bool) -> Exchange {
        Exchange {
            settings: SessionSettings {
                model: "llama3".into(),
                role: "assistant".into(),
                personality: "terse".into(),
                options: GenerationOptions { max_tokens: 256, ..GenerationOptions::default() },
            },
            mode,
            stream,
            history: vec!["Human: hi".into(), "AI: hello".into()],
            prompt: "what's up?".into(),
        }
    }

    fn run(server: &Server, ex: &Exchange) -> Vec<WorkerEvent> {
        let client = OllamaClient::new(format!("{}/api", server.url()));
        let mut events = Vec::new();
        run_exchange(&client, ex, |e| events.push(e));
        events
    }

    fn deltas(events: &[WorkerEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Delta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn streamed_chat_forwards_fragments_in_order() {
        let mut server = Server::new();
        let body = [
            r#"{"message":{"role":"assistant","content":"not"},"done":false}"#,
            "",
            "garbage that is not json",
            r#"{"message":{"role":"assistant","content":" much"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"."},"done":true}"#,
        ]
        .join("\n");
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({
                "model": "llama3",
                "stream": true,
                "messages": [
                    { "role": "system", "content": "assistant\nterse" },
                    { "role": "user", "content": "hi" },
                    { "role": "assistant", "content": "hello" },
                    { "role": "user", "content": "what's up?" },
                ],
                "options": { "top_k": 40, "num_predict": 256 },
            })))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body(body)
            .create();

        let events = run(&server, &exchange(ApiMode::Chat, true));

        mock.assert();
        assert_eq!(
            events,
            vec![
                WorkerEvent::Delta("not".into()),
                WorkerEvent::Delta(" much".into()),
                WorkerEvent::Delta(".".into()),
                WorkerEvent::Done("not much.".into()),
            ]
        );
        assert_eq!(deltas(&events), "not much.");
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let mut server = Server::new();
        let mut body = Vec::new();
        body.extend_from_slice(br#"{"message":{"content":"a"}}"#);
        body.extend_from_slice(b"\n\xff\xfe garbage\n");
        body.extend_from_slice(br#"{"message":{"content":"b"},"done":true}"#);
        let mock = server.mock("POST", "/api/chat").with_status(200).with_body(body).create();

        let events = run(&server, &exchange(ApiMode::Chat, true));

        mock.assert();
        assert_eq!(
            events,
            vec![
                WorkerEvent::Delta("a".into()),
                WorkerEvent::Delta("b".into()),
                WorkerEvent::Done("ab".into()),
            ]
        );
    }

    #[test]
    fn one_shot_generate_emits_single_delta() {
        let mut server = Server::new();
        let body = [
            r#"{"response":"a","done":false}"#,
            r#"{"response":"b","done":false}"#,
            r#"{"response":"","done":true}"#,
        ]
        .join("\n");
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({
                "model": "llama3",
                "stream": false,
                "prompt": "terse\nHuman: hi\nAI: hello\nHuman: what's up?\nAI:",
                "options": { "num_predict": 256 },
            })))
            .with_status(200)
            .with_body(body)
            .create();

        let events = run(&server, &exchange(ApiMode::Generate, false));

        mock.assert();
        assert_eq!(events, vec![WorkerEvent::Delta("ab".into()), WorkerEvent::Done("ab".into())]);
    }

    #[test]
    fn non_2xx_yields_exactly_one_error() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(500)
            .with_body(r#"{"error":"boom"}"#)
            .create();
        let events = run(&server, &exchange(ApiMode::Chat, true));
        mock.assert();
        assert_eq!(events, vec![WorkerEvent::Failed("server returned http 500".into())]);
    }

    #[test]
    fn refused_connection_yields_exactly_one_error() {
        // bind then drop: nothing listens on the port afterwards
        let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = OllamaClient::new(format!("http://{addr}/api"));
        let mut events = Vec::new();
        run_exchange(&client, &exchange(ApiMode::Chat, true), |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Failed(msg) if msg.starts_with("request failed")));
    }

    #[test]
    fn error_object_mid_stream_ends_exchange() {
        let mut server = Server::new();
        let body = [
            r#"{"message":{"role":"assistant","content":"par"},"done":false}"#,
            r#"{"error":"out of memory"}"#,
            r#"{"message":{"role":"assistant","content":"never"},"done":true}"#,
        ]
        .join("\n");
        let _mock = server.mock("POST", "/api/chat").with_status(200).with_body(body).create();
        let events = run(&server, &exchange(ApiMode::Chat, true));
        assert_eq!(
            events,
            vec![
                WorkerEvent::Delta("par".into()),
                WorkerEvent::Failed("server error: out of memory".into()),
            ]
        );
    }

    #[test]
    fn empty_stream_is_an_error() {
        let mut server = Server::new();
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(r#"{"message":{"role":"assistant","content":""},"done":true}"#)
            .create();
        let events = run(&server, &exchange(ApiMode::Chat, true));
        assert_eq!(events, vec![WorkerEvent::Failed("no response received from the model".into())]);
    }
}
