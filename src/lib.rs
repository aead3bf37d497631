//! bevy_ollama: a bevy chat plugin over a local ollama server.
//!
//! - one `ChatSession` entity per conversation; history, transcript and the
//!   persistence flag ride along as required components.
//! - `send_user_text` queues a request; the plugin snapshots settings +
//!   history and runs the request on its own detached worker thread.
//! - fragments come back through a bounded channel and are emitted as bevy
//!   events, applied to the transcript, and recorded in the capped history
//!   once the reply completes.
//! - the session is written to `config.json` on exit (and on clear) when
//!   persistence is enabled.
//!
//! api docs: https://github.com/ollama/ollama/blob/main/docs/api.md

use bevy::app::AppExit;
use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::path::Path;

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod history;
pub mod prompt;
pub mod session;
pub mod worker;

pub use api::{ChatMessage, ChatRole, DEFAULT_BASE_URL, OllamaClient};
pub use catalog::{FetchModelParams, ModelCatalog, RefreshModels};
pub use config::{CONFIG_FILE, ConfigPath, PersistedConfig};
pub use error::{ConfigError, OllamaError};
pub use history::ChatHistory;
pub use session::{ApiMode, GenerationOptions, Persistence, SessionSettings, Transcript};
pub use worker::{Exchange, WorkerEvent, run_exchange};

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// Chat* events are emitted here (in `Update`)
    Drain,
    /// transcript + history are updated from those events here
    Record,
}

/// a conversation with the inference server.
#[derive(Component, Clone, Debug, Default)]
#[require(ChatHistory, Transcript, Persistence)]
pub struct ChatSession {
    pub settings: SessionSettings,
    pub mode: ApiMode,
    /// forward fragments as they arrive, or only the final text.
    pub stream: bool,
}

impl ChatSession {
    pub fn streaming(settings: SessionSettings) -> Self {
        Self { settings, mode: ApiMode::Chat, stream: true }
    }
}

/// everything needed to spawn a session restored from a config file.
pub fn session_from_config(cfg: &PersistedConfig) -> impl Bundle + use<> {
    (
        ChatSession::streaming(cfg.settings()),
        cfg.history(),
        cfg.transcript(),
        cfg.persistence(),
    )
}

/// insert this component to trigger a request for the session entity.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub text: String,
}

/// the prompt of the in-flight exchange; recorded into history on completion.
///
/// a second send before the first completes overwrites it.
#[derive(Component, Clone, Debug)]
pub struct PendingExchange {
    pub prompt: String,
}

/// helper to enqueue a user message on a session entity. blank text is ignored.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into().trim().to_string();
    if text.is_empty() {
        return;
    }
    info!(target: "bevy_ollama", "send_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(ChatRequest { text });
}

/// events emitted by the plugin during/after chat.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
    pub prompt: String,
}
#[derive(Event, Debug)]
pub struct ChatDeltaEvt {
    pub entity: Entity,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    pub final_text: String,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// wipe history, transcript and personality; then save if persistence is on.
#[derive(Event, Debug, Clone, Copy)]
pub struct ClearHistory {
    pub entity: Entity,
}

/// cross-thread inbox for streaming; workers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum StreamMsg {
    Delta { entity: Entity, text: String },
    Done { entity: Entity, final_text: String },
    Err { entity: Entity, error: String },
}

impl StreamMsg {
    fn tagged(entity: Entity, ev: WorkerEvent) -> Self {
        match ev {
            WorkerEvent::Delta(text) => Self::Delta { entity, text },
            WorkerEvent::Done(final_text) => Self::Done { entity, final_text },
            WorkerEvent::Failed(error) => Self::Err { entity, error },
        }
    }
}

/// send to inbox (ignore disconnected)
fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// bevy plugin: wires systems, events, resources.
///
/// inserts a default `OllamaClient` and `ConfigPath` unless the app already
/// has them.
pub struct OllamaChatPlugin;

impl Plugin for OllamaChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_ollama", "OllamaChatPlugin: build()");
        app.init_resource::<StreamInbox>()
            .init_resource::<OllamaClient>()
            .init_resource::<ConfigPath>()
            .init_resource::<ModelCatalog>()
            .init_resource::<catalog::PendingModels>()
            .init_resource::<catalog::PendingParams>()
            .add_event::<ChatStarted>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .add_event::<ClearHistory>()
            .add_event::<RefreshModels>()
            .add_event::<FetchModelParams>()
            .configure_sets(Update, (ChatSet::Drain, ChatSet::Record).chain())
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            .add_systems(Update, (apply_chat_events, clear_history).chain().in_set(ChatSet::Record))
            // spawn requests in Update; work continues on a detached thread
            .add_systems(Update, spawn_chat_requests.before(ChatSet::Drain))
            .add_systems(
                Update,
                (
                    catalog::spawn_model_fetch,
                    catalog::poll_model_fetch,
                    catalog::spawn_params_fetch,
                    catalog::poll_params_fetch,
                )
                    .chain(),
            )
            .add_systems(Last, persist_on_exit);
    }
}

/// spawns a worker per pending request.
fn spawn_chat_requests(
    mut commands: Commands,
    client: Res<OllamaClient>,
    inbox: Res<StreamInbox>,
    mut q: Query<(Entity, &ChatSession, &ChatHistory, &ChatRequest, &mut Transcript)>,
    mut ev_start: EventWriter<ChatStarted>,
) {
    for (e, session, history, req, mut transcript) in q.iter_mut() {
        let exchange = Exchange {
            settings: session.settings.clone(),
            mode: session.mode,
            stream: session.stream,
            history: history.entries().to_vec(),
            prompt: req.text.clone(),
        };
        info!(target: "bevy_ollama",
            "spawn_chat_requests: entity={:?} model='{}' mode={:?} stream={} history={}",
            e, exchange.settings.model, exchange.mode, exchange.stream, exchange.history.len()
        );

        // one-shot marker removal
        commands
            .entity(e)
            .remove::<ChatRequest>()
            .insert(PendingExchange { prompt: req.text.clone() });
        transcript.push_user(&req.text);
        ev_start.write(ChatStarted { entity: e, prompt: req.text.clone() });

        // detached: a hung request must never hold up app shutdown
        let client = client.clone();
        let tx = inbox.tx.clone();
        let worker_tx = tx.clone();
        let spawned = std::thread::Builder::new()
            .name("ollama-worker".to_string())
            .spawn(move || {
                run_exchange(&client, &exchange, |ev| push_inbox(&worker_tx, StreamMsg::tagged(e, ev)));
            });
        if let Err(err) = spawned {
            error!(target: "bevy_ollama", "failed to spawn worker thread: {}", err);
            push_inbox(&tx, StreamMsg::Err { entity: e, error: err.to_string() });
        }
    }
}

/// drains the inbox and emits user-facing events.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    let mut drained = Vec::with_capacity(64);
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(m) => drained.push(m),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    if drained.is_empty() {
        return;
    }

    // aggregate deltas per entity so ui applies a single push per entity per frame
    let mut delta_map: HashMap<Entity, String> = HashMap::new();
    let mut dones: Vec<(Entity, String)> = Vec::new();
    let mut errs: Vec<(Entity, String)> = Vec::new();

    for ev in drained {
        match ev {
            StreamMsg::Delta { entity, text } => {
                delta_map.entry(entity).or_default().push_str(&text);
            }
            StreamMsg::Done { entity, final_text } => dones.push((entity, final_text)),
            StreamMsg::Err { entity, error } => errs.push((entity, error)),
        }
    }

    for (entity, text) in delta_map {
        ev_delta.write(ChatDeltaEvt { entity, text });
    }
    // ensure deltas land before "done" for the same frame
    for (entity, final_text) in dones {
        ev_done.write(ChatCompletedEvt { entity, final_text });
    }
    for (entity, error) in errs {
        ev_err.write(ChatErrorEvt { entity, error });
    }
}

/// transcript follows every event; history only takes completed exchanges.
fn apply_chat_events(
    mut commands: Commands,
    mut ev_delta: EventReader<ChatDeltaEvt>,
    mut ev_done: EventReader<ChatCompletedEvt>,
    mut ev_err: EventReader<ChatErrorEvt>,
    mut q: Query<(&mut Transcript, &mut ChatHistory, Option<&PendingExchange>)>,
) {
    for ChatDeltaEvt { entity, text } in ev_delta.read() {
        if let Ok((mut transcript, _, _)) = q.get_mut(*entity) {
            transcript.push_delta(text);
        }
    }
    for ChatCompletedEvt { entity, final_text } in ev_done.read() {
        let Ok((mut transcript, mut history, pending)) = q.get_mut(*entity) else {
            continue;
        };
        transcript.end_reply();
        match pending {
            Some(PendingExchange { prompt }) => {
                history.push_exchange(prompt, final_text);
                debug!(target: "bevy_ollama", "recorded exchange: entity={:?} history={}", entity, history.len());
            }
            None => warn!(target: "bevy_ollama", "completed reply without a pending prompt: entity={:?}", entity),
        }
        commands.entity(*entity).remove::<PendingExchange>();
    }
    for ChatErrorEvt { entity, error } in ev_err.read() {
        if let Ok((mut transcript, _, _)) = q.get_mut(*entity) {
            transcript.push_error(error);
            commands.entity(*entity).remove::<PendingExchange>();
        }
    }
}

fn clear_history(
    mut ev: EventReader<ClearHistory>,
    path: Res<ConfigPath>,
    mut q: Query<(&mut ChatSession, &mut ChatHistory, &mut Transcript, &Persistence)>,
) {
    for ClearHistory { entity } in ev.read() {
        let Ok((mut session, mut history, mut transcript, persistence)) = q.get_mut(*entity) else {
            continue;
        };
        info!(target: "bevy_ollama", "clear_history: entity={:?}", entity);
        history.clear();
        transcript.clear();
        session.settings.personality.clear();
        save_session(&path.0, &session.settings, &history, &transcript, *persistence);
    }
}

fn persist_on_exit(
    mut ev: EventReader<AppExit>,
    path: Res<ConfigPath>,
    q: Query<(&ChatSession, &ChatHistory, &Transcript, &Persistence)>,
) {
    if ev.read().count() == 0 {
        return;
    }
    for (session, history, transcript, persistence) in &q {
        save_session(&path.0, &session.settings, history, transcript, *persistence);
    }
}

/// write the session if persistence is enabled. returns whether a file was written.
pub fn save_session(
    path: &Path,
    settings: &SessionSettings,
    history: &ChatHistory,
    transcript: &Transcript,
    persistence: Persistence,
) -> bool {
    if !persistence.0 {
        return false;
    }
    match PersistedConfig::capture(settings, history, transcript, persistence).save(path) {
        Ok(()) => {
            info!(target: "bevy_ollama", "saved session to {}", path.display());
            true
        }
        Err(err) => {
            error!(target: "bevy_ollama", "failed to save session to {}: {}", path.display(), err);
            false
        }
    }
}
