//! bevy + bevy_ollama chat window against a local ollama server.
//! - model selector fed by `/tags`, parameters label fed by `/show`.
//! - role / personality fields (tab cycles focus), prompt line (enter sends).
//! - temperature and max-token steppers, history length stepper.
//! - persistence toggle; the session is written to config.json on exit.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_ollama::{
    ChatErrorEvt, ChatHistory, ChatSession, ChatSet, ClearHistory, ConfigPath, FetchModelParams,
    ModelCatalog, OllamaChatPlugin, Persistence, PersistedConfig, RefreshModels, Transcript,
    send_user_text, session_from_config,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct TranscriptText;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct RoleText;
#[derive(Component)]
struct PersonalityText;
#[derive(Component)]
struct ModelText;
#[derive(Component)]
struct ParamsText;
#[derive(Component)]
struct StatusText;

#[derive(Component, Clone, Copy, PartialEq, Eq, Debug)]
enum BtnAction {
    RefreshModels,
    PrevModel,
    NextModel,
    TempDown,
    TempUp,
    TopPDown,
    TopPUp,
    TopKDown,
    TopKUp,
    TokensDown,
    TokensUp,
    HistoryDown,
    HistoryUp,
    TogglePersistence,
    Clear,
}

#[derive(Resource, Clone, Copy)]
struct ActiveSession(Entity);

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

#[derive(Resource)]
struct Focus(FocusField);
impl Default for Focus {
    fn default() -> Self {
        Self(FocusField::Prompt)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FocusField {
    Role,
    Personality,
    Prompt,
}

const BTN_IDLE: Color = Color::srgb(0.2, 0.2, 0.25);
const BTN_HOVER: Color = Color::srgb(0.25, 0.25, 0.3);
const BTN_PRESSED: Color = Color::srgb(0.3, 0.3, 0.35);

// ---------------------- main ----------------------

fn main() {
    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(PromptBuf::default())
        .insert_resource(Focus::default())
        .add_plugins(DefaultPlugins.set(WindowPlugin {
            primary_window: Some(Window {
                title: format!("Ollama Chatbot v{}", env!("CARGO_PKG_VERSION")),
                resolution: (800.0, 600.0).into(),
                ..default()
            }),
            ..default()
        }))
        .add_plugins(OllamaChatPlugin)
        .add_systems(Startup, (restore_session, setup).chain())
        .add_systems(
            Update,
            (
                handle_text_input,
                on_button,
                refresh_field_texts,
                refresh_status_text,
                refresh_model_texts,
            ),
        )
        // transcript is complete once bevy_ollama recorded this frame's events
        .add_systems(Update, (refresh_transcript, on_error).after(ChatSet::Record))
        .run();
}

fn restore_session(
    mut commands: Commands,
    path: Res<ConfigPath>,
    mut ev_refresh: EventWriter<RefreshModels>,
) {
    let cfg = PersistedConfig::load_or_default(&path.0);
    info!(target: "chat", "restore_session: model='{}' history={}", cfg.model, cfg.chat_history.len());
    let session = commands.spawn(session_from_config(&cfg)).id();
    commands.insert_resource(ActiveSession(session));
    ev_refresh.write(RefreshModels);
}

// ---------------------- setup ui ----------------------

fn button(p: &mut ChildSpawnerCommands, label: &str, width: f32, action: BtnAction, font: &TextFont) {
    p.spawn((
        Button,
        Node {
            width: Val::Px(width),
            height: Val::Px(26.0),
            align_items: AlignItems::Center,
            justify_content: JustifyContent::Center,
            ..default()
        },
        BackgroundColor(BTN_IDLE),
        action,
    ))
    .with_children(|b| {
        b.spawn((Text::new(label), font.clone(), TextColor(Color::WHITE)));
    });
}

fn row() -> (Node, BackgroundColor) {
    (
        Node {
            width: Val::Percent(100.0),
            height: Val::Auto,
            column_gap: Val::Px(8.0),
            flex_direction: FlexDirection::Row,
            align_items: AlignItems::Center,
            ..default()
        },
        BackgroundColor(Color::NONE),
    )
}

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d);

    let style_16 = TextFont { font_size: 16.0, ..default() };
    let style_13 = TextFont { font_size: 13.0, ..default() };

    // root
    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // --- settings box ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Auto,
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(6.0),
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|c| {
                // row: [refresh] [<] model [>]
                c.spawn(row()).with_children(|r| {
                    button(r, "refresh models", 130.0, BtnAction::RefreshModels, &style_13);
                    button(r, "<", 26.0, BtnAction::PrevModel, &style_13);
                    r.spawn((Text::new("model: "), style_13.clone(), TextColor(Color::WHITE), ModelText));
                    button(r, ">", 26.0, BtnAction::NextModel, &style_13);
                });

                c.spawn((Text::new(""), style_13.clone(), TextColor(Color::WHITE), RoleText));
                c.spawn((Text::new(""), style_13.clone(), TextColor(Color::WHITE), PersonalityText));

                // row: sampling, max tokens, history length, persistence, clear
                c.spawn(row()).with_children(|r| {
                    button(r, "t-", 30.0, BtnAction::TempDown, &style_13);
                    button(r, "t+", 30.0, BtnAction::TempUp, &style_13);
                    button(r, "p-", 30.0, BtnAction::TopPDown, &style_13);
                    button(r, "p+", 30.0, BtnAction::TopPUp, &style_13);
                    button(r, "k-", 30.0, BtnAction::TopKDown, &style_13);
                    button(r, "k+", 30.0, BtnAction::TopKUp, &style_13);
                    button(r, "n-", 30.0, BtnAction::TokensDown, &style_13);
                    button(r, "n+", 30.0, BtnAction::TokensUp, &style_13);
                    button(r, "h-", 30.0, BtnAction::HistoryDown, &style_13);
                    button(r, "h+", 30.0, BtnAction::HistoryUp, &style_13);
                    button(r, "persistence", 110.0, BtnAction::TogglePersistence, &style_13);
                    button(r, "clear history", 120.0, BtnAction::Clear, &style_13);
                });
                c.spawn((Text::new(""), style_13.clone(), TextColor(Color::srgb_u8(170, 170, 170)), StatusText));
                c.spawn((
                    Text::new("Model Parameters:"),
                    style_13.clone(),
                    TextColor(Color::srgb_u8(170, 170, 170)),
                    ParamsText,
                ));
            });

            // --- conversation box ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    justify_content: JustifyContent::FlexEnd,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    overflow: Overflow::clip(),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|c| {
                c.spawn((Text::new(""), style_16.clone(), TextColor(Color::WHITE), TranscriptText));
                c.spawn((Text::new("> "), style_16.clone(), TextColor(Color::WHITE), PromptText));
            });
        });
}

// ---------------------- input & buttons ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut focus: ResMut<Focus>,
    mut prompt: ResMut<PromptBuf>,
    active: Option<Res<ActiveSession>>,
    mut q_session: Query<&mut ChatSession>,
) {
    let Some(active) = active else {
        return;
    };
    let Ok(mut session) = q_session.get_mut(active.0) else {
        return;
    };

    // switch focus with tab
    if keys.just_pressed(KeyCode::Tab) {
        focus.0 = match focus.0 {
            FocusField::Role => FocusField::Personality,
            FocusField::Personality => FocusField::Prompt,
            FocusField::Prompt => FocusField::Role,
        };
        info!(target: "chat", "focus -> {:?}", focus.0);
    }

    for ev in ev_kbd.read() {
        if !ev.state.is_pressed() {
            continue;
        }
        let Some(txt) = &ev.text else {
            continue;
        };
        let s: String = txt.chars().filter(|c| !c.is_control()).collect();
        if s.is_empty() {
            continue;
        }
        match focus.0 {
            FocusField::Role => session.settings.role.push_str(&s),
            FocusField::Personality => session.settings.personality.push_str(&s),
            FocusField::Prompt => prompt.0.push_str(&s),
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        match focus.0 {
            FocusField::Role => {
                session.settings.role.pop();
            }
            FocusField::Personality => {
                session.settings.personality.pop();
            }
            FocusField::Prompt => {
                prompt.0.pop();
            }
        }
    }

    if keys.just_pressed(KeyCode::Enter) {
        match focus.0 {
            FocusField::Prompt => {
                let msg = std::mem::take(&mut prompt.0);
                send_user_text(&mut commands, active.0, msg);
            }
            FocusField::Personality => session.settings.personality.push('\n'),
            FocusField::Role => focus.0 = FocusField::Personality,
        }
    }
}

fn on_button(
    mut q: Query<(&Interaction, &BtnAction, &mut BackgroundColor), Changed<Interaction>>,
    active: Option<Res<ActiveSession>>,
    mut catalog: ResMut<ModelCatalog>,
    mut q_session: Query<(&mut ChatSession, &mut ChatHistory, &mut Persistence)>,
    mut ev_refresh: EventWriter<RefreshModels>,
    mut ev_params: EventWriter<FetchModelParams>,
    mut ev_clear: EventWriter<ClearHistory>,
) {
    let Some(active) = active else {
        return;
    };
    for (i, action, mut bg) in &mut q {
        match *i {
            Interaction::Hovered => bg.0 = BTN_HOVER,
            Interaction::None => bg.0 = BTN_IDLE,
            Interaction::Pressed => {
                bg.0 = BTN_PRESSED;
                let Ok((mut session, mut history, mut persistence)) = q_session.get_mut(active.0) else {
                    continue;
                };
                let options = &mut session.settings.options;
                match action {
                    BtnAction::RefreshModels => {
                        ev_refresh.write(RefreshModels);
                    }
                    BtnAction::PrevModel | BtnAction::NextModel => {
                        let picked = if *action == BtnAction::PrevModel {
                            catalog.select_prev()
                        } else {
                            catalog.select_next()
                        };
                        if let Some(model) = picked.map(str::to_string) {
                            info!(target: "chat", "model -> '{}'", model);
                            session.settings.model = model.clone();
                            ev_params.write(FetchModelParams { model });
                        }
                    }
                    BtnAction::TempDown => options.temperature = (options.temperature - 0.1).max(0.0),
                    BtnAction::TempUp => options.temperature = (options.temperature + 0.1).min(2.0),
                    BtnAction::TopPDown => options.top_p = (options.top_p - 0.05).max(0.0),
                    BtnAction::TopPUp => options.top_p = (options.top_p + 0.05).min(1.0),
                    BtnAction::TopKDown => options.top_k = options.top_k.saturating_sub(5).max(1),
                    BtnAction::TopKUp => options.top_k = (options.top_k + 5).min(200),
                    BtnAction::TokensDown => options.max_tokens = (options.max_tokens / 2).max(16),
                    BtnAction::TokensUp => options.max_tokens = (options.max_tokens * 2).min(32_768),
                    BtnAction::HistoryDown => {
                        let n = history.max_len().saturating_sub(1);
                        history.set_max_len(n);
                    }
                    BtnAction::HistoryUp => {
                        let n = history.max_len() + 1;
                        history.set_max_len(n);
                    }
                    BtnAction::TogglePersistence => persistence.0 = !persistence.0,
                    BtnAction::Clear => {
                        ev_clear.write(ClearHistory { entity: active.0 });
                    }
                }
            }
        }
    }
}

// ---------------------- text refresh ----------------------

fn caret(focus: &Focus, field: FocusField) -> &'static str {
    if focus.0 == field { " |" } else { "" }
}

fn refresh_field_texts(
    prompt: Res<PromptBuf>,
    focus: Res<Focus>,
    active: Option<Res<ActiveSession>>,
    q_session: Query<Ref<ChatSession>>,
    mut sets: ParamSet<(
        Query<&mut Text, With<PromptText>>,
        Query<&mut Text, With<RoleText>>,
        Query<&mut Text, With<PersonalityText>>,
    )>,
) {
    let Some(active) = active else {
        return;
    };
    let Ok(session) = q_session.get(active.0) else {
        return;
    };
    if !(prompt.is_changed() || focus.is_changed() || session.is_changed()) {
        return;
    }
    if let Ok(mut t) = sets.p0().single_mut() {
        t.0 = format!("> {}{}", prompt.0, caret(&focus, FocusField::Prompt));
    }
    if let Ok(mut t) = sets.p1().single_mut() {
        t.0 = format!("role: {}{}", session.settings.role, caret(&focus, FocusField::Role));
    }
    if let Ok(mut t) = sets.p2().single_mut() {
        t.0 = format!(
            "personality/context: {}{}",
            session.settings.personality,
            caret(&focus, FocusField::Personality)
        );
    }
}

fn refresh_status_text(
    active: Option<Res<ActiveSession>>,
    q_session: Query<(Ref<ChatSession>, Ref<ChatHistory>, Ref<Persistence>)>,
    mut q_status: Query<&mut Text, With<StatusText>>,
) {
    let Some(active) = active else {
        return;
    };
    let Ok((session, history, persistence)) = q_session.get(active.0) else {
        return;
    };
    if !(session.is_changed() || history.is_changed() || persistence.is_changed()) {
        return;
    }
    let o = &session.settings.options;
    if let Ok(mut t) = q_status.single_mut() {
        t.0 = format!(
            "temperature: {:.1}  top_p: {:.2}  top_k: {}  max tokens: {}  |  history length: {} ({} entries)  |  persistence: {}",
            o.temperature,
            o.top_p,
            o.top_k,
            o.max_tokens,
            history.max_len(),
            history.len(),
            if persistence.0 { "on" } else { "off" },
        );
    }
}

fn refresh_model_texts(
    catalog: Res<ModelCatalog>,
    mut sets: ParamSet<(Query<&mut Text, With<ModelText>>, Query<&mut Text, With<ParamsText>>)>,
) {
    if !catalog.is_changed() {
        return;
    }
    if let Ok(mut t) = sets.p0().single_mut() {
        t.0 = catalog.label();
    }
    if let Ok(mut t) = sets.p1().single_mut() {
        t.0 = if catalog.parameters.is_empty() {
            "Model Parameters:".to_string()
        } else {
            catalog.parameters.clone()
        };
    }
}

// ---------------------- chat events ----------------------

fn refresh_transcript(
    active: Option<Res<ActiveSession>>,
    q_transcript: Query<Ref<Transcript>>,
    mut q_text: Query<&mut Text, With<TranscriptText>>,
) {
    let Some(active) = active else {
        return;
    };
    let Ok(transcript) = q_transcript.get(active.0) else {
        return;
    };
    if !transcript.is_changed() {
        return;
    }
    if let Ok(mut t) = q_text.single_mut() {
        t.0 = transcript.as_str().to_string();
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>) {
    for ChatErrorEvt { entity, error } in ev.read() {
        warn!(target: "chat", "chat error (entity={:?}): {}", entity, error);
    }
}
