//! model discovery: `/tags` for the list, `/show` for the selected model's parameters.
//!
//! fetches run on bevy's io pool (ureq is blocking) and are polled once per frame.

use crate::ChatSession;
use crate::api::{OllamaClient, readable_params};
use bevy::prelude::*;
use bevy::tasks::{IoTaskPool, Task};
use futures_lite::future;

pub const MODELS_ERROR_LABEL: &str = "Error fetching models";
pub const PARAMS_ERROR_LABEL: &str = "Error fetching model parameters";

/// what the server offers, plus the parameters of the selected model.
#[derive(Resource, Default, Debug, Clone)]
pub struct ModelCatalog {
    pub items: Vec<String>,
    pub selected: usize,
    pub loading: bool,
    pub error: Option<String>,
    /// human-readable parameter block for the selected model.
    pub parameters: String,
}

impl ModelCatalog {
    pub fn current(&self) -> Option<&str> {
        self.items.get(self.selected).map(String::as_str)
    }

    pub fn select_next(&mut self) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        self.selected = (self.selected + 1) % self.items.len();
        self.current()
    }

    pub fn select_prev(&mut self) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        self.selected = (self.selected + self.items.len() - 1) % self.items.len();
        self.current()
    }

    /// label for the model selector.
    pub fn label(&self) -> String {
        if self.loading {
            "model: (loading...)".to_string()
        } else if self.error.is_some() {
            format!("model: [{MODELS_ERROR_LABEL}]")
        } else {
            match self.current() {
                Some(m) => format!("model: {m}"),
                None => "model: <none>".to_string(),
            }
        }
    }

    /// adopt a fresh list; keep `preferred` selected if the server has it.
    ///
    /// returns the model that ended up selected.
    fn adopt(&mut self, items: Vec<String>, preferred: Option<&str>) -> Option<String> {
        self.items = items;
        self.error = None;
        self.selected = preferred
            .and_then(|p| self.items.iter().position(|m| m == p))
            .unwrap_or(0);
        self.current().map(str::to_string)
    }
}

/// ask the server for its model list.
#[derive(Event, Debug, Clone, Default)]
pub struct RefreshModels;

/// ask the server for one model's parameters.
#[derive(Event, Debug, Clone)]
pub struct FetchModelParams {
    pub model: String,
}

#[derive(Resource, Default)]
pub(crate) struct PendingModels(Option<Task<Result<Vec<String>, String>>>);

#[derive(Resource, Default)]
pub(crate) struct PendingParams(Option<Task<Result<String, String>>>);

pub(crate) fn spawn_model_fetch(
    mut ev: EventReader<RefreshModels>,
    client: Res<OllamaClient>,
    mut catalog: ResMut<ModelCatalog>,
    mut pending: ResMut<PendingModels>,
) {
    if ev.read().count() == 0 || catalog.loading {
        return;
    }
    let client = client.clone();
    info!(target: "bevy_ollama", "spawn_model_fetch -> {}", client.base_url());
    let task = IoTaskPool::get().spawn(async move { client.list_models().map_err(|e| e.to_string()) });
    pending.0 = Some(task);
    catalog.loading = true;
    catalog.error = None;
}

pub(crate) fn poll_model_fetch(
    mut pending: ResMut<PendingModels>,
    mut catalog: ResMut<ModelCatalog>,
    mut sessions: Query<&mut ChatSession>,
    mut ev_params: EventWriter<FetchModelParams>,
) {
    let Some(task) = pending.0.as_mut() else {
        return;
    };
    let Some(result) = future::block_on(future::poll_once(task)) else {
        return;
    };
    pending.0 = None;
    catalog.loading = false;
    match result {
        Ok(items) if !items.is_empty() => {
            info!(target: "bevy_ollama", "models fetched: {}", items.len());
            let preferred = sessions.iter().next().map(|s| s.settings.model.clone());
            let Some(model) = catalog.adopt(items, preferred.as_deref()) else {
                return;
            };
            for mut session in &mut sessions {
                if session.settings.model != model {
                    info!(target: "bevy_ollama", "auto-select model '{}'", model);
                    session.settings.model = model.clone();
                }
            }
            ev_params.write(FetchModelParams { model });
        }
        Ok(_) => {
            warn!(target: "bevy_ollama", "server reported no models");
            catalog.items.clear();
            catalog.selected = 0;
            catalog.error = Some("no models found".to_string());
        }
        Err(err) => {
            warn!(target: "bevy_ollama", "model fetch error: {}", err);
            catalog.items.clear();
            catalog.selected = 0;
            catalog.error = Some(err);
        }
    }
}

pub(crate) fn spawn_params_fetch(
    mut ev: EventReader<FetchModelParams>,
    client: Res<OllamaClient>,
    mut pending: ResMut<PendingParams>,
) {
    // only the latest request matters
    let Some(FetchModelParams { model }) = ev.read().last().cloned() else {
        return;
    };
    let client = client.clone();
    debug!(target: "bevy_ollama", "spawn_params_fetch -> '{}'", model);
    let task = IoTaskPool::get().spawn(async move {
        client
            .show_parameters(&model)
            .map(|p| readable_params(&p))
            .map_err(|e| e.to_string())
    });
    pending.0 = Some(task);
}

pub(crate) fn poll_params_fetch(mut pending: ResMut<PendingParams>, mut catalog: ResMut<ModelCatalog>) {
    let Some(task) = pending.0.as_mut() else {
        return;
    };
    let Some(result) = future::block_on(future::poll_once(task)) else {
        return;
    };
    pending.0 = None;
    catalog.parameters = match result {
        Ok(text) => format!("Model Parameters:\n{text}"),
        Err(err) => {
            warn!(target: "bevy_ollama", "model parameter fetch error: {}", err);
            PARAMS_ERROR_LABEL.to_string()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use crate::OllamaChatPlugin;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn app(server: &Server) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(OllamaChatPlugin);
        app.insert_resource(OllamaClient::new(format!("{}/api", server.url())));
        app
    }

    /// update until `done` holds or the frame budget runs out.
    fn run_until(app: &mut App, done: impl Fn(&ModelCatalog) -> bool) {
        for _ in 0..300 {
            app.update();
            if done(app.world().resource::<ModelCatalog>()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn catalog(items: &[&str]) -> ModelCatalog {
        ModelCatalog {
            items: items.iter().map(|s| s.to_string()).collect(),
            ..default()
        }
    }

    #[test]
    fn selection_wraps_both_ways() {
        let mut c = catalog(&["a", "b", "c"]);
        assert_eq!(c.select_prev(), Some("c"));
        assert_eq!(c.select_next(), Some("a"));
        assert_eq!(c.select_next(), Some("b"));
        assert_eq!(catalog(&[]).select_next(), None);
    }

    #[test]
    fn adopt_keeps_preferred_model() {
        let mut c = ModelCatalog::default();
        let picked = c.adopt(vec!["a".into(), "b".into()], Some("b"));
        assert_eq!(picked.as_deref(), Some("b"));
        assert_eq!(c.selected, 1);

        let picked = c.adopt(vec!["x".into(), "y".into()], Some("b"));
        assert_eq!(picked.as_deref(), Some("x"));
        assert_eq!(c.selected, 0);
    }

    #[test]
    fn label_reports_state() {
        let mut c = catalog(&["llama3"]);
        assert_eq!(c.label(), "model: llama3");
        c.loading = true;
        assert_eq!(c.label(), "model: (loading...)");
        c.loading = false;
        c.error = Some("refused".into());
        assert_eq!(c.label(), "model: [Error fetching models]");
    }

    #[test]
    fn refresh_selects_first_model_and_loads_its_parameters() {
        let mut server = Server::new();
        let tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3"},{"name":"phi3"}]}"#)
            .create();
        let show = server
            .mock("POST", "/api/show")
            .match_body(Matcher::PartialJson(json!({ "name": "llama3" })))
            .with_status(200)
            .with_body(r#"{"parameters":"num_ctx 4096"}"#)
            .create();

        let mut app = app(&server);
        let settings = SessionSettings { model: "mistral".into(), ..default() };
        let e = app.world_mut().spawn(ChatSession::streaming(settings)).id();
        app.world_mut().send_event(RefreshModels);

        run_until(&mut app, |c| !c.loading && !c.parameters.is_empty());

        tags.assert();
        show.assert();
        let catalog = app.world().resource::<ModelCatalog>();
        assert_eq!(catalog.items, vec!["llama3".to_string(), "phi3".to_string()]);
        assert_eq!(catalog.current(), Some("llama3"));
        assert_eq!(catalog.error, None);
        assert_eq!(catalog.parameters, "Model Parameters:\nNum Ctx: 4096\n");
        assert_eq!(app.world().entity(e).get::<ChatSession>().unwrap().settings.model, "llama3");
    }

    #[test]
    fn refresh_keeps_listed_session_model() {
        let mut server = Server::new();
        let _tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3"},{"name":"phi3"}]}"#)
            .create();
        let show = server
            .mock("POST", "/api/show")
            .match_body(Matcher::PartialJson(json!({ "name": "phi3" })))
            .with_status(200)
            .with_body(r#"{"parameters":{"temperature":0.2}}"#)
            .create();

        let mut app = app(&server);
        let settings = SessionSettings { model: "phi3".into(), ..default() };
        let e = app.world_mut().spawn(ChatSession::streaming(settings)).id();
        app.world_mut().send_event(RefreshModels);

        run_until(&mut app, |c| !c.loading && !c.parameters.is_empty());

        show.assert();
        assert_eq!(app.world().resource::<ModelCatalog>().selected, 1);
        assert_eq!(app.world().entity(e).get::<ChatSession>().unwrap().settings.model, "phi3");
    }

    #[test]
    fn failed_refresh_reports_error_label() {
        let mut server = Server::new();
        let tags = server.mock("GET", "/api/tags").with_status(500).create();
        let show = server.mock("POST", "/api/show").expect(0).create();

        let mut app = app(&server);
        let settings = SessionSettings { model: "llama3".into(), ..default() };
        let e = app.world_mut().spawn(ChatSession::streaming(settings)).id();
        app.world_mut().send_event(RefreshModels);

        run_until(&mut app, |c| !c.loading && c.error.is_some());

        tags.assert();
        show.assert();
        let catalog = app.world().resource::<ModelCatalog>();
        assert_eq!(catalog.error.as_deref(), Some("server returned http 500"));
        assert_eq!(catalog.label(), "model: [Error fetching models]");
        assert!(catalog.items.is_empty());
        assert_eq!(app.world().entity(e).get::<ChatSession>().unwrap().settings.model, "llama3");
    }

    #[test]
    fn failed_parameter_fetch_shows_error_text() {
        let mut server = Server::new();
        let _tags = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"llama3"}]}"#)
            .create();
        let _show = server.mock("POST", "/api/show").with_status(404).create();

        let mut app = app(&server);
        app.world_mut().send_event(RefreshModels);

        run_until(&mut app, |c| !c.loading && !c.parameters.is_empty());

        assert_eq!(app.world().resource::<ModelCatalog>().parameters, PARAMS_ERROR_LABEL);
    }
}
