// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod lobby;
mod proto;
mod reporter;
mod session;
mod steam;

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gargamel_common::{
    ChatMessageRequest, CreateGameRequest, CreateGameResponse, GameStatus, PollControlRequest,
    ReplacePlayerRequest, SessionState, SwapPlayersRequest, UpdateLobbySettingsRequest,
    expand_env_vars,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::reporter::{HttpResultSink, ResultSink};
use crate::session::{GameConfig, GameRegistry, GameSession, GcTimings};
use crate::steam::{SimulatedSteamFactory, SteamClientFactory};

#[derive(Clone)]
struct AppState {
    registry: Arc<GameRegistry>,
    steam_factory: Arc<dyn SteamClientFactory>,
    result_sink: Arc<dyn ResultSink>,
    timings: GcTimings,
}

/// Optional YAML tunables, all overridable per deployment.
#[derive(Debug, Clone, Default, Deserialize)]
struct ServiceConfigFile {
    #[serde(default)]
    bind: Option<String>,
    #[serde(default)]
    gc_bootstrap_delay_ms: Option<u64>,
    #[serde(default)]
    gc_hello_delay_ms: Option<u64>,
    #[serde(default)]
    gc_post_hello_delay_ms: Option<u64>,
    #[serde(default)]
    keepalive_interval_secs: Option<u64>,
    #[serde(default)]
    invite_delay_ms: Option<u64>,
    #[serde(default)]
    invite_retry_delay_ms: Option<u64>,
    #[serde(default)]
    bot_eject_delay_ms: Option<u64>,
    #[serde(default)]
    reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    lobby_recreate_delay_ms: Option<u64>,
    #[serde(default)]
    launch_pause_ms: Option<u64>,
    #[serde(default)]
    team_check_debounce_ms: Option<u64>,
    #[serde(default)]
    auto_poll_threshold: Option<usize>,
    #[serde(default)]
    debug_auto_poll_threshold: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "lobby_manager_service=debug,tower_http=info".to_string()),
        )
        .init();

    let file_config = load_service_config().unwrap_or_default();
    let state = AppState {
        registry: GameRegistry::new(),
        steam_factory: Arc::new(SimulatedSteamFactory::default()),
        result_sink: Arc::new(HttpResultSink::new()),
        timings: timings_from(&file_config),
    };
    info!("Steam transport: in-process simulator");

    let app = build_router(state);
    let bind_addr = resolve_bind_addr(&file_config)?;
    info!(%bind_addr, "gargamel lobby manager listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_service_config() -> Option<ServiceConfigFile> {
    let path = std::env::var("LOBBY_MANAGER_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read lobby manager config file");
            return None;
        }
    };

    match serde_yaml::from_str::<ServiceConfigFile>(&expand_env_vars(&raw)) {
        Ok(parsed) => {
            info!(path = %path, "loaded lobby manager config");
            Some(parsed)
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse lobby manager config yaml");
            None
        }
    }
}

fn timings_from(config: &ServiceConfigFile) -> GcTimings {
    let mut timings = GcTimings::default();
    let millis = Duration::from_millis;
    if let Some(value) = config.gc_bootstrap_delay_ms {
        timings.gc_bootstrap_delay = millis(value);
    }
    if let Some(value) = config.gc_hello_delay_ms {
        timings.gc_hello_delay = millis(value);
    }
    if let Some(value) = config.gc_post_hello_delay_ms {
        timings.gc_post_hello_delay = millis(value);
    }
    if let Some(value) = config.keepalive_interval_secs {
        timings.keepalive_interval = Duration::from_secs(value.max(1));
    }
    if let Some(value) = config.invite_delay_ms {
        timings.invite_delay = millis(value);
    }
    if let Some(value) = config.invite_retry_delay_ms {
        timings.invite_retry_delay = millis(value);
    }
    if let Some(value) = config.bot_eject_delay_ms {
        timings.bot_eject_delay = millis(value);
    }
    if let Some(value) = config.reconnect_delay_ms {
        timings.reconnect_delay = millis(value);
    }
    if let Some(value) = config.lobby_recreate_delay_ms {
        timings.lobby_recreate_delay = millis(value);
    }
    if let Some(value) = config.launch_pause_ms {
        timings.launch_pause = millis(value);
    }
    if let Some(value) = config.team_check_debounce_ms {
        timings.team_check_debounce = millis(value);
    }
    if let Some(value) = config.auto_poll_threshold {
        timings.auto_poll_threshold = value;
    }
    if let Some(value) = config.debug_auto_poll_threshold {
        timings.debug_auto_poll_threshold = value;
    }
    timings
}

fn resolve_bind_addr(config: &ServiceConfigFile) -> anyhow::Result<SocketAddr> {
    if let Ok(value) = std::env::var("LOBBY_MANAGER_BIND") {
        return value.parse().context("invalid LOBBY_MANAGER_BIND");
    }
    if let Some(bind) = config.bind.as_deref().filter(|value| !value.is_empty()) {
        return bind.parse().context("invalid bind address in config file");
    }
    let port = std::env::var("PORT")
        .ok()
        .unwrap_or_else(|| "8080".to_string());
    format!("0.0.0.0:{port}").parse().context("invalid PORT")
}

fn build_router(state: AppState) -> Router {
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .route("/health", get(health))
        .route("/game", post(create_game_handler))
        .route(
            "/game/{game_id}",
            get(get_game_handler)
                .put(update_game_handler)
                .delete(delete_game_handler),
        )
        .route("/game/{game_id}/swap", post(swap_players_handler))
        .route("/game/{game_id}/replace", post(replace_player_handler))
        .route("/game/{game_id}/chat", post(chat_handler))
        .route("/poll/{game_id}", post(poll_handler))
        .route("/games", get(list_games_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "lobby-manager-service"}))
}

fn lookup(state: &AppState, game_id: &str) -> Result<Arc<GameSession>, ApiError> {
    state
        .registry
        .get(game_id)
        .ok_or_else(|| ApiError::not_found(format!("Game {game_id} not found")))
}

async fn create_game_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateGameRequest>,
) -> Result<Json<CreateGameResponse>, ApiError> {
    if request.game_id.trim().is_empty() {
        return Err(ApiError::bad_request("game_id is required"));
    }
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }
    if request.result_url.is_empty() {
        return Err(ApiError::bad_request("result_url is required"));
    }
    if request.radiant_team.is_empty() && request.dire_team.is_empty() {
        return Err(ApiError::bad_request("at least one team must have players"));
    }
    let radiant: HashSet<u64> = request.radiant_team.iter().copied().collect();
    if request.dire_team.iter().any(|id| radiant.contains(id)) {
        return Err(ApiError::bad_request(
            "a Steam id may appear on only one team",
        ));
    }

    let game_id = request.game_id.clone();
    let config = GameConfig::from_request(request);
    let pass_key = config.pass_key.clone();
    let session = GameSession::new(
        config,
        state.registry.clone(),
        state.result_sink.clone(),
        state.timings.clone(),
    );
    if !state.registry.add(session.clone()) {
        return Err(ApiError::conflict(format!("Game {game_id} already exists")));
    }

    // Protocol work continues in the session's background workers.
    session.spawn(&state.steam_factory);
    info!(game_id = %game_id, "game session created");

    Ok(Json(CreateGameResponse {
        game_id,
        status: SessionState::Creating,
        password: pass_key,
    }))
}

async fn get_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameStatus>, ApiError> {
    let session = lookup(&state, &game_id)?;
    Ok(Json(session.status()))
}

async fn update_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<UpdateLobbySettingsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = lookup(&state, &game_id)?;
    session.update_settings(request).await;
    Ok(Json(serde_json::json!({"status": "updated"})))
}

async fn delete_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = lookup(&state, &game_id)?;
    session.teardown().await;
    Ok(Json(serde_json::json!({"status": "deleted"})))
}

async fn swap_players_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<SwapPlayersRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = lookup(&state, &game_id)?;
    session
        .swap_players(request.steam_id_1, request.steam_id_2)
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    Ok(Json(serde_json::json!({"status": "swapped"})))
}

async fn replace_player_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<ReplacePlayerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = lookup(&state, &game_id)?;
    session
        .replace_player(request.old_steam_id, request.new_steam_id)
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    Ok(Json(serde_json::json!({"status": "replaced"})))
}

async fn chat_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = lookup(&state, &game_id)?;
    session
        .send_chat(&request.message)
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    Ok(Json(serde_json::json!({"status": "sent"})))
}

async fn poll_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<PollControlRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = lookup(&state, &game_id)?;
    match request.action.as_str() {
        "start" => {
            session.start_poll().await;
            Ok(Json(serde_json::json!({"status": "polling_started"})))
        }
        "end" => {
            let Some(game_mode) = request.game_mode else {
                return Err(ApiError::bad_request("game_mode is required when ending poll"));
            };
            session.end_poll(game_mode).await;
            Ok(Json(serde_json::json!({"status": "polling_ended"})))
        }
        _ => Err(ApiError::bad_request("Invalid action. Use 'start' or 'end'")),
    }
}

async fn list_games_handler(State(state): State<AppState>) -> Json<Vec<GameStatus>> {
    let statuses = state
        .registry
        .list()
        .into_iter()
        .map(|session| session.status())
        .collect();
    Json(statuses)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gargamel_common::GameResult;

    struct NoopResultSink;

    #[async_trait]
    impl ResultSink for NoopResultSink {
        async fn notify_poll_started(&self, _url: &str, _game_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn post_result(&self, _url: &str, _result: &GameResult) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn app_state() -> AppState {
        AppState {
            registry: GameRegistry::new(),
            steam_factory: Arc::new(SimulatedSteamFactory::default()),
            result_sink: Arc::new(NoopResultSink),
            timings: GcTimings::fast(),
        }
    }

    /// Slow GC choreography so handler tests observe the pre-lobby window.
    fn app_state_slow() -> AppState {
        AppState {
            timings: GcTimings::default(),
            ..app_state()
        }
    }

    fn create_request(game_id: &str) -> CreateGameRequest {
        CreateGameRequest {
            game_id: game_id.to_string(),
            username: "gargamel".to_string(),
            password: "hunter2".to_string(),
            radiant_team: vec![1, 2],
            dire_team: vec![3, 4],
            result_url: "http://master-bot/result".to_string(),
            server_region: None,
            game_mode: None,
            allow_cheats: None,
            game_name: None,
            pass_key: Some("pk".to_string()),
            debug_steam_id: None,
            poll_callback_url: None,
        }
    }

    #[tokio::test]
    async fn create_game_validates_required_fields() {
        let state = app_state_slow();

        let mut missing_id = create_request("");
        missing_id.game_id = String::new();
        let error = create_game_handler(State(state.clone()), Json(missing_id))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let mut missing_credentials = create_request("g1");
        missing_credentials.password = String::new();
        let error = create_game_handler(State(state.clone()), Json(missing_credentials))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let mut missing_result_url = create_request("g1");
        missing_result_url.result_url = String::new();
        let error = create_game_handler(State(state.clone()), Json(missing_result_url))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let mut empty_teams = create_request("g1");
        empty_teams.radiant_team.clear();
        empty_teams.dire_team.clear();
        let error = create_game_handler(State(state.clone()), Json(empty_teams))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        // Nothing slipped into the registry.
        assert!(state.registry.list().is_empty());
    }

    #[tokio::test]
    async fn create_game_rejects_a_player_on_both_teams() {
        let state = app_state_slow();
        let mut overlapping = create_request("g1");
        overlapping.dire_team = vec![2, 5];
        let error = create_game_handler(State(state), Json(overlapping))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("only one team"));
    }

    #[tokio::test]
    async fn create_game_conflicts_on_duplicate_id() {
        let state = app_state_slow();
        let created = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap()
            .0;
        assert_eq!(created.status, SessionState::Creating);
        assert_eq!(created.password, "pk");

        let error = create_game_handler(State(state), Json(create_request("g1")))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn keyed_operations_return_not_found_for_unknown_games() {
        let state = app_state_slow();
        let error = get_game_handler(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        let error = delete_game_handler(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        let error = poll_handler(
            State(state),
            Path("missing".to_string()),
            Json(PollControlRequest {
                action: "start".to_string(),
                game_mode: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reflects_config_updates() {
        let state = app_state_slow();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap();

        let _ = update_game_handler(
            State(state.clone()),
            Path("g1".to_string()),
            Json(UpdateLobbySettingsRequest {
                game_mode: Some(23),
                server_region: Some(3),
                allow_cheats: Some(true),
                game_name: Some("finals".to_string()),
            }),
        )
        .await
        .unwrap();

        let status = get_game_handler(State(state), Path("g1".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(status.game_mode, 23);
        assert_eq!(status.server_region, 3);
        assert!(status.allow_cheats);
        assert_eq!(status.state, SessionState::Creating);
        assert_eq!(status.lobby_id, 0);
    }

    #[tokio::test]
    async fn delete_removes_the_game_everywhere() {
        let state = app_state_slow();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap();

        let deleted = delete_game_handler(State(state.clone()), Path("g1".to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(deleted["status"], "deleted");

        let listed = list_games_handler(State(state.clone())).await.0;
        assert!(listed.is_empty());

        let error = get_game_handler(State(state), Path("g1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_rejects_bad_actions_and_missing_mode() {
        let state = app_state_slow();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap();

        let error = poll_handler(
            State(state.clone()),
            Path("g1".to_string()),
            Json(PollControlRequest {
                action: "pause".to_string(),
                game_mode: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let error = poll_handler(
            State(state.clone()),
            Path("g1".to_string()),
            Json(PollControlRequest {
                action: "end".to_string(),
                game_mode: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let started = poll_handler(
            State(state.clone()),
            Path("g1".to_string()),
            Json(PollControlRequest {
                action: "start".to_string(),
                game_mode: None,
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(started["status"], "polling_started");

        let status = get_game_handler(State(state), Path("g1".to_string()))
            .await
            .unwrap()
            .0;
        assert!(status.polling_active);
        assert!(!status.polling_done);
    }

    #[tokio::test]
    async fn chat_requires_an_existing_lobby() {
        let state = app_state_slow();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap();

        // The GC bootstrap has not produced a lobby yet.
        let error = chat_handler(
            State(state),
            Path("g1".to_string()),
            Json(ChatMessageRequest {
                message: "glhf".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("Lobby not available"));
    }

    #[tokio::test]
    async fn swap_rejection_surfaces_as_bad_request() {
        let state = app_state_slow();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap();

        let error = swap_players_handler(
            State(state),
            Path("g1".to_string()),
            Json(SwapPlayersRequest {
                steam_id_1: 1,
                steam_id_2: 2,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.message, "Players must be on opposite teams");
    }

    #[tokio::test]
    async fn listing_includes_live_games() {
        let state = app_state_slow();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g1")))
            .await
            .unwrap();
        let _ = create_game_handler(State(state.clone()), Json(create_request("g2")))
            .await
            .unwrap();

        let mut ids: Vec<String> = list_games_handler(State(state))
            .await
            .0
            .into_iter()
            .map(|status| status.game_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["g1".to_string(), "g2".to_string()]);
    }

    #[tokio::test]
    async fn health_names_the_service() {
        let body = health().await.0;
        assert_eq!(body["ok"], true);
        assert_eq!(body["service"], "lobby-manager-service");
    }

    #[test]
    fn timings_fall_back_to_defaults_on_empty_config() {
        let timings = timings_from(&ServiceConfigFile::default());
        assert_eq!(timings.keepalive_interval, Duration::from_secs(55));
        assert_eq!(timings.gc_bootstrap_delay, Duration::from_secs(10));
        assert_eq!(timings.auto_poll_threshold, 7);
    }

    #[test]
    fn timings_apply_config_overrides() {
        let config = ServiceConfigFile {
            keepalive_interval_secs: Some(30),
            launch_pause_ms: Some(100),
            auto_poll_threshold: Some(9),
            ..Default::default()
        };
        let timings = timings_from(&config);
        assert_eq!(timings.keepalive_interval, Duration::from_secs(30));
        assert_eq!(timings.launch_pause, Duration::from_millis(100));
        assert_eq!(timings.auto_poll_threshold, 9);
        assert_eq!(timings.invite_delay, Duration::from_secs(2));
    }
}
