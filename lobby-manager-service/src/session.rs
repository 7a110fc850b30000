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

//! Per-game lifecycle: one `GameSession` owns all mutable state for a game
//! and the workers that drive its lobby through the Game Coordinator. The
//! control plane mutates config and enqueues protocol actions; GC events
//! mutate observed state and may fire outbound callbacks.

use std::collections::{HashMap, HashSet, hash_map::Entry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use gargamel_common::{
    CreateGameRequest, DEFAULT_GAME_MODE, DEFAULT_SERVER_REGION, GameResult, GameStatus,
    MATCH_OUTCOME_UNKNOWN, SessionState, UpdateLobbySettingsRequest, default_game_name,
    outcome_label,
};
use prost::Message;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::lobby::{LobbyMember, LobbySnapshot};
use crate::proto::{
    self, DotaMatch, MatchDetailsResponse, PracticeLobbySetDetails, SoMultipleObjects,
};
use crate::reporter::ResultSink;
use crate::steam::{GcConnectionStatus, SteamClient, SteamClientFactory, SteamEvent};

const POLL_STARTED_CHAT: &str =
    "Game Polling has Started! Check #match-listings on Discord to Vote!!";
const SEATING_SHORTFALL_CHAT: &str = "Game polling finished, but not all players are seated. \
     Game will launch once all players are on their assigned teams.";

/// Delays and thresholds for GC choreography. The defaults are what the GC
/// tolerates in production; tests shrink them.
#[derive(Debug, Clone)]
pub struct GcTimings {
    /// Wait after Steam logon before the GC is worth talking to.
    pub gc_bootstrap_delay: Duration,
    pub gc_hello_delay: Duration,
    pub gc_post_hello_delay: Duration,
    pub keepalive_interval: Duration,
    pub invite_delay: Duration,
    pub invite_retry_delay: Duration,
    pub bot_eject_delay: Duration,
    pub reconnect_delay: Duration,
    pub lobby_recreate_delay: Duration,
    pub launch_pause: Duration,
    pub team_check_debounce: Duration,
    /// Lobby size (bot included) past which a game-mode poll auto-starts.
    pub auto_poll_threshold: usize,
    pub debug_auto_poll_threshold: usize,
}

impl Default for GcTimings {
    fn default() -> Self {
        Self {
            gc_bootstrap_delay: Duration::from_secs(10),
            gc_hello_delay: Duration::from_secs(1),
            gc_post_hello_delay: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(55),
            invite_delay: Duration::from_secs(2),
            invite_retry_delay: Duration::from_secs(3),
            bot_eject_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(2),
            lobby_recreate_delay: Duration::from_secs(2),
            launch_pause: Duration::from_millis(500),
            team_check_debounce: Duration::from_secs(1),
            auto_poll_threshold: 7,
            debug_auto_poll_threshold: 2,
        }
    }
}

#[cfg(test)]
impl GcTimings {
    pub fn fast() -> Self {
        Self {
            gc_bootstrap_delay: Duration::from_millis(5),
            gc_hello_delay: Duration::from_millis(5),
            gc_post_hello_delay: Duration::from_millis(10),
            keepalive_interval: Duration::from_secs(5),
            invite_delay: Duration::from_millis(10),
            invite_retry_delay: Duration::from_millis(20),
            bot_eject_delay: Duration::from_millis(15),
            reconnect_delay: Duration::from_millis(10),
            lobby_recreate_delay: Duration::from_millis(40),
            launch_pause: Duration::from_millis(5),
            team_check_debounce: Duration::ZERO,
            auto_poll_threshold: 7,
            debug_auto_poll_threshold: 2,
        }
    }
}

/// Immutable identity plus the mutable lobby settings for one game.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub game_id: String,
    pub username: String,
    pub password: String,
    pub radiant_team: Vec<u64>,
    pub dire_team: Vec<u64>,
    pub result_url: String,
    pub server_region: u32,
    pub game_mode: u32,
    pub allow_cheats: bool,
    pub game_name: String,
    pub pass_key: String,
    pub debug_steam_id: u64,
    pub poll_callback_url: Option<String>,
}

impl GameConfig {
    pub fn from_request(request: CreateGameRequest) -> Self {
        let game_name = match request.game_name {
            Some(name) if !name.is_empty() => name,
            _ => default_game_name(&request.game_id),
        };
        Self {
            game_id: request.game_id,
            username: request.username,
            password: request.password,
            radiant_team: request.radiant_team,
            dire_team: request.dire_team,
            result_url: request.result_url,
            server_region: request.server_region.unwrap_or(DEFAULT_SERVER_REGION),
            game_mode: request.game_mode.unwrap_or(DEFAULT_GAME_MODE),
            allow_cheats: request.allow_cheats.unwrap_or(false),
            game_name,
            pass_key: request.pass_key.unwrap_or_default(),
            debug_steam_id: request.debug_steam_id.unwrap_or(0),
            poll_callback_url: request.poll_callback_url.filter(|url| !url.is_empty()),
        }
    }
}

struct Lifecycle {
    state: SessionState,
    error: Option<String>,
}

/// Last view of the lobby the GC showed us, for change detection.
#[derive(Default)]
struct ObservedLobby {
    lobby_id: u64,
    current_game_name: String,
    last_state: u32,
    last_region: u32,
    last_member_count: usize,
    /// `None` until the first observation, so the first parse never
    /// triggers a settings re-apply.
    last_allow_cheats: Option<bool>,
}

#[derive(Default)]
struct PollingGate {
    active: bool,
    done: bool,
    short_notice_sent: bool,
}

#[derive(Default)]
struct ReconnectState {
    reconnecting: bool,
    lobby_should_exist: bool,
}

fn transition_allowed(current: SessionState, next: SessionState) -> bool {
    use SessionState::*;
    match current {
        Completed => false,
        Error => next == Completed,
        Postgame => matches!(next, Completed | Error),
        _ => true,
    }
}

pub struct GameSession {
    pub game_id: String,
    config: Mutex<GameConfig>,
    members: Mutex<HashMap<u64, LobbyMember>>,
    pending_results: Mutex<HashMap<u64, GameResult>>,
    lifecycle: Mutex<Lifecycle>,
    observed: Mutex<ObservedLobby>,
    polling: Mutex<PollingGate>,
    invites_sent: Mutex<bool>,
    reconnect: Mutex<ReconnectState>,
    last_team_check: Mutex<Option<Instant>>,
    bot_moved_to_unassigned: AtomicBool,
    game_launched: AtomicBool,
    game_in_progress: AtomicBool,
    gc_bootstrapped: AtomicBool,
    lobby_create_sent: AtomicBool,
    keepalive_running: AtomicBool,
    result_reported: AtomicBool,
    torn_down: AtomicBool,
    steam: Mutex<Option<Arc<dyn SteamClient>>>,
    cancel_tx: watch::Sender<bool>,
    sink: Arc<dyn ResultSink>,
    registry: Arc<GameRegistry>,
    timings: GcTimings,
}

impl GameSession {
    pub fn new(
        config: GameConfig,
        registry: Arc<GameRegistry>,
        sink: Arc<dyn ResultSink>,
        timings: GcTimings,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            game_id: config.game_id.clone(),
            config: Mutex::new(config),
            members: Mutex::new(HashMap::new()),
            pending_results: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Creating,
                error: None,
            }),
            observed: Mutex::new(ObservedLobby::default()),
            polling: Mutex::new(PollingGate::default()),
            invites_sent: Mutex::new(false),
            reconnect: Mutex::new(ReconnectState::default()),
            last_team_check: Mutex::new(None),
            bot_moved_to_unassigned: AtomicBool::new(false),
            game_launched: AtomicBool::new(false),
            game_in_progress: AtomicBool::new(false),
            gc_bootstrapped: AtomicBool::new(false),
            lobby_create_sent: AtomicBool::new(false),
            keepalive_running: AtomicBool::new(false),
            result_reported: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            steam: Mutex::new(None),
            cancel_tx,
            sink,
            registry,
            timings,
        })
    }

    /// Connect the Steam client and hand the event stream to the session
    /// worker. Runs exactly once per session.
    pub fn spawn(self: &Arc<Self>, factory: &Arc<dyn SteamClientFactory>) {
        let (client, events) = factory.create(&self.game_id);
        *self.steam.lock().unwrap() = Some(client);
        let session = self.clone();
        tokio::spawn(async move {
            session.run_steam_worker(events).await;
        });
    }

    fn steam(&self) -> Option<Arc<dyn SteamClient>> {
        self.steam.lock().unwrap().clone()
    }

    fn cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Returns false when the sleep was cut short by cancellation.
    async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        if self.cancelled() {
            return false;
        }
        let mut cancel_rx = self.cancel_rx();
        tokio::select! {
            _ = cancel_rx.changed() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().unwrap().state
    }

    fn set_state(&self, next: SessionState) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.state == next || !transition_allowed(lifecycle.state, next) {
            return;
        }
        debug!(game_id = %self.game_id, from = ?lifecycle.state, to = ?next, "state transition");
        lifecycle.state = next;
    }

    fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.state == SessionState::Completed {
            return;
        }
        warn!(game_id = %self.game_id, error = %message, "session error");
        lifecycle.error = Some(message);
        lifecycle.state = SessionState::Error;
    }

    pub fn status(&self) -> GameStatus {
        let (radiant_count, dire_count) = {
            let members = self.members.lock().unwrap();
            members.values().fold((0, 0), |(r, d), m| match m.team {
                proto::TEAM_RADIANT => (r + 1, d),
                proto::TEAM_DIRE => (r, d + 1),
                _ => (r, d),
            })
        };
        let (polling_active, polling_done) = {
            let gate = self.polling.lock().unwrap();
            (gate.active, gate.done)
        };
        let lobby_id = self.observed.lock().unwrap().lobby_id;
        let (state, error) = {
            let lifecycle = self.lifecycle.lock().unwrap();
            (lifecycle.state, lifecycle.error.clone())
        };
        let config = self.config.lock().unwrap();
        GameStatus {
            game_id: self.game_id.clone(),
            state,
            lobby_id,
            game_mode: config.game_mode,
            server_region: config.server_region,
            allow_cheats: config.allow_cheats,
            radiant_count,
            dire_count,
            radiant_team: config.radiant_team.clone(),
            dire_team: config.dire_team.clone(),
            polling_active,
            polling_done,
            pass_key: config.pass_key.clone(),
            error,
        }
    }

    // ---- control-plane operations ----

    pub async fn update_settings(&self, request: UpdateLobbySettingsRequest) {
        {
            let mut config = self.config.lock().unwrap();
            if let Some(mode) = request.game_mode {
                config.game_mode = mode;
            }
            if let Some(region) = request.server_region {
                config.server_region = region;
            }
            if let Some(cheats) = request.allow_cheats {
                config.allow_cheats = cheats;
            }
            if let Some(name) = request.game_name.as_ref().filter(|n| !n.is_empty()) {
                config.game_name = name.clone();
            }
        }
        if let Some(name) = request.game_name.filter(|n| !n.is_empty()) {
            self.observed.lock().unwrap().current_game_name = name;
        }
        if self.observed.lock().unwrap().lobby_id != 0 {
            self.set_all_lobby_settings().await;
        }
    }

    pub async fn start_poll(&self) {
        {
            let mut gate = self.polling.lock().unwrap();
            gate.active = true;
            gate.done = false;
            gate.short_notice_sent = false;
        }
        info!(game_id = %self.game_id, "polling marked as active");
        let lobby_id = self.observed.lock().unwrap().lobby_id;
        if lobby_id != 0 {
            if let Some(client) = self.steam() {
                let _ = client.send_channel_message(lobby_id, POLL_STARTED_CHAT).await;
            }
        }
    }

    pub async fn end_poll(self: &Arc<Self>, game_mode: u32) {
        {
            let mut gate = self.polling.lock().unwrap();
            gate.active = false;
            gate.done = true;
            gate.short_notice_sent = false;
        }
        self.config.lock().unwrap().game_mode = game_mode;
        if self.observed.lock().unwrap().lobby_id != 0 {
            self.set_all_lobby_settings().await;
        }
        info!(game_id = %self.game_id, game_mode, "polling ended");

        // Everyone may already be seated; give the launch a chance.
        let session = self.clone();
        tokio::spawn(async move {
            session.process_team_assignments().await;
        });
    }

    pub async fn swap_players(&self, steam_id_1: u64, steam_id_2: u64) -> anyhow::Result<()> {
        {
            let mut config = self.config.lock().unwrap();
            let in_radiant_1 = config.radiant_team.contains(&steam_id_1);
            let in_dire_1 = config.dire_team.contains(&steam_id_1);
            let in_radiant_2 = config.radiant_team.contains(&steam_id_2);
            let in_dire_2 = config.dire_team.contains(&steam_id_2);
            if !((in_radiant_1 && in_dire_2) || (in_dire_1 && in_radiant_2)) {
                anyhow::bail!("Players must be on opposite teams");
            }

            let (radiant_member, dire_member) = if in_radiant_1 {
                (steam_id_1, steam_id_2)
            } else {
                (steam_id_2, steam_id_1)
            };
            for slot in config.radiant_team.iter_mut() {
                if *slot == radiant_member {
                    *slot = dire_member;
                }
            }
            for slot in config.dire_team.iter_mut() {
                if *slot == dire_member {
                    *slot = radiant_member;
                }
            }
        }

        // Kick both off their seats so they re-seat on the new sides.
        self.kick_to_pool(steam_id_1).await;
        self.kick_to_pool(steam_id_2).await;
        info!(game_id = %self.game_id, steam_id_1, steam_id_2, "swapped players");
        Ok(())
    }

    pub async fn replace_player(&self, old_steam_id: u64, new_steam_id: u64) -> anyhow::Result<()> {
        {
            let mut config = self.config.lock().unwrap();
            if config.radiant_team.contains(&new_steam_id)
                || config.dire_team.contains(&new_steam_id)
            {
                anyhow::bail!("New player is already in the game");
            }
            let config = &mut *config;
            let slot = config
                .radiant_team
                .iter_mut()
                .chain(config.dire_team.iter_mut())
                .find(|slot| **slot == old_steam_id);
            match slot {
                Some(slot) => *slot = new_steam_id,
                None => anyhow::bail!("Old player not found in game"),
            }
        }

        self.kick_to_pool(old_steam_id).await;
        info!(game_id = %self.game_id, old_steam_id, new_steam_id, "replaced player");
        Ok(())
    }

    pub async fn send_chat(&self, message: &str) -> anyhow::Result<()> {
        let lobby_id = self.observed.lock().unwrap().lobby_id;
        let Some(client) = self.steam() else {
            anyhow::bail!("Lobby not available");
        };
        if lobby_id == 0 {
            anyhow::bail!("Lobby not available");
        }
        client.send_channel_message(lobby_id, message).await?;
        info!(game_id = %self.game_id, message, "sent lobby chat message");
        Ok(())
    }

    /// Orderly shutdown: stop keepalive, cancel every worker, disconnect
    /// Steam, deregister. Safe to call any number of times.
    pub async fn teardown(self: &Arc<Self>) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(game_id = %self.game_id, "tearing down session");
        self.keepalive_running.store(false, Ordering::SeqCst);
        self.cancel_tx.send_replace(true);
        if let Some(client) = self.steam() {
            client.disconnect().await;
        }
        self.registry.remove(&self.game_id);
        self.set_state(SessionState::Completed);
        info!(game_id = %self.game_id, "session torn down");
    }

    // ---- Steam event worker ----

    async fn run_steam_worker(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SteamEvent>) {
        let Some(client) = self.steam() else {
            return;
        };
        if let Err(error) = client.connect().await {
            self.set_error(format!("failed to connect to Steam: {error:#}"));
            return;
        }

        let mut cancel_rx = self.cancel_rx();
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    info!(game_id = %self.game_id, "steam worker stopping");
                    break;
                }
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else { break; };
                    match event {
                        SteamEvent::Connected => {
                            info!(game_id = %self.game_id, "connected to Steam, logging in");
                            let (username, password) = {
                                let config = self.config.lock().unwrap();
                                (config.username.clone(), config.password.clone())
                            };
                            if let Err(error) = client.log_on(&username, &password).await {
                                self.set_error(format!("logon dispatch failed: {error:#}"));
                            }
                        }
                        SteamEvent::LoggedOn => {
                            info!(game_id = %self.game_id, "logged in to Steam");
                            let _ = client.set_persona_online().await;
                            let _ = client.set_games_played(proto::DOTA_APP_ID).await;
                            if !self.gc_bootstrapped.swap(true, Ordering::SeqCst) {
                                let session = self.clone();
                                tokio::spawn(async move {
                                    session.bootstrap_gc().await;
                                });
                            }
                        }
                        SteamEvent::LogOnFailed(reason) => {
                            self.set_error(format!("Steam login rejected: {reason}"));
                            break;
                        }
                        SteamEvent::GcStatusChanged { old, new } => {
                            self.handle_connection_status_change(old, new);
                        }
                        SteamEvent::GcPacket { msg_type, body } => {
                            self.handle_gc_packet(msg_type, &body).await;
                        }
                        SteamEvent::Disconnected => {
                            if self.cancelled() || self.torn_down.load(Ordering::SeqCst) {
                                break;
                            }
                            self.set_error("Disconnected from Steam");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// The GC needs breathing room after logon before it will take a
    /// lobby: wait, announce ourselves, wait again, then create.
    async fn bootstrap_gc(self: Arc<Self>) {
        if !self.sleep_unless_cancelled(self.timings.gc_bootstrap_delay).await {
            return;
        }
        let Some(client) = self.steam() else { return };
        info!(game_id = %self.game_id, "initializing Dota client");
        let _ = client.set_playing(true).await;
        if !self.sleep_unless_cancelled(self.timings.gc_hello_delay).await {
            return;
        }
        let _ = client.say_hello().await;
        if !self.sleep_unless_cancelled(self.timings.gc_post_hello_delay).await {
            return;
        }
        if self.lobby_create_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatch_create_lobby(true).await;
    }

    /// Lobby id is left unset so the GC assigns one.
    fn create_lobby_details(config: &GameConfig, allow_spectating: bool) -> PracticeLobbySetDetails {
        PracticeLobbySetDetails {
            lobby_id: None,
            game_name: Some(config.game_name.clone()),
            pass_key: Some(config.pass_key.clone()),
            server_region: Some(config.server_region),
            fill_with_bots: Some(false),
            allow_spectating: Some(allow_spectating),
            allchat: Some(true),
            lan: Some(false),
            cm_pick: Some(proto::CM_PICK_RANDOM),
            visibility: Some(proto::LOBBY_VISIBILITY_PUBLIC),
            pause_setting: Some(proto::PAUSE_SETTING_LIMITED),
            selection_priority_rules: Some(proto::SELECTION_PRIORITY_RULES_MANUAL),
            dota_tv_delay: Some(proto::DOTA_TV_DELAY_10S),
            series_type: Some(proto::DEFAULT_SERIES_TYPE),
            ..Default::default()
        }
    }

    async fn dispatch_create_lobby(&self, allow_spectating: bool) {
        let Some(client) = self.steam() else { return };
        let (details, game_name, pass_key) = {
            let config = self.config.lock().unwrap();
            (
                Self::create_lobby_details(&config, allow_spectating),
                config.game_name.clone(),
                config.pass_key.clone(),
            )
        };
        self.observed.lock().unwrap().current_game_name = game_name;
        info!(game_id = %self.game_id, pass_key = %pass_key, "sending lobby creation request");
        if let Err(error) = client.create_lobby(details).await {
            warn!(game_id = %self.game_id, error = %error, "CreateLobby dispatch failed");
        }
        self.reconnect.lock().unwrap().lobby_should_exist = true;
    }

    // ---- packet dispatch ----

    async fn handle_gc_packet(self: &Arc<Self>, msg_type: u32, body: &[u8]) {
        match msg_type {
            proto::MSG_GC_PRACTICE_LOBBY_UPDATE => self.handle_lobby_update(body).await,
            proto::MSG_GC_MATCH_DETAILS | proto::MSG_GC_UPDATE_MATCH_DETAILS => {
                self.handle_match_details(body).await;
            }
            proto::MSG_SO_UPDATE_MULTIPLE => self.handle_update_multiple(body).await,
            _ => {
                // Some builds deliver match results on unmapped msg types;
                // sniff anything plausible while a result is outstanding.
                let has_pending = !self.pending_results.lock().unwrap().is_empty();
                if (self.game_in_progress.load(Ordering::SeqCst) || has_pending)
                    && body.len() > 10
                {
                    self.try_parse_as_match_details(body, msg_type).await;
                }
            }
        }
    }

    async fn handle_update_multiple(self: &Arc<Self>, body: &[u8]) {
        let Ok(update) = SoMultipleObjects::decode(body) else {
            return;
        };
        debug!(
            game_id = %self.game_id,
            added = update.objects_added.len(),
            modified = update.objects_modified.len(),
            "shared object update"
        );
        // Invites fire only for added objects: a brand new lobby.
        for object in &update.objects_added {
            if object.type_id == Some(proto::LOBBY_SO_TYPE_ID) {
                self.apply_lobby_object(object.object_data.as_deref().unwrap_or_default(), true)
                    .await;
            }
        }
        for object in &update.objects_modified {
            if object.type_id == Some(proto::LOBBY_SO_TYPE_ID) {
                self.apply_lobby_object(object.object_data.as_deref().unwrap_or_default(), false)
                    .await;
            }
        }
    }

    /// Merge one lobby object into observed state. `is_new` distinguishes
    /// the GC adding the object from modifying it.
    async fn apply_lobby_object(self: &Arc<Self>, data: &[u8], is_new: bool) {
        let Some(snapshot) = LobbySnapshot::parse(data) else {
            return;
        };

        if snapshot.lobby_id != 0 {
            self.observed.lock().unwrap().lobby_id = snapshot.lobby_id;

            if is_new {
                let should_send = {
                    let mut sent = self.invites_sent.lock().unwrap();
                    if *sent {
                        false
                    } else {
                        *sent = true;
                        true
                    }
                };
                if should_send {
                    self.set_state(SessionState::Waiting);
                    info!(game_id = %self.game_id, lobby_id = snapshot.lobby_id, "new lobby observed");
                    let session = self.clone();
                    tokio::spawn(async move {
                        // Let the GC settle before the invite burst.
                        if session.sleep_unless_cancelled(session.timings.invite_delay).await {
                            session.send_invites_with_retry().await;
                        }
                    });
                }
            }
            if self.state() == SessionState::Creating {
                self.set_state(SessionState::Waiting);
            }
        } else {
            debug!(game_id = %self.game_id, "lobby object without an id");
        }

        if !snapshot.game_name.is_empty() {
            self.observed.lock().unwrap().current_game_name = snapshot.game_name.clone();
        }

        let mut reapply_settings = false;

        let cheats_changed = {
            let mut observed = self.observed.lock().unwrap();
            match observed.last_allow_cheats {
                None => {
                    info!(game_id = %self.game_id, allow_cheats = snapshot.allow_cheats, "observed cheat setting");
                    observed.last_allow_cheats = Some(snapshot.allow_cheats);
                    false
                }
                Some(last) if last != snapshot.allow_cheats => {
                    observed.last_allow_cheats = Some(snapshot.allow_cheats);
                    true
                }
                Some(_) => false,
            }
        };
        if cheats_changed && snapshot.lobby_id != 0 {
            let wanted = self.config.lock().unwrap().allow_cheats;
            if wanted && !snapshot.allow_cheats {
                reapply_settings = true;
            }
        }

        self.observed.lock().unwrap().last_state = snapshot.state;

        if snapshot.is_post_game() && self.game_in_progress.swap(false, Ordering::SeqCst) {
            self.set_state(SessionState::Postgame);
            let result = self.merge_post_game_lobby(&snapshot);
            if result.is_complete() {
                self.process_complete_game_result(result).await;
                return;
            }
        }

        let region_changed = {
            let mut observed = self.observed.lock().unwrap();
            if snapshot.server_region != observed.last_region {
                observed.last_region = snapshot.server_region;
                true
            } else {
                false
            }
        };
        if region_changed && snapshot.lobby_id != 0 {
            let wanted = self.config.lock().unwrap().server_region;
            if snapshot.server_region != wanted {
                reapply_settings = true;
            }
        }

        if reapply_settings {
            self.set_all_lobby_settings().await;
        }

        self.observe_member_count(&snapshot);

        if snapshot.members.is_empty() {
            return;
        }

        let bot_steam_id = self.steam().map(|c| c.steam_id()).unwrap_or(0);
        let mut bot_on_team = false;
        {
            let mut members = self.members.lock().unwrap();
            members.clear();
            for member in &snapshot.members {
                members.insert(member.steam_id, member.clone());
                if bot_steam_id != 0
                    && member.steam_id == bot_steam_id
                    && matches!(member.team, proto::TEAM_RADIANT | proto::TEAM_DIRE)
                {
                    bot_on_team = true;
                }
            }
        }
        if bot_on_team {
            self.kick_to_pool(bot_steam_id).await;
            self.bot_moved_to_unassigned.store(true, Ordering::SeqCst);
        }
        if !self.bot_moved_to_unassigned.load(Ordering::SeqCst) && snapshot.lobby_id != 0 {
            let session = self.clone();
            tokio::spawn(async move {
                if session.sleep_unless_cancelled(session.timings.bot_eject_delay).await {
                    session.move_bot_to_unassigned().await;
                }
            });
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.check_team_assignments_and_launch().await;
        });
    }

    /// Auto-trigger the game-mode poll when enough people have gathered in
    /// a lobby that is still on its UI screen.
    fn observe_member_count(self: &Arc<Self>, snapshot: &LobbySnapshot) {
        let member_count = snapshot.members.len();
        let count_changed = {
            let mut observed = self.observed.lock().unwrap();
            if member_count != observed.last_member_count {
                observed.last_member_count = member_count;
                true
            } else {
                false
            }
        };
        if !count_changed {
            return;
        }

        let (debug_steam_id, callback_url) = {
            let config = self.config.lock().unwrap();
            (config.debug_steam_id, config.poll_callback_url.clone())
        };
        let threshold = if debug_steam_id != 0 {
            self.timings.debug_auto_poll_threshold
        } else {
            self.timings.auto_poll_threshold
        };

        if member_count <= threshold || !snapshot.in_ui_state() {
            return;
        }
        let Some(url) = callback_url else { return };

        let triggered = {
            let mut gate = self.polling.lock().unwrap();
            if !gate.done && !gate.active {
                gate.active = true;
                gate.short_notice_sent = false;
                true
            } else {
                false
            }
        };
        if triggered {
            info!(game_id = %self.game_id, member_count, "lobby filled, triggering game mode poll");
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(error) = session.sink.notify_poll_started(&url, &session.game_id).await {
                    warn!(game_id = %session.game_id, error = %error, "poll-start callback failed");
                }
            });
        }
    }

    fn merge_post_game_lobby(&self, snapshot: &LobbySnapshot) -> GameResult {
        let server_region = self.config.lock().unwrap().server_region;
        let mut results = self.pending_results.lock().unwrap();
        let key = if snapshot.match_id != 0 {
            snapshot.match_id
        } else {
            snapshot.lobby_id
        };
        let entry = results.entry(key).or_insert_with(|| GameResult {
            game_id: self.game_id.clone(),
            match_id: snapshot.match_id,
            lobby_id: snapshot.lobby_id,
            outcome: snapshot.match_outcome,
            duration: 0,
            radiant_score: 0,
            dire_score: 0,
            game_name: snapshot.game_name.clone(),
            start_time: 0,
            lobby_type: snapshot.lobby_type,
            game_mode: snapshot.game_mode,
            server_region,
            timestamp: Utc::now(),
        });
        if snapshot.match_id != 0 {
            entry.match_id = snapshot.match_id;
        }
        if snapshot.match_outcome != MATCH_OUTCOME_UNKNOWN {
            entry.outcome = snapshot.match_outcome;
        }
        entry.clone()
    }

    async fn handle_lobby_update(self: &Arc<Self>, body: &[u8]) {
        let Ok(details) = PracticeLobbySetDetails::decode(body) else {
            return;
        };
        let lobby_id = details.lobby_id.unwrap_or(0);
        if lobby_id != 0 {
            self.observed.lock().unwrap().lobby_id = lobby_id;
            if self.state() == SessionState::Creating {
                self.set_state(SessionState::Waiting);
            }
            self.set_all_lobby_settings().await;

            if !self.bot_moved_to_unassigned.load(Ordering::SeqCst) {
                let session = self.clone();
                tokio::spawn(async move {
                    if session.sleep_unless_cancelled(session.timings.bot_eject_delay).await {
                        session.move_bot_to_unassigned().await;
                    }
                });
            }
        }
        self.process_team_assignments().await;
    }

    async fn handle_match_details(self: &Arc<Self>, body: &[u8]) {
        let Ok(response) = MatchDetailsResponse::decode(body) else {
            return;
        };
        if let Some(match_info) = response.match_info {
            self.process_match_info(&match_info).await;
        }
    }

    async fn try_parse_as_match_details(self: &Arc<Self>, body: &[u8], msg_type: u32) {
        if let Ok(response) = MatchDetailsResponse::decode(body) {
            if let Some(match_info) = response.match_info {
                if match_info.match_id.unwrap_or(0) != 0 {
                    debug!(game_id = %self.game_id, msg_type, "unmapped packet decoded as match details");
                    self.process_match_info(&match_info).await;
                    return;
                }
            }
        }

        if let Ok(match_info) = DotaMatch::decode(body) {
            let match_id = match_info.match_id.unwrap_or(0);
            let populated = match_info.duration.unwrap_or(0) > 0
                || match_info.starttime.unwrap_or(0) > 0
                || match_info.match_outcome.unwrap_or(0) != 0;
            if match_id != 0 && populated {
                debug!(game_id = %self.game_id, msg_type, match_id, "unmapped packet decoded as match");
                self.process_match_info(&match_info).await;
            }
        }
    }

    /// Fold a match message into the most recent pending result, then see
    /// whether that made it reportable.
    async fn process_match_info(self: &Arc<Self>, match_info: &DotaMatch) {
        let match_id = match_info.match_id.unwrap_or(0);
        self.game_in_progress.store(false, Ordering::SeqCst);

        let (server_region, config_game_mode) = {
            let config = self.config.lock().unwrap();
            (config.server_region, config.game_mode)
        };
        let (lobby_id, game_name) = {
            let observed = self.observed.lock().unwrap();
            (observed.lobby_id, observed.current_game_name.clone())
        };

        let result = {
            let mut results = self.pending_results.lock().unwrap();
            let key = results
                .iter()
                .max_by_key(|(_, result)| result.timestamp)
                .map(|(&key, _)| key)
                .unwrap_or(if match_id != 0 { match_id } else { lobby_id });
            let entry = results.entry(key).or_insert_with(|| GameResult {
                game_id: self.game_id.clone(),
                match_id,
                lobby_id,
                outcome: MATCH_OUTCOME_UNKNOWN,
                duration: 0,
                radiant_score: 0,
                dire_score: 0,
                game_name,
                start_time: 0,
                lobby_type: 0,
                game_mode: config_game_mode,
                server_region,
                timestamp: Utc::now(),
            });
            if match_id != 0 {
                entry.match_id = match_id;
            }
            if let Some(outcome) = match_info.match_outcome.filter(|&o| o != 0) {
                entry.outcome = outcome;
            }
            if let Some(duration) = match_info.duration.filter(|&d| d > 0) {
                entry.duration = duration;
            }
            if let Some(start_time) = match_info.starttime.filter(|&s| s > 0) {
                entry.start_time = start_time;
            }
            if let Some(score) = match_info.radiant_team_score.filter(|&s| s > 0) {
                entry.radiant_score = score;
            }
            if let Some(score) = match_info.dire_team_score.filter(|&s| s > 0) {
                entry.dire_score = score;
            }
            if let Some(lobby_type) = match_info.lobby_type.filter(|&t| t != 0) {
                entry.lobby_type = lobby_type;
            }
            if let Some(game_mode) = match_info.game_mode.filter(|&m| m != 0) {
                entry.game_mode = game_mode;
            }
            entry.clone()
        };

        self.process_complete_game_result(result).await;
    }

    /// POST the result and tear down. Reports at most once per session and
    /// only a complete result; teardown follows whether or not the POST
    /// landed.
    async fn process_complete_game_result(self: &Arc<Self>, result: GameResult) {
        if !result.is_complete() {
            return;
        }
        if self.result_reported.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            game_id = %self.game_id,
            match_id = result.match_id,
            outcome = %outcome_label(result.outcome),
            duration = result.duration,
            "match result complete"
        );

        let result_url = self.config.lock().unwrap().result_url.clone();
        if let Err(error) = self.sink.post_result(&result_url, &result).await {
            warn!(game_id = %self.game_id, error = %error, "failed to deliver result, tearing down anyway");
        }
        self.teardown().await;
    }

    // ---- lobby maintenance ----

    /// Push the full configured tuple at the GC; it treats the dispatch as
    /// an overwrite, so there is nothing to diff here.
    async fn set_all_lobby_settings(&self) {
        let Some(client) = self.steam() else { return };
        let lobby_id = self.observed.lock().unwrap().lobby_id;
        if lobby_id == 0 {
            return;
        }
        let (config_name, server_region, game_mode, allow_cheats, pass_key) = {
            let config = self.config.lock().unwrap();
            (
                config.game_name.clone(),
                config.server_region,
                config.game_mode,
                config.allow_cheats,
                config.pass_key.clone(),
            )
        };
        let current_name = self.observed.lock().unwrap().current_game_name.clone();
        let game_name = if current_name.is_empty() {
            config_name
        } else {
            current_name
        };

        let details = PracticeLobbySetDetails {
            lobby_id: Some(lobby_id),
            game_name: Some(game_name.clone()),
            server_region: Some(server_region),
            game_mode: Some(game_mode),
            allow_cheats: Some(allow_cheats),
            fill_with_bots: Some(false),
            allow_spectating: Some(false),
            allchat: Some(true),
            lan: Some(false),
            pass_key: Some(pass_key),
            ..Default::default()
        };
        if let Err(error) = client.set_lobby_details(details).await {
            warn!(game_id = %self.game_id, error = %error, "SetLobbyDetails dispatch failed");
            return;
        }
        info!(
            game_id = %self.game_id,
            game_name = %game_name,
            server_region,
            game_mode,
            allow_cheats,
            "applied lobby settings"
        );
    }

    /// Invite both rosters. If the lobby id has not landed yet, back off
    /// and try again; the sent-flag is released for the retry so the
    /// invite pass still happens exactly once per lobby.
    async fn send_invites_with_retry(self: Arc<Self>) {
        loop {
            if self.cancelled() {
                return;
            }
            let lobby_id = self.observed.lock().unwrap().lobby_id;
            if lobby_id == 0 {
                warn!(game_id = %self.game_id, "cannot send invites yet, lobby id is 0");
                *self.invites_sent.lock().unwrap() = false;
                if !self.sleep_unless_cancelled(self.timings.invite_retry_delay).await {
                    return;
                }
                let mut sent = self.invites_sent.lock().unwrap();
                if *sent {
                    // A newer lobby object claimed the invite pass.
                    return;
                }
                *sent = true;
                drop(sent);
                continue;
            }

            let Some(client) = self.steam() else { return };
            let (radiant, dire) = {
                let config = self.config.lock().unwrap();
                (config.radiant_team.clone(), config.dire_team.clone())
            };
            let invitees: Vec<u64> = radiant
                .into_iter()
                .chain(dire)
                .filter(|&steam_id| steam_id != 0)
                .collect();
            if invitees.is_empty() {
                info!(game_id = %self.game_id, "no players to invite");
                return;
            }

            info!(game_id = %self.game_id, players = invitees.len(), lobby_id, "sending lobby invites");
            for steam_id in invitees {
                // Players need not be friends to receive a lobby invite.
                if let Err(error) = client.invite_lobby_member(steam_id).await {
                    warn!(game_id = %self.game_id, steam_id, error = %error, "invite dispatch failed");
                }
            }
            return;
        }
    }

    async fn move_bot_to_unassigned(&self) {
        if self.bot_moved_to_unassigned.load(Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.steam() else { return };
        let bot_steam_id = client.steam_id();
        if bot_steam_id == 0 {
            return;
        }
        let _ = client
            .kick_lobby_member_from_team((bot_steam_id & 0xFFFF_FFFF) as u32)
            .await;
        self.bot_moved_to_unassigned.store(true, Ordering::SeqCst);
    }

    async fn kick_to_pool(&self, steam_id: u64) {
        if let Some(client) = self.steam() {
            let _ = client
                .kick_lobby_member_from_team((steam_id & 0xFFFF_FFFF) as u32)
                .await;
        }
    }

    // ---- seating and launch ----

    async fn check_team_assignments_and_launch(self: &Arc<Self>) {
        {
            let mut last_check = self.last_team_check.lock().unwrap();
            let now = Instant::now();
            if let Some(previous) = *last_check {
                if now.duration_since(previous) < self.timings.team_check_debounce {
                    return;
                }
            }
            *last_check = Some(now);
        }
        self.process_team_assignments().await;
    }

    async fn process_team_assignments(self: &Arc<Self>) {
        if self.game_launched.load(Ordering::SeqCst)
            || self.game_in_progress.load(Ordering::SeqCst)
        {
            return;
        }

        let members: Vec<LobbyMember> = {
            let members = self.members.lock().unwrap();
            members.values().cloned().collect()
        };
        if members.is_empty() {
            return;
        }

        let (expected_radiant, expected_dire): (HashSet<u64>, HashSet<u64>) = {
            let config = self.config.lock().unwrap();
            (
                config.radiant_team.iter().copied().collect(),
                config.dire_team.iter().copied().collect(),
            )
        };

        let mut radiant_seated = 0usize;
        let mut dire_seated = 0usize;
        let mut wrong_team = Vec::new();

        for member in &members {
            let steam_id = member.steam_id;
            let should_be_radiant = expected_radiant.contains(&steam_id);
            let should_be_dire = expected_dire.contains(&steam_id);
            if should_be_radiant {
                if member.team == proto::TEAM_RADIANT {
                    radiant_seated += 1;
                } else {
                    wrong_team.push(steam_id);
                }
            } else if should_be_dire {
                if member.team == proto::TEAM_DIRE {
                    dire_seated += 1;
                } else {
                    wrong_team.push(steam_id);
                }
            } else if matches!(member.team, proto::TEAM_RADIANT | proto::TEAM_DIRE) {
                // Uninvited or mis-seated: back to the pool.
                wrong_team.push(steam_id);
            }
        }

        for steam_id in wrong_team {
            self.kick_to_pool(steam_id).await;
        }

        let expected_radiant_count = expected_radiant.len();
        let expected_dire_count = expected_dire.len();

        let notify_shortfall = {
            let mut gate = self.polling.lock().unwrap();
            let poll_just_ended = gate.done && !gate.active;
            let seats_short =
                radiant_seated < expected_radiant_count || dire_seated < expected_dire_count;
            if poll_just_ended && seats_short && !gate.short_notice_sent {
                gate.short_notice_sent = true;
                true
            } else {
                false
            }
        };
        if notify_shortfall {
            let lobby_id = self.observed.lock().unwrap().lobby_id;
            if lobby_id != 0 {
                if let Some(client) = self.steam() {
                    let _ = client
                        .send_channel_message(lobby_id, SEATING_SHORTFALL_CHAT)
                        .await;
                }
            }
        }

        if radiant_seated == expected_radiant_count
            && dire_seated == expected_dire_count
            && expected_radiant_count > 0
            && expected_dire_count > 0
        {
            info!(
                game_id = %self.game_id,
                radiant = expected_radiant_count,
                dire = expected_dire_count,
                "all players assigned, launching"
            );
            self.launch_game().await;
        }
    }

    async fn launch_game(&self) {
        let Some(client) = self.steam() else { return };

        if self.polling.lock().unwrap().active {
            info!(game_id = %self.game_id, "all players ready but polling is active, delaying launch");
            return;
        }
        if self
            .game_launched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.set_state(SessionState::Launching);
        info!(game_id = %self.game_id, "launching game");
        self.set_all_lobby_settings().await;
        tokio::time::sleep(self.timings.launch_pause).await;
        if let Err(error) = client.launch_lobby().await {
            warn!(game_id = %self.game_id, error = %error, "LaunchLobby dispatch failed");
        }
        self.game_in_progress.store(true, Ordering::SeqCst);
        self.set_state(SessionState::InProgress);
    }

    // ---- keepalive and reconnect ----

    /// Keep the GC session warm; it times sessions out after an hour of
    /// silence. Idempotent start, stops on cancellation or teardown.
    fn start_keepalive(self: &Arc<Self>) {
        if self.keepalive_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move {
            let mut cancel_rx = session.cancel_rx();
            let mut ticker = tokio::time::interval(session.timings.keepalive_interval);
            ticker.tick().await; // the first tick is immediate
            info!(game_id = %session.game_id, "GC keepalive started");
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        if !session.keepalive_running.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Some(client) = session.steam() {
                            let _ = client.say_hello().await;
                            debug!(game_id = %session.game_id, "GC keepalive sent");
                        }
                    }
                }
            }
            session.keepalive_running.store(false, Ordering::SeqCst);
            info!(game_id = %session.game_id, "GC keepalive stopped");
        });
    }

    fn handle_connection_status_change(
        self: &Arc<Self>,
        old: GcConnectionStatus,
        new: GcConnectionStatus,
    ) {
        let have = GcConnectionStatus::HaveSession;

        if old == have && new != have {
            info!(game_id = %self.game_id, status = ?new, "GC session lost");
            self.reconnect.lock().unwrap().reconnecting = true;
            let session = self.clone();
            tokio::spawn(async move {
                if session.sleep_unless_cancelled(session.timings.reconnect_delay).await {
                    session.attempt_reconnect().await;
                }
            });
        }

        if old != have && new == have {
            info!(game_id = %self.game_id, "GC session established");
            self.reconnect.lock().unwrap().reconnecting = false;
            {
                let mut observed = self.observed.lock().unwrap();
                observed.last_state = 0;
                observed.last_region = 0;
                observed.last_member_count = 0;
                observed.lobby_id = 0;
            }
            self.bot_moved_to_unassigned.store(false, Ordering::SeqCst);
            self.game_launched.store(false, Ordering::SeqCst);
            // A re-created lobby must re-invite even if the GC replays it
            // under modified semantics.
            *self.invites_sent.lock().unwrap() = false;

            self.start_keepalive();

            let session = self.clone();
            tokio::spawn(async move {
                if session
                    .sleep_unless_cancelled(session.timings.lobby_recreate_delay)
                    .await
                {
                    session.recreate_lobby_if_needed().await;
                }
            });
        }
    }

    async fn attempt_reconnect(&self) {
        if !self.reconnect.lock().unwrap().reconnecting {
            return;
        }
        let Some(client) = self.steam() else { return };
        info!(game_id = %self.game_id, "re-greeting the GC");
        let _ = client.set_playing(true).await;
        tokio::time::sleep(self.timings.gc_hello_delay).await;
        let _ = client.say_hello().await;
    }

    async fn recreate_lobby_if_needed(&self) {
        let should_exist = self.reconnect.lock().unwrap().lobby_should_exist;
        let lobby_id = self.observed.lock().unwrap().lobby_id;
        if !should_exist || lobby_id != 0 {
            return;
        }
        info!(game_id = %self.game_id, "lobby missing after session recovery, re-creating");
        self.dispatch_create_lobby(false).await;
    }
}

/// Process-wide map of live sessions. Entries self-remove on teardown.
pub struct GameRegistry {
    games: RwLock<HashMap<String, Arc<GameSession>>>,
}

impl GameRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            games: RwLock::new(HashMap::new()),
        })
    }

    /// Returns false when the id is already registered.
    pub fn add(&self, session: Arc<GameSession>) -> bool {
        let mut games = self.games.write().unwrap();
        match games.entry(session.game_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn get(&self, game_id: &str) -> Option<Arc<GameSession>> {
        self.games.read().unwrap().get(game_id).cloned()
    }

    pub fn remove(&self, game_id: &str) {
        self.games.write().unwrap().remove(game_id);
    }

    pub fn list(&self) -> Vec<Arc<GameSession>> {
        self.games.read().unwrap().values().cloned().collect()
    }
}
