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

//! Capability seam over the Steam client and Dota GC plumbing. The session
//! worker consumes `SteamEvent`s and drives the lobby through a
//! `SteamClient` handle; which transport backs the handle is a deployment
//! concern behind `SteamClientFactory`. The in-process `SimulatedSteam`
//! implementation speaks the same wire messages and backs tests and local
//! runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use prost::Message;
use rand::Rng;
use tokio::sync::mpsc;

use crate::proto::{
    self, CsoDotaLobby, DotaLobbyMember, DotaMatch, MatchDetailsResponse,
    PracticeLobbySetDetails, SoMultipleObjects, SoSingleObject,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcConnectionStatus {
    HaveSession,
    NoSession,
    GcGoingDown,
}

#[derive(Debug)]
pub enum SteamEvent {
    Connected,
    LoggedOn,
    LogOnFailed(String),
    Disconnected,
    GcStatusChanged {
        old: GcConnectionStatus,
        new: GcConnectionStatus,
    },
    GcPacket {
        msg_type: u32,
        body: Vec<u8>,
    },
}

/// The protocol capability set one game session consumes. Dispatch calls
/// serialize a packet and return; acknowledgments, if any, arrive later on
/// the event stream.
#[async_trait]
pub trait SteamClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn log_on(&self, username: &str, password: &str) -> Result<()>;
    async fn set_persona_online(&self) -> Result<()>;
    async fn set_games_played(&self, app_id: u32) -> Result<()>;
    async fn set_playing(&self, playing: bool) -> Result<()>;
    async fn say_hello(&self) -> Result<()>;
    async fn create_lobby(&self, details: PracticeLobbySetDetails) -> Result<()>;
    async fn set_lobby_details(&self, details: PracticeLobbySetDetails) -> Result<()>;
    async fn launch_lobby(&self) -> Result<()>;
    async fn invite_lobby_member(&self, steam_id: u64) -> Result<()>;
    async fn kick_lobby_member_from_team(&self, account_id: u32) -> Result<()>;
    async fn send_channel_message(&self, channel_id: u64, message: &str) -> Result<()>;
    async fn disconnect(&self);
    fn steam_id(&self) -> u64;
}

/// One Steam client per game session.
pub trait SteamClientFactory: Send + Sync {
    fn create(
        &self,
        game_id: &str,
    ) -> (Arc<dyn SteamClient>, mpsc::UnboundedReceiver<SteamEvent>);
}

const STEAM_ID_64_BASE: u64 = 76561197960265728;

struct SimLobby {
    details: PracticeLobbySetDetails,
    /// steam id -> (team, name)
    members: HashMap<u64, (u32, String)>,
    state: u32,
    game_state: u32,
    match_id: u64,
    match_outcome: u32,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    logged_on: bool,
    playing: bool,
    have_session: bool,
    lobby: Option<SimLobby>,
    invites: Vec<u64>,
    chat: Vec<(u64, String)>,
    launches: u32,
    lobbies_created: u32,
    hellos: u32,
    details_applied: u32,
}

/// In-process Steam + Game Coordinator double. Commands mutate a fake
/// lobby and echo the same prost-encoded packets a real GC would send;
/// the scripting methods below play the part of human players and GC
/// weather.
pub struct SimulatedSteam {
    game_id: String,
    bot_steam_id: u64,
    events: mpsc::UnboundedSender<SteamEvent>,
    state: Mutex<SimState>,
}

impl SimulatedSteam {
    pub fn new(game_id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<SteamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let bot_steam_id = STEAM_ID_64_BASE + rand::rng().random_range(1..=u32::MAX as u64);
        let sim = Arc::new(Self {
            game_id: game_id.to_string(),
            bot_steam_id,
            events,
            state: Mutex::new(SimState::default()),
        });
        (sim, rx)
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    fn send(&self, event: SteamEvent) {
        let _ = self.events.send(event);
    }

    fn lobby_object(&self, lobby: &SimLobby) -> CsoDotaLobby {
        CsoDotaLobby {
            lobby_id: lobby.details.lobby_id,
            all_members: lobby
                .members
                .iter()
                .map(|(&id, (team, name))| DotaLobbyMember {
                    id: Some(id),
                    name: Some(name.clone()),
                    team: Some(*team),
                })
                .collect(),
            state: Some(lobby.state),
            game_name: lobby.details.game_name.clone(),
            pass_key: lobby.details.pass_key.clone(),
            server_region: lobby.details.server_region,
            game_mode: lobby.details.game_mode,
            allow_cheats: lobby.details.allow_cheats,
            game_state: Some(lobby.game_state),
            match_id: Some(lobby.match_id),
            match_outcome: Some(lobby.match_outcome),
            lobby_type: Some(1),
            leader_id: Some(self.bot_steam_id),
        }
    }

    fn emit_lobby(&self, state: &SimState, is_new: bool) {
        let Some(lobby) = state.lobby.as_ref() else {
            return;
        };
        let object = SoSingleObject {
            type_id: Some(proto::LOBBY_SO_TYPE_ID),
            object_data: Some(self.lobby_object(lobby).encode_to_vec()),
        };
        let update = if is_new {
            SoMultipleObjects {
                objects_added: vec![object],
                ..Default::default()
            }
        } else {
            SoMultipleObjects {
                objects_modified: vec![object],
                ..Default::default()
            }
        };
        self.send(SteamEvent::GcPacket {
            msg_type: proto::MSG_SO_UPDATE_MULTIPLE,
            body: update.encode_to_vec(),
        });
    }

    // ---- scripting surface (players and GC weather) ----

    /// A player accepts an invite and lands in the unassigned pool.
    pub fn join_member(&self, steam_id: u64, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(lobby) = state.lobby.as_mut() {
            lobby
                .members
                .insert(steam_id, (proto::TEAM_PLAYER_POOL, name.to_string()));
            self.emit_lobby(&state, false);
        }
    }

    /// A player drags themselves onto a team slot.
    pub fn seat_member(&self, steam_id: u64, team: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(lobby) = state.lobby.as_mut() {
            if let Some(entry) = lobby.members.get_mut(&steam_id) {
                entry.0 = team;
            }
            self.emit_lobby(&state, false);
        }
    }

    pub fn remove_member(&self, steam_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(lobby) = state.lobby.as_mut() {
            lobby.members.remove(&steam_id);
            self.emit_lobby(&state, false);
        }
    }

    /// The GC drops the session (the 60-minute idle problem, a GC restart...).
    pub fn drop_gc_session(&self) {
        let mut state = self.state.lock().unwrap();
        if state.have_session {
            state.have_session = false;
            state.lobby = None;
            self.send(SteamEvent::GcStatusChanged {
                old: GcConnectionStatus::HaveSession,
                new: GcConnectionStatus::NoSession,
            });
        }
    }

    /// Match over: the lobby flips to its post-game state. The GC knows the
    /// match id at this point but not necessarily the outcome.
    pub fn enter_post_game(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(lobby) = state.lobby.as_mut() {
            lobby.state = proto::LOBBY_STATE_POSTGAME;
            lobby.game_state = proto::GAMERULES_STATE_POST_GAME;
            if lobby.match_id == 0 {
                lobby.match_id = rand::rng().random_range(1_000_000..u32::MAX as u64);
            }
            self.emit_lobby(&state, false);
        }
    }

    /// The match-details message that fills in outcome and scores.
    pub fn send_match_details(&self, outcome: u32, duration: u32, radiant: u32, dire: u32) {
        let match_id = {
            let state = self.state.lock().unwrap();
            state.lobby.as_ref().map(|l| l.match_id).unwrap_or(0)
        };
        let response = MatchDetailsResponse {
            result: Some(0),
            match_info: Some(DotaMatch {
                match_id: Some(match_id),
                duration: Some(duration),
                starttime: Some(1_700_000_000),
                match_outcome: Some(outcome),
                radiant_team_score: Some(radiant),
                dire_team_score: Some(dire),
                lobby_type: Some(1),
                game_mode: None,
            }),
        };
        self.send(SteamEvent::GcPacket {
            msg_type: proto::MSG_GC_MATCH_DETAILS,
            body: response.encode_to_vec(),
        });
    }

    /// Deliver an arbitrary GC packet, e.g. a match message on an unmapped
    /// msg type.
    pub fn send_raw_packet(&self, msg_type: u32, body: Vec<u8>) {
        self.send(SteamEvent::GcPacket { msg_type, body });
    }

    // ---- observation surface for tests ----

    pub fn invites(&self) -> Vec<u64> {
        self.state.lock().unwrap().invites.clone()
    }

    pub fn chat_messages(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().chat.clone()
    }

    pub fn launch_count(&self) -> u32 {
        self.state.lock().unwrap().launches
    }

    pub fn lobbies_created(&self) -> u32 {
        self.state.lock().unwrap().lobbies_created
    }

    pub fn lobby_id(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .lobby
            .as_ref()
            .and_then(|l| l.details.lobby_id)
            .unwrap_or(0)
    }

    pub fn match_id(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .lobby
            .as_ref()
            .map(|l| l.match_id)
            .unwrap_or(0)
    }

    pub fn member_team(&self, steam_id: u64) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .lobby
            .as_ref()
            .and_then(|l| l.members.get(&steam_id).map(|(team, _)| *team))
    }

    pub fn applied_details(&self) -> u32 {
        self.state.lock().unwrap().details_applied
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn has_gc_session(&self) -> bool {
        self.state.lock().unwrap().have_session
    }
}

#[async_trait]
impl SteamClient for SimulatedSteam {
    async fn connect(&self) -> Result<()> {
        self.state.lock().unwrap().connected = true;
        self.send(SteamEvent::Connected);
        Ok(())
    }

    async fn log_on(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() || password.is_empty() {
            self.send(SteamEvent::LogOnFailed(
                "invalid credentials".to_string(),
            ));
            return Ok(());
        }
        self.state.lock().unwrap().logged_on = true;
        self.send(SteamEvent::LoggedOn);
        Ok(())
    }

    async fn set_persona_online(&self) -> Result<()> {
        Ok(())
    }

    async fn set_games_played(&self, _app_id: u32) -> Result<()> {
        Ok(())
    }

    async fn set_playing(&self, playing: bool) -> Result<()> {
        self.state.lock().unwrap().playing = playing;
        Ok(())
    }

    async fn say_hello(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.hellos += 1;
        if state.playing && state.logged_on && !state.have_session {
            state.have_session = true;
            self.send(SteamEvent::GcStatusChanged {
                old: GcConnectionStatus::NoSession,
                new: GcConnectionStatus::HaveSession,
            });
        }
        Ok(())
    }

    async fn create_lobby(&self, mut details: PracticeLobbySetDetails) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.have_session {
            return Ok(());
        }
        details.lobby_id = Some(rand::rng().random_range(1_000_000..u64::MAX));
        let mut members = HashMap::new();
        // The GC seats the creating account straight onto Radiant.
        members.insert(
            self.bot_steam_id,
            (proto::TEAM_RADIANT, "gargamel".to_string()),
        );
        state.lobby = Some(SimLobby {
            details,
            members,
            state: proto::LOBBY_STATE_UI,
            game_state: 0,
            match_id: 0,
            match_outcome: 0,
        });
        state.lobbies_created += 1;
        self.emit_lobby(&state, true);
        Ok(())
    }

    async fn set_lobby_details(&self, details: PracticeLobbySetDetails) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.details_applied += 1;
        if let Some(lobby) = state.lobby.as_mut() {
            let lobby_id = lobby.details.lobby_id;
            lobby.details = PracticeLobbySetDetails {
                lobby_id,
                ..details
            };
            self.emit_lobby(&state, false);
        }
        Ok(())
    }

    async fn launch_lobby(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.launches += 1;
        if let Some(lobby) = state.lobby.as_mut() {
            lobby.state = proto::LOBBY_STATE_RUN;
            self.emit_lobby(&state, false);
        }
        Ok(())
    }

    async fn invite_lobby_member(&self, steam_id: u64) -> Result<()> {
        self.state.lock().unwrap().invites.push(steam_id);
        Ok(())
    }

    async fn kick_lobby_member_from_team(&self, account_id: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(lobby) = state.lobby.as_mut() {
            let target = lobby
                .members
                .iter()
                .find(|&(&id, &(team, _))| {
                    (id & 0xFFFF_FFFF) as u32 == account_id
                        && matches!(team, proto::TEAM_RADIANT | proto::TEAM_DIRE)
                })
                .map(|(&id, _)| id);
            // Kicking someone already in the pool is a no-op; the GC only
            // announces actual seat changes.
            if let Some(id) = target {
                if let Some(entry) = lobby.members.get_mut(&id) {
                    entry.0 = proto::TEAM_PLAYER_POOL;
                }
                self.emit_lobby(&state, false);
            }
        }
        Ok(())
    }

    async fn send_channel_message(&self, channel_id: u64, message: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .chat
            .push((channel_id, message.to_string()));
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            state.connected = false;
            state.have_session = false;
            self.send(SteamEvent::Disconnected);
        }
    }

    fn steam_id(&self) -> u64 {
        self.bot_steam_id
    }
}

/// Hands out one simulator per session and keeps the handles so tests (and
/// local operators poking at the HTTP surface) can script the other side.
#[derive(Default)]
pub struct SimulatedSteamFactory {
    created: Mutex<Vec<Arc<SimulatedSteam>>>,
}

impl SimulatedSteamFactory {
    pub fn client_for(&self, game_id: &str) -> Option<Arc<SimulatedSteam>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|sim| sim.game_id() == game_id)
            .cloned()
    }
}

impl SteamClientFactory for SimulatedSteamFactory {
    fn create(
        &self,
        game_id: &str,
    ) -> (Arc<dyn SteamClient>, mpsc::UnboundedReceiver<SteamEvent>) {
        let (sim, rx) = SimulatedSteam::new(game_id);
        self.created.lock().unwrap().push(sim.clone());
        (sim, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session_up(sim: &SimulatedSteam) {
        sim.connect().await.unwrap();
        sim.log_on("bot", "pw").await.unwrap();
        sim.set_playing(true).await.unwrap();
        sim.say_hello().await.unwrap();
    }

    #[tokio::test]
    async fn hello_establishes_the_gc_session_once() {
        let (sim, mut rx) = SimulatedSteam::new("g1");
        session_up(&sim).await;
        sim.say_hello().await.unwrap();

        let mut transitions = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SteamEvent::GcStatusChanged { .. }) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert!(sim.has_gc_session());
    }

    #[tokio::test]
    async fn create_lobby_emits_an_added_object_with_the_bot_seated() {
        let (sim, mut rx) = SimulatedSteam::new("g1");
        session_up(&sim).await;
        sim.create_lobby(PracticeLobbySetDetails {
            game_name: Some("gargamel_game_g1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut added_lobby = None;
        while let Ok(event) = rx.try_recv() {
            if let SteamEvent::GcPacket { msg_type, body } = event {
                if msg_type == proto::MSG_SO_UPDATE_MULTIPLE {
                    let update = SoMultipleObjects::decode(body.as_slice()).unwrap();
                    if let Some(object) = update.objects_added.first() {
                        added_lobby = CsoDotaLobby::decode(
                            object.object_data.as_deref().unwrap_or_default(),
                        )
                        .ok();
                    }
                }
            }
        }

        let lobby = added_lobby.expect("added lobby object");
        assert_ne!(lobby.lobby_id.unwrap_or(0), 0);
        let bot = lobby
            .all_members
            .iter()
            .find(|m| m.id == Some(sim.steam_id()))
            .expect("bot is a lobby member");
        assert_eq!(bot.team, Some(proto::TEAM_RADIANT));
    }

    #[tokio::test]
    async fn kick_from_team_moves_the_member_to_the_pool() {
        let (sim, _rx) = SimulatedSteam::new("g1");
        session_up(&sim).await;
        sim.create_lobby(PracticeLobbySetDetails::default())
            .await
            .unwrap();

        let bot = sim.steam_id();
        assert_eq!(sim.member_team(bot), Some(proto::TEAM_RADIANT));
        sim.kick_lobby_member_from_team((bot & 0xFFFF_FFFF) as u32)
            .await
            .unwrap();
        assert_eq!(sim.member_team(bot), Some(proto::TEAM_PLAYER_POOL));
    }
}
