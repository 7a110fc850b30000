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

//! Parsed view of GC lobby objects. Each parse returns a plain value; the
//! session merges it into its observed state with its own change detection.

use prost::Message;

use crate::proto::{
    self, CsoDotaLobby, GAMERULES_STATE_POST_GAME, LOBBY_STATE_POSTGAME, LOBBY_STATE_UI,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyMember {
    pub steam_id: u64,
    pub team: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct LobbySnapshot {
    pub lobby_id: u64,
    pub state: u32,
    pub game_state: u32,
    pub game_name: String,
    pub pass_key: String,
    pub server_region: u32,
    pub allow_cheats: bool,
    pub game_mode: u32,
    pub members: Vec<LobbyMember>,
    pub match_id: u64,
    pub match_outcome: u32,
    pub lobby_type: u32,
}

impl LobbySnapshot {
    /// Decode a lobby shared object body. Members without a Steam id are
    /// dropped. Returns `None` on any decode failure; the GC emits plenty
    /// of object types this service does not model.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let lobby = CsoDotaLobby::decode(body).ok()?;

        let members = lobby
            .all_members
            .into_iter()
            .filter_map(|member| {
                let steam_id = member.id.unwrap_or(0);
                if steam_id == 0 {
                    return None;
                }
                Some(LobbyMember {
                    steam_id,
                    team: member.team.unwrap_or(proto::TEAM_PLAYER_POOL),
                    name: member.name.unwrap_or_default(),
                })
            })
            .collect();

        Some(Self {
            lobby_id: lobby.lobby_id.unwrap_or(0),
            state: lobby.state.unwrap_or(LOBBY_STATE_UI),
            game_state: lobby.game_state.unwrap_or(0),
            game_name: lobby.game_name.unwrap_or_default(),
            pass_key: lobby.pass_key.unwrap_or_default(),
            server_region: lobby.server_region.unwrap_or(0),
            allow_cheats: lobby.allow_cheats.unwrap_or(false),
            game_mode: lobby.game_mode.unwrap_or(0),
            members,
            match_id: lobby.match_id.unwrap_or(0),
            match_outcome: lobby.match_outcome.unwrap_or(0),
            lobby_type: lobby.lobby_type.unwrap_or(0),
        })
    }

    pub fn is_post_game(&self) -> bool {
        self.state == LOBBY_STATE_POSTGAME || self.game_state == GAMERULES_STATE_POST_GAME
    }

    /// The lobby is still in its pre-launch UI screen.
    pub fn in_ui_state(&self) -> bool {
        self.state == LOBBY_STATE_UI
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{DotaLobbyMember, TEAM_DIRE, TEAM_RADIANT};

    fn member(id: u64, team: u32) -> DotaLobbyMember {
        DotaLobbyMember {
            id: Some(id),
            name: Some(format!("player-{id}")),
            team: Some(team),
        }
    }

    #[test]
    fn parse_extracts_members_and_drops_zero_ids() {
        let lobby = CsoDotaLobby {
            lobby_id: Some(5150),
            state: Some(LOBBY_STATE_UI),
            game_name: Some("gargamel_game_g1".to_string()),
            pass_key: Some("pk".to_string()),
            server_region: Some(3),
            allow_cheats: Some(true),
            all_members: vec![
                member(101, TEAM_RADIANT),
                member(102, TEAM_DIRE),
                DotaLobbyMember {
                    id: Some(0),
                    name: None,
                    team: Some(TEAM_RADIANT),
                },
            ],
            ..Default::default()
        };

        let snapshot = LobbySnapshot::parse(&lobby.encode_to_vec()).expect("parse");
        assert_eq!(snapshot.lobby_id, 5150);
        assert_eq!(snapshot.pass_key, "pk");
        assert_eq!(snapshot.game_name, "gargamel_game_g1");
        assert_eq!(snapshot.server_region, 3);
        assert!(snapshot.allow_cheats);
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.members[0].steam_id, 101);
        assert_eq!(snapshot.members[0].team, TEAM_RADIANT);
        assert!(snapshot.in_ui_state());
        assert!(!snapshot.is_post_game());
    }

    #[test]
    fn post_game_is_detected_from_either_field() {
        let by_state = CsoDotaLobby {
            lobby_id: Some(1),
            state: Some(LOBBY_STATE_POSTGAME),
            ..Default::default()
        };
        let snapshot = LobbySnapshot::parse(&by_state.encode_to_vec()).unwrap();
        assert!(snapshot.is_post_game());

        let by_gamerules = CsoDotaLobby {
            lobby_id: Some(1),
            state: Some(proto::LOBBY_STATE_RUN),
            game_state: Some(GAMERULES_STATE_POST_GAME),
            ..Default::default()
        };
        let snapshot = LobbySnapshot::parse(&by_gamerules.encode_to_vec()).unwrap();
        assert!(snapshot.is_post_game());
        assert!(!snapshot.in_ui_state());
    }

    #[test]
    fn parse_rejects_garbage_bodies() {
        // A bare varint field with a truncated payload is not a lobby.
        assert!(LobbySnapshot::parse(&[0x0a, 0xff]).is_none());
    }
}
