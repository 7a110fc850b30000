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

//! The Game Coordinator wire subset the lobby manager consumes. Only the
//! lobby shared object, the practice-lobby details tuple, and the match
//! result messages are modeled; every other GC message is opaque bytes.

/// Steam app id for Dota 2.
pub const DOTA_APP_ID: u32 = 570;

// GC message ids.
pub const MSG_GC_PRACTICE_LOBBY_UPDATE: u32 = 7038;
pub const MSG_GC_MATCH_DETAILS: u32 = 7034;
pub const MSG_GC_UPDATE_MATCH_DETAILS: u32 = 7035;
pub const MSG_SO_UPDATE_MULTIPLE: u32 = 26;

/// Shared-object type id carried by lobby objects inside SO updates.
pub const LOBBY_SO_TYPE_ID: i32 = 2004;

// Lobby team slots.
pub const TEAM_RADIANT: u32 = 0;
pub const TEAM_DIRE: u32 = 1;
pub const TEAM_SPECTATOR: u32 = 2;
pub const TEAM_PLAYER_POOL: u32 = 3;

// Aggregate lobby states.
pub const LOBBY_STATE_UI: u32 = 0;
pub const LOBBY_STATE_RUN: u32 = 2;
pub const LOBBY_STATE_POSTGAME: u32 = 3;

/// Gamerules state reported once the match has finished.
pub const GAMERULES_STATE_POST_GAME: u32 = 8;

// CreateLobby detail enums.
pub const CM_PICK_RANDOM: u32 = 2;
pub const LOBBY_VISIBILITY_PUBLIC: u32 = 0;
pub const PAUSE_SETTING_LIMITED: u32 = 1;
pub const SELECTION_PRIORITY_RULES_MANUAL: u32 = 0;
pub const DOTA_TV_DELAY_10S: u32 = 0;
/// Opaque series configuration the GC accepts for these lobbies.
pub const DEFAULT_SERIES_TYPE: u32 = 46;

#[derive(Clone, PartialEq, prost::Message)]
pub struct DotaLobbyMember {
    #[prost(fixed64, optional, tag = "1")]
    pub id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub team: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CsoDotaLobby {
    #[prost(uint64, optional, tag = "1")]
    pub lobby_id: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub all_members: Vec<DotaLobbyMember>,
    #[prost(uint32, optional, tag = "3")]
    pub state: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub game_name: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub pass_key: Option<String>,
    #[prost(uint32, optional, tag = "6")]
    pub server_region: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub game_mode: Option<u32>,
    #[prost(bool, optional, tag = "8")]
    pub allow_cheats: Option<bool>,
    #[prost(uint32, optional, tag = "9")]
    pub game_state: Option<u32>,
    #[prost(uint64, optional, tag = "10")]
    pub match_id: Option<u64>,
    #[prost(uint32, optional, tag = "11")]
    pub match_outcome: Option<u32>,
    #[prost(uint32, optional, tag = "12")]
    pub lobby_type: Option<u32>,
    #[prost(fixed64, optional, tag = "13")]
    pub leader_id: Option<u64>,
}

/// Settings tuple for both CreateLobby and SetLobbyDetails. The GC treats
/// a details dispatch as an overwrite of everything present.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PracticeLobbySetDetails {
    #[prost(uint64, optional, tag = "1")]
    pub lobby_id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub game_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub pass_key: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub server_region: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub game_mode: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub allow_cheats: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub fill_with_bots: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub allow_spectating: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub allchat: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub lan: Option<bool>,
    #[prost(uint32, optional, tag = "11")]
    pub cm_pick: Option<u32>,
    #[prost(uint32, optional, tag = "12")]
    pub visibility: Option<u32>,
    #[prost(uint32, optional, tag = "13")]
    pub pause_setting: Option<u32>,
    #[prost(uint32, optional, tag = "14")]
    pub selection_priority_rules: Option<u32>,
    #[prost(uint32, optional, tag = "15")]
    pub dota_tv_delay: Option<u32>,
    #[prost(uint32, optional, tag = "16")]
    pub series_type: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SoSingleObject {
    #[prost(int32, optional, tag = "1")]
    pub type_id: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub object_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SoMultipleObjects {
    #[prost(uint64, optional, tag = "1")]
    pub version: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub objects_modified: Vec<SoSingleObject>,
    #[prost(message, repeated, tag = "3")]
    pub objects_added: Vec<SoSingleObject>,
    #[prost(message, repeated, tag = "4")]
    pub objects_removed: Vec<SoSingleObject>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DotaMatch {
    #[prost(uint64, optional, tag = "1")]
    pub match_id: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub duration: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub starttime: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub match_outcome: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub radiant_team_score: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub dire_team_score: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub lobby_type: Option<u32>,
    #[prost(uint32, optional, tag = "8")]
    pub game_mode: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MatchDetailsResponse {
    #[prost(uint32, optional, tag = "1")]
    pub result: Option<u32>,
    #[prost(message, optional, tag = "2")]
    pub match_info: Option<DotaMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn so_update_groups_added_and_modified_objects() {
        let lobby = CsoDotaLobby {
            lobby_id: Some(27182818),
            state: Some(LOBBY_STATE_UI),
            ..Default::default()
        };

        let update = SoMultipleObjects {
            objects_added: vec![SoSingleObject {
                type_id: Some(LOBBY_SO_TYPE_ID),
                object_data: Some(lobby.encode_to_vec()),
            }],
            objects_modified: vec![SoSingleObject {
                type_id: Some(7),
                object_data: Some(vec![1, 2, 3]),
            }],
            ..Default::default()
        };

        let decoded = SoMultipleObjects::decode(update.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.objects_added.len(), 1);
        assert_eq!(decoded.objects_modified.len(), 1);
        assert_eq!(decoded.objects_added[0].type_id, Some(LOBBY_SO_TYPE_ID));

        let inner = CsoDotaLobby::decode(
            decoded.objects_added[0]
                .object_data
                .as_deref()
                .unwrap_or_default(),
        )
        .unwrap();
        assert_eq!(inner.lobby_id, Some(27182818));
    }

    #[test]
    fn match_details_response_wraps_the_match_payload() {
        let response = MatchDetailsResponse {
            result: Some(0),
            match_info: Some(DotaMatch {
                match_id: Some(777),
                duration: Some(2400),
                match_outcome: Some(2),
                ..Default::default()
            }),
        };

        let decoded =
            MatchDetailsResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        let details = decoded.match_info.expect("match payload");
        assert_eq!(details.match_id, Some(777));
        assert_eq!(details.duration, Some(2400));
    }
}
