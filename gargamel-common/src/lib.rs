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

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_REGION: u32 = SERVER_REGION_US_EAST;
pub const DEFAULT_GAME_MODE: u32 = GAME_MODE_ALL_DRAFT;

/// Dota 2 game mode ids accepted by the Game Coordinator.
pub const GAME_MODE_NONE: u32 = 0;
pub const GAME_MODE_CM: u32 = 2;
pub const GAME_MODE_RD: u32 = 3;
pub const GAME_MODE_SD: u32 = 4;
pub const GAME_MODE_AR: u32 = 5;
pub const GAME_MODE_REVERSE_CM: u32 = 8;
pub const GAME_MODE_MO: u32 = 11;
pub const GAME_MODE_LP: u32 = 12;
pub const GAME_MODE_CD: u32 = 16;
pub const GAME_MODE_ABILITY_DRAFT: u32 = 18;
pub const GAME_MODE_ARDM: u32 = 20;
/// Ranked All Pick.
pub const GAME_MODE_ALL_DRAFT: u32 = 22;
pub const GAME_MODE_TURBO: u32 = 23;

pub const SERVER_REGION_US_WEST: u32 = 1;
pub const SERVER_REGION_US_EAST: u32 = 2;
pub const SERVER_REGION_EU_WEST: u32 = 3;
pub const SERVER_REGION_EU_EAST: u32 = 4;
pub const SERVER_REGION_CHINA: u32 = 5;
pub const SERVER_REGION_SEA: u32 = 6;

pub const MATCH_OUTCOME_UNKNOWN: u32 = 0;
pub const MATCH_OUTCOME_RADIANT_VICTORY: u32 = 2;
pub const MATCH_OUTCOME_DIRE_VICTORY: u32 = 3;

/// Action string carried by the poll-start callback body.
pub const POLL_CALLBACK_ACTION_START: &str = "start_poll";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Creating,
    Waiting,
    Launching,
    InProgress,
    Postgame,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGameRequest {
    pub game_id: String,
    pub username: String,
    pub password: String,
    pub radiant_team: Vec<u64>,
    pub dire_team: Vec<u64>,
    pub result_url: String,
    #[serde(default)]
    pub server_region: Option<u32>,
    #[serde(default)]
    pub game_mode: Option<u32>,
    #[serde(default)]
    pub allow_cheats: Option<bool>,
    #[serde(default)]
    pub game_name: Option<String>,
    #[serde(default)]
    pub pass_key: Option<String>,
    #[serde(default)]
    pub debug_steam_id: Option<u64>,
    #[serde(default)]
    pub poll_callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGameResponse {
    pub game_id: String,
    pub status: SessionState,
    pub password: String,
}

/// Absent fields leave the corresponding setting unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateLobbySettingsRequest {
    #[serde(default)]
    pub game_mode: Option<u32>,
    #[serde(default)]
    pub server_region: Option<u32>,
    #[serde(default)]
    pub allow_cheats: Option<bool>,
    #[serde(default)]
    pub game_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollControlRequest {
    pub action: String,
    #[serde(default)]
    pub game_mode: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SwapPlayersRequest {
    pub steam_id_1: u64,
    pub steam_id_2: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplacePlayerRequest {
    pub old_steam_id: u64,
    pub new_steam_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStatus {
    pub game_id: String,
    pub state: SessionState,
    pub lobby_id: u64,
    pub game_mode: u32,
    pub server_region: u32,
    pub allow_cheats: bool,
    pub radiant_count: usize,
    pub dire_count: usize,
    pub radiant_team: Vec<u64>,
    pub dire_team: Vec<u64>,
    pub polling_active: bool,
    pub polling_done: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pass_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final match outcome reported to the result callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameResult {
    pub game_id: String,
    pub match_id: u64,
    pub lobby_id: u64,
    /// 2 = Radiant win, 3 = Dire win, 0 = unknown.
    pub outcome: u32,
    /// Duration in seconds.
    pub duration: u32,
    pub radiant_score: u32,
    pub dire_score: u32,
    pub game_name: String,
    pub start_time: u32,
    pub lobby_type: u32,
    pub game_mode: u32,
    pub server_region: u32,
    pub timestamp: DateTime<Utc>,
}

impl GameResult {
    /// A result is only reportable once the GC has told us both which match
    /// this was and who won.
    pub fn is_complete(&self) -> bool {
        self.match_id != 0
            && matches!(
                self.outcome,
                MATCH_OUTCOME_RADIANT_VICTORY | MATCH_OUTCOME_DIRE_VICTORY
            )
    }
}

/// Body POSTed to the poll callback URL when the auto-poll threshold is hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCallback {
    pub game_id: String,
    pub action: String,
}

impl PollCallback {
    pub fn start(game_id: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            action: POLL_CALLBACK_ACTION_START.to_string(),
        }
    }
}

pub fn default_game_name(game_id: &str) -> String {
    format!("gargamel_game_{game_id}")
}

pub fn outcome_label(outcome: u32) -> &'static str {
    match outcome {
        MATCH_OUTCOME_RADIANT_VICTORY => "Radiant Victory",
        MATCH_OUTCOME_DIRE_VICTORY => "Dire Victory",
        _ => "Unknown",
    }
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_completeness_requires_match_id_and_decisive_outcome() {
        let mut result = GameResult {
            game_id: "g1".to_string(),
            match_id: 0,
            lobby_id: 9000,
            outcome: MATCH_OUTCOME_UNKNOWN,
            duration: 0,
            radiant_score: 0,
            dire_score: 0,
            game_name: default_game_name("g1"),
            start_time: 0,
            lobby_type: 0,
            game_mode: DEFAULT_GAME_MODE,
            server_region: DEFAULT_SERVER_REGION,
            timestamp: Utc::now(),
        };
        assert!(!result.is_complete());

        result.match_id = 123456;
        assert!(!result.is_complete());

        result.outcome = MATCH_OUTCOME_DIRE_VICTORY;
        assert!(result.is_complete());

        // An aborted match never becomes reportable.
        result.outcome = MATCH_OUTCOME_UNKNOWN;
        assert!(!result.is_complete());
    }

    #[test]
    fn outcome_labels_cover_both_victories() {
        assert_eq!(outcome_label(MATCH_OUTCOME_RADIANT_VICTORY), "Radiant Victory");
        assert_eq!(outcome_label(MATCH_OUTCOME_DIRE_VICTORY), "Dire Victory");
        assert_eq!(outcome_label(MATCH_OUTCOME_UNKNOWN), "Unknown");
        assert_eq!(outcome_label(7), "Unknown");
    }

    #[test]
    fn game_status_omits_empty_pass_key_and_absent_error() {
        let status = GameStatus {
            game_id: "g1".to_string(),
            state: SessionState::Waiting,
            lobby_id: 42,
            game_mode: DEFAULT_GAME_MODE,
            server_region: DEFAULT_SERVER_REGION,
            allow_cheats: false,
            radiant_count: 0,
            dire_count: 0,
            radiant_team: vec![1, 2],
            dire_team: vec![3, 4],
            polling_active: false,
            polling_done: false,
            pass_key: String::new(),
            error: None,
        };

        let encoded = serde_json::to_value(&status).unwrap();
        assert!(encoded.get("pass_key").is_none());
        assert!(encoded.get("error").is_none());
        assert_eq!(encoded["state"], "waiting");
    }

    #[test]
    fn update_request_fields_default_to_absent() {
        let request: UpdateLobbySettingsRequest = serde_json::from_str("{}").unwrap();
        assert!(request.game_mode.is_none());
        assert!(request.server_region.is_none());
        assert!(request.allow_cheats.is_none());
        assert!(request.game_name.is_none());

        let request: UpdateLobbySettingsRequest =
            serde_json::from_str(r#"{"game_mode": 23}"#).unwrap();
        assert_eq!(request.game_mode, Some(GAME_MODE_TURBO));
        assert!(request.server_region.is_none());
    }

    #[test]
    fn create_request_accepts_minimal_body() {
        let request: CreateGameRequest = serde_json::from_str(
            r#"{
                "game_id": "g1",
                "username": "bot",
                "password": "hunter2",
                "radiant_team": [1, 2],
                "dire_team": [3, 4],
                "result_url": "http://master/result"
            }"#,
        )
        .unwrap();
        assert!(request.server_region.is_none());
        assert!(request.poll_callback_url.is_none());
        assert_eq!(request.radiant_team, vec![1, 2]);
    }

    #[test]
    fn expand_env_vars_substitutes_known_and_drops_unknown() {
        unsafe {
            std::env::set_var("GARGAMEL_TEST_TOKEN", "sekrit");
        }
        assert_eq!(
            expand_env_vars("key=${GARGAMEL_TEST_TOKEN}!"),
            "key=sekrit!"
        );
        assert_eq!(expand_env_vars("${GARGAMEL_TEST_UNSET_VAR}"), "");
    }

    #[test]
    fn poll_callback_uses_start_action() {
        let callback = PollCallback::start("g1");
        let encoded = serde_json::to_value(&callback).unwrap();
        assert_eq!(encoded["action"], "start_poll");
        assert_eq!(encoded["game_id"], "g1");
    }
}
