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

//! Outbound callbacks to the master bot: the poll-start notification and
//! the final match result. Both are fire-and-forget; failures are logged
//! by the caller and never retried.

use anyhow::Context;
use async_trait::async_trait;
use gargamel_common::{GameResult, PollCallback};
use serde::Serialize;

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn notify_poll_started(&self, url: &str, game_id: &str) -> anyhow::Result<()>;
    async fn post_result(&self, url: &str, result: &GameResult) -> anyhow::Result<()>;
}

pub struct HttpResultSink {
    client: reqwest::Client,
}

impl HttpResultSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn post_json<T: Serialize + Sync>(&self, url: &str, payload: &T) -> anyhow::Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("failed to POST to {url}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("callback {url} returned {status}: {body}");
        }

        Ok(())
    }
}

impl Default for HttpResultSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for HttpResultSink {
    async fn notify_poll_started(&self, url: &str, game_id: &str) -> anyhow::Result<()> {
        self.post_json(url, &PollCallback::start(game_id)).await
    }

    async fn post_result(&self, url: &str, result: &GameResult) -> anyhow::Result<()> {
        self.post_json(url, result).await
    }
}
