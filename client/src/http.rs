//! HTTP access to the run API

use crate::error::ClientError;
use log::debug;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use shared::{PlayerSlot, Progress, RunView};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn create_run(&self) -> Result<RunView, ClientError> {
        let response = self.client.post(self.url("/api/runs")).send().await?;
        let run: RunView = check(response).await?.json().await?;
        debug!("Created run {}", run.id);
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunView, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}", run_id)))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn update_player_progress(
        &self,
        run_id: &str,
        player: PlayerSlot,
        progress: &Progress,
    ) -> Result<(), ClientError> {
        let response = self
            .client
            .patch(self.url(&format!("/api/runs/{}/player", run_id)))
            .json(&json!({ "player": player.number(), "progress": progress }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn update_mode(&self, run_id: &str, two_player_mode: bool) -> Result<(), ClientError> {
        let response = self
            .client
            .patch(self.url(&format!("/api/runs/{}/mode", run_id)))
            .json(&json!({ "twoPlayerMode": two_player_mode }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Turns a non-success status into `ClientError::Rejected`, keeping the
/// server's `{error}` message when there is one.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    };
    Err(rejected(status, message))
}

fn rejected(status: StatusCode, message: String) -> ClientError {
    ClientError::Rejected {
        status: status.as_u16(),
        message,
    }
}
