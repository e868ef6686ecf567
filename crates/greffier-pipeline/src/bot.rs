//! Bot provider adapter.
//!
//! Thin wrapper over the external meeting-bot API. The provider's status
//! surface is heterogeneous, so everything is normalized here: an explicit
//! `status` field wins, otherwise the last entry of the status-change log;
//! `audio_ready` is derived from a priority-ordered probe of the media
//! shortcut keys.

use serde_json::Value;
use tracing::debug;

use crate::error::PipelineError;

/// Raw provider states from which no further progress is possible.
pub const TERMINAL_STATUSES: &[&str] = &["done", "fatal", "error", "payment_required"];

/// Media shortcut keys, best first: lossless raw audio, then mp3, then any
/// mixed audio, then mixed video as a last resort.
const MEDIA_PREFERENCE: &[&str] = &["audio_separate_raw", "audio_mp3", "audio_mixed", "video_mixed"];

pub fn is_terminal(raw_status: &str) -> bool {
    TERMINAL_STATUSES.contains(&raw_status)
}

/// Normalized view of one provider status poll.
#[derive(Debug, Clone)]
pub struct BotStatus {
    pub raw_status: String,
    pub audio_ready: bool,
    pub audio_url: Option<String>,
}

#[derive(Clone)]
pub struct BotClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl BotClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Dispatch a bot into the meeting; returns the provider's bot id.
    pub async fn join(&self, meeting_url: &str, bot_name: &str) -> Result<String, PipelineError> {
        let response = self
            .http
            .post(format!("{}/bot", self.base_url))
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({
                "meeting_url": meeting_url,
                "bot_name": bot_name,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let body = expect_json(response).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Provider {
                status: 200,
                message: "join response carried no bot id".to_string(),
            })
    }

    pub async fn status(&self, bot_id: &str) -> Result<BotStatus, PipelineError> {
        let response = self
            .http
            .get(format!("{}/bot/{}", self.base_url, bot_id))
            .header("Authorization", format!("Token {}", self.api_key))
            .send()
            .await
            .map_err(transport_error)?;

        let body = expect_json(response).await?;
        let status = interpret_status(&body);
        debug!(
            bot_id = %bot_id,
            raw_status = %status.raw_status,
            audio_ready = status.audio_ready,
            "provider status poll"
        );
        Ok(status)
    }

    /// Open the provider's media download as a byte stream.
    pub async fn download_audio(&self, url: &str) -> Result<reqwest::Response, PipelineError> {
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Provider {
                status: status.as_u16(),
                message: format!("media download refused for {url}"),
            });
        }
        Ok(response)
    }

    pub async fn leave(&self, bot_id: &str) -> Result<(), PipelineError> {
        let response = self
            .http
            .post(format!("{}/bot/{}/leave", self.base_url, bot_id))
            .header("Authorization", format!("Token {}", self.api_key))
            .send()
            .await
            .map_err(transport_error)?;
        expect_json(response).await?;
        Ok(())
    }
}

/// Normalize one raw provider status document.
pub fn interpret_status(body: &Value) -> BotStatus {
    let raw_status = body
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            body.get("status_changes")
                .and_then(Value::as_array)
                .and_then(|changes| changes.last())
                .and_then(|entry| entry.get("code"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string());

    let audio_url = MEDIA_PREFERENCE.iter().find_map(|key| {
        body.get("media_shortcuts")?
            .get(key)?
            .pointer("/data/download_url")?
            .as_str()
            .map(str::to_string)
    });

    BotStatus {
        raw_status,
        audio_ready: audio_url.is_some(),
        audio_url,
    }
}

fn transport_error(e: reqwest::Error) -> PipelineError {
    PipelineError::Provider {
        status: e.status().map(|s| s.as_u16()).unwrap_or(0),
        message: e.to_string(),
    }
}

async fn expect_json(response: reqwest::Response) -> Result<Value, PipelineError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(PipelineError::Provider {
            status: status.as_u16(),
            message,
        });
    }
    response.json().await.map_err(transport_error)
}
