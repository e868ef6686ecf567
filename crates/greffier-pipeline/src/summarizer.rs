//! Summarization engine adapter.
//!
//! Sends the transcript (truncated to its opening stretch) to an
//! OpenAI-style chat endpoint in JSON mode with a bounded timeout. The
//! engine being unreachable, slow, or incoherent degrades to the
//! development mock rather than failing the whole pipeline; an explicit
//! error status from a configured engine is still surfaced.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use greffier_shared::SummaryArtifact;

use crate::error::PipelineError;

/// The engine only sees the first stretch of the transcript.
pub const SUMMARY_INPUT_LIMIT: usize = 4_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const SYSTEM_PROMPT: &str = "You summarize meeting transcripts. Reply with a JSON object \
    {\"summary\": \"<one sentence>\", \"actions\": [\"<action item>\", ...]} and nothing else.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

pub struct Summarizer {
    http: reqwest::Client,
    endpoint: Option<String>,
    model: String,
}

impl Summarizer {
    /// `endpoint` is the engine base URL (e.g. a local OpenAI-compatible
    /// server); `None` enables the development mock.
    pub fn new(endpoint: Option<String>, model: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            model,
        }
    }

    pub async fn summarize(&self, transcript_text: &str) -> Result<SummaryArtifact, PipelineError> {
        let Some(endpoint) = &self.endpoint else {
            warn!("SUMMARIZER_URL is not set; serving MOCK summary (development only)");
            return Ok(mock_summary());
        };

        let excerpt = truncate_chars(transcript_text, SUMMARY_INPUT_LIMIT);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: excerpt,
                },
            ],
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = match self
            .http
            .post(format!("{endpoint}/chat/completions"))
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!(error = %e, "summarization engine unreachable; serving MOCK summary (development only)");
                return Ok(mock_summary());
            }
            Err(e) => return Err(PipelineError::Summarizer(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Summarizer(format!(
                "engine returned HTTP {status}"
            )));
        }

        let body: ChatResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "summarization response unparseable; serving MOCK summary (development only)");
                return Ok(mock_summary());
            }
        };

        let Some(content) = body.choices.into_iter().next().map(|c| c.message.content) else {
            warn!("summarization response carried no choices; serving MOCK summary (development only)");
            return Ok(mock_summary());
        };

        match serde_json::from_str::<SummaryArtifact>(&content) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(error = %e, "summarization JSON invalid; serving MOCK summary (development only)");
                Ok(mock_summary())
            }
        }
    }
}

/// Character-boundary-safe truncation.
fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn mock_summary() -> SummaryArtifact {
    SummaryArtifact {
        summary: "Development mock summary of the meeting.".to_string(),
        actions: vec!["Review the transcript manually.".to_string()],
    }
}
