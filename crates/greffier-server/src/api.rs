use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, Response};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use greffier_pipeline::{Orchestrator, PollOutcome};
use greffier_shared::{ArtifactKind, ProcessState, SummaryArtifact, TranscriptArtifact, TranscriptSegment};
use greffier_store::{Database, Meeting};
use greffier_vault::Vault;

use crate::auth::Authenticator;
use crate::error::ApiError;
use crate::stream::{envelope_buffer_response, envelope_stream_response};
use crate::verify::verify_content;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub vault: Arc<Vault>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<Authenticator>,
    pub bot_default_name: String,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/api/join", post(join_meeting))
        .route("/api/leave", post(leave_meeting))
        .route("/api/status/{id}", get(meeting_status))
        .route("/api/meetings", get(list_meetings))
        .route("/api/audio/{id}", get(stream_audio))
        .route("/api/data/{id}/transcript", get(stream_transcript))
        .route("/api/data/{id}/summary", get(stream_summary))
        .route("/api/data/{id}", get(combined_data))
        .route("/api/edit/{id}", post(edit_transcript))
        .route("/api/verify", post(verify_content))
        .route("/api/history/{id}", get(revision_history))
        .route("/api/revision/{rid}/content", get(revision_content))
        .route("/api/revert/{id}", post(revert_revision))
        .route("/api/meeting/{id}/checkout", post(checkout_version))
        .route("/api/meeting/{id}", delete(delete_meeting))
        .route("/api/retry/{id}", post(retry_processing))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Authenticate, then load the meeting and enforce ownership -- the fixed
/// prologue of every per-meeting route.
async fn owned_meeting(
    state: &AppState,
    headers: &HeaderMap,
    meeting_id: &str,
) -> Result<Meeting, ApiError> {
    let user_id = state.auth.authenticate(headers).await?;
    let meeting = { state.db.lock().await.get_meeting(meeting_id)? };
    if meeting.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(meeting)
}

// ─── Join / leave ───

#[derive(Deserialize)]
struct JoinRequest {
    meeting_url: String,
    bot_name: Option<String>,
}

#[derive(Serialize)]
struct JoinResponse {
    success: bool,
    meeting_id: String,
    message: &'static str,
}

async fn join_meeting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let user_id = state.auth.authenticate(&headers).await?;
    if request.meeting_url.trim().is_empty() {
        return Err(ApiError::BadRequest("meeting_url is required".to_string()));
    }
    let bot_name = request
        .bot_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| state.bot_default_name.clone());

    let meeting = state
        .orchestrator
        .join_meeting(&user_id, &request.meeting_url, &bot_name)
        .await?;

    Ok(Json(JoinResponse {
        success: true,
        meeting_id: meeting.id,
        message: "Bot dispatched to meeting",
    }))
}

#[derive(Deserialize)]
struct LeaveRequest {
    meeting_id: String,
}

async fn leave_meeting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LeaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_meeting(&state, &headers, &request.meeting_id).await?;
    state.orchestrator.leave_meeting(&request.meeting_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ─── Status / listing ───

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    process_state: Option<String>,
    audio_ready: bool,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifacts: Option<HashMap<String, String>>,
}

async fn meeting_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;

    match state.orchestrator.poll_status(&id).await? {
        PollOutcome::Discarded => Ok(Json(serde_json::json!({
            "status": "discarded",
            "message": "The bot finished without recording audio; the meeting was discarded",
        }))
        .into_response()),
        PollOutcome::Active {
            meeting,
            raw_status,
            audio_ready,
        } => {
            let artifacts = (meeting.process_state == ProcessState::Completed)
                .then(|| meeting.file_paths.clone());
            let response = StatusResponse {
                status: client_status(meeting.process_state, raw_status.as_deref()),
                raw_status,
                process_state: Some(meeting.process_state.to_string()),
                audio_ready,
                timestamp: meeting.updated_at,
                artifacts,
            };
            Ok(Json(response).into_response())
        }
    }
}

/// UI badge mapping. Note the deliberate spelling split: this returns
/// `"complete"` for a completed meeting while the listing endpoint reports
/// the raw state `"completed"`.
fn client_status(state: ProcessState, raw_status: Option<&str>) -> String {
    match state {
        ProcessState::Completed => "complete".to_string(),
        ProcessState::Failed => "failed".to_string(),
        ProcessState::Downloading | ProcessState::Downloaded | ProcessState::Transcribing => {
            "processing".to_string()
        }
        ProcessState::Initializing => raw_status.unwrap_or("pending").to_string(),
    }
}

#[derive(Serialize)]
struct MeetingSummary {
    id: String,
    meeting_id: String,
    user_id: String,
    status: String,
    process_state: String,
    created_at: i64,
    duration: String,
    date: String,
}

#[derive(Serialize)]
struct MeetingsResponse {
    success: bool,
    meetings: Vec<MeetingSummary>,
}

async fn list_meetings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeetingsResponse>, ApiError> {
    let user_id = state.auth.authenticate(&headers).await?;
    let meetings = { state.db.lock().await.list_meetings_by_user(&user_id)? };

    let meetings = meetings
        .into_iter()
        .map(|m| MeetingSummary {
            id: m.id.clone(),
            meeting_id: m.id,
            user_id: m.user_id,
            status: m.process_state.to_string(),
            process_state: m.process_state.to_string(),
            created_at: m.created_at,
            duration: format_duration(m.duration_seconds.unwrap_or(0)),
            date: chrono::DateTime::from_timestamp_millis(m.created_at)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
        })
        .collect();

    Ok(Json(MeetingsResponse {
        success: true,
        meetings,
    }))
}

fn format_duration(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

// ─── Secure artifact delivery ───

async fn stream_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let meeting = owned_meeting(&state, &headers, &id).await?;
    envelope_stream_response(&state, &headers, &meeting, "audio", "audio/mpeg").await
}

async fn stream_transcript(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let meeting = owned_meeting(&state, &headers, &id).await?;
    envelope_stream_response(&state, &headers, &meeting, "transcript", "application/json").await
}

async fn stream_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let meeting = owned_meeting(&state, &headers, &id).await?;
    envelope_stream_response(&state, &headers, &meeting, "summary", "application/json").await
}

/// Combined `{transcript, segments, summary}` document under one envelope.
async fn combined_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let meeting = owned_meeting(&state, &headers, &id).await?;
    let (key, iv) = { state.db.lock().await.get_meeting_key(&id)? };

    let transcript_rel = meeting
        .file_paths
        .get("transcript")
        .ok_or_else(|| ApiError::NotFound("no transcript artifact for this meeting".to_string()))?;
    let summary_rel = meeting
        .file_paths
        .get("summary")
        .ok_or_else(|| ApiError::NotFound("no summary artifact for this meeting".to_string()))?;

    let transcript: TranscriptArtifact = serde_json::from_slice(
        &state
            .vault
            .decrypt_buffer_from_file(transcript_rel, &key, &iv)
            .await?,
    )
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    let summary: SummaryArtifact = serde_json::from_slice(
        &state
            .vault
            .decrypt_buffer_from_file(summary_rel, &key, &iv)
            .await?,
    )
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let payload = serde_json::to_vec(&serde_json::json!({
        "transcript": transcript.text,
        "segments": transcript.segments,
        "summary": summary.summary,
    }))
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    envelope_buffer_response(&headers, &payload, "application/json")
}

// ─── Revisions ───

#[derive(Deserialize)]
struct EditRequest {
    text: String,
    #[serde(default)]
    segments: Option<Vec<TranscriptSegment>>,
}

#[derive(Serialize)]
struct EditResponse {
    success: bool,
    version: i64,
    hash: String,
}

async fn edit_transcript(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<EditRequest>,
) -> Result<Json<EditResponse>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text is required".to_string()));
    }

    let receipt = state
        .orchestrator
        .save_transcript_revision(&id, request.text, request.segments.unwrap_or_default())
        .await?;

    Ok(Json(EditResponse {
        success: true,
        version: receipt.version,
        hash: receipt.hash,
    }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Serialize)]
struct RevisionView {
    id: i64,
    version: i64,
    hash: String,
    created_at: String,
}

async fn revision_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;

    let kind = match query.kind.as_deref() {
        None => ArtifactKind::Transcript,
        Some(raw) => ArtifactKind::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown revision type '{raw}'")))?,
    };

    let revisions = { state.db.lock().await.list_revisions(&id, kind)? };
    let revisions: Vec<RevisionView> = revisions
        .into_iter()
        .map(|r| RevisionView {
            id: r.id,
            version: r.version,
            hash: r.content_hash,
            created_at: r.created_at.to_rfc3339(),
        })
        .collect();

    Ok(Json(serde_json::json!({
        "success": true,
        "revisions": revisions,
    })))
}

/// Cleartext snapshot content over the authenticated channel.
async fn revision_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(rid): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revision = { state.db.lock().await.get_revision(rid)? };
    owned_meeting(&state, &headers, &revision.meeting_id).await?;

    let (key, iv) = { state.db.lock().await.get_meeting_key(&revision.meeting_id)? };
    let payload = state
        .vault
        .decrypt_buffer_from_file(&revision.file_path, &key, &iv)
        .await?;
    let content: serde_json::Value =
        serde_json::from_slice(&payload).map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "content": content,
    })))
}

#[derive(Deserialize)]
struct RevertRequest {
    revision_id: i64,
}

async fn revert_revision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RevertRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;
    let receipt = state
        .orchestrator
        .revert_to_revision(&id, request.revision_id)
        .await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "new_version": receipt.version,
    })))
}

#[derive(Deserialize)]
struct CheckoutRequest {
    version: i64,
}

async fn checkout_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;
    state
        .orchestrator
        .checkout_to_version(&id, request.version)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ─── Lifecycle ───

async fn delete_meeting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;
    state.orchestrator.delete_meeting(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn retry_processing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_meeting(&state, &headers, &id).await?;
    state.orchestrator.resume_processing(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_rendering() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(59), "00:59");
        assert_eq!(format_duration(61), "01:01");
        assert_eq!(format_duration(3599), "59:59");
        assert_eq!(format_duration(3600), "01:00:00");
        assert_eq!(format_duration(3723), "01:02:03");
    }

    #[test]
    fn status_badge_mapping() {
        assert_eq!(client_status(ProcessState::Completed, None), "complete");
        assert_eq!(client_status(ProcessState::Failed, None), "failed");
        assert_eq!(client_status(ProcessState::Downloading, None), "processing");
        assert_eq!(client_status(ProcessState::Downloaded, None), "processing");
        assert_eq!(client_status(ProcessState::Transcribing, None), "processing");
        assert_eq!(
            client_status(ProcessState::Initializing, Some("in_call")),
            "in_call"
        );
        assert_eq!(client_status(ProcessState::Initializing, None), "pending");
    }
}
