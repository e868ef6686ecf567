//! Hash verification with fuzzy fallback.
//!
//! The exact path is an indexed lookup over the revision log. When that
//! misses and the caller names a meeting, each of its revisions is
//! decrypted and hashed under canonicalized renderings (whitespace-collapsed
//! text; a "SUMMARY: ... ACTION ITEMS: ..." concatenation for summaries),
//! which accommodates clients hashing text re-extracted from a PDF export.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use greffier_shared::hash::content_hash;
use greffier_shared::{ArtifactKind, SummaryArtifact, TranscriptArtifact};
use greffier_store::Revision;
use greffier_vault::VaultError;

use crate::api::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub hash: Option<String>,
    pub hashes: Option<Vec<String>>,
    pub content: Option<String>,
    pub meeting_id: Option<String>,
}

#[derive(Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn verify_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let user_id = state.auth.authenticate(&headers).await?;

    let mut candidates: Vec<String> = Vec::new();
    let mut calculated_hash = None;
    if let Some(hash) = request.hash {
        candidates.push(hash);
    }
    if let Some(hashes) = request.hashes {
        candidates.extend(hashes);
    }
    if let Some(content) = &request.content {
        let hash = content_hash(content);
        calculated_hash = Some(hash.clone());
        candidates.push(hash);
    }
    if candidates.is_empty() {
        return Err(ApiError::BadRequest(
            "hash, hashes, or content is required".to_string(),
        ));
    }

    // Exact path: indexed lookup.
    {
        let db = state.db.lock().await;
        for candidate in &candidates {
            if let Some(revision) = db.find_revision_by_hash(candidate)? {
                let meeting = db.get_meeting(&revision.meeting_id)?;
                if meeting.user_id == user_id {
                    return Ok(Json(verified(&revision, calculated_hash)));
                }
            }
        }
    }

    // Fuzzy fallback: canonicalize this meeting's stored artifacts.
    if let Some(meeting_id) = &request.meeting_id {
        let (key, iv, revisions) = {
            let db = state.db.lock().await;
            let meeting = db.get_meeting(meeting_id)?;
            if meeting.user_id != user_id {
                return Err(ApiError::Forbidden);
            }
            let (key, iv) = db.get_meeting_key(meeting_id)?;
            (key, iv, db.list_all_revisions(meeting_id)?)
        };

        for revision in revisions {
            let payload = match state
                .vault
                .decrypt_buffer_from_file(&revision.file_path, &key, &iv)
                .await
            {
                Ok(payload) => payload,
                Err(VaultError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let variants = match revision.kind {
                ArtifactKind::Transcript => transcript_variants(&payload)?,
                ArtifactKind::Summary => summary_variants(&payload)?,
            };
            let matched = variants
                .iter()
                .any(|variant| candidates.contains(&content_hash(variant)));
            if matched {
                return Ok(Json(verified(&revision, calculated_hash)));
            }
        }
    }

    Ok(Json(VerifyResponse {
        verified: false,
        version: None,
        kind: None,
        date: None,
        calculated_hash,
        message: Some("No matching revision found".to_string()),
    }))
}

fn verified(revision: &Revision, calculated_hash: Option<String>) -> VerifyResponse {
    VerifyResponse {
        verified: true,
        version: Some(revision.version),
        kind: Some(revision.kind.as_str()),
        date: Some(revision.created_at.to_rfc3339()),
        calculated_hash,
        message: None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn transcript_variants(payload: &[u8]) -> Result<Vec<String>, ApiError> {
    let artifact: TranscriptArtifact =
        serde_json::from_slice(payload).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(vec![
        artifact.text.clone(),
        collapse_whitespace(&artifact.text),
    ])
}

fn summary_variants(payload: &[u8]) -> Result<Vec<String>, ApiError> {
    let artifact: SummaryArtifact =
        serde_json::from_slice(payload).map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut rendered = format!("SUMMARY: {} ACTION ITEMS:", artifact.summary);
    for action in &artifact.actions {
        rendered.push_str(" - ");
        rendered.push_str(action);
    }

    Ok(vec![
        artifact.summary.clone(),
        collapse_whitespace(&artifact.summary),
        collapse_whitespace(&rendered),
        rendered,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_collapse() {
        assert_eq!(collapse_whitespace("  a\n b\t\tc  "), "a b c");
        assert_eq!(collapse_whitespace("plain"), "plain");
    }

    #[test]
    fn transcript_variants_cover_collapsed_form() {
        let payload = serde_json::to_vec(&TranscriptArtifact {
            text: "Hello   world\nagain".to_string(),
            segments: Vec::new(),
        })
        .unwrap();

        let variants = transcript_variants(&payload).unwrap();
        assert!(variants.contains(&"Hello   world\nagain".to_string()));
        assert!(variants.contains(&"Hello world again".to_string()));
    }

    #[test]
    fn summary_variants_cover_pdf_rendering() {
        let payload = serde_json::to_vec(&SummaryArtifact {
            summary: "We shipped it.".to_string(),
            actions: vec!["Tell the team".to_string(), "Write docs".to_string()],
        })
        .unwrap();

        let variants = summary_variants(&payload).unwrap();
        assert!(variants
            .contains(&"SUMMARY: We shipped it. ACTION ITEMS: - Tell the team - Write docs".to_string()));
        assert!(variants.contains(&"We shipped it.".to_string()));
    }

    #[test]
    fn summary_without_actions_still_renders() {
        let payload = serde_json::to_vec(&SummaryArtifact {
            summary: "Quiet week.".to_string(),
            actions: Vec::new(),
        })
        .unwrap();

        let variants = summary_variants(&payload).unwrap();
        assert!(variants.contains(&"SUMMARY: Quiet week. ACTION ITEMS:".to_string()));
    }
}
