use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use greffier_shared::{ArtifactKind, ProcessState};

/// The primary aggregate: one bot-attended meeting and its artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Meeting {
    /// Provider bot identifier, also the primary key.
    pub id: String,
    pub user_id: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub process_state: ProcessState,
    /// Epoch milliseconds, bumped on every state transition.
    pub updated_at: i64,
    /// Measured audio duration in whole seconds, known after processing.
    pub duration_seconds: Option<i64>,
    /// Artifact kind ("audio", "transcript", "summary") -> vault path.
    pub file_paths: HashMap<String, String>,
    /// Revision version currently presented as head, for UI rendering.
    pub active_version: Option<i64>,
}

/// One append-only audit entry in the revision log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Revision {
    pub id: i64,
    pub meeting_id: String,
    pub version: i64,
    pub kind: ArtifactKind,
    pub content_hash: String,
    /// Vault path of the immutable versioned snapshot.
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}
