use thiserror::Error;

use greffier_store::StoreError;
use greffier_vault::VaultError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Ingest error: {0}")]
    Ingest(String),

    #[error("Transcriber error: {0}")]
    Transcriber(String),

    #[error("Summarizer error: {0}")]
    Summarizer(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Revision {0} is not a transcript revision")]
    NotTranscriptRevision(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Artifact serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
