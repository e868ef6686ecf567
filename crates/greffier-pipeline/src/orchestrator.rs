//! Pipeline orchestrator.
//!
//! Drives each meeting through its state machine:
//!
//! ```text
//! initializing --audio_ready--> downloading -> downloaded -> transcribing -> completed
//!                                                  \________error________-> failed
//! initializing --terminal, no audio--> (discarded)
//! ```
//!
//! Transitions come from two directions: client status polls
//! ([`Orchestrator::poll_status`]) and internal pipeline progress. The jump
//! into `downloading` is a compare-and-swap in the store, written before the
//! download task is dispatched, so concurrent polls that both observe
//! `audio_ready` produce exactly one ingestion. Everything else that must
//! not interleave for one meeting (version assignment, head-blob writes,
//! retry claims) serializes on a per-meeting lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use greffier_shared::crypto::{self, DataKey, FileIv};
use greffier_shared::hash::content_hash;
use greffier_shared::{ArtifactKind, ProcessState, SummaryArtifact, TranscriptArtifact, TranscriptSegment};
use greffier_store::{Database, Meeting};
use greffier_vault::{Vault, VaultError};

use crate::bot::{self, BotClient};
use crate::error::PipelineError;
use crate::ffmpeg;
use crate::summarizer::Summarizer;
use crate::transcriber::Transcriber;

/// Outcome of one status poll, already folded through the discard rule.
pub enum PollOutcome {
    /// The bot reached a terminal state without audio; the meeting and its
    /// key are gone.
    Discarded,
    Active {
        meeting: Meeting,
        raw_status: Option<String>,
        audio_ready: bool,
    },
}

/// What a revision write hands back to the API layer.
#[derive(Debug, Clone)]
pub struct RevisionReceipt {
    pub version: i64,
    pub hash: String,
}

pub struct Orchestrator {
    db: Arc<Mutex<Database>>,
    vault: Arc<Vault>,
    bot: Arc<BotClient>,
    transcriber: Arc<Transcriber>,
    summarizer: Arc<Summarizer>,
    /// Per-meeting critical sections: version assignment, head-blob writes,
    /// and retry claims for one meeting serialize on its entry here.
    meeting_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        vault: Arc<Vault>,
        bot: Arc<BotClient>,
        transcriber: Arc<Transcriber>,
        summarizer: Arc<Summarizer>,
    ) -> Self {
        Self {
            db,
            vault,
            bot,
            transcriber,
            summarizer,
            meeting_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn meeting_lock(&self, meeting_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.meeting_locks.lock().await;
        Arc::clone(locks.entry(meeting_id.to_string()).or_default())
    }

    /// Send a bot into the meeting and create the tracking record.
    pub async fn join_meeting(
        &self,
        user_id: &str,
        meeting_url: &str,
        bot_name: &str,
    ) -> Result<Meeting, PipelineError> {
        let bot_id = self.bot.join(meeting_url, bot_name).await?;
        let meeting = { self.db.lock().await.create_meeting(user_id, &bot_id)? };
        info!(id = %meeting.id, user = %user_id, "bot joined meeting");
        Ok(meeting)
    }

    pub async fn leave_meeting(&self, meeting_id: &str) -> Result<(), PipelineError> {
        self.bot.leave(meeting_id).await
    }

    /// One client-driven poll. While the meeting is still `initializing`
    /// this consults the provider, applies the discard rule, and claims the
    /// download when audio has appeared; afterwards it reports pipeline
    /// progress without touching the provider.
    pub async fn poll_status(self: &Arc<Self>, meeting_id: &str) -> Result<PollOutcome, PipelineError> {
        let meeting = { self.db.lock().await.get_meeting(meeting_id)? };

        if meeting.process_state != ProcessState::Initializing {
            return Ok(PollOutcome::Active {
                meeting,
                raw_status: None,
                audio_ready: true,
            });
        }

        let status = self.bot.status(meeting_id).await?;

        if bot::is_terminal(&status.raw_status) && !status.audio_ready {
            info!(
                id = %meeting_id,
                raw_status = %status.raw_status,
                "bot finished without audio; discarding meeting"
            );
            self.delete_meeting(meeting_id).await?;
            return Ok(PollOutcome::Discarded);
        }

        if let Some(url) = status.audio_url.clone() {
            // State precondition + CAS write happen before the download task
            // exists, so a racing poll cannot dispatch a second ingestion.
            let claimed = {
                self.db.lock().await.try_transition(
                    meeting_id,
                    ProcessState::Initializing,
                    ProcessState::Downloading,
                )?
            };
            if claimed {
                info!(id = %meeting_id, "audio ready; dispatching ingestion");
                let this = Arc::clone(self);
                let id = meeting_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = this.download_and_ingest(&id, &url).await {
                        error!(id = %id, error = %e, "ingestion failed");
                        this.mark_failed(&id).await;
                    }
                });
            }
        }

        let meeting = { self.db.lock().await.get_meeting(meeting_id)? };
        Ok(PollOutcome::Active {
            meeting,
            raw_status: Some(status.raw_status),
            audio_ready: status.audio_ready,
        })
    }

    async fn download_and_ingest(self: &Arc<Self>, meeting_id: &str, url: &str) -> Result<(), PipelineError> {
        let source = self.bot.download_audio(url).await?;
        self.ingest_recording(meeting_id, source).await
    }

    /// Pull provider bytes through the FFmpeg transcode and into the vault
    /// under a freshly generated (key, IV), then hand off to processing.
    pub async fn ingest_recording(
        self: &Arc<Self>,
        meeting_id: &str,
        mut source: reqwest::Response,
    ) -> Result<(), PipelineError> {
        let data_key = crypto::generate_data_key();
        let file_iv = crypto::generate_file_iv();

        let transcode = ffmpeg::spawn_mp3_transcode()?;
        let mut child = transcode.child;
        let mut stdin = transcode.stdin;

        let feeder = tokio::spawn(async move {
            loop {
                match source.chunk().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = stdin.write_all(&chunk).await {
                            return Err(format!("transcode pipe closed: {e}"));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(format!("provider stream failed: {e}")),
                }
            }
            let _ = stdin.shutdown().await;
            Ok(())
        });

        let audio_rel = format!("audio/{meeting_id}.enc");
        let written = self
            .vault
            .encrypt_stream_to_file(transcode.stdout, &audio_rel, &data_key, &file_iv)
            .await?;

        let feed_result = feeder
            .await
            .unwrap_or_else(|e| Err(format!("feeder task panicked: {e}")));

        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(id = %meeting_id, ?status, "ffmpeg exited non-zero");
            }
            Err(e) => warn!(id = %meeting_id, error = %e, "could not reap ffmpeg"),
            _ => {}
        }

        if let Err(message) = feed_result {
            return Err(PipelineError::Ingest(message));
        }
        if written == 0 {
            return Err(PipelineError::Ingest("transcode produced no audio".to_string()));
        }

        {
            let db = self.db.lock().await;
            db.store_meeting_key(meeting_id, &data_key, &file_iv)?;
            let mut paths = HashMap::new();
            paths.insert("audio".to_string(), audio_rel);
            db.update_process_state(meeting_id, ProcessState::Downloaded, Some(&paths), None)?;
        }
        info!(id = %meeting_id, mp3_bytes = written, "recording ingested");

        let this = Arc::clone(self);
        let id = meeting_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.process_meeting(&id).await {
                error!(id = %id, error = %e, "processing failed");
                this.mark_failed(&id).await;
            }
        });

        Ok(())
    }

    /// The linear processing task: decrypt audio to a temp file, probe,
    /// transcribe, summarize, write artifact pair, complete. Any error is
    /// translated by the caller into a single `failed` write.
    pub async fn process_meeting(&self, meeting_id: &str) -> Result<(), PipelineError> {
        {
            self.db.lock().await.update_process_state(
                meeting_id,
                ProcessState::Transcribing,
                None,
                None,
            )?;
        }
        let (key, iv) = { self.db.lock().await.get_meeting_key(meeting_id)? };

        let audio_rel = format!("audio/{meeting_id}.enc");
        let staged = std::env::temp_dir().join(format!("greffier-{}-{}.mp3", meeting_id, Uuid::new_v4()));

        if let Err(e) = self.vault.decrypt_to_file(&audio_rel, &key, &iv, &staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }

        let duration_seconds = match ffmpeg::probe_duration_seconds(&staged).await {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!(id = %meeting_id, error = %e, "duration probe failed");
                0
            }
        };

        let transcript = self.transcriber.transcribe(&staged).await;

        // The decrypted audio lives exactly as long as one transcription.
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!(path = %staged.display(), error = %e, "failed to delete staged audio");
        }
        let transcript = transcript?;

        // Summarize before anything is persisted; a summarizer error must
        // not leave the revision log advanced on one side only.
        let summary = self.summarizer.summarize(&transcript.text).await?;

        let lock = self.meeting_lock(meeting_id).await;
        let _guard = lock.lock().await;

        let receipt = self
            .persist_revision_pair(meeting_id, &transcript, &summary, &key, &iv)
            .await?;

        {
            let db = self.db.lock().await;
            db.update_process_state(
                meeting_id,
                ProcessState::Completed,
                Some(&head_paths(meeting_id)),
                Some(duration_seconds),
            )?;
            db.set_active_version(meeting_id, receipt.version)?;
        }
        info!(
            id = %meeting_id,
            version = receipt.version,
            duration_seconds,
            "meeting processing completed"
        );
        Ok(())
    }

    /// Persist an edited transcript as the next revision and regenerate the
    /// matching summary under the same version number, so a later checkout
    /// restores a consistent pair.
    pub async fn save_transcript_revision(
        &self,
        meeting_id: &str,
        new_text: String,
        new_segments: Vec<TranscriptSegment>,
    ) -> Result<RevisionReceipt, PipelineError> {
        let (key, iv) = { self.db.lock().await.get_meeting_key(meeting_id)? };
        let artifact = TranscriptArtifact {
            text: new_text,
            segments: new_segments,
        };

        // Regenerate the summary before taking the critical section or
        // writing anything; an engine failure here leaves no trace.
        let summary = self.summarizer.summarize(&artifact.text).await?;

        let lock = self.meeting_lock(meeting_id).await;
        let _guard = lock.lock().await;

        let receipt = self
            .persist_revision_pair(meeting_id, &artifact, &summary, &key, &iv)
            .await?;

        let meeting = { self.db.lock().await.get_meeting(meeting_id)? };
        let mut paths = meeting.file_paths;
        paths.extend(head_paths(meeting_id));
        {
            let db = self.db.lock().await;
            db.update_process_state(meeting_id, meeting.process_state, Some(&paths), None)?;
            db.set_active_version(meeting_id, receipt.version)?;
        }

        info!(id = %meeting_id, version = receipt.version, "transcript revision saved");
        Ok(receipt)
    }

    /// Write head + snapshot blobs for a transcript/summary pair and append
    /// both revision rows in one transaction. The caller holds the
    /// per-meeting lock, which makes the latest+1 read-then-insert a
    /// critical section and serializes head-blob writers.
    async fn persist_revision_pair(
        &self,
        meeting_id: &str,
        transcript: &TranscriptArtifact,
        summary: &SummaryArtifact,
        key: &DataKey,
        iv: &FileIv,
    ) -> Result<RevisionReceipt, PipelineError> {
        let version = { self.db.lock().await.latest_version(meeting_id, ArtifactKind::Transcript)? } + 1;

        let transcript_snapshot = self
            .write_blobs(
                meeting_id,
                ArtifactKind::Transcript,
                version,
                &serde_json::to_vec(transcript)?,
                key,
                iv,
            )
            .await?;
        let summary_snapshot = self
            .write_blobs(
                meeting_id,
                ArtifactKind::Summary,
                version,
                &serde_json::to_vec(summary)?,
                key,
                iv,
            )
            .await?;

        let hash = content_hash(&transcript.text);
        {
            self.db.lock().await.add_revision_pair(
                meeting_id,
                version,
                &hash,
                &transcript_snapshot,
                &content_hash(&summary.summary),
                &summary_snapshot,
            )?;
        }

        Ok(RevisionReceipt { version, hash })
    }

    async fn write_blobs(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
        version: i64,
        payload: &[u8],
        key: &DataKey,
        iv: &FileIv,
    ) -> Result<String, PipelineError> {
        let head = format!("data/{meeting_id}_{kind}.enc");
        let snapshot = format!("data/{meeting_id}_{kind}_v{version}.enc");

        self.vault.encrypt_buffer_to_file(payload, &head, key, iv).await?;
        self.vault.encrypt_buffer_to_file(payload, &snapshot, key, iv).await?;

        Ok(snapshot)
    }

    /// Rebuild an old transcript revision as a brand-new version. History is
    /// append-only; the result is version N+1 whose content equals the
    /// reverted-to revision.
    pub async fn revert_to_revision(
        &self,
        meeting_id: &str,
        revision_id: i64,
    ) -> Result<RevisionReceipt, PipelineError> {
        let revision = { self.db.lock().await.get_revision(revision_id)? };
        if revision.meeting_id != meeting_id {
            return Err(greffier_store::StoreError::NotFound.into());
        }
        if revision.kind != ArtifactKind::Transcript {
            return Err(PipelineError::NotTranscriptRevision(revision_id));
        }

        let (key, iv) = { self.db.lock().await.get_meeting_key(meeting_id)? };
        let payload = self
            .vault
            .decrypt_buffer_from_file(&revision.file_path, &key, &iv)
            .await?;
        let artifact: TranscriptArtifact = serde_json::from_slice(&payload)?;

        self.save_transcript_revision(meeting_id, artifact.text, artifact.segments)
            .await
    }

    /// Point the meeting's head pointers at the snapshots of `version`.
    pub async fn checkout_to_version(&self, meeting_id: &str, version: i64) -> Result<(), PipelineError> {
        { self.db.lock().await.checkout_version(meeting_id, version)? };
        info!(id = %meeting_id, version, "checked out revision");
        Ok(())
    }

    /// Crypto-shred: remove key record, revisions, and meeting row, then
    /// unlink vault files best-effort. With the key gone the blobs are
    /// unreadable whether or not the unlink succeeds.
    pub async fn delete_meeting(&self, meeting_id: &str) -> Result<(), PipelineError> {
        let (paths, revisions) = {
            let db = self.db.lock().await;
            let meeting = db.get_meeting(meeting_id)?;
            let revisions = db.list_all_revisions(meeting_id)?;
            (meeting.file_paths, revisions)
        };

        { self.db.lock().await.delete_meeting(meeting_id)? };

        let mut targets: Vec<String> = paths.into_values().collect();
        targets.extend(revisions.into_iter().map(|r| r.file_path));
        targets.extend(head_paths(meeting_id).into_values());
        targets.sort();
        targets.dedup();

        for rel in targets {
            match self.vault.remove(&rel).await {
                Ok(()) | Err(VaultError::NotFound(_)) => {}
                Err(e) => warn!(id = %meeting_id, path = %rel, error = %e, "vault unlink failed"),
            }
        }

        self.meeting_locks.lock().await.remove(meeting_id);

        info!(id = %meeting_id, "meeting deleted and crypto-shredded");
        Ok(())
    }

    /// Re-enter `transcribing` after a failure (or to regenerate artifacts).
    /// Guarded so a run already in flight is not doubled: the state check
    /// and the claim happen under the per-meeting lock, and `transcribing`
    /// is written before the task is dispatched, so a racing retry observes
    /// the claim and is rejected.
    pub async fn resume_processing(self: &Arc<Self>, meeting_id: &str) -> Result<(), PipelineError> {
        let lock = self.meeting_lock(meeting_id).await;
        let _guard = lock.lock().await;

        let meeting = { self.db.lock().await.get_meeting(meeting_id)? };
        match meeting.process_state {
            ProcessState::Initializing => Err(PipelineError::InvalidState(
                "no recording has been ingested yet".to_string(),
            )),
            ProcessState::Transcribing => Err(PipelineError::InvalidState(
                "transcription is already in progress".to_string(),
            )),
            _ => {
                {
                    self.db.lock().await.update_process_state(
                        meeting_id,
                        ProcessState::Transcribing,
                        None,
                        None,
                    )?;
                }
                let this = Arc::clone(self);
                let id = meeting_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = this.process_meeting(&id).await {
                        error!(id = %id, error = %e, "retried processing failed");
                        this.mark_failed(&id).await;
                    }
                });
                Ok(())
            }
        }
    }

    async fn mark_failed(&self, meeting_id: &str) {
        let result = {
            self.db
                .lock()
                .await
                .update_process_state(meeting_id, ProcessState::Failed, None, None)
        };
        if let Err(e) = result {
            error!(id = %meeting_id, error = %e, "could not record failure state");
        }
    }
}

/// Canonical head pointers for a meeting's three artifacts.
fn head_paths(meeting_id: &str) -> HashMap<String, String> {
    let mut paths = HashMap::new();
    paths.insert("audio".to_string(), format!("audio/{meeting_id}.enc"));
    paths.insert(
        "transcript".to_string(),
        format!("data/{meeting_id}_transcript.enc"),
    );
    paths.insert(
        "summary".to_string(),
        format!("data/{meeting_id}_summary.enc"),
    );
    paths
}
