//! FFmpeg transcode and probe helpers.
//!
//! The provider may hand back raw PCM, mixed video, or already-compressed
//! audio; everything funnels through one `ffmpeg` invocation that reads the
//! provider bytes on stdin and emits MP3 frames on stdout, so the vault only
//! ever stores one audio format.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

use crate::error::PipelineError;

pub struct TranscodePipeline {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Spawn `ffmpeg` reading arbitrary media on stdin and writing MP3 on
/// stdout. stderr is drained to the log in the background; diagnostics must
/// not stall the pipe.
pub fn spawn_mp3_transcode() -> Result<TranscodePipeline, PipelineError> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-codec:a",
            "libmp3lame",
            "-b:a",
            "128k",
            "-f",
            "mp3",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PipelineError::Ingest(format!("failed to spawn ffmpeg: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PipelineError::Ingest("ffmpeg stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::Ingest("ffmpeg stdout unavailable".to_string()))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(engine = "ffmpeg", "{line}");
            }
        });
    }

    Ok(TranscodePipeline {
        child,
        stdin,
        stdout,
    })
}

/// Measure a media file's duration in whole seconds via `ffprobe`.
pub async fn probe_duration_seconds(path: &Path) -> Result<i64, PipelineError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| PipelineError::Ingest(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(PipelineError::Ingest(format!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let seconds: f64 = text
        .trim()
        .parse()
        .map_err(|_| PipelineError::Ingest(format!("unparseable ffprobe duration '{}'", text.trim())))?;
    Ok(seconds.round() as i64)
}
