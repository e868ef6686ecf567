//! Transcription engine adapter.
//!
//! The engine is an external process taking the path of a decrypted audio
//! file and printing a JSON object on stdout, usually surrounded by log
//! noise on both streams. The adapter owns all the tolerance: it carves the
//! outermost `{...}` out of stdout, accepts a non-zero exit code when valid
//! JSON was still produced, treats a top-level `error` key as a failure
//! report, and applies the "my name is ..." speaker identification pass so
//! stored transcripts already carry final display names.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tracing::warn;

use greffier_shared::{TranscriptArtifact, TranscriptSegment};

use crate::error::PipelineError;

/// Only the opening minute of a meeting is scanned for introductions.
const INTRO_WINDOW_SECONDS: f64 = 60.0;

static SPEAKER_INTRO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bmy\s+name\s+is\s+([a-z][a-z\s]*?)(?:\s+and\s+my\s+id\s+is\s+(\w+))?(?:[.,!?]|$)")
        .expect("speaker intro regex compiles")
});

pub struct Transcriber {
    command: Option<String>,
}

impl Transcriber {
    /// `command` is the engine executable; `None` enables the development
    /// mock.
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    pub async fn transcribe(&self, audio_path: &Path) -> Result<TranscriptArtifact, PipelineError> {
        let Some(command) = &self.command else {
            warn!("TRANSCRIBER_CMD is not set; serving MOCK transcript (development only)");
            return Ok(mock_transcript());
        };

        let output = match Command::new(command).arg(audio_path).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    command = %command,
                    "transcription engine binary missing; serving MOCK transcript (development only)"
                );
                return Ok(mock_transcript());
            }
            Err(e) => {
                return Err(PipelineError::Transcriber(format!(
                    "failed to spawn '{command}': {e}"
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // A non-zero exit is tolerated as long as stdout still carries a
        // parseable result object.
        let Some(json) = extract_outer_json(&stdout) else {
            return Err(PipelineError::Transcriber(format!(
                "engine produced no JSON (exit {:?}): {}",
                output.status.code(),
                tail(&stderr)
            )));
        };

        let value: Value = serde_json::from_str(json).map_err(|e| {
            PipelineError::Transcriber(format!("engine JSON unparseable ({e}): {}", tail(&stderr)))
        })?;

        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(PipelineError::Transcriber(message.to_string()));
        }

        let mut artifact: TranscriptArtifact = serde_json::from_value(value).map_err(|e| {
            PipelineError::Transcriber(format!("engine JSON has unexpected shape: {e}"))
        })?;

        identify_speakers(&mut artifact.segments);

        if artifact.text.is_empty() {
            artifact.text = artifact
                .segments
                .iter()
                .map(|s| s.text.trim())
                .collect::<Vec<_>>()
                .join(" ");
        }

        Ok(artifact)
    }
}

/// Carve the outermost JSON object out of a noisy stdout stream.
fn extract_outer_json(stdout: &str) -> Option<&str> {
    let start = stdout.find('{')?;
    let end = stdout.rfind('}')?;
    (end >= start).then(|| &stdout[start..=end])
}

/// Scan the intro window for "my name is <Name> [and my id is <ID>]" and
/// rename the matching diarized speaker everywhere. First match per raw
/// speaker label wins.
fn identify_speakers(segments: &mut [TranscriptSegment]) {
    let mut names: HashMap<String, String> = HashMap::new();

    for segment in segments.iter() {
        if segment.start > INTRO_WINDOW_SECONDS {
            continue;
        }
        let Some(raw_speaker) = &segment.speaker else {
            continue;
        };
        if names.contains_key(raw_speaker) {
            continue;
        }
        if let Some(caps) = SPEAKER_INTRO.captures(&segment.text) {
            let name = caps[1].trim();
            if name.len() > 1 && name.len() < 50 {
                let mut display = title_case(name);
                if let Some(id) = caps.get(2) {
                    display = format!("{display} {}", id.as_str());
                }
                names.insert(raw_speaker.clone(), display);
            }
        }
    }

    if names.is_empty() {
        return;
    }
    for segment in segments.iter_mut() {
        if let Some(speaker) = &segment.speaker {
            if let Some(display) = names.get(speaker) {
                segment.speaker = Some(display.clone());
            }
        }
    }
}

fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    match trimmed.char_indices().rev().nth(399) {
        Some((idx, _)) => format!("...{}", &trimmed[idx..]),
        None => trimmed.to_string(),
    }
}

fn mock_transcript() -> TranscriptArtifact {
    let text = "This is a development mock transcript.".to_string();
    TranscriptArtifact {
        text: text.clone(),
        segments: vec![TranscriptSegment {
            start: 0.0,
            end: 2.5,
            text,
            speaker: Some("Speaker".to_string()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, text: &str, speaker: Option<&str>) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end: start + 5.0,
            text: text.to_string(),
            speaker: speaker.map(str::to_string),
        }
    }

    #[test]
    fn extracts_json_between_log_noise() {
        let stdout = "loading model...\n{\"text\": \"hi\", \"segments\": []}\ndone\n";
        assert_eq!(
            extract_outer_json(stdout),
            Some("{\"text\": \"hi\", \"segments\": []}")
        );
    }

    #[test]
    fn no_json_yields_none() {
        assert_eq!(extract_outer_json("no braces here"), None);
        assert_eq!(extract_outer_json("} backwards {"), None);
    }

    #[test]
    fn nested_objects_stay_intact() {
        let stdout = "x{\"a\": {\"b\": 1}}y";
        assert_eq!(extract_outer_json(stdout), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn name_only_introduction() {
        let mut segments = vec![
            segment(3.0, "My name is John Doe, hello.", Some("SPK_00")),
            segment(10.0, "And the agenda today...", Some("SPK_00")),
        ];
        identify_speakers(&mut segments);
        assert_eq!(segments[0].speaker.as_deref(), Some("John Doe"));
        assert_eq!(segments[1].speaker.as_deref(), Some("John Doe"));
    }

    #[test]
    fn name_and_id_introduction() {
        let mut segments = vec![segment(2.0, "My name is Jane and my id is 123.", Some("SPK_01"))];
        identify_speakers(&mut segments);
        assert_eq!(segments[0].speaker.as_deref(), Some("Jane 123"));
    }

    #[test]
    fn introduction_with_trailing_punctuation() {
        let mut segments = vec![segment(1.0, "Hello my name is Bob.", Some("SPK_02"))];
        identify_speakers(&mut segments);
        assert_eq!(segments[0].speaker.as_deref(), Some("Bob"));
    }

    #[test]
    fn late_introduction_ignored() {
        let mut segments = vec![segment(61.0, "My name is Alice.", Some("SPK_03"))];
        identify_speakers(&mut segments);
        assert_eq!(segments[0].speaker.as_deref(), Some("SPK_03"));
    }

    #[test]
    fn first_match_per_speaker_wins() {
        let mut segments = vec![
            segment(1.0, "My name is Carol.", Some("SPK_00")),
            segment(5.0, "Actually my name is Eve.", Some("SPK_00")),
        ];
        identify_speakers(&mut segments);
        assert_eq!(segments[0].speaker.as_deref(), Some("Carol"));
        assert_eq!(segments[1].speaker.as_deref(), Some("Carol"));
    }

    #[test]
    fn overlong_names_rejected() {
        let long = format!("My name is {}.", "a ".repeat(40));
        let mut segments = vec![segment(1.0, &long, Some("SPK_00"))];
        identify_speakers(&mut segments);
        assert_eq!(segments[0].speaker.as_deref(), Some("SPK_00"));
    }

    #[test]
    fn title_casing() {
        assert_eq!(title_case("john doe"), "John Doe");
        assert_eq!(title_case("ALICE"), "Alice");
    }

    #[tokio::test]
    async fn absent_engine_falls_back_to_mock() {
        let transcriber = Transcriber::new(None);
        let artifact = transcriber.transcribe(Path::new("/tmp/none.mp3")).await.unwrap();
        assert!(!artifact.text.is_empty());
        assert!(!artifact.segments.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_falls_back_to_mock() {
        let transcriber = Transcriber::new(Some("/definitely/not/a/binary".to_string()));
        let artifact = transcriber.transcribe(Path::new("/tmp/none.mp3")).await.unwrap();
        assert!(!artifact.text.is_empty());
    }
}
