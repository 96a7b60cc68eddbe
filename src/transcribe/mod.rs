use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_transcribe::Client as TranscribeClient;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::config::TranscriptionConfig;
use crate::utils::{format_timestamp, join_front_matter, write_atomic};

pub mod processor;

/// Longest span grouped into one transcript paragraph, in seconds
const MAX_SEGMENT_SECONDS: f64 = 30.0;

/// Where and how a transcript is written
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    /// Directory receiving `<stem>.md` and `<stem>.json`
    pub output_dir: PathBuf,

    pub stem: String,

    pub speaker_labels: bool,

    pub max_speakers: Option<u8>,
}

/// Speech to text for one audio file; returns the transcript path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<String>,
        options: &TranscribeOptions,
    ) -> Result<PathBuf>;
}

/// Individual transcript segment with timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start_time: f64,

    /// End time in seconds
    pub end_time: f64,

    pub text: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: Option<f64>,

    /// Speaker ID (if speaker identification is enabled)
    pub speaker_id: Option<String>,
}

/// Metadata about the transcription process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionMetadata {
    /// AWS Transcribe job ID
    pub job_id: String,

    /// Language detected/used
    pub language: String,

    /// Processing time in seconds
    pub processing_duration: Option<f64>,

    /// Audio duration in seconds
    pub audio_duration: Option<f64>,

    /// Overall confidence score
    pub confidence: Option<f64>,

    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Transcription through S3 + AWS Transcribe
pub struct AwsTranscriber {
    config: TranscriptionConfig,
    s3_client: S3Client,
    transcribe_client: TranscribeClient,
}

impl AwsTranscriber {
    pub async fn new(config: TranscriptionConfig) -> Result<Self> {
        if config.s3_bucket.is_empty() {
            anyhow::bail!("transcription.s3_bucket must be configured");
        }

        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        Ok(Self {
            s3_client: S3Client::new(&aws_config),
            transcribe_client: TranscribeClient::new(&aws_config),
            config,
        })
    }

    /// Upload audio file to S3
    async fn upload_to_s3(&self, audio_path: &Path) -> Result<String> {
        let extension = audio_extension(audio_path);
        let key = format!(
            "{}audio_{}_{}.{}",
            self.config.s3_key_prefix.as_deref().unwrap_or(""),
            Uuid::new_v4(),
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            extension
        );

        tracing::info!("Uploading audio to S3: s3://{}/{}", self.config.s3_bucket, key);

        let content = fs_err::read(audio_path)?;

        self.s3_client
            .put_object()
            .bucket(&self.config.s3_bucket)
            .key(&key)
            .body(content.into())
            .content_type(mime_type(&extension))
            .send()
            .await
            .context("Failed to upload audio to S3")?;

        Ok(key)
    }

    async fn start_transcription_job(
        &self,
        s3_key: &str,
        extension: &str,
        language: Option<&str>,
        options: &TranscribeOptions,
    ) -> Result<String> {
        use aws_sdk_transcribe::types::{LanguageCode, Media, MediaFormat, Settings};

        let job_name = format!("podcaster_{}", Uuid::new_v4());
        let media_uri = format!("s3://{}/{}", self.config.s3_bucket, s3_key);

        tracing::info!("Starting transcription job: {}", job_name);

        let media = Media::builder().media_file_uri(media_uri).build();

        let mut job_builder = self
            .transcribe_client
            .start_transcription_job()
            .transcription_job_name(&job_name)
            .media_format(MediaFormat::from(extension))
            .media(media);

        if let Some(lang) = language.or(self.config.language.as_deref()) {
            tracing::debug!("Using language: {}", lang);
            job_builder = job_builder.language_code(LanguageCode::from(lang));
        } else {
            tracing::debug!("Using automatic language detection");
            job_builder = job_builder.identify_language(true);
        }

        if options.speaker_labels || self.config.speaker_labels {
            // AWS supports 2-10 speakers
            let requested = options
                .max_speakers
                .or(self.config.max_speakers)
                .unwrap_or(10);
            let clamped = requested.clamp(2, 10);
            if clamped != requested {
                tracing::warn!(
                    "Max speakers clamped from {} to {} (AWS supports 2-10)",
                    requested,
                    clamped
                );
            }
            let settings = Settings::builder()
                .show_speaker_labels(true)
                .max_speaker_labels(clamped as i32)
                .build();
            job_builder = job_builder.settings(settings);
        }

        job_builder
            .send()
            .await
            .context("Failed to start transcription job")?;

        Ok(job_name)
    }

    /// Clean up S3 object
    async fn cleanup_s3(&self, s3_key: &str) {
        tracing::debug!("Cleaning up S3 object: {}", s3_key);

        if let Err(e) = self
            .s3_client
            .delete_object()
            .bucket(&self.config.s3_bucket)
            .key(s3_key)
            .send()
            .await
        {
            tracing::warn!("Failed to clean up s3://{}/{}: {}", self.config.s3_bucket, s3_key, e);
        }
    }
}

#[async_trait]
impl Transcriber for AwsTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<String>,
        options: &TranscribeOptions,
    ) -> Result<PathBuf> {
        let extension = audio_extension(audio);
        let s3_key = self.upload_to_s3(audio).await?;

        let job = self
            .start_transcription_job(&s3_key, &extension, language.as_deref(), options)
            .await;
        let result = match job {
            Ok(job_id) => {
                processor::TranscriptionProcessor::new(
                    self.transcribe_client.clone(),
                    job_id,
                    MAX_SEGMENT_SECONDS,
                    Duration::from_secs(self.config.max_wait_secs),
                )
                .wait_for_completion()
                .await
            }
            Err(e) => Err(e),
        };

        // The uploaded copy is removed whether or not the job succeeded
        self.cleanup_s3(&s3_key).await;
        let result = result?;

        write_transcript(
            &options.output_dir,
            &options.stem,
            audio,
            &result.transcript,
            &result.segments,
            &result.metadata,
        )
    }
}

/// Write `<stem>.md` (readable transcript) and `<stem>.json` (segments)
pub fn write_transcript(
    output_dir: &Path,
    stem: &str,
    audio: &Path,
    transcript: &str,
    segments: &[TranscriptSegment],
    metadata: &TranscriptionMetadata,
) -> Result<PathBuf> {
    let markdown_path = output_dir.join(format!("{}.md", stem));
    let json_path = output_dir.join(format!("{}.json", stem));

    let json = serde_json::to_string_pretty(&serde_json::json!({
        "metadata": metadata,
        "segments": segments,
    }))?;
    write_atomic(&json_path, json.as_bytes())
        .with_context(|| format!("Failed to write {}", json_path.display()))?;

    let header = serde_yaml::to_string(&serde_json::json!({
        "source_audio": audio.display().to_string(),
        "job_id": metadata.job_id,
        "language": metadata.language,
        "duration": metadata.audio_duration.map(format_timestamp),
        "transcribed_at": metadata.completed_at.to_rfc3339(),
    }))?;
    let body = render_transcript_body(transcript, segments);
    write_atomic(&markdown_path, join_front_matter(&header, &body).as_bytes())
        .with_context(|| format!("Failed to write {}", markdown_path.display()))?;

    Ok(markdown_path)
}

/// One paragraph per segment, prefixed with its start time. Falls back to the
/// plain transcript when no segments were produced.
pub fn render_transcript_body(transcript: &str, segments: &[TranscriptSegment]) -> String {
    if segments.is_empty() {
        return format!("{}\n", transcript.trim());
    }

    segments
        .iter()
        .map(|s| match &s.speaker_id {
            Some(speaker) => format!("[{}] {}: {}", format_timestamp(s.start_time), speaker, s.text),
            None => format!("[{}] {}", format_timestamp(s.start_time), s.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
        + "\n"
}

fn audio_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "mp3".to_string())
}

fn mime_type(extension: &str) -> &'static str {
    match extension {
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::split_front_matter;
    use tempfile::TempDir;

    fn segment(start: f64, text: &str, speaker: Option<&str>) -> TranscriptSegment {
        TranscriptSegment {
            start_time: start,
            end_time: start + 1.0,
            text: text.to_string(),
            confidence: None,
            speaker_id: speaker.map(String::from),
        }
    }

    #[test]
    fn test_render_body_prefixes_timestamps() {
        let body = render_transcript_body(
            "ignored",
            &[segment(0.0, "Hello.", None), segment(65.0, "Next.", Some("spk_1"))],
        );
        assert_eq!(body, "[00:00:00] Hello.\n\n[00:01:05] spk_1: Next.\n");
        assert_eq!(render_transcript_body(" plain ", &[]), "plain\n");
    }

    #[test]
    fn test_write_transcript_creates_markdown_and_json() {
        let dir = TempDir::new().unwrap();
        let metadata = TranscriptionMetadata {
            job_id: "job-1".to_string(),
            language: "pt-BR".to_string(),
            processing_duration: None,
            audio_duration: Some(61.0),
            confidence: None,
            completed_at: chrono::Utc::now(),
        };
        let path = write_transcript(
            dir.path(),
            "lesson01",
            Path::new("/a/lesson01.mp3"),
            "Hello.",
            &[segment(0.0, "Hello.", None)],
            &metadata,
        )
        .unwrap();

        assert_eq!(path, dir.path().join("lesson01.md"));
        let content = fs_err::read_to_string(&path).unwrap();
        let (header, body) = split_front_matter(&content);
        assert!(header.unwrap().contains("job_id: job-1"));
        assert_eq!(body, "[00:00:00] Hello.\n");
        assert!(dir.path().join("lesson01.json").exists());
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type("mp3"), "audio/mpeg");
        assert_eq!(mime_type("xyz"), "application/octet-stream");
    }
}
