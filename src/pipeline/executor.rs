use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::ai::{clean_output, AiBackend, OpenAiBackend};
use crate::config::Config;
use crate::conversation::{
    fill_template, ConversationSession, ConversationSettings, DEFAULT_INSTRUCTIONS,
};
use crate::feed::{EpisodeMetadata, FeedPublisher, RssFeed};
use crate::item::{ItemDescriptor, Stage};
use crate::media::{
    render_transcript_chapters, transcript_chapters, AudioExtractor, AudioOptions, FfmpegExtractor,
    FfprobeTimestamps, TimestampGenerator,
};
use crate::publish::{object_key, GitPublisher, RemoteStorage, S3Storage, Vcs};
use crate::transcribe::{AwsTranscriber, TranscribeOptions, Transcriber};
use crate::tts::{EdgeTts, SpeechCleaner, TtsEngine, VoiceOptions};
use crate::utils::{
    join_front_matter, sanitize_filename, split_front_matter, title_from_stem, truncate_text,
    write_atomic,
};

/// Whether retrying a failed stage can help
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Collaborator error: network, subprocess exit code, rate limit
    Transient,
    /// Retrying cannot succeed without someone changing the inputs
    Permanent,
}

/// Uniform failure result of a stage execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl From<anyhow::Error> for StageFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{:#}", err))
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The external tools and services the stages delegate to
pub struct Collaborators {
    pub audio: Box<dyn AudioExtractor>,
    pub transcriber: Box<dyn Transcriber>,
    pub ai: Box<dyn AiBackend>,
    pub timestamps: Box<dyn TimestampGenerator>,
    pub tts: Box<dyn TtsEngine>,
    pub feed: Box<dyn FeedPublisher>,
    pub storage: Box<dyn RemoteStorage>,
    pub vcs: Box<dyn Vcs>,
}

impl Collaborators {
    /// Production collaborators. Services that cannot be set up (missing
    /// bucket, missing API key) are replaced by stand-ins that fail every
    /// call, so stages that do not need them still run.
    pub async fn from_config(config: &Config) -> Self {
        let transcriber: Box<dyn Transcriber> =
            match AwsTranscriber::new(config.transcription.clone()).await {
                Ok(t) => Box::new(t),
                Err(e) => Box::new(Unconfigured::new("transcription", e)),
            };

        let ai: Box<dyn AiBackend> = match OpenAiBackend::new(&config.ai) {
            Ok(backend) => Box::new(backend),
            Err(e) => Box::new(Unconfigured::new("AI backend", e)),
        };

        let storage: Box<dyn RemoteStorage> = match S3Storage::new(config.storage.clone()).await {
            Ok(s) => Box::new(s),
            Err(e) => Box::new(Unconfigured::new("storage", e)),
        };

        Self {
            audio: Box::new(FfmpegExtractor::new()),
            transcriber,
            ai,
            timestamps: Box::new(FfprobeTimestamps::new(config.timestamps.heading.clone())),
            tts: Box::new(EdgeTts::new(config.tts.command.clone())),
            feed: Box::new(RssFeed::new(config.feed.clone())),
            storage,
            vcs: Box::new(GitPublisher::new(&config.publish)),
        }
    }
}

/// Stand-in for a collaborator whose setup failed
struct Unconfigured {
    what: &'static str,
    reason: String,
}

impl Unconfigured {
    fn new(what: &'static str, err: anyhow::Error) -> Self {
        tracing::debug!("{} unavailable: {:#}", what, err);
        Self {
            what,
            reason: format!("{:#}", err),
        }
    }

    fn error<T>(&self) -> Result<T> {
        anyhow::bail!("{} is not configured: {}", self.what, self.reason)
    }
}

#[async_trait]
impl Transcriber for Unconfigured {
    async fn transcribe(&self, _: &Path, _: Option<String>, _: &TranscribeOptions) -> Result<PathBuf> {
        self.error()
    }
}

#[async_trait]
impl AiBackend for Unconfigured {
    async fn complete(&self, _: &str) -> Result<String> {
        self.error()
    }
}

#[async_trait]
impl RemoteStorage for Unconfigured {
    async fn upload(&self, _: &Path, _: &str) -> Result<String> {
        self.error()
    }
}

/// Runs one stage for one lesson: resolves inputs from earlier artifacts,
/// calls the collaborator and returns the new artifact.
pub struct StageExecutor {
    config: Config,
    collaborators: Collaborators,
    speech: SpeechCleaner,
}

impl StageExecutor {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        Ok(Self {
            config,
            collaborators,
            speech: SpeechCleaner::new().context("Failed to build Markdown cleaner")?,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Directory holding every derived file of the lesson's course
    pub fn workspace(&self, item: &ItemDescriptor) -> PathBuf {
        let dir = item
            .identity
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        dir.join(&self.config.pipeline.workspace_dir)
    }

    /// `<workspace>/<kind>/<stem>.<ext>`
    pub fn output_path(&self, item: &ItemDescriptor, kind: &str, ext: &str) -> PathBuf {
        self.workspace(item)
            .join(kind)
            .join(format!("{}.{}", item.stem(), ext))
    }

    pub async fn execute(&self, item: &ItemDescriptor, stage: Stage) -> Result<String, StageFailure> {
        let artifact = match stage {
            Stage::AudioExtracted => self.extract_audio(item).await?,
            Stage::Transcribed => self.transcribe(item).await?,
            Stage::AiProcessed => self.process_with_ai(item).await?,
            Stage::TimestampsGenerated => self.generate_timestamps(item).await?,
            Stage::TtsGenerated => self.narrate(item).await?,
            Stage::FeedUpdated => self.update_feed(item).await?,
            Stage::Uploaded => self.upload(item).await?,
            Stage::Published => self.publish(item).await?,
        };
        Ok(artifact)
    }

    /// Artifact of an earlier stage
    fn input(&self, item: &ItemDescriptor, stage: Stage) -> Result<PathBuf, StageFailure> {
        item.artifact(stage).map(PathBuf::from).ok_or_else(|| {
            StageFailure::permanent(format!("No {} artifact recorded", stage))
        })
    }

    async fn extract_audio(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let options = AudioOptions {
            output: self.output_path(item, "audio", "mp3"),
            bitrate: self.config.audio.bitrate.clone(),
            sample_rate: self.config.audio.sample_rate,
        };
        let audio = self
            .collaborators
            .audio
            .extract(&item.identity, &options)
            .await?;
        Ok(audio.display().to_string())
    }

    async fn transcribe(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let audio = self.input(item, Stage::AudioExtracted)?;
        let options = TranscribeOptions {
            output_dir: self.workspace(item).join("transcripts"),
            stem: item.stem(),
            speaker_labels: self.config.transcription.speaker_labels,
            max_speakers: self.config.transcription.max_speakers,
        };
        let transcript = self
            .collaborators
            .transcriber
            .transcribe(&audio, self.config.transcription.language.clone(), &options)
            .await?;
        Ok(transcript.display().to_string())
    }

    async fn process_with_ai(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let transcript_path = self.input(item, Stage::Transcribed)?;
        let content = fs_err::read_to_string(&transcript_path)
            .with_context(|| format!("Failed to read transcript {}", transcript_path.display()))?;
        let (header, transcript) = split_front_matter(&content);
        if transcript.trim().is_empty() {
            return Err(StageFailure::permanent(format!(
                "Transcript {} is empty",
                transcript_path.display()
            )));
        }

        let ai = &self.config.ai;
        let instructions = match &ai.prompt_file {
            Some(path) => {
                let template = fs_err::read_to_string(path)
                    .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
                prompt_instructions(&template, item, header)
            }
            None => DEFAULT_INSTRUCTIONS.to_string(),
        };

        let mut session = ConversationSession::new(
            transcript,
            ai.chunk_max_chars(),
            ConversationSettings::from_config(ai, instructions),
        );
        tracing::info!(
            "{}: sending transcript in {} part(s)",
            item.stem(),
            session.chunk_count()
        );

        session
            .run(
                self.collaborators.ai.as_ref(),
                ai.request_retries,
                ai.retry_backoff_ms,
            )
            .await?;
        let body = clean_output(&session.assemble()?);

        let output = self.output_path(item, "processed", "md");
        let header = serde_yaml::to_string(&serde_json::json!({
            "title": title_from_stem(&item.stem()),
            "course": item.course,
            "source": transcript_path.display().to_string(),
            "model": ai.model,
            "chunks": session.chunk_count(),
            "processed_at": chrono::Utc::now().to_rfc3339(),
        }))
        .context("Failed to serialize AI output header")?;
        write_atomic(&output, join_front_matter(&header, &body).as_bytes())
            .with_context(|| format!("Failed to write {}", output.display()))?;

        Ok(output.display().to_string())
    }

    async fn generate_timestamps(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let transcript = self.input(item, Stage::Transcribed)?;
        let chapters = transcript_chapters(&transcript)
            .with_context(|| format!("Failed to read timing of {}", transcript.display()))?;

        let doc = if chapters.is_empty() {
            // Untimed transcript: one chapter spanning the whole audio
            let audio = self.input(item, Stage::AudioExtracted)?;
            self.collaborators
                .timestamps
                .generate(&[audio], &item.course)
                .await?
        } else {
            render_transcript_chapters(
                &self.config.timestamps.heading,
                &item.course,
                &title_from_stem(&item.stem()),
                &chapters,
            )
        };

        let output = self.output_path(item, "timestamps", "md");
        write_atomic(&output, doc.as_bytes())
            .with_context(|| format!("Failed to write {}", output.display()))?;
        Ok(output.display().to_string())
    }

    async fn narrate(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let processed = self.input(item, Stage::AiProcessed)?;
        let markdown = fs_err::read_to_string(&processed)
            .with_context(|| format!("Failed to read {}", processed.display()))?;
        let text = self.speech.clean(&markdown);
        if text.is_empty() {
            return Err(StageFailure::permanent(format!(
                "{} has no narratable text",
                processed.display()
            )));
        }

        let output = self.output_path(item, "tts", "mp3");
        let audio = self
            .collaborators
            .tts
            .synthesize(&text, &VoiceOptions::from(&self.config.tts), &output)
            .await?;
        Ok(audio.display().to_string())
    }

    async fn update_feed(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let narration = self.input(item, Stage::TtsGenerated)?;
        let length = fs_err::metadata(&narration)
            .with_context(|| format!("Cannot stat {}", narration.display()))?
            .len();

        let description = match item.artifact(Stage::AiProcessed) {
            Some(path) => fs_err::read_to_string(path)
                .map(|markdown| summary(&markdown))
                .unwrap_or_default(),
            None => String::new(),
        };

        let episode = EpisodeMetadata {
            guid: format!("{}/{}", item.course, item.stem()),
            title: title_from_stem(&item.stem()),
            description,
            audio_url: enclosure_url(&self.config, item, &narration),
            length,
            pub_date: chrono::Utc::now().to_rfc2822(),
            duration: None,
        };

        let feed_path = self.config.feed_path(&self.workspace(item));
        self.collaborators
            .feed
            .add_episode(&feed_path, &episode)
            .await?;
        Ok(feed_path.display().to_string())
    }

    async fn upload(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let narration = self.input(item, Stage::TtsGenerated)?;
        let remote = self
            .collaborators
            .storage
            .upload(&narration, &remote_destination(item, &narration))
            .await?;
        Ok(remote)
    }

    async fn publish(&self, item: &ItemDescriptor) -> Result<String, StageFailure> {
        let feed = self.input(item, Stage::FeedUpdated)?;
        let message = self
            .config
            .publish
            .commit_message
            .replace("{course}", &item.course)
            .replace("{lesson}", &title_from_stem(&item.stem()));

        self.collaborators.vcs.publish(&[feed.clone()], &message).await?;

        Ok(self
            .config
            .publish
            .public_feed_url
            .clone()
            .unwrap_or_else(|| feed.display().to_string()))
    }
}

/// `<course>/<file name>` of an uploaded narration
fn remote_destination(item: &ItemDescriptor, narration: &Path) -> String {
    let file = narration
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.mp3", item.stem()));
    format!("{}/{}", sanitize_filename(&item.course), sanitize_filename(&file))
}

/// Public URL of the uploaded narration: the storage key the upload writes,
/// served from `feed.media_base_url`
fn enclosure_url(config: &Config, item: &ItemDescriptor, narration: &Path) -> String {
    let key = object_key(
        config.storage.prefix.as_deref(),
        &remote_destination(item, narration),
    );
    let encoded = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", config.feed.media_base_url.trim_end_matches('/'), encoded)
}

/// Prompt template with lesson details filled in. The transcript itself
/// travels in the conversation parts, so `{{TRANSCRIPTION}}` is dropped.
fn prompt_instructions(template: &str, item: &ItemDescriptor, transcript_header: Option<&str>) -> String {
    let file_name = item
        .identity
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let duration = transcript_header
        .and_then(|h| serde_yaml::from_str::<serde_yaml::Value>(h).ok())
        .and_then(|header| header.get("duration")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "00:00:00".to_string());
    let lesson = title_from_stem(&item.stem());

    fill_template(
        template,
        &[
            ("TRANSCRIPTION", ""),
            ("COURSE_NAME", item.course.as_str()),
            ("LESSON_TITLE", lesson.as_str()),
            ("FILE_NAME", file_name.as_str()),
            ("DURATION", duration.as_str()),
        ],
    )
}

/// First prose paragraph of a Markdown document, shortened for feed readers
fn summary(markdown: &str) -> String {
    let (_, body) = split_front_matter(markdown);
    body.split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.starts_with('#') && !p.starts_with("```"))
        .map(|p| truncate_text(&p.lines().collect::<Vec<_>>().join(" "), 300))
        .unwrap_or_default()
}
