#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use course_podcaster::ai::AiBackend;
use course_podcaster::feed::{EpisodeMetadata, FeedPublisher};
use course_podcaster::media::{AudioExtractor, AudioOptions, TimestampGenerator};
use course_podcaster::publish::{RemoteStorage, Vcs};
use course_podcaster::transcribe::{TranscribeOptions, Transcriber};
use course_podcaster::tts::{TtsEngine, VoiceOptions};
use course_podcaster::{BatchCoordinator, Collaborators, Config, PipelineRunner, StageExecutor};

/// Total number of collaborator calls made by a set of fakes
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Which lessons (by file stem) should fail at which collaborator
#[derive(Clone, Default)]
pub struct Failures {
    pub transcriber: Option<String>,
    pub ai: Option<String>,
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(path, contents)?;
    Ok(())
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

struct FakeAudio(Calls);

#[async_trait]
impl AudioExtractor for FakeAudio {
    async fn extract(&self, _video: &Path, options: &AudioOptions) -> Result<PathBuf> {
        self.0.hit();
        write_file(&options.output, b"ID3 fake mp3")?;
        Ok(options.output.clone())
    }
}

struct FakeTranscriber {
    calls: Calls,
    fail_for: Option<String>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        _language: Option<String>,
        options: &TranscribeOptions,
    ) -> Result<PathBuf> {
        self.calls.hit();
        if self.fail_for.as_deref() == Some(stem(audio).as_str()) {
            anyhow::bail!("transcription job failed for {}", options.stem);
        }
        let path = options.output_dir.join(format!("{}.md", options.stem));
        let body = format!(
            "---\ntitle: {}\n---\n[00:00:00] Transcript of {}. Ownership and borrowing.\n",
            options.stem, options.stem
        );
        write_file(&path, body.as_bytes())?;
        Ok(path)
    }
}

struct FakeAi {
    calls: Calls,
    fail_for: Option<String>,
}

#[async_trait]
impl AiBackend for FakeAi {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.hit();
        if let Some(lesson) = &self.fail_for {
            if prompt.contains(&format!("Transcript of {}.", lesson)) {
                anyhow::bail!("429 Too Many Requests");
            }
        }
        Ok("## Notes\n\nThis lesson covers ownership.\n".to_string())
    }
}

struct FakeTimestamps(Calls);

#[async_trait]
impl TimestampGenerator for FakeTimestamps {
    async fn generate(&self, audio: &[PathBuf], course: &str) -> Result<String> {
        self.0.hit();
        Ok(format!(
            "## Timestamps - {}\n\n- 00:00:00 {}\n",
            course,
            audio.first().map(|p| stem(p)).unwrap_or_default()
        ))
    }
}

struct FakeTts(Calls);

#[async_trait]
impl TtsEngine for FakeTts {
    async fn synthesize(&self, text: &str, _voice: &VoiceOptions, output: &Path) -> Result<PathBuf> {
        self.0.hit();
        write_file(output, text.as_bytes())?;
        Ok(output.to_path_buf())
    }
}

struct FakeFeed(Calls);

#[async_trait]
impl FeedPublisher for FakeFeed {
    async fn add_episode(&self, feed_path: &Path, episode: &EpisodeMetadata) -> Result<()> {
        self.0.hit();
        let mut existing = fs_err::read_to_string(feed_path).unwrap_or_default();
        existing.push_str(&format!("{}\n", episode.guid));
        write_file(feed_path, existing.as_bytes())
    }
}

struct FakeStorage(Calls);

#[async_trait]
impl RemoteStorage for FakeStorage {
    async fn upload(&self, _path: &Path, destination: &str) -> Result<String> {
        self.0.hit();
        Ok(format!("s3://episodes/{}", destination))
    }
}

struct FakeVcs(Calls);

#[async_trait]
impl Vcs for FakeVcs {
    async fn publish(&self, _paths: &[PathBuf], _commit_message: &str) -> Result<()> {
        self.0.hit();
        Ok(())
    }
}

pub fn collaborators(calls: &Calls, failures: &Failures) -> Collaborators {
    Collaborators {
        audio: Box::new(FakeAudio(calls.clone())),
        transcriber: Box::new(FakeTranscriber {
            calls: calls.clone(),
            fail_for: failures.transcriber.clone(),
        }),
        ai: Box::new(FakeAi {
            calls: calls.clone(),
            fail_for: failures.ai.clone(),
        }),
        timestamps: Box::new(FakeTimestamps(calls.clone())),
        tts: Box::new(FakeTts(calls.clone())),
        feed: Box::new(FakeFeed(calls.clone())),
        storage: Box::new(FakeStorage(calls.clone())),
        vcs: Box::new(FakeVcs(calls.clone())),
    }
}

/// Defaults with the AI retry loop disabled so failures are immediate
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ai.request_retries = 0;
    config.ai.retry_backoff_ms = 0;
    config.feed.media_base_url = "https://cdn.example.com/media".to_string();
    config
}

pub fn runner(config: &Config, calls: &Calls, failures: &Failures) -> PipelineRunner {
    let executor = StageExecutor::new(config.clone(), collaborators(calls, failures)).unwrap();
    PipelineRunner::new(config, executor)
}

pub fn coordinator(config: &Config, calls: &Calls, failures: &Failures) -> BatchCoordinator {
    BatchCoordinator::new(runner(config, calls, failures))
}

/// Course directory with one placeholder video per lesson name
pub fn course(dir: &TempDir, lessons: &[&str]) -> Vec<PathBuf> {
    let course = dir.path().join("rust-course");
    fs_err::create_dir_all(&course).unwrap();
    lessons
        .iter()
        .map(|lesson| {
            let video = course.join(format!("{}.mp4", lesson));
            fs_err::write(&video, format!("video {}", lesson)).unwrap();
            video
        })
        .collect()
}
