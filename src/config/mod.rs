use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "podcaster.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runner settings
    pub pipeline: PipelineConfig,

    /// Which files count as lessons
    pub discovery: DiscoveryConfig,

    /// Audio extraction settings
    pub audio: AudioConfig,

    /// AWS Transcribe settings
    pub transcription: TranscriptionConfig,

    /// Chat completion backend and conversation protocol
    pub ai: AiConfig,

    pub timestamps: TimestampsConfig,

    /// Narration settings
    pub tts: TtsConfig,

    /// Podcast feed metadata
    pub feed: FeedConfig,

    /// Remote storage for narrated episodes
    pub storage: StorageConfig,

    /// Git publishing of the feed
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per stage before the lesson is terminally blocked
    pub max_attempts: u32,

    /// Directory (inside each course directory) holding derived files
    pub workspace_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Glob patterns (relative to the scanned root) of lesson videos
    pub include: Vec<String>,

    /// Glob patterns that are never scanned
    pub exclude: Vec<String>,

    pub follow_symlinks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// ffmpeg bitrate, e.g. `128k`
    pub bitrate: String,

    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// AWS region
    pub region: String,

    /// S3 bucket for temporary audio storage
    pub s3_bucket: String,

    /// Optional S3 key prefix
    pub s3_key_prefix: Option<String>,

    /// Language code; automatic identification when unset
    pub language: Option<String>,

    /// Enable speaker identification
    pub speaker_labels: bool,

    /// Maximum speakers for identification
    pub max_speakers: Option<u8>,

    /// Upper bound on polling for a finished job
    pub max_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,

    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    pub temperature: f32,

    /// Completion budget per request
    pub max_tokens: u32,

    /// Input budget per chunk, in estimated tokens
    pub chunk_max_tokens: usize,

    /// Characters of the previous reply repeated with each follow-up part
    pub context_chars: usize,

    /// Reserved token a reply ends with when more input is expected
    pub continuation_marker: String,

    /// Resubmissions of one chunk before the stage fails
    pub request_retries: u32,

    /// Base delay of the exponential backoff between resubmissions
    pub retry_backoff_ms: u64,

    pub timeout_secs: u64,

    /// Instruction template; a built-in prompt is used when unset
    pub prompt_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampsConfig {
    /// Heading of the generated chapter list
    pub heading: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// edge-tts executable
    pub command: String,

    pub voice: String,

    /// Speech rate offset, e.g. `+0%`
    pub rate: String,

    /// Volume offset, e.g. `+0%`
    pub volume: String,

    /// Pitch offset, e.g. `+0Hz`
    pub pitch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed file; relative paths live in the course workspace
    pub path: PathBuf,

    pub title: String,

    pub description: String,

    pub author: String,

    pub language: String,

    pub link: String,

    /// Public prefix episode enclosures are served from
    pub media_base_url: String,

    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3 bucket for published episodes
    pub bucket: String,

    pub prefix: Option<String>,

    pub region: String,

    /// Public URL the bucket is served from
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Git working tree; defaults to the course workspace
    pub repo_dir: Option<PathBuf>,

    pub remote: String,

    pub branch: String,

    /// Commit message; `{course}` and `{lesson}` are substituted
    pub commit_message: String,

    /// Public URL of the feed once pushed
    pub public_feed_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            workspace_dir: "podcast".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*.{mp4,mkv,avi,mov,webm}".to_string()],
            exclude: vec!["**/.git/**".to_string()],
            follow_symlinks: false,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bitrate: "128k".to_string(),
            sample_rate: 44100,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            s3_bucket: "".to_string(),
            s3_key_prefix: Some("podcaster/".to_string()),
            language: Some("pt-BR".to_string()),
            speaker_labels: false,
            max_speakers: None,
            max_wait_secs: 3600,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 4000,
            chunk_max_tokens: 3000,
            context_chars: 500,
            continuation_marker: "[CONTINUA]".to_string(),
            request_retries: 5,
            retry_backoff_ms: 1000,
            timeout_secs: 300,
            prompt_file: None,
        }
    }
}

impl Default for TimestampsConfig {
    fn default() -> Self {
        Self {
            heading: "Timestamps".to_string(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            command: "edge-tts".to_string(),
            voice: "pt-BR-FranciscaNeural".to_string(),
            rate: "+0%".to_string(),
            volume: "+0%".to_string(),
            pitch: "+0Hz".to_string(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("feed.xml"),
            title: "Processed Courses".to_string(),
            description: "Narrated lessons generated from course videos".to_string(),
            author: "Course Podcaster".to_string(),
            language: "pt-br".to_string(),
            link: "https://example.com".to_string(),
            media_base_url: "https://example.com/media".to_string(),
            image_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "".to_string(),
            prefix: Some("episodes/".to_string()),
            region: "us-east-1".to_string(),
            public_base_url: None,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            repo_dir: None,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            commit_message: "Publish {course}: {lesson}".to_string(),
            public_feed_url: None,
        }
    }
}

impl AiConfig {
    /// API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Chunk size budget in characters (4 chars per token estimate)
    pub fn chunk_max_chars(&self) -> usize {
        self.chunk_max_tokens.saturating_mul(4)
    }
}

impl Config {
    /// Load configuration from `explicit`, `./podcaster.yaml` or the user
    /// config directory, creating a default file when none exists.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        Self::load_from(&path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs_err::read_to_string(path).context("Failed to read config file")?;

            match serde_yaml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    let backup = PathBuf::from(format!("{}.corrupted", path.display()));
                    tracing::warn!(
                        "Config file {} is corrupted ({}), backing it up to {} and using defaults",
                        path.display(),
                        e,
                        backup.display()
                    );
                    fs_err::copy(path, &backup).context("Failed to back up corrupted config")?;
                    let config = Self::default();
                    config.save_to(path).await?;
                    config
                }
            }
        } else {
            tracing::info!("Creating default configuration at {}", path.display());
            let config = Self::default();
            config.save_to(path).await?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        // First try current directory for easy testing
        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("course-podcaster").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_attempts == 0 {
            anyhow::bail!("pipeline.max_attempts must be at least 1");
        }

        if self.pipeline.workspace_dir.trim().is_empty() {
            anyhow::bail!("pipeline.workspace_dir must not be empty");
        }

        if self.ai.chunk_max_tokens == 0 {
            anyhow::bail!("ai.chunk_max_tokens must be at least 1");
        }

        if self.ai.continuation_marker.trim().is_empty() {
            anyhow::bail!("ai.continuation_marker must not be empty");
        }

        if !(0.0..=2.0).contains(&self.ai.temperature) {
            anyhow::bail!(
                "ai.temperature must be between 0.0 and 2.0, got {}",
                self.ai.temperature
            );
        }

        if self.discovery.include.is_empty() {
            anyhow::bail!("discovery.include needs at least one pattern");
        }

        url::Url::parse(&self.ai.base_url)
            .with_context(|| format!("ai.base_url is not a valid URL: {}", self.ai.base_url))?;
        url::Url::parse(&self.feed.media_base_url).with_context(|| {
            format!(
                "feed.media_base_url is not a valid URL: {}",
                self.feed.media_base_url
            )
        })?;

        Ok(())
    }

    /// Feed file for a course whose workspace is `workspace`
    pub fn feed_path(&self, workspace: &Path) -> PathBuf {
        if self.feed.path.is_absolute() {
            self.feed.path.clone()
        } else {
            workspace.join(&self.feed.path)
        }
    }

    /// Print the effective configuration
    pub fn display(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }
}
