use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::PipelineError;

/// One step of the pipeline, in execution order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Stage {
    AudioExtracted,
    Transcribed,
    AiProcessed,
    TimestampsGenerated,
    TtsGenerated,
    FeedUpdated,
    Uploaded,
    Published,
}

impl Stage {
    /// Fixed stage order
    pub const ALL: [Stage; 8] = [
        Stage::AudioExtracted,
        Stage::Transcribed,
        Stage::AiProcessed,
        Stage::TimestampsGenerated,
        Stage::TtsGenerated,
        Stage::FeedUpdated,
        Stage::Uploaded,
        Stage::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AudioExtracted => "audio_extracted",
            Stage::Transcribed => "transcribed",
            Stage::AiProcessed => "ai_processed",
            Stage::TimestampsGenerated => "timestamps_generated",
            Stage::TtsGenerated => "tts_generated",
            Stage::FeedUpdated => "feed_updated",
            Stage::Uploaded => "uploaded",
            Stage::Published => "published",
        }
    }

    /// Short human label used by the menu and status tables
    pub fn label(&self) -> &'static str {
        match self {
            Stage::AudioExtracted => "Extract audio",
            Stage::Transcribed => "Transcribe",
            Stage::AiProcessed => "AI rewrite",
            Stage::TimestampsGenerated => "Timestamps",
            Stage::TtsGenerated => "Narration (TTS)",
            Stage::FeedUpdated => "Update feed",
            Stage::Uploaded => "Upload",
            Stage::Published => "Publish",
        }
    }

    /// Stages that must be done before this one may be marked done
    pub fn prerequisites(&self) -> &'static [Stage] {
        match self {
            Stage::AudioExtracted => &[],
            Stage::Transcribed => &[Stage::AudioExtracted],
            Stage::AiProcessed => &[Stage::Transcribed],
            Stage::TimestampsGenerated => &[Stage::Transcribed],
            Stage::TtsGenerated => &[Stage::AiProcessed],
            Stage::FeedUpdated => &[Stage::TtsGenerated],
            Stage::Uploaded => &[Stage::TtsGenerated],
            Stage::Published => &[Stage::FeedUpdated, Stage::Uploaded],
        }
    }

    /// Every stage that depends on this one, directly or transitively
    pub fn dependents(&self) -> BTreeSet<Stage> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![*self];
        while let Some(current) = frontier.pop() {
            for stage in Stage::ALL {
                if stage.prerequisites().contains(&current) && found.insert(stage) {
                    frontier.push(stage);
                }
            }
        }
        found
    }

    /// Whether the artifact of this stage is a file on local disk
    pub fn produces_local_file(&self) -> bool {
        matches!(
            self,
            Stage::AudioExtracted
                | Stage::Transcribed
                | Stage::AiProcessed
                | Stage::TimestampsGenerated
                | Stage::TtsGenerated
                | Stage::FeedUpdated
        )
    }

    /// Stages from the start of the pipeline up to and including `self`
    pub fn prefix(&self) -> Vec<Stage> {
        Stage::ALL.iter().copied().filter(|s| s <= self).collect()
    }

    /// `self` plus everything it transitively requires, in stage order
    pub fn requirements(&self) -> Vec<Stage> {
        let mut needed = BTreeSet::from([*self]);
        let mut frontier = vec![*self];
        while let Some(current) = frontier.pop() {
            for prerequisite in current.prerequisites() {
                if needed.insert(*prerequisite) {
                    frontier.push(*prerequisite);
                }
            }
        }
        needed.into_iter().collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

pub(crate) fn join_stages(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Progress of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(StageStatus::Pending),
            "in_progress" => Ok(StageStatus::InProgress),
            "done" => Ok(StageStatus::Done),
            "failed" => Ok(StageStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Cheap identity check for the primary file, used to notice replaced content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: i64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = fs_err::metadata(path)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Ok(Self {
            size: metadata.len(),
            modified,
        })
    }
}

/// Durable progress record for one lesson
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// Path of the lesson's primary (video) file
    pub identity: PathBuf,

    /// Name of the course the lesson belongs to
    pub course: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fingerprint: Option<Fingerprint>,

    pub stage_status: BTreeMap<Stage, StageStatus>,

    #[serde(default)]
    pub attempts: BTreeMap<Stage, u32>,

    #[serde(default)]
    pub artifacts: BTreeMap<Stage, String>,

    #[serde(default)]
    pub last_error: BTreeMap<Stage, String>,

    /// Stages that failed with an error retrying cannot fix
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub non_retryable: BTreeSet<Stage>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemDescriptor {
    /// Fresh descriptor with every stage pending
    pub fn new(identity: impl Into<PathBuf>) -> Self {
        let identity = identity.into();
        let now = Utc::now();
        Self {
            course: course_name(&identity),
            identity,
            source_fingerprint: None,
            stage_status: Stage::ALL.iter().map(|s| (*s, StageStatus::Pending)).collect(),
            attempts: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            last_error: BTreeMap::new(),
            non_retryable: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// File stem of the primary file, used to name every derived artifact
    pub fn stem(&self) -> String {
        self.identity
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "item".to_string())
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stage_status.get(&stage).copied().unwrap_or_default()
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.status(stage) == StageStatus::Done
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn artifact(&self, stage: Stage) -> Option<&str> {
        self.artifacts.get(&stage).map(String::as_str)
    }

    pub fn error(&self, stage: Stage) -> Option<&str> {
        self.last_error.get(&stage).map(String::as_str)
    }

    pub fn is_complete(&self, stages: &[Stage]) -> bool {
        stages.iter().all(|s| self.is_done(*s))
    }

    /// Prerequisites of `stage` that are not done yet
    pub fn missing_prerequisites(&self, stage: Stage) -> Vec<Stage> {
        stage
            .prerequisites()
            .iter()
            .copied()
            .filter(|p| !self.is_done(*p))
            .collect()
    }

    pub fn check_prerequisites(&self, stage: Stage) -> Result<(), PipelineError> {
        let missing = self.missing_prerequisites(stage);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::PrerequisiteNotMet { stage, missing })
        }
    }

    /// PENDING/FAILED -> IN_PROGRESS, counting the attempt
    pub fn begin(&mut self, stage: Stage) -> Result<(), PipelineError> {
        self.check_prerequisites(stage)?;
        self.stage_status.insert(stage, StageStatus::InProgress);
        *self.attempts.entry(stage).or_insert(0) += 1;
        self.touch();
        Ok(())
    }

    /// IN_PROGRESS -> DONE with the produced artifact
    pub fn complete(&mut self, stage: Stage, artifact: String) -> Result<(), PipelineError> {
        self.check_prerequisites(stage)?;
        self.stage_status.insert(stage, StageStatus::Done);
        self.artifacts.insert(stage, artifact);
        self.last_error.remove(&stage);
        self.non_retryable.remove(&stage);
        self.touch();
        Ok(())
    }

    /// IN_PROGRESS -> FAILED with a diagnostic message
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>, retryable: bool) {
        self.stage_status.insert(stage, StageStatus::Failed);
        self.artifacts.remove(&stage);
        self.last_error.insert(stage, message.into());
        if retryable {
            self.non_retryable.remove(&stage);
        } else {
            self.non_retryable.insert(stage);
        }
        self.touch();
    }

    /// Explicit invalidation: the given stages and everything downstream of
    /// them go back to PENDING with counters and artifacts cleared.
    /// Returns the stages that were touched, in pipeline order.
    pub fn reset(&mut self, stages: &[Stage]) -> Vec<Stage> {
        let mut affected = BTreeSet::new();
        for stage in stages {
            affected.insert(*stage);
            affected.extend(stage.dependents());
        }
        for stage in &affected {
            self.stage_status.insert(*stage, StageStatus::Pending);
            self.artifacts.remove(stage);
            self.attempts.remove(stage);
            self.last_error.remove(stage);
            self.non_retryable.remove(stage);
        }
        self.touch();
        affected.into_iter().collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Course name for a lesson: the directory it lives in
pub fn course_name(identity: &Path) -> String {
    identity
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "course".to_string())
}
