//! Course Podcaster - turn course videos into a published podcast/article bundle
//!
//! Each lesson video moves through a fixed sequence of stages (audio extraction,
//! transcription, AI rewriting, timestamps, narration, feed, upload, publish).
//! Progress for every lesson is kept in a small status file next to the video so
//! that a batch can be interrupted and re-run at any time and will resume where
//! it left off.

pub mod ai;
pub mod batch;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod feed;
pub mod item;
pub mod media;
pub mod output;
pub mod pipeline;
pub mod publish;
pub mod store;
pub mod transcribe;
pub mod tts;
pub mod utils;

pub use batch::{BatchCoordinator, BatchReport, ItemOutcome};
pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use item::{ItemDescriptor, Stage, StageStatus};
pub use pipeline::{Collaborators, PipelineRunner, StageExecutor};
pub use store::StatusStore;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Errors raised by the pipeline core
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Corrupt status record {path}: {reason}")]
    CorruptState { path: String, reason: String },

    #[error("Stage {stage} requires {} to be done first", item::join_stages(.missing))]
    PrerequisiteNotMet { stage: Stage, missing: Vec<Stage> },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Status store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize status record: {0}")]
    Serialize(String),
}
