use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::item::Stage;

pub mod menu;

#[derive(Parser)]
#[command(
    name = "podcaster",
    about = "Course Podcaster - turn course videos into narrated podcast episodes",
    version,
    long_about = "Runs every lesson video of a course through audio extraction, AWS Transcribe, AI rewriting, chapter timestamps, text-to-speech, an RSS feed, S3 upload and git publishing. Progress is kept next to each video so runs can be interrupted and resumed."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ./podcaster.yaml, then the user config dir)
    #[arg(short, long, global = true, env = "PODCASTER_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Report format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline for every lesson under a directory
    Run {
        /// Course directory (scanned recursively)
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Stop after this stage
        #[arg(long, value_enum, value_name = "STAGE")]
        until: Option<Stage>,
    },

    /// Run a single stage (and any pending prerequisites) for every lesson
    Stage {
        #[arg(value_enum)]
        stage: Stage,

        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Show per-lesson progress without running anything
    Status {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Send stages (and everything after them) back to pending
    Reset {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Stage to reset; repeat for several (all stages when omitted)
        #[arg(long, value_enum, value_name = "STAGE")]
        stage: Vec<Stage>,
    },

    /// Show or locate the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// Interactive menu
    Menu,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human readable table
    Text,
    /// JSON document
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_until() {
        let cli = Cli::parse_from(["podcaster", "run", "courses", "--until", "transcribed"]);
        match cli.command {
            Commands::Run { dir, until } => {
                assert_eq!(dir, PathBuf::from("courses"));
                assert_eq!(until, Some(Stage::Transcribed));
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_parse_reset_with_repeated_stages() {
        let cli = Cli::parse_from([
            "podcaster",
            "--format",
            "json",
            "reset",
            "courses",
            "--stage",
            "ai_processed",
            "--stage",
            "uploaded",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Reset { stage, .. } => {
                assert_eq!(stage, vec![Stage::AiProcessed, Stage::Uploaded]);
            }
            _ => panic!("expected reset"),
        }
    }
}
