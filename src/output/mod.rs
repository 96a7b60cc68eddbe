//! Rendering of batch reports and status tables for the terminal.

use anyhow::Result;
use console::style;
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;

use crate::batch::{BatchReport, ItemOutcome};
use crate::cli::OutputFormat;
use crate::item::{ItemDescriptor, Stage, StageStatus};
use crate::utils::{format_duration, truncate_text};

const NAME_WIDTH: usize = 36;

/// Batch report as text or JSON
pub fn render_report(report: &BatchReport, root: &Path, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Text => Ok(report_table(report, root)),
    }
}

fn report_table(report: &BatchReport, root: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {}", "Lesson", "Outcome", width = NAME_WIDTH);

    for item in &report.items {
        let name = display_name(&item.identity, root);
        let outcome = match &item.outcome {
            ItemOutcome::Completed => style(item.outcome.label()).green().to_string(),
            ItemOutcome::Blocked { error, .. } => format!(
                "{}: {}",
                style(item.outcome.label()).red(),
                truncate_text(error, 80)
            ),
            ItemOutcome::Errored { error } => format!(
                "{}: {}",
                style(item.outcome.label()).red(),
                truncate_text(error, 80)
            ),
            ItemOutcome::NotStarted => style(item.outcome.label()).dim().to_string(),
        };
        let _ = writeln!(out, "{:<width$}  {}", name, outcome, width = NAME_WIDTH);
    }

    let counts = report.counts();
    let _ = writeln!(
        out,
        "\nCompleted: {}  Blocked: {}  Errored: {}  Not started: {}",
        counts.completed, counts.blocked, counts.errored, counts.not_started
    );
    let elapsed = (report.finished_at - report.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let _ = writeln!(out, "Finished in {}", format_duration(elapsed));
    if report.interrupted {
        let _ = writeln!(out, "Run interrupted; run again to resume.");
    }
    out
}

#[derive(Serialize)]
struct StatusRow<'a> {
    identity: &'a Path,
    course: &'a str,
    stages: Vec<StageRow<'a>>,
}

#[derive(Serialize)]
struct StageRow<'a> {
    stage: Stage,
    status: StageStatus,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Per-lesson stage table
pub fn render_status(items: &[ItemDescriptor], root: &Path, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<StatusRow> = items
                .iter()
                .map(|item| StatusRow {
                    identity: &item.identity,
                    course: &item.course,
                    stages: Stage::ALL
                        .iter()
                        .map(|s| StageRow {
                            stage: *s,
                            status: item.status(*s),
                            attempts: item.attempts(*s),
                            artifact: item.artifact(*s),
                            error: item.error(*s),
                        })
                        .collect(),
                })
                .collect();
            Ok(serde_json::to_string_pretty(&rows)?)
        }
        OutputFormat::Text => Ok(status_table(items, root)),
    }
}

fn status_table(items: &[ItemDescriptor], root: &Path) -> String {
    let mut out = String::new();
    let _ = write!(out, "{:<width$}", "Lesson", width = NAME_WIDTH);
    for stage in Stage::ALL {
        let _ = write!(out, " {:^10}", column_title(stage));
    }
    out.push('\n');

    for item in items {
        let _ = write!(
            out,
            "{:<width$}",
            display_name(&item.identity, root),
            width = NAME_WIDTH
        );
        for stage in Stage::ALL {
            let _ = write!(out, " {:^10}", status_cell(item.status(stage)));
        }
        out.push('\n');

        for stage in Stage::ALL {
            if let (StageStatus::Failed, Some(error)) = (item.status(stage), item.error(stage)) {
                let _ = writeln!(
                    out,
                    "  {} {} (attempt {}): {}",
                    style("!").red(),
                    stage,
                    item.attempts(stage),
                    truncate_text(error, 100)
                );
            }
        }
    }

    if items.is_empty() {
        out.push_str("No lessons found.\n");
    }
    out
}

/// Stages reset by `reset`, one line per lesson
pub fn render_reset(reset: &[(ItemDescriptor, Vec<Stage>)], root: &Path, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = reset
                .iter()
                .map(|(item, stages)| {
                    serde_json::json!({
                        "identity": item.identity,
                        "reset": stages,
                    })
                })
                .collect();
            Ok(serde_json::to_string_pretty(&rows)?)
        }
        OutputFormat::Text => {
            let mut out = String::new();
            for (item, stages) in reset {
                let names: Vec<&str> = stages.iter().map(|s| s.as_str()).collect();
                let _ = writeln!(
                    out,
                    "{}: reset {}",
                    display_name(&item.identity, root),
                    names.join(", ")
                );
            }
            Ok(out)
        }
    }
}

fn column_title(stage: Stage) -> &'static str {
    match stage {
        Stage::AudioExtracted => "audio",
        Stage::Transcribed => "transcript",
        Stage::AiProcessed => "ai",
        Stage::TimestampsGenerated => "timestamps",
        Stage::TtsGenerated => "tts",
        Stage::FeedUpdated => "feed",
        Stage::Uploaded => "upload",
        Stage::Published => "publish",
    }
}

fn status_cell(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Done => "done",
        StageStatus::Failed => "FAILED",
        StageStatus::InProgress => "running",
        StageStatus::Pending => "-",
    }
}

fn display_name(identity: &Path, root: &Path) -> String {
    identity
        .strip_prefix(root)
        .unwrap_or(identity)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ItemReport;
    use chrono::Utc;
    use std::path::PathBuf;

    fn report() -> BatchReport {
        BatchReport {
            items: vec![
                ItemReport {
                    identity: PathBuf::from("/courses/rust/lessonA.mp4"),
                    outcome: ItemOutcome::Completed,
                    stages_run: vec![Stage::AudioExtracted, Stage::Transcribed],
                },
                ItemReport {
                    identity: PathBuf::from("/courses/rust/lessonB.mp4"),
                    outcome: ItemOutcome::Blocked {
                        stage: Stage::Transcribed,
                        error: "job failed".to_string(),
                    },
                    stages_run: vec![Stage::AudioExtracted],
                },
            ],
            interrupted: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_table_lists_outcomes() {
        let text = render_report(&report(), Path::new("/courses"), OutputFormat::Text).unwrap();
        assert!(text.contains("rust/lessonA.mp4"));
        assert!(text.contains("blocked at transcribed"));
        assert!(text.contains("job failed"));
        assert!(text.contains("Completed: 1  Blocked: 1"));
    }

    #[test]
    fn test_report_json_is_parseable() {
        let json = render_report(&report(), Path::new("/courses"), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["items"][1]["outcome"], "blocked");
        assert_eq!(value["items"][1]["stage"], "transcribed");
        assert_eq!(value["interrupted"], false);
    }

    #[test]
    fn test_status_table_shows_failures() {
        let mut item = ItemDescriptor::new("/courses/rust/lessonB.mp4");
        item.begin(Stage::AudioExtracted).unwrap();
        item.complete(Stage::AudioExtracted, "a.mp3".to_string()).unwrap();
        item.begin(Stage::Transcribed).unwrap();
        item.fail(Stage::Transcribed, "job failed", true);

        let text = render_status(&[item], Path::new("/courses"), OutputFormat::Text).unwrap();
        assert!(text.contains("rust/lessonB.mp4"));
        assert!(text.contains("done"));
        assert!(text.contains("FAILED"));
        assert!(text.contains("transcribed (attempt 1): job failed"));
    }

    #[test]
    fn test_empty_status() {
        let text = render_status(&[], Path::new("/courses"), OutputFormat::Text).unwrap();
        assert!(text.contains("No lessons found."));
    }
}
