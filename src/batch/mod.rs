use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::DiscoveryConfig;
use crate::item::Stage;
use crate::pipeline::{Advance, PipelineRunner};
use crate::store::StatusStore;

/// Lessons found under a root directory
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Absolute form of the scanned directory
    pub root: PathBuf,
    /// Primary files, sorted by path
    pub items: Vec<PathBuf>,
    /// Status records whose primary file no longer exists
    pub orphans: Vec<PathBuf>,
}

/// Find every lesson video under `root`
///
/// Paths are absolute so status records stay valid from any working directory.
pub fn discover(root: &Path, config: &DiscoveryConfig, workspace_dir: &str) -> Result<Discovery> {
    if !root.is_dir() {
        anyhow::bail!("Course directory does not exist: {}", root.display());
    }
    let root = std::path::absolute(root)
        .with_context(|| format!("Cannot resolve {}", root.display()))?;
    let root = root.as_path();

    let include = build_globset(&config.include)?;
    let mut excludes = config.exclude.clone();
    excludes.push(format!("**/{}/**", workspace_dir));
    let exclude = build_globset(&excludes)?;

    let mut discovery = Discovery {
        root: root.to_path_buf(),
        ..Discovery::default()
    };
    let mut records = Vec::new();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if exclude.is_match(relative) {
            continue;
        }

        if StatusStore::is_record(path) {
            records.push(path.to_path_buf());
        } else if include.is_match(relative) {
            discovery.items.push(path.to_path_buf());
        }
    }

    discovery.items.sort();

    for record in records {
        let has_item = discovery
            .items
            .iter()
            .any(|item| StatusStore::record_path(item) == record);
        if !has_item {
            tracing::warn!(
                "Orphan status record {} (no matching video)",
                record.display()
            );
            discovery.orphans.push(record);
        }
    }
    discovery.orphans.sort();

    tracing::debug!(
        "Discovered {} lesson(s) under {}",
        discovery.items.len(),
        root.display()
    );

    Ok(discovery)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .with_context(|| format!("Invalid glob pattern: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Final state of one item after a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Every stage in scope is done
    Completed,
    /// Stuck at `stage` until someone resets it
    Blocked { stage: Stage, error: String },
    /// The item could not be processed at all (status store failure,
    /// prerequisite violation)
    Errored { error: String },
    /// The batch was interrupted before reaching this item
    NotStarted,
}

impl ItemOutcome {
    pub fn label(&self) -> String {
        match self {
            ItemOutcome::Completed => "completed".to_string(),
            ItemOutcome::Blocked { stage, .. } => format!("blocked at {}", stage),
            ItemOutcome::Errored { .. } => "errored".to_string(),
            ItemOutcome::NotStarted => "not started".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub identity: PathBuf,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
    /// Stages executed during this run (retries repeat the stage)
    pub stages_run: Vec<Stage>,
}

/// Aggregate result of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Totals per outcome kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub blocked: usize,
    pub errored: usize,
    pub not_started: usize,
}

impl BatchReport {
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for item in &self.items {
            match item.outcome {
                ItemOutcome::Completed => counts.completed += 1,
                ItemOutcome::Blocked { .. } => counts.blocked += 1,
                ItemOutcome::Errored { .. } => counts.errored += 1,
                ItemOutcome::NotStarted => counts.not_started += 1,
            }
        }
        counts
    }

    pub fn outcome_for(&self, identity: &Path) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|item| item.identity == identity)
            .map(|item| &item.outcome)
    }

    pub fn has_failures(&self) -> bool {
        let counts = self.counts();
        counts.blocked > 0 || counts.errored > 0
    }
}

/// Runs a list of items through the pipeline one after another. A failure
/// in one item never stops the others.
pub struct BatchCoordinator {
    runner: PipelineRunner,
    cancel: Option<Arc<AtomicBool>>,
    show_progress: bool,
}

impl BatchCoordinator {
    pub fn new(runner: PipelineRunner) -> Self {
        Self {
            runner,
            cancel: None,
            show_progress: false,
        }
    }

    /// Flag checked between items; once set, remaining items are skipped
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    /// Run every item through the runner's stages, stopping after `target`
    /// when given.
    pub async fn run_batch(&self, items: &[PathBuf], target: Option<Stage>) -> Result<BatchReport> {
        let scope: Vec<Stage> = match target {
            Some(target) => self
                .runner
                .stages()
                .iter()
                .copied()
                .filter(|s| *s <= target)
                .collect(),
            None => self.runner.stages().to_vec(),
        };
        self.run_batch_scoped(items, &scope).await
    }

    /// Run every item through exactly the stages in `scope`
    pub async fn run_batch_scoped(&self, items: &[PathBuf], scope: &[Stage]) -> Result<BatchReport> {
        // Items added to disk after this point wait for the next run
        let snapshot = items.to_vec();
        let started_at = Utc::now();
        let progress = self.progress_bar(snapshot.len() as u64)?;

        tracing::info!(
            "Processing {} lesson(s) through {} stage(s)",
            snapshot.len(),
            scope.len()
        );

        let mut reports = Vec::with_capacity(snapshot.len());
        let mut interrupted = false;

        for identity in &snapshot {
            if self.is_cancelled() {
                if !interrupted {
                    tracing::warn!("Interrupted, {} lesson(s) left for the next run", snapshot.len() - reports.len());
                }
                interrupted = true;
                reports.push(ItemReport {
                    identity: identity.clone(),
                    outcome: ItemOutcome::NotStarted,
                    stages_run: Vec::new(),
                });
                continue;
            }

            progress.set_message(
                identity
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            );

            let report = match self.runner.run_item(identity, scope).await {
                Ok(run) => ItemReport {
                    identity: identity.clone(),
                    outcome: match run.result {
                        Advance::Blocked { stage, error } => ItemOutcome::Blocked { stage, error },
                        _ => ItemOutcome::Completed,
                    },
                    stages_run: run.stages_run,
                },
                Err(e) => {
                    tracing::error!("{}: {}", identity.display(), e);
                    ItemReport {
                        identity: identity.clone(),
                        outcome: ItemOutcome::Errored {
                            error: e.to_string(),
                        },
                        stages_run: Vec::new(),
                    }
                }
            };

            tracing::info!("{}: {}", identity.display(), report.outcome.label());
            reports.push(report);
            progress.inc(1);
        }

        progress.finish_and_clear();

        Ok(BatchReport {
            items: reports,
            interrupted,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn progress_bar(&self, len: u64) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let progress = ProgressBar::new(len);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?,
        );
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs_err::create_dir_all(path.parent().unwrap()).unwrap();
        fs_err::write(path, b"x").unwrap();
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("rust/02-traits.mp4"));
        touch(&root.join("rust/01-intro.MKV"));
        touch(&root.join("rust/notes.txt"));
        touch(&root.join("rust/podcast/audio/01-intro.mp4"));
        touch(&root.join(".git/objects/x.mp4"));
        touch(&root.join("go/01-hello.webm"));

        let discovery = discover(root, &DiscoveryConfig::default(), "podcast").unwrap();
        assert_eq!(
            discovery.items,
            vec![
                root.join("go/01-hello.webm"),
                root.join("rust/01-intro.MKV"),
                root.join("rust/02-traits.mp4"),
            ]
        );
        assert!(discovery.orphans.is_empty());
    }

    #[test]
    fn test_discover_reports_orphan_records() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("rust/01-intro.mp4"));
        touch(&root.join("rust/01-intro.status.md"));
        touch(&root.join("rust/00-removed.status.md"));

        let discovery = discover(root, &DiscoveryConfig::default(), "podcast").unwrap();
        assert_eq!(discovery.items, vec![root.join("rust/01-intro.mp4")]);
        assert_eq!(discovery.orphans, vec![root.join("rust/00-removed.status.md")]);
    }

    #[test]
    fn test_discover_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        assert!(discover(&dir.path().join("nope"), &DiscoveryConfig::default(), "podcast").is_err());
    }

    #[test]
    fn test_report_counts() {
        let report = BatchReport {
            items: vec![
                ItemReport {
                    identity: PathBuf::from("a.mp4"),
                    outcome: ItemOutcome::Completed,
                    stages_run: vec![Stage::AudioExtracted],
                },
                ItemReport {
                    identity: PathBuf::from("b.mp4"),
                    outcome: ItemOutcome::Blocked {
                        stage: Stage::Transcribed,
                        error: "boom".to_string(),
                    },
                    stages_run: vec![],
                },
                ItemReport {
                    identity: PathBuf::from("c.mp4"),
                    outcome: ItemOutcome::NotStarted,
                    stages_run: vec![],
                },
            ],
            interrupted: true,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        let counts = report.counts();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.blocked, 1);
        assert_eq!(counts.not_started, 1);
        assert!(report.has_failures());
        assert_eq!(
            report.outcome_for(Path::new("b.mp4")).map(ItemOutcome::label),
            Some("blocked at transcribed".to_string())
        );
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(ItemOutcome::Blocked {
            stage: Stage::AiProcessed,
            error: "rate limited".to_string(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "blocked");
        assert_eq!(json["stage"], "ai_processed");
    }
}
