//! Per-item state machine driver.
//!
//! The runner owns no per-item state: every call loads or receives an
//! [`ItemDescriptor`], moves at most one stage forward and persists the result
//! through the [`StatusStore`] before returning.

mod executor;

pub use executor::{Collaborators, FailureKind, StageExecutor, StageFailure};

use std::path::Path;

use crate::config::Config;
use crate::item::{ItemDescriptor, Stage, StageStatus};
use crate::store::{Reconciliation, StatusStore};
use crate::PipelineError;

/// Result of executing one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Done { artifact: String },
    Failed { error: String, retryable: bool },
}

/// What `advance` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// One stage was executed
    Ran { stage: Stage, outcome: StageOutcome },
    /// Every stage in scope is done
    Complete,
    /// The next stage cannot run without an explicit reset
    Blocked { stage: Stage, error: String },
}

/// Next step for an item within a stage scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runnable {
    Stage(Stage),
    Complete,
    Blocked { stage: Stage, error: String },
}

/// Summary of driving one item as far as it can go
#[derive(Debug, Clone)]
pub struct ItemRun {
    pub descriptor: ItemDescriptor,
    /// Stages executed during this run, in order (retries repeat the stage)
    pub stages_run: Vec<Stage>,
    /// `Complete` or `Blocked`
    pub result: Advance,
}

pub struct PipelineRunner {
    store: StatusStore,
    executor: StageExecutor,
    stages: Vec<Stage>,
    max_attempts: u32,
}

impl PipelineRunner {
    pub fn new(config: &Config, executor: StageExecutor) -> Self {
        Self {
            store: StatusStore::new(),
            executor,
            stages: Stage::ALL.to_vec(),
            max_attempts: config.pipeline.max_attempts.max(1),
        }
    }

    /// Restrict the runner to an ordered subset of stages
    pub fn with_stages(mut self, stages: &[Stage]) -> Self {
        let mut stages = stages.to_vec();
        stages.sort();
        stages.dedup();
        self.stages = stages;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Load an item's descriptor, recovering from a corrupt record and
    /// reconciling it against the files on disk.
    pub fn load_item(&self, identity: &Path) -> Result<ItemDescriptor, PipelineError> {
        let mut item = self.store.load_or_recover(identity)?;

        if self.store.reconcile(&mut item) != Reconciliation::Unchanged {
            self.store.save(&item)?;
        }

        Ok(item)
    }

    /// Execute one stage. A stage already done is left untouched and no
    /// collaborator is called. Collaborator failures become a FAILED status;
    /// only prerequisite violations and store errors are returned as `Err`.
    pub async fn run_stage(
        &self,
        item: &mut ItemDescriptor,
        stage: Stage,
    ) -> Result<StageOutcome, PipelineError> {
        if item.is_done(stage) {
            return Ok(StageOutcome::Done {
                artifact: item.artifact(stage).unwrap_or_default().to_string(),
            });
        }

        item.begin(stage)?;
        self.store.save(item)?;
        tracing::info!(
            "{}: {} (attempt {}/{})",
            item.stem(),
            stage.label(),
            item.attempts(stage),
            self.max_attempts
        );

        let outcome = match self.executor.execute(item, stage).await {
            Ok(artifact) => {
                item.complete(stage, artifact.clone())?;
                tracing::info!("{}: {} done -> {}", item.stem(), stage, artifact);
                StageOutcome::Done { artifact }
            }
            Err(failure) => {
                let retryable = failure.is_retryable();
                item.fail(stage, failure.message.clone(), retryable);
                tracing::warn!("{}: {} failed: {}", item.stem(), stage, failure.message);
                StageOutcome::Failed {
                    error: failure.message,
                    retryable,
                }
            }
        };

        self.store.save(item)?;
        Ok(outcome)
    }

    /// First stage in `scope` that is not done, unless it cannot run
    pub fn next_runnable(&self, item: &ItemDescriptor, scope: &[Stage]) -> Runnable {
        let Some(stage) = scope.iter().copied().find(|s| !item.is_done(*s)) else {
            return Runnable::Complete;
        };

        if item.non_retryable.contains(&stage) {
            return Runnable::Blocked {
                stage,
                error: item.error(stage).unwrap_or("Failed permanently").to_string(),
            };
        }

        if item.attempts(stage) >= self.max_attempts {
            let error = match (item.status(stage), item.error(stage)) {
                (StageStatus::Failed, Some(error)) => error.to_string(),
                _ => format!("Retry budget of {} attempt(s) exhausted", self.max_attempts),
            };
            return Runnable::Blocked { stage, error };
        }

        if let Err(e) = item.check_prerequisites(stage) {
            return Runnable::Blocked {
                stage,
                error: e.to_string(),
            };
        }

        Runnable::Stage(stage)
    }

    /// Move the item one stage forward within the runner's stages
    pub async fn advance(&self, item: &mut ItemDescriptor) -> Result<Advance, PipelineError> {
        let scope = self.stages.clone();
        self.advance_within(item, &scope).await
    }

    pub async fn advance_within(
        &self,
        item: &mut ItemDescriptor,
        scope: &[Stage],
    ) -> Result<Advance, PipelineError> {
        match self.next_runnable(item, scope) {
            Runnable::Complete => Ok(Advance::Complete),
            Runnable::Blocked { stage, error } => Ok(Advance::Blocked { stage, error }),
            Runnable::Stage(stage) => {
                let outcome = self.run_stage(item, stage).await?;
                Ok(Advance::Ran { stage, outcome })
            }
        }
    }

    /// Advance the item until every stage in `scope` is done or it blocks
    pub async fn run_item(&self, identity: &Path, scope: &[Stage]) -> Result<ItemRun, PipelineError> {
        let mut descriptor = self.load_item(identity)?;
        let mut stages_run = Vec::new();

        loop {
            match self.advance_within(&mut descriptor, scope).await? {
                Advance::Ran { stage, .. } => stages_run.push(stage),
                result => {
                    return Ok(ItemRun {
                        descriptor,
                        stages_run,
                        result,
                    })
                }
            }
        }
    }
}
