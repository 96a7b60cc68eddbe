//! Durable per-lesson progress records.
//!
//! Each lesson `dir/lesson.mp4` owns a sidecar `dir/lesson.status.md`: a
//! Markdown file whose YAML front matter is the serialized
//! [`ItemDescriptor`]. Anything below the front matter is left alone, so
//! operators can keep notes in it. Saves go through [`write_atomic`], so a
//! reader never observes a half-written record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::item::{Fingerprint, ItemDescriptor, Stage, StageStatus};
use crate::utils::{join_front_matter, split_front_matter, write_atomic};
use crate::PipelineError;

/// File name suffix of status records
pub const STATUS_SUFFIX: &str = ".status.md";

/// Outcome of checking a persisted descriptor against the files on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing changed
    Unchanged,
    /// The primary file was replaced; the old progress no longer applies
    Superseded,
    /// Artifacts of these stages vanished; they (and their dependents) were reset
    Invalidated(Vec<Stage>),
}

#[derive(Debug, Clone, Default)]
pub struct StatusStore;

impl StatusStore {
    pub fn new() -> Self {
        Self
    }

    /// Sidecar path for a lesson's primary file
    pub fn record_path(identity: &Path) -> PathBuf {
        let stem = identity
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "item".to_string());
        identity.with_file_name(format!("{}{}", stem, STATUS_SUFFIX))
    }

    /// Whether `path` names a status record rather than content
    pub fn is_record(path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().ends_with(STATUS_SUFFIX))
            .unwrap_or(false)
    }

    /// Load the descriptor for `identity`, or a fresh all-pending one when no
    /// record exists yet.
    pub fn load(&self, identity: &Path) -> Result<ItemDescriptor, PipelineError> {
        let path = Self::record_path(identity);
        if !path.exists() {
            return Ok(ItemDescriptor::new(identity));
        }

        let content = fs_err::read_to_string(&path)?;
        let (header, _) = split_front_matter(&content);
        let header = header.ok_or_else(|| PipelineError::CorruptState {
            path: path.display().to_string(),
            reason: "missing front matter".to_string(),
        })?;

        let mut descriptor: ItemDescriptor =
            serde_yaml::from_str(header).map_err(|e| PipelineError::CorruptState {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        for stage in Stage::ALL {
            let status = descriptor.stage_status.entry(stage).or_default();
            // The process stopped while this stage was running
            if *status == StageStatus::InProgress {
                tracing::warn!(
                    "{}: stage {} was interrupted, treating it as pending",
                    path.display(),
                    stage
                );
                *status = StageStatus::Pending;
            }
            if *status != StageStatus::Done {
                descriptor.artifacts.remove(&stage);
            }
        }
        descriptor.identity = identity.to_path_buf();

        Ok(descriptor)
    }

    /// Persist `descriptor` next to its primary file, replacing any previous
    /// record atomically. The Markdown body of an existing record is kept.
    pub fn save(&self, descriptor: &ItemDescriptor) -> Result<(), PipelineError> {
        let path = Self::record_path(&descriptor.identity);

        let body = match fs_err::read_to_string(&path) {
            Ok(existing) => match split_front_matter(&existing) {
                (Some(_), body) => body.to_string(),
                (None, _) => String::new(),
            },
            Err(_) => String::new(),
        };

        let header =
            serde_yaml::to_string(descriptor).map_err(|e| PipelineError::Serialize(e.to_string()))?;
        write_atomic(&path, join_front_matter(&header, &body).as_bytes())?;

        tracing::debug!("Saved status record {}", path.display());
        Ok(())
    }

    /// `load`, falling back to `recover` when the record is corrupt
    pub fn load_or_recover(&self, identity: &Path) -> Result<ItemDescriptor, PipelineError> {
        match self.load(identity) {
            Err(PipelineError::CorruptState { path, reason }) => {
                tracing::warn!("Status record {} is corrupt ({}), recovering", path, reason);
                self.recover(identity)
            }
            other => other,
        }
    }

    /// Read-only view of a record for reporting. A corrupt record is reported
    /// and shown with its salvageable stages, but neither backed up nor
    /// rewritten.
    pub fn inspect(&self, identity: &Path) -> Result<ItemDescriptor, PipelineError> {
        match self.load(identity) {
            Err(PipelineError::CorruptState { path, reason }) => {
                tracing::warn!(
                    "Status record {} is corrupt ({}); the next run will recover it",
                    path,
                    reason
                );
                let raw = fs_err::read_to_string(Self::record_path(identity))?;
                Ok(salvage(identity, &raw))
            }
            other => other,
        }
    }

    /// Explicit invalidation of `stages` (every stage when empty) and
    /// everything depending on them. Returns the updated descriptor and the
    /// stages that were reset.
    pub fn reset_stages(
        &self,
        identity: &Path,
        stages: &[Stage],
    ) -> Result<(ItemDescriptor, Vec<Stage>), PipelineError> {
        let mut descriptor = self.load_or_recover(identity)?;
        let targets = if stages.is_empty() { &Stage::ALL[..] } else { stages };
        let reset = descriptor.reset(targets);
        self.save(&descriptor)?;
        Ok((descriptor, reset))
    }

    /// Rebuild a descriptor from a record that failed to parse.
    ///
    /// The unreadable file is copied to `<record>.corrupted`. Stages are
    /// salvaged in pipeline order while both their status line says `done`
    /// and their artifact line can be read; the first stage that does not
    /// qualify, and every stage after it, is treated as pending.
    pub fn recover(&self, identity: &Path) -> Result<ItemDescriptor, PipelineError> {
        let path = Self::record_path(identity);
        let raw = fs_err::read_to_string(&path).unwrap_or_default();

        let backup = PathBuf::from(format!("{}.corrupted", path.display()));
        if let Err(e) = fs_err::copy(&path, &backup) {
            tracing::warn!("Could not back up corrupt record {}: {}", path.display(), e);
        }

        let descriptor = salvage(identity, &raw);
        let salvaged: Vec<Stage> = Stage::ALL
            .iter()
            .copied()
            .filter(|s| descriptor.is_done(*s))
            .collect();
        tracing::warn!(
            "Recovered corrupt record {} ({} stage(s) salvaged, rest pending)",
            path.display(),
            salvaged.len()
        );

        Ok(descriptor)
    }

    /// Check a loaded descriptor against the current file inventory.
    pub fn reconcile(&self, descriptor: &mut ItemDescriptor) -> Reconciliation {
        let current = match Fingerprint::of(&descriptor.identity) {
            Ok(fp) => Some(fp),
            Err(e) => {
                tracing::warn!(
                    "Cannot stat {}: {}",
                    descriptor.identity.display(),
                    e
                );
                None
            }
        };

        match (descriptor.source_fingerprint, current) {
            (Some(recorded), Some(current)) if recorded != current => {
                tracing::info!(
                    "{} changed since it was last processed, starting over",
                    descriptor.identity.display()
                );
                let mut fresh = ItemDescriptor::new(descriptor.identity.clone());
                fresh.source_fingerprint = Some(current);
                *descriptor = fresh;
                return Reconciliation::Superseded;
            }
            (None, Some(current)) => descriptor.source_fingerprint = Some(current),
            _ => {}
        }

        let missing: Vec<Stage> = Stage::ALL
            .iter()
            .copied()
            .filter(|s| s.produces_local_file() && descriptor.is_done(*s))
            .filter(|s| {
                descriptor
                    .artifact(*s)
                    .map(|a| !Path::new(a).exists())
                    .unwrap_or(true)
            })
            .collect();

        if missing.is_empty() {
            return Reconciliation::Unchanged;
        }

        let reset = descriptor.reset(&missing);
        tracing::warn!(
            "{}: artifacts missing for {}, reset {} stage(s)",
            descriptor.identity.display(),
            crate::item::join_stages(&missing),
            reset.len()
        );
        Reconciliation::Invalidated(missing)
    }
}

/// Read `key: value` lines nested under a top-level `block:` key, stopping
/// at the first line that does not look like an entry.
/// Leading done stages of an unparseable record that still name an artifact
fn salvage(identity: &Path, raw: &str) -> ItemDescriptor {
    let header = match split_front_matter(raw) {
        (Some(header), _) => header,
        (None, _) => raw,
    };
    let statuses = salvage_block(header, "stage_status");
    let artifacts = salvage_block(header, "artifacts");

    let mut descriptor = ItemDescriptor::new(identity);
    for stage in Stage::ALL {
        let status = statuses
            .get(stage.as_str())
            .and_then(|v| v.parse::<StageStatus>().ok());
        let artifact = artifacts.get(stage.as_str());
        match (status, artifact) {
            (Some(StageStatus::Done), Some(artifact)) if !artifact.is_empty() => {
                descriptor.stage_status.insert(stage, StageStatus::Done);
                descriptor.artifacts.insert(stage, artifact.clone());
            }
            _ => break,
        }
    }
    descriptor
}

fn salvage_block(header: &str, block: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    let mut inside = false;

    for line in header.lines() {
        if !inside {
            if line.trim_end() == format!("{}:", block) {
                inside = true;
            }
            continue;
        }

        if !line.starts_with(' ') {
            break;
        }
        let Some((key, value)) = line.trim().split_once(':') else {
            break;
        };
        let value = value.trim();
        let value = serde_yaml::from_str::<String>(value).unwrap_or_else(|_| value.to_string());
        entries.insert(key.trim().to_string(), value);
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lesson(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("course").join("lesson01.mp4");
        fs_err::create_dir_all(path.parent().unwrap()).unwrap();
        fs_err::write(&path, b"video bytes").unwrap();
        path
    }

    #[test]
    fn test_record_path_sits_next_to_video() {
        let path = StatusStore::record_path(Path::new("/c/lesson01.mp4"));
        assert_eq!(path, PathBuf::from("/c/lesson01.status.md"));
        assert!(StatusStore::is_record(&path));
        assert!(!StatusStore::is_record(Path::new("/c/lesson01.mp4")));
    }

    #[test]
    fn test_load_missing_record_gives_fresh_descriptor() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        let item = StatusStore::new().load(&identity).unwrap();
        assert_eq!(item.identity, identity);
        assert_eq!(item.course, "course");
        assert!(Stage::ALL.iter().all(|s| item.status(*s) == StageStatus::Pending));
    }

    #[test]
    fn test_save_then_load_preserves_state_and_notes() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        let store = StatusStore::new();

        let mut item = store.load(&identity).unwrap();
        item.begin(Stage::AudioExtracted).unwrap();
        item.complete(Stage::AudioExtracted, "/tmp/a.mp3".into()).unwrap();
        item.begin(Stage::Transcribed).unwrap();
        item.fail(Stage::Transcribed, "bucket missing", true);
        store.save(&item).unwrap();

        // Operator notes below the header survive later saves
        let record = StatusStore::record_path(&identity);
        let mut content = fs_err::read_to_string(&record).unwrap();
        content.push_str("\nRe-record the intro.\n");
        fs_err::write(&record, content).unwrap();
        store.save(&item).unwrap();

        let loaded = store.load(&identity).unwrap();
        assert_eq!(loaded.status(Stage::AudioExtracted), StageStatus::Done);
        assert_eq!(loaded.artifact(Stage::AudioExtracted), Some("/tmp/a.mp3"));
        assert_eq!(loaded.status(Stage::Transcribed), StageStatus::Failed);
        assert_eq!(loaded.attempts(Stage::Transcribed), 1);
        assert_eq!(loaded.error(Stage::Transcribed), Some("bucket missing"));
        assert!(fs_err::read_to_string(&record)
            .unwrap()
            .contains("Re-record the intro."));
    }

    #[test]
    fn test_unparseable_record_is_corrupt_state() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        fs_err::write(
            StatusStore::record_path(&identity),
            "---\nstage_status: [unterminated\n---\n",
        )
        .unwrap();
        let err = StatusStore::new().load(&identity).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptState { .. }));
    }

    #[test]
    fn test_recover_salvages_leading_done_stages() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        let record = StatusStore::record_path(&identity);
        fs_err::write(
            &record,
            "---\nidentity: x\nstage_status:\n  audio_extracted: done\n  transcribed: done\n  ai_processed: ??? {\nartifacts:\n  audio_extracted: /out/a.mp3\n  transcribed: '/out/t.md'\ncreated_at: garbage\n---\n",
        )
        .unwrap();

        let store = StatusStore::new();
        assert!(store.load(&identity).is_err());
        let item = store.recover(&identity).unwrap();

        assert_eq!(item.status(Stage::AudioExtracted), StageStatus::Done);
        assert_eq!(item.artifact(Stage::AudioExtracted), Some("/out/a.mp3"));
        assert_eq!(item.status(Stage::Transcribed), StageStatus::Done);
        assert_eq!(item.artifact(Stage::Transcribed), Some("/out/t.md"));
        assert_eq!(item.status(Stage::AiProcessed), StageStatus::Pending);
        assert_eq!(item.status(Stage::Published), StageStatus::Pending);
        assert!(PathBuf::from(format!("{}.corrupted", record.display())).exists());
    }

    #[test]
    fn test_recover_never_marks_done_without_artifact() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        fs_err::write(
            StatusStore::record_path(&identity),
            "---\nstage_status:\n  audio_extracted: done\n  transcribed: done\nartifacts:\n  transcribed: /out/t.md\n---\n",
        )
        .unwrap();
        let item = StatusStore::new().recover(&identity).unwrap();
        assert!(Stage::ALL.iter().all(|s| !item.is_done(*s)));
    }

    #[test]
    fn test_interrupted_write_leaves_previous_record_intact() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        let store = StatusStore::new();
        let item = store.load(&identity).unwrap();
        store.save(&item).unwrap();

        // A writer that dies before the rename leaves only a stray temp file
        {
            use std::io::Write;
            let mut partial = tempfile::Builder::new()
                .prefix(".podcaster-")
                .suffix(".tmp")
                .tempfile_in(identity.parent().unwrap())
                .unwrap();
            partial
                .write_all(b"---\nstage_status:\n  audio_extracted: do")
                .unwrap();
            let (_file, _path) = partial.keep().unwrap();
        }

        let reloaded = store.load(&identity).unwrap();
        assert_eq!(reloaded.status(Stage::AudioExtracted), StageStatus::Pending);
        assert!(reloaded.artifact(Stage::AudioExtracted).is_none());
    }

    #[test]
    fn test_inspect_reports_corrupt_record_without_writing() {
        let dir = TempDir::new().unwrap();
        let video = lesson(&dir);
        let record = StatusStore::record_path(&video);
        let raw = "---\nstage_status:\n  audio_extracted: done\n  transcribed: [\nartifacts:\n  audio_extracted: a.mp3\n---\n";
        fs_err::write(&record, raw).unwrap();

        let store = StatusStore::new();
        assert!(matches!(
            store.load(&video),
            Err(PipelineError::CorruptState { .. })
        ));
        let descriptor = store.inspect(&video).unwrap();
        assert!(descriptor.is_done(Stage::AudioExtracted));
        assert!(!descriptor.is_done(Stage::Transcribed));

        assert_eq!(fs_err::read_to_string(&record).unwrap(), raw);
        let backup = PathBuf::from(format!("{}.corrupted", record.display()));
        assert!(!backup.exists());
    }

    #[test]
    fn test_load_or_recover_handles_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let video = lesson(&dir);
        fs_err::write(StatusStore::record_path(&video), "---\nstage_status: [\n---\n").unwrap();

        let store = StatusStore::new();
        let descriptor = store.load_or_recover(&video).unwrap();
        assert!(Stage::ALL.iter().all(|s| !descriptor.is_done(*s)));
    }

    #[test]
    fn test_reset_stages_reopens_downstream() {
        let dir = TempDir::new().unwrap();
        let video = lesson(&dir);
        let store = StatusStore::new();

        let mut descriptor = ItemDescriptor::new(&video);
        for stage in [Stage::AudioExtracted, Stage::Transcribed, Stage::AiProcessed] {
            descriptor.begin(stage).unwrap();
            descriptor.complete(stage, format!("{}.out", stage)).unwrap();
        }
        store.save(&descriptor).unwrap();

        let (descriptor, reset) = store.reset_stages(&video, &[Stage::Transcribed]).unwrap();
        assert!(descriptor.is_done(Stage::AudioExtracted));
        assert!(!descriptor.is_done(Stage::Transcribed));
        assert!(!descriptor.is_done(Stage::AiProcessed));
        assert!(reset.contains(&Stage::Published));
        assert!(reset.contains(&Stage::TimestampsGenerated));
        assert!(!reset.contains(&Stage::AudioExtracted));

        let stored = store.load(&video).unwrap();
        assert_eq!(stored, descriptor);
    }

    #[test]
    fn test_reconcile_supersedes_replaced_video() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        let store = StatusStore::new();
        let mut item = store.load(&identity).unwrap();
        assert_eq!(store.reconcile(&mut item), Reconciliation::Unchanged);
        item.begin(Stage::AudioExtracted).unwrap();
        item.fail(Stage::AudioExtracted, "boom", true);

        fs_err::write(&identity, b"a completely different and longer video").unwrap();
        assert_eq!(store.reconcile(&mut item), Reconciliation::Superseded);
        assert_eq!(item.status(Stage::AudioExtracted), StageStatus::Pending);
        assert_eq!(item.attempts(Stage::AudioExtracted), 0);
    }

    #[test]
    fn test_reconcile_resets_stages_with_missing_artifacts() {
        let dir = TempDir::new().unwrap();
        let identity = lesson(&dir);
        let audio = dir.path().join("a.mp3");
        fs_err::write(&audio, b"mp3").unwrap();

        let store = StatusStore::new();
        let mut item = store.load(&identity).unwrap();
        store.reconcile(&mut item);
        item.begin(Stage::AudioExtracted).unwrap();
        item.complete(Stage::AudioExtracted, audio.display().to_string())
            .unwrap();
        item.begin(Stage::Transcribed).unwrap();
        item.complete(Stage::Transcribed, dir.path().join("gone.md").display().to_string())
            .unwrap();

        assert_eq!(
            store.reconcile(&mut item),
            Reconciliation::Invalidated(vec![Stage::Transcribed])
        );
        assert!(item.is_done(Stage::AudioExtracted));
        assert_eq!(item.status(Stage::Transcribed), StageStatus::Pending);
    }
}
