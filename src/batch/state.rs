//! Batch records, the aggregate processing state, and its on-disk store.
//!
//! The state document is rewritten after every batch transition so that an
//! interrupted run can be resumed without redoing completed batches.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::discovery::AudioFileRef;
use crate::utils::file_ops::{remove_if_exists, temp_path, write_atomic};
use crate::{HarvestError, Result};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: u32,
    pub files: Vec<AudioFileRef>,
    pub status: BatchStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Export artifact written for this batch, if the engine produced one
    pub artifact: Option<PathBuf>,
    pub uploaded: usize,
    pub skipped: usize,
}

impl Batch {
    pub fn new(id: u32, files: Vec<AudioFileRef>, max_attempts: u32) -> Self {
        Self {
            id,
            files,
            status: BatchStatus::Pending,
            attempts: 0,
            max_attempts,
            started_at: None,
            finished_at: None,
            last_error: None,
            artifact: None,
            uploaded: 0,
            skipped: 0,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_retryable(&self) -> bool {
        self.status == BatchStatus::Failed && self.has_attempts_left()
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            BatchStatus::Completed => true,
            BatchStatus::Failed => !self.has_attempts_left(),
            _ => false,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    fn start(&mut self) -> Result<()> {
        if self.status != BatchStatus::Pending && !self.is_retryable() {
            return Err(HarvestError::State(format!(
                "batch {} cannot start from {} with {}/{} attempts",
                self.id,
                self.status.as_str(),
                self.attempts,
                self.max_attempts
            )));
        }
        self.status = BatchStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        Ok(())
    }

    fn complete(&mut self, artifact: Option<PathBuf>, uploaded: usize, skipped: usize) -> Result<()> {
        self.expect_processing("complete")?;
        self.status = BatchStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.last_error = None;
        self.artifact = artifact;
        self.uploaded = uploaded;
        self.skipped = skipped;
        Ok(())
    }

    fn fail(&mut self, error: String) -> Result<()> {
        self.expect_processing("fail")?;
        self.status = BatchStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.last_error = Some(error);
        Ok(())
    }

    fn expect_processing(&self, transition: &str) -> Result<()> {
        if self.status != BatchStatus::Processing {
            return Err(HarvestError::State(format!(
                "cannot {} batch {} while {}",
                transition,
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }
}

/// Per-status batch tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub retryable: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub version: u32,
    pub root: Option<PathBuf>,
    pub total_files: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    pub current_batch: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub batches: Vec<Batch>,
    pub processed_files: BTreeSet<PathBuf>,
    pub failed_files: BTreeSet<PathBuf>,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::new(None, Vec::new())
    }
}

impl ProcessingState {
    pub fn new(root: Option<PathBuf>, batches: Vec<Batch>) -> Self {
        let total_files = batches.iter().map(|b| b.files.len()).sum();
        Self {
            version: STATE_VERSION,
            root,
            total_files,
            processed_count: 0,
            failed_count: 0,
            current_batch: None,
            started_at: Utc::now(),
            batches,
            processed_files: BTreeSet::new(),
            failed_files: BTreeSet::new(),
        }
    }

    pub fn batch(&self, id: u32) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }

    fn batch_mut(&mut self, id: u32) -> Result<&mut Batch> {
        self.batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| HarvestError::State(format!("unknown batch id {}", id)))
    }

    /// First pending batch, else the first failed batch with attempts left.
    pub fn next_eligible(&self) -> Option<u32> {
        self.batches
            .iter()
            .find(|b| b.status == BatchStatus::Pending)
            .or_else(|| self.batches.iter().find(|b| b.is_retryable()))
            .map(|b| b.id)
    }

    pub fn start_batch(&mut self, id: u32) -> Result<()> {
        self.batch_mut(id)?.start()?;
        self.current_batch = Some(id);
        Ok(())
    }

    pub fn complete_batch(
        &mut self,
        id: u32,
        artifact: Option<PathBuf>,
        uploaded: usize,
        skipped: usize,
    ) -> Result<()> {
        let batch = self.batch_mut(id)?;
        batch.complete(artifact, uploaded, skipped)?;
        let paths: Vec<PathBuf> = batch.paths().map(Path::to_path_buf).collect();
        for path in paths {
            self.failed_files.remove(&path);
            self.processed_files.insert(path);
        }
        self.current_batch = None;
        self.recount();
        Ok(())
    }

    pub fn fail_batch(&mut self, id: u32, error: impl Into<String>) -> Result<()> {
        let batch = self.batch_mut(id)?;
        batch.fail(error.into())?;
        if batch.is_terminal() {
            let paths: Vec<PathBuf> = batch.paths().map(Path::to_path_buf).collect();
            self.failed_files.extend(paths);
        }
        self.current_batch = None;
        self.recount();
        Ok(())
    }

    /// Turn batches left in `processing` by a crashed run into failed attempts.
    /// Returns how many batches were recovered.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        let mut newly_failed = Vec::new();
        for batch in self.batches.iter_mut().filter(|b| b.status == BatchStatus::Processing) {
            batch.status = BatchStatus::Failed;
            batch.last_error = Some("interrupted before completion".to_string());
            if batch.is_terminal() {
                newly_failed.extend(batch.paths().map(Path::to_path_buf));
            }
            recovered += 1;
        }
        self.failed_files.extend(newly_failed);
        self.current_batch = None;
        self.recount();
        recovered
    }

    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for batch in &self.batches {
            match batch.status {
                BatchStatus::Pending => counts.pending += 1,
                BatchStatus::Processing => counts.processing += 1,
                BatchStatus::Completed => counts.completed += 1,
                BatchStatus::Failed if batch.has_attempts_left() => counts.retryable += 1,
                BatchStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn is_finished(&self) -> bool {
        self.batches.iter().all(Batch::is_terminal)
    }

    pub fn check_invariants(&self) -> Result<()> {
        if self.processed_count + self.failed_count > self.total_files {
            return Err(HarvestError::State(format!(
                "processed ({}) + failed ({}) exceeds total files ({})",
                self.processed_count, self.failed_count, self.total_files
            )));
        }
        let open: BTreeSet<&Path> = self
            .batches
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Pending | BatchStatus::Processing))
            .flat_map(|b| b.paths())
            .collect();
        let overlap = self
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .flat_map(|b| b.paths())
            .find(|p| open.contains(p));
        if let Some(path) = overlap {
            return Err(HarvestError::State(format!(
                "{} belongs to both a completed and an open batch",
                path.display()
            )));
        }
        Ok(())
    }

    fn recount(&mut self) {
        self.processed_count = self.processed_files.len();
        self.failed_count = self.failed_files.len();
    }
}

/// JSON file store for [`ProcessingState`]. Assumes a single writer.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &ProcessingState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, json)?;
        log::debug!("Saved progress state to {}", self.path.display());
        Ok(())
    }

    /// `Ok(None)` when no state has been saved yet.
    pub fn load(&self) -> Result<Option<ProcessingState>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: ProcessingState = serde_json::from_str(&data)?;
        if state.version != STATE_VERSION {
            return Err(HarvestError::State(format!(
                "unsupported state version {} in {}",
                state.version,
                self.path.display()
            )));
        }
        state.check_invariants()?;
        Ok(Some(state))
    }

    pub fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), temp_path(&self.path)] {
            if remove_if_exists(&path)? {
                log::info!("Removed {}", path.display());
            }
        }
        Ok(())
    }
}
