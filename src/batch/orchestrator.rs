//! Drives batches through upload → wait → export, one at a time.
//!
//! Retry budgets are split by layer: the orchestrator owns whole-batch
//! retries (`max_attempts`, `retry_backoff`), a driver owns whatever retries
//! it does internally, and nothing retries across both.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::batch::driver::AnalysisDriver;
use crate::batch::state::{BatchStatus, ProcessingState, StateStore};
use crate::config::BatchConfig;
use crate::{HarvestError, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub total_batches: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub attempts_this_run: usize,
    pub artifacts: Vec<PathBuf>,
    /// Completed batches that produced no export artifact
    pub missing_exports: Vec<u32>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunOutcome {
    fn from_state(state: &ProcessingState, attempts_this_run: usize, cancelled: bool, elapsed: Duration) -> Self {
        let counts = state.counts();
        let completed: Vec<_> = state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .collect();
        Self {
            total_batches: state.batches.len(),
            completed: counts.completed,
            failed: counts.failed,
            pending: counts.pending + counts.retryable + counts.processing,
            processed_files: state.processed_count,
            failed_files: state.failed_count,
            skipped_files: completed.iter().map(|b| b.skipped).sum(),
            attempts_this_run,
            artifacts: completed.iter().filter_map(|b| b.artifact.clone()).collect(),
            missing_exports: completed.iter().filter(|b| b.artifact.is_none()).map(|b| b.id).collect(),
            cancelled,
            elapsed,
        }
    }
}

struct BatchSuccess {
    artifact: Option<PathBuf>,
    uploaded: usize,
    skipped: usize,
}

pub struct BatchOrchestrator<D> {
    driver: D,
    store: StateStore,
    state: ProcessingState,
    config: BatchConfig,
    artifact_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl<D: AnalysisDriver> BatchOrchestrator<D> {
    pub fn new(
        driver: D,
        store: StateStore,
        state: ProcessingState,
        config: BatchConfig,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            driver,
            store,
            state,
            config,
            artifact_dir: artifact_dir.into(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancellation flag (e.g. set from a signal handler).
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Sleep in short slices; returns true if cancellation arrived meanwhile.
    fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        let started = Instant::now();

        if self.state.batches.is_empty() {
            log::info!("No batches to process");
            return Ok(RunOutcome::from_state(&self.state, 0, false, started.elapsed()));
        }
        fs::create_dir_all(&self.artifact_dir)?;

        let mut consecutive_failures = 0u32;
        let mut attempts = 0usize;
        let mut cancelled = false;

        loop {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some(id) = self.state.next_eligible() else {
                break;
            };

            if attempts > 0 && self.sleep_unless_cancelled(self.config.inter_batch_delay()) {
                cancelled = true;
                break;
            }
            let is_retry = self.state.batch(id).is_some_and(|b| b.attempts > 0);
            if is_retry && self.sleep_unless_cancelled(self.config.retry_backoff()) {
                cancelled = true;
                break;
            }

            // Leftovers from an earlier batch or an earlier run must not leak in
            if let Err(e) = self.driver.reset_session() {
                log::warn!("Session reset before batch {} failed: {}", id, e);
            }

            self.state.start_batch(id)?;
            self.store.save(&self.state)?;
            attempts += 1;

            let (attempt, max_attempts, size) = self
                .state
                .batch(id)
                .map(|b| (b.attempts, b.max_attempts, b.files.len()))
                .unwrap_or_default();
            log::info!(
                "Processing batch {} ({} files, attempt {}/{})",
                id,
                size,
                attempt,
                max_attempts
            );

            match self.drive_batch(id) {
                Ok(success) => {
                    if success.artifact.is_none() {
                        log::warn!("Batch {} completed without an export artifact", id);
                    }
                    self.state.complete_batch(id, success.artifact, success.uploaded, success.skipped)?;
                    self.store.save(&self.state)?;
                    consecutive_failures = 0;
                    log::info!(
                        "Batch {} completed ({}/{} files processed)",
                        id,
                        self.state.processed_count,
                        self.state.total_files
                    );
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.state.fail_batch(id, reason.clone())?;
                    self.store.save(&self.state)?;
                    consecutive_failures += 1;
                    log::error!("Batch {} failed on attempt {}: {}", id, attempt, reason);

                    if self.config.strict {
                        return Err(HarvestError::BatchFailed { id, reason });
                    }
                    if consecutive_failures >= self.config.consecutive_failure_threshold {
                        log::error!(
                            "Aborting run: {} consecutive batch failures",
                            consecutive_failures
                        );
                        return Err(HarvestError::CircuitBreakerTripped(consecutive_failures));
                    }
                }
            }
        }

        if cancelled {
            log::warn!("Run cancelled; remaining batches left for a resumed run");
        }
        Ok(RunOutcome::from_state(&self.state, attempts, cancelled, started.elapsed()))
    }

    fn drive_batch(&mut self, id: u32) -> Result<BatchSuccess> {
        let files: Vec<PathBuf> = self
            .state
            .batch(id)
            .map(|b| b.paths().map(Path::to_path_buf).collect())
            .unwrap_or_default();

        let upload = self.driver.upload(&files)?;
        if !upload.success {
            return Err(HarvestError::Upload(
                upload.error.unwrap_or_else(|| "engine rejected the upload".to_string()),
            ));
        }
        if upload.skipped_count > 0 {
            log::warn!("Batch {}: engine skipped {} files", id, upload.skipped_count);
        }

        let timeout = self.config.analysis_timeout();
        if !self.driver.wait_for_completion(timeout)? {
            return Err(HarvestError::AnalysisTimeout(timeout));
        }

        let artifact = self.collect_export(id)?;
        Ok(BatchSuccess {
            artifact,
            uploaded: upload.uploaded_count,
            skipped: upload.skipped_count,
        })
    }

    fn export_ready(&mut self, id: u32) -> bool {
        let checks = self.config.export_ready_checks.max(1);
        for check in 1..=checks {
            match self.driver.is_export_ready() {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => log::warn!("Batch {}: export readiness check failed: {}", id, e),
            }
            if check < checks {
                thread::sleep(self.config.export_ready_interval());
            }
        }
        false
    }

    /// Export and tag the artifact with the batch id. A missing export is a
    /// warning, not a batch failure.
    fn collect_export(&mut self, id: u32) -> Result<Option<PathBuf>> {
        if !self.export_ready(id) {
            log::warn!("Batch {}: export not ready after grace checks", id);
            return Ok(None);
        }

        let export = match self.driver.export_results(&self.artifact_dir) {
            Ok(export) => export,
            Err(e) => {
                log::warn!("Batch {}: export failed: {}", id, e);
                return Ok(None);
            }
        };
        let exported = match (export.success, export.file_path) {
            (true, Some(path)) => path,
            (_, _) => {
                log::warn!(
                    "Batch {}: export reported failure: {}",
                    id,
                    export.error.unwrap_or_else(|| "no file produced".to_string())
                );
                return Ok(None);
            }
        };

        let export_name = exported
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export.csv".to_string());
        let tagged = self.artifact_dir.join(artifact_name(id, &export_name));
        fs::rename(&exported, &tagged)?;
        log::info!("Batch {}: export saved to {}", id, tagged.display());
        Ok(Some(tagged))
    }
}

/// `batch_<3-digit-id>_<export-name>.csv`
pub fn artifact_name(id: u32, export_name: &str) -> String {
    let has_csv_ext = Path::new(export_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if has_csv_ext {
        format!("batch_{:03}_{}", id, export_name)
    } else {
        format!("batch_{:03}_{}.csv", id, export_name)
    }
}
