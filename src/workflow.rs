//! End-to-end sequencing: discover → plan → process → merge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::audio::discovery::{DiscoveryStats, FileDiscovery};
use crate::batch::driver::AnalysisDriver;
use crate::batch::orchestrator::{BatchOrchestrator, RunOutcome};
use crate::batch::planner::plan_batches;
use crate::batch::state::{ProcessingState, StateStore};
use crate::config::PipelineConfig;
use crate::merge::artifacts::discover_artifacts;
use crate::merge::engine::{MergeEngine, MergeOptions, MergeReport};
use crate::utils::reporting::Reporter;
use crate::{HarvestError, Result};

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    /// Present when this run discovered files instead of resuming
    pub discovery: Option<DiscoveryStats>,
    pub resumed: bool,
    pub outcome: RunOutcome,
    pub merge: Option<MergeReport>,
}

pub struct WorkflowCoordinator {
    config: PipelineConfig,
    store: StateStore,
}

impl WorkflowCoordinator {
    pub fn new(config: PipelineConfig) -> Self {
        let store = StateStore::new(&config.state_path);
        Self { config, store }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn merge_engine(&self) -> MergeEngine {
        MergeEngine::new(MergeOptions::from_config(&self.config.merge))
    }

    fn batch_report_path(&self) -> PathBuf {
        self.config
            .state_path
            .parent()
            .map(|p| p.join("batch_report.csv"))
            .unwrap_or_else(|| PathBuf::from("batch_report.csv"))
    }

    /// Load resumable state for `root`, or discover and plan a fresh run.
    pub fn prepare_state(&self, root: &Path, resume: bool) -> Result<(ProcessingState, Option<DiscoveryStats>)> {
        if !root.is_dir() {
            return Err(HarvestError::InvalidRoot(root.to_path_buf()));
        }
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        if resume {
            if let Some(mut state) = self.store.load()? {
                if state.root.as_deref() != Some(root.as_path()) {
                    return Err(HarvestError::State(format!(
                        "saved progress belongs to {}; clear it before processing {}",
                        state.root.as_deref().unwrap_or(Path::new("<unknown>")).display(),
                        root.display()
                    )));
                }
                let recovered = state.recover_interrupted();
                if recovered > 0 {
                    log::warn!("Recovered {} batches interrupted by a previous run", recovered);
                }
                log::info!(
                    "Resuming: {}/{} files already processed",
                    state.processed_count,
                    state.total_files
                );
                self.store.save(&state)?;
                return Ok((state, None));
            }
        }

        let discovery = FileDiscovery::new(&self.config.discovery).discover(&root)?;
        if discovery.files.is_empty() {
            return Err(HarvestError::NoInputFiles(root));
        }
        let batches = plan_batches(&discovery.files, self.config.batch.batch_size, self.config.batch.max_attempts)?;
        if let Some(archive) = self.archive_previous_artifacts()? {
            log::warn!("Moved batch artifacts of an earlier run to {}", archive.display());
        }
        let state = ProcessingState::new(Some(root), batches);
        self.store.save(&state)?;
        Ok((state, Some(discovery.statistics)))
    }

    /// A fresh plan reuses batch ids from 1, so artifacts already in the
    /// artifact directory go into a `superseded_<timestamp>` subdirectory
    /// where merges no longer see them.
    pub fn archive_previous_artifacts(&self) -> Result<Option<PathBuf>> {
        let artifact_dir = &self.config.artifact_dir;
        if !artifact_dir.is_dir() {
            return Ok(None);
        }
        let previous = discover_artifacts(artifact_dir)?;
        if previous.is_empty() {
            return Ok(None);
        }

        let archive = artifact_dir.join(format!("superseded_{}", Utc::now().format("%Y%m%d_%H%M%S%3f")));
        fs::create_dir_all(&archive)?;
        for artifact in &previous {
            fs::rename(&artifact.path, archive.join(&artifact.name))?;
        }
        Ok(Some(archive))
    }

    pub fn run<D: AnalysisDriver>(
        &self,
        root: &Path,
        driver: D,
        cancel: Arc<AtomicBool>,
        resume: bool,
    ) -> Result<WorkflowReport> {
        let (state, discovery) = self.prepare_state(root, resume)?;
        let resumed = discovery.is_none();

        let mut orchestrator = BatchOrchestrator::new(
            driver,
            self.store.clone(),
            state,
            self.config.batch.clone(),
            &self.config.artifact_dir,
        )
        .with_cancel_flag(Arc::clone(&cancel));

        let result = orchestrator.run();
        // The per-batch report is written even when the run aborted
        if let Err(e) = Reporter::new().generate_batch_report(orchestrator.state(), self.batch_report_path()) {
            log::warn!("Could not write batch report: {}", e);
        }
        let outcome = result?;

        let merge = if outcome.cancelled || cancel.load(Ordering::SeqCst) {
            log::warn!("Skipping merge after cancellation");
            None
        } else {
            self.merge_available()?
        };

        Ok(WorkflowReport { discovery, resumed, outcome, merge })
    }

    /// Merge when at least one valid artifact exists; otherwise log and skip.
    fn merge_available(&self) -> Result<Option<MergeReport>> {
        let engine = self.merge_engine();
        let readiness = engine.readiness(&self.config.artifact_dir, &self.config.merge.output_dir)?;
        if !readiness.is_ready() {
            log::warn!("No valid export artifacts to merge in {}", self.config.artifact_dir.display());
            return Ok(None);
        }
        engine
            .merge(&self.config.artifact_dir, &self.config.merge.output_dir)
            .map(Some)
    }

    pub fn merge_only(&self, input_dir: Option<&Path>) -> Result<MergeReport> {
        let input_dir = input_dir.unwrap_or(&self.config.artifact_dir);
        self.merge_engine().merge(input_dir, &self.config.merge.output_dir)
    }

    pub fn status(&self) -> Result<String> {
        let state = self.store.load()?;
        let readiness = self
            .merge_engine()
            .readiness(&self.config.artifact_dir, &self.config.merge.output_dir)?;
        Ok(Reporter::new().status_summary(state.as_ref(), &readiness))
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }
}
