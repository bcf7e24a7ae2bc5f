#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mir_harvester::config::BatchConfig;
use mir_harvester::merge::schema::Schema;
use mir_harvester::{
    AnalysisDriver, AudioFileRef, AudioFormat, ExportResult, HarvestError, PipelineConfig, Result,
    UploadResult,
};

pub fn audio_refs(n: usize) -> Vec<AudioFileRef> {
    (1..=n)
        .map(|i| AudioFileRef {
            path: PathBuf::from(format!("/music/f{:02}.mp3", i)),
            size_bytes: 4096,
            format: AudioFormat::Mp3,
        })
        .collect()
}

pub fn fast_batch_config() -> BatchConfig {
    BatchConfig {
        inter_batch_delay_ms: 0,
        retry_backoff_ms: 0,
        export_ready_checks: 1,
        export_ready_interval_ms: 0,
        analysis_timeout_secs: 1,
        ..BatchConfig::default()
    }
}

pub fn fast_pipeline_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.state_path = root.join("state/state.json");
    config.artifact_dir = root.join("partials");
    config.driver.spool_dir = root.join("spool");
    config.driver.poll_interval_ms = 5;
    config.merge.output_dir = root.join("merged");
    config.discovery.min_file_size = 1;
    config.batch = fast_batch_config();
    config
}

/// Export CSV content in the default schema, one row per uploaded file.
pub fn export_csv(files: &[PathBuf], bpm: &str) -> String {
    let schema = Schema::from_config(&PipelineConfig::default().merge);
    let header = schema.header();
    let mut out = header.join(",");
    out.push('\n');
    for file in files {
        let name = file.file_name().unwrap().to_string_lossy();
        let mut row = vec![name.to_string(), bpm.to_string(), "A minor".to_string()];
        row.extend(std::iter::repeat("0.5").take(header.len() - 3).map(String::from));
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// In-memory engine whose behavior is scripted per test.
#[derive(Default)]
pub struct ScriptedDriver {
    /// Every upload call, in order
    pub uploads: Vec<Vec<PathBuf>>,
    pub resets: usize,
    pub fail_all_uploads: bool,
    /// First file name of a batch -> number of uploads to reject
    pub upload_failures: HashMap<String, u32>,
    pub timeouts_remaining: u32,
    pub error_states_remaining: u32,
    pub never_export: bool,
    pub skipped_per_upload: usize,
    /// Set the flag while handling the n-th upload (1-based)
    pub cancel_on_upload: Option<(usize, Arc<AtomicBool>)>,
    /// Files of the upload awaiting export
    pub pending: Option<Vec<PathBuf>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads_for(mut self, first_file: &str, times: u32) -> Self {
        self.upload_failures.insert(first_file.to_string(), times);
        self
    }

    /// First-file stems of each upload, e.g. ["f01", "f04"]
    pub fn upload_order(&self) -> Vec<String> {
        self.uploads
            .iter()
            .map(|files| files[0].file_stem().unwrap().to_string_lossy().into_owned())
            .collect()
    }
}

impl AnalysisDriver for ScriptedDriver {
    fn upload(&mut self, files: &[PathBuf]) -> Result<UploadResult> {
        self.uploads.push(files.to_vec());
        if let Some((n, flag)) = &self.cancel_on_upload {
            if *n == self.uploads.len() {
                flag.store(true, Ordering::SeqCst);
            }
        }

        let first = files[0].file_name().unwrap().to_string_lossy().into_owned();
        let scripted_failure = match self.upload_failures.get_mut(&first) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if self.fail_all_uploads || scripted_failure {
            return Ok(UploadResult {
                success: false,
                uploaded_count: 0,
                skipped_count: files.len(),
                error: Some("engine refused upload".to_string()),
            });
        }

        self.pending = Some(files.to_vec());
        Ok(UploadResult {
            success: true,
            uploaded_count: files.len() - self.skipped_per_upload,
            skipped_count: self.skipped_per_upload,
            error: None,
        })
    }

    fn wait_for_completion(&mut self, _timeout: Duration) -> Result<bool> {
        if self.error_states_remaining > 0 {
            self.error_states_remaining -= 1;
            return Err(HarvestError::AnalysisErrorState("model crashed".to_string()));
        }
        if self.timeouts_remaining > 0 {
            self.timeouts_remaining -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn is_export_ready(&mut self) -> Result<bool> {
        Ok(!self.never_export && self.pending.is_some())
    }

    fn export_results(&mut self, destination: &Path) -> Result<ExportResult> {
        let Some(files) = self.pending.take() else {
            return Ok(ExportResult::failed("nothing to export"));
        };
        fs::create_dir_all(destination)?;
        let path = destination.join("results.csv");
        fs::write(&path, export_csv(&files, "120.4"))?;
        Ok(ExportResult { success: true, file_path: Some(path), error: None })
    }

    fn reset_session(&mut self) -> Result<()> {
        self.resets += 1;
        self.pending = None;
        Ok(())
    }
}
