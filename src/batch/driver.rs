//! The analysis engine boundary.
//!
//! The orchestrator only knows [`AnalysisDriver`]. [`SpoolDriver`] talks to an
//! engine front-end (for example a browser automation harness) through a
//! shared directory:
//!
//! ```text
//! <spool>/inbox/          uploaded audio files + manifest.json
//! <spool>/outbox/*.csv    exports written by the engine
//! <spool>/done            marker: analysis finished
//! <spool>/error           marker: analysis failed, contents = message
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::config::DriverConfig;
use crate::utils::file_ops::remove_if_exists;
use crate::{HarvestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub success: bool,
    pub uploaded_count: usize,
    pub skipped_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub success: bool,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl ExportResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, file_path: None, error: Some(error.into()) }
    }
}

pub trait AnalysisDriver {
    fn upload(&mut self, files: &[PathBuf]) -> Result<UploadResult>;

    /// `Ok(true)` once analysis finished, `Ok(false)` on timeout, `Err` when
    /// the engine reports an error state.
    fn wait_for_completion(&mut self, timeout: Duration) -> Result<bool>;

    fn is_export_ready(&mut self) -> Result<bool>;

    fn export_results(&mut self, destination: &Path) -> Result<ExportResult>;

    /// Return the engine to a clean baseline. Must be idempotent.
    fn reset_session(&mut self) -> Result<()>;
}

#[derive(Serialize)]
struct Manifest<'a> {
    files: &'a [String],
}

pub struct SpoolDriver {
    spool_dir: PathBuf,
    poll_interval: Duration,
    upload_retries: u32,
    upload_backoff: Duration,
}

impl SpoolDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            spool_dir: config.spool_dir.clone(),
            poll_interval: config.poll_interval(),
            upload_retries: config.upload_retries,
            upload_backoff: config.upload_backoff(),
        }
    }

    pub fn inbox(&self) -> PathBuf {
        self.spool_dir.join("inbox")
    }

    pub fn outbox(&self) -> PathBuf {
        self.spool_dir.join("outbox")
    }

    fn done_marker(&self) -> PathBuf {
        self.spool_dir.join("done")
    }

    fn error_marker(&self) -> PathBuf {
        self.spool_dir.join("error")
    }

    /// Copy with the driver's own retry budget. Returns the last error if
    /// every attempt failed.
    fn copy_with_retries(&self, source: &Path, target: &Path) -> std::io::Result<()> {
        let mut attempt = 0;
        loop {
            match fs::copy(source, target) {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.upload_retries && e.kind() != std::io::ErrorKind::NotFound => {
                    attempt += 1;
                    log::debug!(
                        "Retrying copy of {} ({}/{}): {}",
                        source.display(),
                        attempt,
                        self.upload_retries,
                        e
                    );
                    thread::sleep(self.upload_backoff * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn csv_exports(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let outbox = self.outbox();
        if !outbox.is_dir() {
            return Ok(Vec::new());
        }
        let mut exports = Vec::new();
        for entry in fs::read_dir(&outbox)? {
            let entry = entry?;
            let path = entry.path();
            let is_csv = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
            if is_csv && entry.file_type()?.is_file() {
                let modified = entry.metadata()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                exports.push((path, modified));
            }
        }
        Ok(exports)
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl AnalysisDriver for SpoolDriver {
    fn upload(&mut self, files: &[PathBuf]) -> Result<UploadResult> {
        let inbox = self.inbox();
        fs::create_dir_all(&inbox)?;

        let mut uploaded = Vec::new();
        let mut skipped = 0;
        for (index, source) in files.iter().enumerate() {
            let Some(name) = source.file_name() else {
                skipped += 1;
                continue;
            };
            // Prefix keeps same-named files from different folders apart
            let target_name = format!("{:04}_{}", index, name.to_string_lossy());
            match self.copy_with_retries(source, &inbox.join(&target_name)) {
                Ok(()) => uploaded.push(target_name),
                Err(e) => {
                    log::warn!("Skipping {}: {}", source.display(), e);
                    skipped += 1;
                }
            }
        }

        if uploaded.is_empty() {
            return Ok(UploadResult {
                success: false,
                uploaded_count: 0,
                skipped_count: skipped,
                error: Some(format!("none of the {} files could be staged", files.len())),
            });
        }

        let manifest = serde_json::to_string_pretty(&Manifest { files: &uploaded })?;
        fs::write(inbox.join("manifest.json"), manifest)?;
        log::debug!("Staged {} files in {}", uploaded.len(), inbox.display());

        Ok(UploadResult {
            success: true,
            uploaded_count: uploaded.len(),
            skipped_count: skipped,
            error: None,
        })
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.error_marker().exists() {
                let message = fs::read_to_string(self.error_marker()).unwrap_or_default();
                let message = message.trim();
                return Err(HarvestError::AnalysisErrorState(if message.is_empty() {
                    "engine raised an error without a message".to_string()
                } else {
                    message.to_string()
                }));
            }
            if self.done_marker().exists() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn is_export_ready(&mut self) -> Result<bool> {
        Ok(!self.csv_exports()?.is_empty())
    }

    fn export_results(&mut self, destination: &Path) -> Result<ExportResult> {
        let newest = self
            .csv_exports()?
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let Some((source, _)) = newest else {
            return Ok(ExportResult::failed("no export found in outbox"));
        };
        let Some(name) = source.file_name() else {
            return Ok(ExportResult::failed("export has no file name"));
        };

        fs::create_dir_all(destination)?;
        let target = destination.join(name);
        if fs::rename(&source, &target).is_err() {
            // Cross-device moves fall back to copy + delete
            fs::copy(&source, &target)?;
            fs::remove_file(&source)?;
        }
        Ok(ExportResult { success: true, file_path: Some(target), error: None })
    }

    fn reset_session(&mut self) -> Result<()> {
        clear_dir(&self.inbox())?;
        clear_dir(&self.outbox())?;
        remove_if_exists(self.done_marker())?;
        remove_if_exists(self.error_marker())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn driver(dir: &TempDir) -> SpoolDriver {
        SpoolDriver::new(&DriverConfig {
            spool_dir: dir.path().join("spool"),
            poll_interval_ms: 5,
            upload_retries: 1,
            upload_backoff_ms: 1,
        })
    }

    #[test]
    fn upload_stages_files_and_counts_missing_ones() {
        let dir = TempDir::new().unwrap();
        let song = dir.path().join("song.mp3");
        fs::write(&song, b"audio").unwrap();
        let mut driver = driver(&dir);

        let result = driver.upload(&[song, dir.path().join("missing.mp3")]).unwrap();

        assert_eq!(
            result,
            UploadResult { success: true, uploaded_count: 1, skipped_count: 1, error: None }
        );
        assert!(driver.inbox().join("0000_song.mp3").exists());
        let manifest = fs::read_to_string(driver.inbox().join("manifest.json")).unwrap();
        assert!(manifest.contains("0000_song.mp3"));
    }

    #[test]
    fn upload_with_nothing_staged_fails() {
        let dir = TempDir::new().unwrap();
        let mut driver = driver(&dir);
        let result = driver.upload(&[dir.path().join("gone.wav")]).unwrap();
        assert!(!result.success);
        assert_eq!(result.skipped_count, 1);
    }

    #[test]
    fn wait_reports_done_error_and_timeout() {
        let dir = TempDir::new().unwrap();
        let mut driver = driver(&dir);
        fs::create_dir_all(dir.path().join("spool")).unwrap();

        assert!(!driver.wait_for_completion(Duration::from_millis(20)).unwrap());

        fs::write(dir.path().join("spool/done"), "").unwrap();
        assert!(driver.wait_for_completion(Duration::from_millis(20)).unwrap());

        fs::write(dir.path().join("spool/error"), "model failed to load\n").unwrap();
        let err = driver.wait_for_completion(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, HarvestError::AnalysisErrorState(m) if m == "model failed to load"));
    }

    #[test]
    fn export_moves_csv_and_reset_clears_spool() {
        let dir = TempDir::new().unwrap();
        let mut driver = driver(&dir);
        assert!(!driver.is_export_ready().unwrap());

        fs::create_dir_all(driver.outbox()).unwrap();
        fs::write(driver.outbox().join("results.csv"), "filename,bpm\n").unwrap();
        fs::write(driver.outbox().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("spool/done"), "").unwrap();
        assert!(driver.is_export_ready().unwrap());

        let dest = dir.path().join("partials");
        let export = driver.export_results(&dest).unwrap();
        assert!(export.success);
        assert_eq!(export.file_path, Some(dest.join("results.csv")));
        assert!(dest.join("results.csv").exists());
        assert!(!driver.is_export_ready().unwrap());

        driver.reset_session().unwrap();
        driver.reset_session().unwrap();
        assert!(!dir.path().join("spool/done").exists());
        assert!(!driver.outbox().join("notes.txt").exists());
    }

    #[test]
    fn export_without_csv_reports_failure() {
        let dir = TempDir::new().unwrap();
        let mut driver = driver(&dir);
        let export = driver.export_results(&dir.path().join("partials")).unwrap();
        assert!(!export.success);
        assert!(export.file_path.is_none());
    }
}
