use std::fmt::Write as _;
use std::path::Path;
use csv::Writer;
use chrono::{DateTime, Utc};
use crate::audio::discovery::DiscoveryStats;
use crate::batch::orchestrator::RunOutcome;
use crate::batch::state::ProcessingState;
use crate::merge::engine::{MergeReadiness, MergeReport};
use crate::utils::file_ops::write_atomic;
use crate::Result;

pub struct Reporter;

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_default()
}

impl Reporter {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_batch_report(&self, state: &ProcessingState, output_path: impl AsRef<Path>) -> Result<()> {
        let output_path_ref = output_path.as_ref();
        let mut writer = Writer::from_path(output_path_ref)?;

        writer.write_record([
            "Batch",
            "Status",
            "Attempts",
            "Files",
            "Uploaded",
            "Skipped",
            "Started",
            "Finished",
            "Artifact",
            "Last Error",
        ])?;

        for batch in &state.batches {
            writer.write_record(&[
                batch.id.to_string(),
                batch.status.as_str().to_string(),
                format!("{}/{}", batch.attempts, batch.max_attempts),
                batch.files.len().to_string(),
                batch.uploaded.to_string(),
                batch.skipped.to_string(),
                timestamp(batch.started_at),
                timestamp(batch.finished_at),
                batch.artifact.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
                batch.last_error.clone().unwrap_or_default(),
            ])?;
        }

        writer.flush()?;
        log::info!("Batch report generated: {}", output_path_ref.display());
        Ok(())
    }

    pub fn write_merge_report(&self, report: &MergeReport, output_path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        write_atomic(output_path.as_ref(), json)?;
        log::info!("Merge report generated: {}", output_path.as_ref().display());
        Ok(())
    }

    pub fn discovery_summary(&self, stats: &DiscoveryStats) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Audio files: {} ({})", stats.total_files, stats.total_size_display());
        for (format, count, percentage) in stats.format_breakdown() {
            let _ = writeln!(out, "  {}: {} files ({:.1}%)", format, count, percentage);
        }
        let _ = writeln!(
            out,
            "Rejected: {} unsupported format, {} outside size limits",
            stats.rejected_format, stats.rejected_size
        );
        out
    }

    pub fn run_summary(&self, outcome: &RunOutcome) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Batches: {} total, {} completed, {} failed, {} remaining",
            outcome.total_batches, outcome.completed, outcome.failed, outcome.pending
        );
        let _ = writeln!(
            out,
            "Files: {} processed, {} failed, {} skipped by the engine",
            outcome.processed_files, outcome.failed_files, outcome.skipped_files
        );
        let _ = writeln!(out, "Export artifacts: {}", outcome.artifacts.len());
        if !outcome.missing_exports.is_empty() {
            let ids: Vec<String> = outcome.missing_exports.iter().map(u32::to_string).collect();
            let _ = writeln!(out, "Completed without export: batches {}", ids.join(", "));
        }
        if outcome.cancelled {
            let _ = writeln!(out, "Run was cancelled; rerun to resume");
        }
        let _ = writeln!(out, "Elapsed: {:.1}s", outcome.elapsed.as_secs_f64());
        out
    }

    pub fn merge_summary(&self, report: &MergeReport) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Batch files: {} found, {} merged, {} excluded",
            report.batch_files_found,
            report.batch_files_processed,
            report.validation_errors.len()
        );
        let _ = writeln!(out, "Rows: {} read, {} written", report.rows_read, report.total_rows);
        let _ = writeln!(
            out,
            "Duplicates ({}): {} found, {} resolved, {} flagged",
            report.policy, report.duplicates_found, report.duplicates_resolved, report.duplicates_flagged
        );
        if report.out_of_range_values > 0 {
            let _ = writeln!(out, "Scores outside [0, 1]: {}", report.out_of_range_values);
        }
        for error in report.validation_errors.iter().chain(&report.processing_errors) {
            let _ = writeln!(out, "  ! {}", error);
        }
        if let Some(path) = &report.output_path {
            let _ = writeln!(
                out,
                "Output: {} ({})",
                path.display(),
                if report.verified { "verified" } else { "NOT verified" }
            );
        }
        if report.artifacts_removed > 0 {
            let _ = writeln!(out, "Removed {} batch artifacts", report.artifacts_removed);
        }
        out
    }

    pub fn status_summary(&self, state: Option<&ProcessingState>, readiness: &MergeReadiness) -> String {
        let mut out = String::new();
        match state {
            Some(state) => {
                let counts = state.counts();
                let _ = writeln!(
                    out,
                    "Progress: {}/{} files processed, {} failed",
                    state.processed_count, state.total_files, state.failed_count
                );
                let _ = writeln!(
                    out,
                    "Batches: {} pending, {} in flight, {} completed, {} awaiting retry, {} failed",
                    counts.pending, counts.processing, counts.completed, counts.retryable, counts.failed
                );
                if let Some(root) = &state.root {
                    let _ = writeln!(out, "Source: {}", root.display());
                }
            }
            None => {
                let _ = writeln!(out, "No saved progress");
            }
        }
        let _ = writeln!(
            out,
            "Merge: {} valid artifacts, {} invalid, next output {}",
            readiness.valid,
            readiness.invalid.len(),
            readiness.next_output.display()
        );
        out
    }
}
