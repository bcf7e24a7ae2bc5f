//! Consolidates per-batch export artifacts into one numbered, verified CSV.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::MergeConfig;
use crate::merge::artifacts::{discover_artifacts, validate_artifact, ValidArtifact};
use crate::merge::consolidate::{Consolidator, MergedRecord};
use crate::merge::schema::{format_field, Schema};
use crate::merge::DuplicatePolicy;
use crate::utils::parallel::ParallelProcessor;
use crate::utils::reporting::Reporter;
use crate::{HarvestError, Result};

const DUPLICATE_FLAG_COLUMNS: [&str; 2] = ["is_duplicate", "first_seen_in"];

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub base_name: String,
    pub policy: DuplicatePolicy,
    pub cleanup: bool,
    pub write_report: bool,
    pub schema: Schema,
}

impl MergeOptions {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            base_name: config.base_name.clone(),
            policy: config.policy,
            cleanup: config.cleanup,
            write_report: config.write_report,
            schema: Schema::from_config(config),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub input_dir: PathBuf,
    pub output_path: Option<PathBuf>,
    pub policy: DuplicatePolicy,
    pub batch_files_found: usize,
    pub batch_files_processed: usize,
    pub rows_read: usize,
    pub total_rows: usize,
    pub duplicates_found: usize,
    pub duplicates_resolved: usize,
    pub duplicates_flagged: usize,
    pub validation_errors: Vec<String>,
    pub processing_errors: Vec<String>,
    pub out_of_range_values: usize,
    pub verified: bool,
    pub artifacts_removed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl MergeReport {
    fn new(input_dir: &Path, policy: DuplicatePolicy) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
            output_path: None,
            policy,
            batch_files_found: 0,
            batch_files_processed: 0,
            rows_read: 0,
            total_rows: 0,
            duplicates_found: 0,
            duplicates_resolved: 0,
            duplicates_flagged: 0,
            validation_errors: Vec::new(),
            processing_errors: Vec::new(),
            out_of_range_values: 0,
            verified: false,
            artifacts_removed: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
        }
    }
}

/// What a merge would do right now, without writing anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReadiness {
    pub batch_ids: Vec<u32>,
    pub valid: usize,
    pub invalid: Vec<String>,
    pub next_output: PathBuf,
}

impl MergeReadiness {
    pub fn is_ready(&self) -> bool {
        self.valid > 0
    }
}

pub struct MergeEngine {
    options: MergeOptions,
    suffix_pattern: Regex,
}

impl ParallelProcessor for MergeEngine {}

impl MergeEngine {
    pub fn new(options: MergeOptions) -> Self {
        let suffix_pattern = Regex::new(&format!(r"^{}_(\d+)\.csv$", regex::escape(&options.base_name)))
            .expect("escaped base name is a valid pattern");
        Self { options, suffix_pattern }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    fn highest_output_suffix(&self, output_dir: &Path) -> Result<Option<u32>> {
        if !output_dir.is_dir() {
            return Ok(None);
        }
        let mut highest = None;
        for entry in fs::read_dir(output_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let suffix = self
                .suffix_pattern
                .captures(&name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok());
            if let Some(suffix) = suffix {
                highest = highest.max(Some(suffix));
            }
        }
        Ok(highest)
    }

    /// `<base>_<NN>.csv` with NN one past the highest existing suffix.
    pub fn next_output_path(&self, output_dir: &Path) -> Result<PathBuf> {
        let next = self.highest_output_suffix(output_dir)?.map_or(1, |n| n + 1);
        Ok(output_dir.join(format!("{}_{:02}.csv", self.options.base_name, next)))
    }

    fn validate_all(&self, input_dir: &Path) -> Result<(usize, Vec<ValidArtifact>, Vec<String>)> {
        let artifacts = discover_artifacts(input_dir)?;
        Self::init_parallel_processing();
        let results = Self::parallel_map(&artifacts, |a| validate_artifact(a, &self.options.schema));

        let mut valid = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(artifact) => {
                    if artifact.data_rows == 0 {
                        log::warn!("{} has no data rows", artifact.file.name);
                    }
                    valid.push(artifact);
                }
                Err(e) => {
                    log::warn!("Excluding artifact: {}", e);
                    errors.push(e.to_string());
                }
            }
        }
        Ok((artifacts.len(), valid, errors))
    }

    pub fn readiness(&self, input_dir: &Path, output_dir: &Path) -> Result<MergeReadiness> {
        let next_output = self.next_output_path(output_dir)?;
        if !input_dir.is_dir() {
            return Ok(MergeReadiness { batch_ids: Vec::new(), valid: 0, invalid: Vec::new(), next_output });
        }
        let (_, valid, invalid) = self.validate_all(input_dir)?;
        let mut batch_ids: Vec<u32> = valid.iter().map(|a| a.file.batch_id).collect();
        batch_ids.dedup();
        Ok(MergeReadiness { batch_ids, valid: valid.len(), invalid, next_output })
    }

    pub fn merge(&self, input_dir: &Path, output_dir: &Path) -> Result<MergeReport> {
        let clock = Instant::now();
        let mut report = MergeReport::new(input_dir, self.options.policy);

        if !input_dir.is_dir() {
            return Err(HarvestError::InvalidRoot(input_dir.to_path_buf()));
        }
        let (found, valid, validation_errors) = self.validate_all(input_dir)?;
        report.batch_files_found = found;
        report.validation_errors = validation_errors;
        log::info!(
            "Found {} batch artifacts in {}, {} valid",
            found,
            input_dir.display(),
            valid.len()
        );
        if valid.is_empty() {
            return Err(HarvestError::NoInputFiles(input_dir.to_path_buf()));
        }

        let mut consolidator = Consolidator::new(self.options.policy);
        for artifact in &valid {
            self.consolidate_artifact(artifact, &mut consolidator, &mut report)?;
            report.batch_files_processed += 1;
        }
        let (records, stats) = consolidator.finish();
        report.rows_read = stats.rows_seen;
        report.total_rows = records.len();
        report.duplicates_found = stats.duplicates_found;
        report.duplicates_resolved = stats.duplicates_resolved;
        report.duplicates_flagged = stats.duplicates_flagged;

        fs::create_dir_all(output_dir)?;
        let output_path = self.next_output_path(output_dir)?;
        report.output_path = Some(output_path.clone());
        self.write_output(&output_path, &records)?;
        self.verify_output(&output_path, records.len())?;
        report.verified = true;
        log::info!("Wrote {} rows to {}", records.len(), output_path.display());

        if self.options.cleanup {
            for artifact in &valid {
                match fs::remove_file(&artifact.file.path) {
                    Ok(()) => report.artifacts_removed += 1,
                    Err(e) => log::warn!("Could not remove {}: {}", artifact.file.path.display(), e),
                }
            }
        }

        report.finished_at = Some(Utc::now());
        report.duration_ms = clock.elapsed().as_millis() as u64;

        if self.options.write_report {
            let report_path = output_path.with_extension("report.json");
            if let Err(e) = Reporter::new().write_merge_report(&report, &report_path) {
                log::warn!("Could not write merge report: {}", e);
            }
        }
        Ok(report)
    }

    fn consolidate_artifact(
        &self,
        artifact: &ValidArtifact,
        consolidator: &mut Consolidator,
        report: &mut MergeReport,
    ) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&artifact.file.path)?;
        let fields = self.options.schema.fields();

        for (index, record) in reader.records().enumerate() {
            // Header is line 1
            let line = index + 2;
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    report.processing_errors.push(format!("{} line {}: {}", artifact.file.name, line, e));
                    continue;
                }
            };
            let Some(filename) = artifact.header.filename(&record) else {
                report
                    .processing_errors
                    .push(format!("{} line {}: no filename", artifact.file.name, line));
                continue;
            };

            let mut values = Vec::with_capacity(fields.len());
            for (position, column) in fields.iter().enumerate() {
                let formatted = format_field(column.kind, artifact.header.field(&record, position));
                if formatted.out_of_range {
                    report.out_of_range_values += 1;
                    log::warn!(
                        "{}: {} = {} is outside [0, 1]",
                        filename,
                        column.name,
                        formatted.value
                    );
                }
                values.push(formatted.value);
            }

            consolidator.add(MergedRecord {
                filename: filename.to_string(),
                values,
                source: artifact.file.name.clone(),
                duplicate_of: None,
            });
        }
        Ok(())
    }

    fn flags_duplicates(&self) -> bool {
        self.options.policy == DuplicatePolicy::FlagDuplicates
    }

    fn write_output(&self, path: &Path, records: &[MergedRecord]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        let mut header = self.options.schema.header();
        if self.flags_duplicates() {
            header.extend(DUPLICATE_FLAG_COLUMNS);
        }
        writer.write_record(&header)?;

        for record in records {
            let mut row: Vec<&str> = Vec::with_capacity(header.len());
            row.push(&record.filename);
            row.extend(record.values.iter().map(String::as_str));
            if self.flags_duplicates() {
                row.push(if record.duplicate_of.is_some() { "true" } else { "false" });
                row.push(record.duplicate_of.as_deref().unwrap_or(""));
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Re-read the written file and check header and row count.
    fn verify_output(&self, path: &Path, expected_rows: usize) -> Result<()> {
        let failure = |reason: String| HarvestError::MergeVerification { path: path.to_path_buf(), reason };

        let mut reader = csv::Reader::from_path(path).map_err(|e| failure(e.to_string()))?;
        let header = reader.headers().map_err(|e| failure(e.to_string()))?.clone();
        if let Err(missing) = self.options.schema.resolve_header(&header) {
            return Err(failure(format!("header lacks {}", missing.join(", "))));
        }

        let mut rows = 0;
        for record in reader.records() {
            record.map_err(|e| failure(e.to_string()))?;
            rows += 1;
        }
        if rows != expected_rows {
            return Err(failure(format!("expected {} rows, found {}", expected_rows, rows)));
        }
        Ok(())
    }
}
