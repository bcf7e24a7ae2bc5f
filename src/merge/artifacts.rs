use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::merge::schema::{HeaderMap, Schema};
use crate::Result;

/// A per-batch export found in the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub batch_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("{0}: file is empty")]
    Empty(PathBuf),
    #[error("{path}: corrupt CSV ({reason})")]
    Corrupt { path: PathBuf, reason: String },
    #[error("{path}: missing required columns: {}", missing.join(", "))]
    Schema { path: PathBuf, missing: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ValidArtifact {
    pub file: ArtifactFile,
    pub header: HeaderMap,
    pub data_rows: usize,
}

static ARTIFACT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^batch_(\d+)_.*\.csv$").expect("artifact pattern is valid"));

/// Batch artifacts in `dir`, ordered by numeric batch id, then name.
pub fn discover_artifacts(dir: &Path) -> Result<Vec<ArtifactFile>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(batch_id) = ARTIFACT_PATTERN
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        else {
            continue;
        };
        found.push(ArtifactFile { path: entry.path(), batch_id, name });
    }
    found.sort_by(|a, b| a.batch_id.cmp(&b.batch_id).then_with(|| a.name.cmp(&b.name)));
    Ok(found)
}

pub fn validate_artifact(file: &ArtifactFile, schema: &Schema) -> std::result::Result<ValidArtifact, ArtifactError> {
    let corrupt = |reason: String| ArtifactError::Corrupt { path: file.path.clone(), reason };

    let size = fs::metadata(&file.path).map_err(|e| corrupt(e.to_string()))?.len();
    if size == 0 {
        return Err(ArtifactError::Empty(file.path.clone()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(&file.path)
        .map_err(|e| corrupt(e.to_string()))?;
    let header = reader.headers().map_err(|e| corrupt(e.to_string()))?.clone();
    if header.iter().all(|h| h.trim().is_empty()) {
        return Err(ArtifactError::Empty(file.path.clone()));
    }

    let header_map = schema.resolve_header(&header).map_err(|missing| ArtifactError::Schema {
        path: file.path.clone(),
        missing,
    })?;

    let mut data_rows = 0;
    for record in reader.records() {
        record.map_err(|e| corrupt(e.to_string()))?;
        data_rows += 1;
    }

    Ok(ValidArtifact { file: file.clone(), header: header_map, data_rows })
}
