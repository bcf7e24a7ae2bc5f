use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::config::DiscoveryConfig;
use crate::utils::parallel::ParallelProcessor;
use crate::{HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Flac,
    Ogg,
    M4a,
    Aac,
    Aiff,
    Opus,
}

impl AudioFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            "ogg" => Some(AudioFormat::Ogg),
            "m4a" => Some(AudioFormat::M4a),
            "aac" => Some(AudioFormat::Aac),
            "aif" | "aiff" => Some(AudioFormat::Aiff),
            "opus" => Some(AudioFormat::Opus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::M4a => "m4a",
            AudioFormat::Aac => "aac",
            AudioFormat::Aiff => "aiff",
            AudioFormat::Opus => "opus",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A discovered audio file. Immutable once produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFileRef {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format: AudioFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub by_format: BTreeMap<AudioFormat, usize>,
    pub rejected_format: usize,
    pub rejected_size: usize,
    pub walk_errors: usize,
}

impl DiscoveryStats {
    pub fn percentage(&self, format: AudioFormat) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        let count = self.by_format.get(&format).copied().unwrap_or(0);
        count as f64 / self.total_files as f64 * 100.0
    }

    pub fn total_size_display(&self) -> String {
        human_size(self.total_bytes)
    }

    /// (format, count, percentage) rows, most common format first
    pub fn format_breakdown(&self) -> Vec<(AudioFormat, usize, f64)> {
        let mut rows: Vec<_> = self
            .by_format
            .iter()
            .map(|(format, count)| (*format, *count, self.percentage(*format)))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        rows
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub files: Vec<AudioFileRef>,
    pub statistics: DiscoveryStats,
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

pub struct FileDiscovery {
    formats: Vec<AudioFormat>,
    exclude: Vec<String>,
    min_file_size: u64,
    max_file_size: u64,
    recursive: bool,
}

impl ParallelProcessor for FileDiscovery {}

impl FileDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Self {
        let mut formats = Vec::new();
        for ext in &config.extensions {
            match AudioFormat::from_extension(ext) {
                Some(format) if !formats.contains(&format) => formats.push(format),
                Some(_) => {}
                None => log::warn!("Ignoring unknown audio extension in config: {}", ext),
            }
        }
        Self {
            formats,
            exclude: config.exclude.iter().map(|p| p.to_lowercase()).collect(),
            min_file_size: config.min_file_size,
            max_file_size: config.max_file_size,
            recursive: config.recursive,
        }
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        // The root itself is never excluded, even if it is a dot directory
        if entry.depth() == 0 {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            return true;
        }
        let lowered = name.to_lowercase();
        self.exclude.iter().any(|pattern| *pattern == lowered)
    }

    fn collect_candidates(&self, root: &Path, stats: &mut DiscoveryStats) -> Vec<(PathBuf, AudioFormat)> {
        let mut walker = WalkDir::new(root).follow_links(true);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut candidates = Vec::new();
        for entry in walker.into_iter().filter_entry(|e| !self.is_excluded(e)) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Error accessing entry: {}", err);
                    stats.walk_errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let format = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .and_then(AudioFormat::from_extension)
                .filter(|f| self.formats.contains(f));
            match format {
                Some(format) => candidates.push((entry.into_path(), format)),
                None => {
                    log::debug!("Skipping unsupported format: {}", entry.path().display());
                    stats.rejected_format += 1;
                }
            }
        }
        candidates
    }

    pub fn discover(&self, root: impl AsRef<Path>) -> Result<Discovery> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(HarvestError::InvalidRoot(root.to_path_buf()));
        }
        Self::init_parallel_processing();

        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        log::info!("Scanning directory structure: {}", root.display());

        let mut stats = DiscoveryStats::default();
        let candidates = self.collect_candidates(&root, &mut stats);
        log::info!("Found {} potential audio files", candidates.len());

        let progress = Self::get_progress_counter();
        let total = candidates.len();
        let sized = Self::parallel_map(&candidates, |(path, format)| {
            let size = std::fs::metadata(path).map(|m| m.len());
            let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
            if done % 1000 == 0 || done == total {
                log::debug!("Size check progress: {}/{}", done, total);
            }
            (path.clone(), *format, size)
        });

        let mut files = Vec::with_capacity(sized.len());
        for (path, format, size) in sized {
            let size = match size {
                Ok(size) => size,
                Err(e) => {
                    log::warn!("Cannot read size of {}: {}", path.display(), e);
                    stats.walk_errors += 1;
                    continue;
                }
            };
            if size < self.min_file_size || size > self.max_file_size {
                log::warn!(
                    "Rejecting {}: size {} outside [{}, {}]",
                    path.display(),
                    size,
                    self.min_file_size,
                    self.max_file_size
                );
                stats.rejected_size += 1;
                continue;
            }
            stats.total_bytes += size;
            *stats.by_format.entry(format).or_insert(0) += 1;
            files.push(AudioFileRef { path, size_bytes: size, format });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        stats.total_files = files.len();

        log::info!(
            "Discovered {} audio files ({}), rejected {} by format and {} by size",
            stats.total_files,
            stats.total_size_display(),
            stats.rejected_format,
            stats.rejected_size
        );
        Ok(Discovery { files, statistics: stats })
    }
}
