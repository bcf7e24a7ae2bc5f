use std::collections::HashMap;

use serde::Serialize;

use crate::merge::DuplicatePolicy;

/// One row of the merged dataset, already in canonical column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRecord {
    pub filename: String,
    /// Formatted feature values, one per schema field
    pub values: Vec<String>,
    /// Artifact the row came from
    pub source: String,
    /// Set on flagged duplicates: artifact where the filename was first seen
    pub duplicate_of: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    pub rows_seen: usize,
    pub duplicates_found: usize,
    pub duplicates_resolved: usize,
    pub duplicates_flagged: usize,
}

/// Applies a [`DuplicatePolicy`] while rows stream in.
pub struct Consolidator {
    policy: DuplicatePolicy,
    records: Vec<MergedRecord>,
    // filename -> index of the first record kept for it
    seen: HashMap<String, usize>,
    stats: ConsolidationStats,
}

impl Consolidator {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            records: Vec::new(),
            seen: HashMap::new(),
            stats: ConsolidationStats::default(),
        }
    }

    pub fn add(&mut self, mut record: MergedRecord) {
        self.stats.rows_seen += 1;
        let existing = self.seen.get(&record.filename).copied();
        let Some(index) = existing else {
            self.seen.insert(record.filename.clone(), self.records.len());
            self.records.push(record);
            return;
        };

        self.stats.duplicates_found += 1;
        log::debug!(
            "Duplicate row for {} in {} (first seen in {})",
            record.filename,
            record.source,
            self.records[index].source
        );
        match self.policy {
            DuplicatePolicy::KeepFirst => self.stats.duplicates_resolved += 1,
            DuplicatePolicy::KeepLast => {
                self.records[index] = record;
                self.stats.duplicates_resolved += 1;
            }
            DuplicatePolicy::FlagDuplicates => {
                record.duplicate_of = Some(self.records[index].source.clone());
                self.records.push(record);
                self.stats.duplicates_flagged += 1;
            }
        }
    }

    /// Rows sorted by filename; equal filenames keep arrival order.
    pub fn finish(self) -> (Vec<MergedRecord>, ConsolidationStats) {
        let mut records = self.records;
        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        (records, self.stats)
    }
}
