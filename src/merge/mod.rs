pub mod artifacts;
pub mod consolidate;
pub mod engine;
pub mod schema;

use std::fmt;

use serde::{Deserialize, Serialize};

/// What to do when two artifacts contain a row for the same filename.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Ignore later rows for an already seen filename
    #[default]
    KeepFirst,
    /// Replace the earlier row with the later one
    KeepLast,
    /// Keep every row and mark the later ones
    FlagDuplicates,
}

impl DuplicatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicatePolicy::KeepFirst => "keep_first",
            DuplicatePolicy::KeepLast => "keep_last",
            DuplicatePolicy::FlagDuplicates => "flag_duplicates",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
