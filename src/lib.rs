use std::path::PathBuf;
use std::time::Duration;

pub mod audio;
pub mod batch;
pub mod cli;
pub mod config;
pub mod merge;
pub mod utils;
pub mod workflow;

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("State serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config file error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Invalid root directory: {0}")]
    InvalidRoot(PathBuf),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Progress state error: {0}")]
    State(String),
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Analysis did not complete within {0:?}")]
    AnalysisTimeout(Duration),
    #[error("Analysis engine reported an error state: {0}")]
    AnalysisErrorState(String),
    #[error("Circuit breaker tripped after {0} consecutive batch failures")]
    CircuitBreakerTripped(u32),
    #[error("Batch {id} failed in strict mode: {reason}")]
    BatchFailed { id: u32, reason: String },
    #[error("No input files found in {0}")]
    NoInputFiles(PathBuf),
    #[error("Merge verification failed for {path}: {reason}")]
    MergeVerification { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, HarvestError>;

// Re-exports for convenience
pub use audio::discovery::{AudioFileRef, AudioFormat, Discovery, DiscoveryStats, FileDiscovery};
pub use batch::driver::{AnalysisDriver, ExportResult, SpoolDriver, UploadResult};
pub use batch::orchestrator::{BatchOrchestrator, RunOutcome};
pub use batch::planner::plan_batches;
pub use batch::state::{Batch, BatchStatus, ProcessingState, StateStore};
pub use config::PipelineConfig;
pub use merge::engine::{MergeEngine, MergeReport};
pub use merge::DuplicatePolicy;
