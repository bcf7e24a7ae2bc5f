use clap::{Parser, Subcommand};
use std::path::PathBuf;
use crate::config::PipelineConfig;
use crate::merge::DuplicatePolicy;

#[derive(Parser, Debug)]
#[command(name = "mir-harvester")]
#[command(version = "1.0")]
#[command(about = "Batch MIR feature extraction through an external analysis engine, with CSV consolidation", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Progress state file
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Directory holding per-batch export artifacts
    #[arg(short = 'a', long = "artifacts", global = true)]
    pub artifact_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover, process and merge an audio collection
    Run {
        /// Directory to scan for audio files
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Spool directory shared with the analysis engine front-end
        #[arg(long)]
        spool: Option<PathBuf>,

        /// Files per batch
        #[arg(short = 'b', long)]
        batch_size: Option<usize>,

        /// Abort on the first failed batch
        #[arg(long)]
        strict: bool,

        /// Ignore saved progress and start over
        #[arg(long)]
        fresh: bool,

        /// Only scan the top-level directory
        #[arg(long)]
        no_recursive: bool,

        /// Directory for the merged CSV
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum)]
        policy: Option<DuplicatePolicy>,
    },

    /// Merge existing batch artifacts into one CSV
    Merge {
        /// Directory with batch_<id>_*.csv files (defaults to the artifact directory)
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,

        /// Directory for the merged CSV
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum)]
        policy: Option<DuplicatePolicy>,

        /// Delete batch artifacts after a verified merge
        #[arg(long)]
        cleanup: bool,
    },

    /// Show saved progress and merge readiness
    Status,

    /// Delete saved progress so the next run starts fresh
    Clear,
}

impl Cli {
    /// Apply command-line values on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(state) = &self.state {
            config.state_path = state.clone();
        }
        if let Some(dir) = &self.artifact_dir {
            config.artifact_dir = dir.clone();
        }

        match &self.command {
            Commands::Run { spool, batch_size, strict, no_recursive, output, policy, .. } => {
                if let Some(spool) = spool {
                    config.driver.spool_dir = spool.clone();
                }
                if let Some(size) = batch_size {
                    config.batch.batch_size = *size;
                }
                if *strict {
                    config.batch.strict = true;
                }
                if *no_recursive {
                    config.discovery.recursive = false;
                }
                if let Some(output) = output {
                    config.merge.output_dir = output.clone();
                }
                if let Some(policy) = policy {
                    config.merge.policy = *policy;
                }
            }
            Commands::Merge { output, policy, cleanup, .. } => {
                if let Some(output) = output {
                    config.merge.output_dir = output.clone();
                }
                if let Some(policy) = policy {
                    config.merge.policy = *policy;
                }
                if *cleanup {
                    config.merge.cleanup = true;
                }
            }
            Commands::Status | Commands::Clear => {}
        }
    }
}
