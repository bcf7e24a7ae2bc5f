use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use mir_harvester::{
    cli::commands::{Cli, Commands},
    utils::reporting::Reporter,
    workflow::WorkflowCoordinator,
    PipelineConfig, Result, SpoolDriver,
};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let coordinator = WorkflowCoordinator::new(config);
    let reporter = Reporter::new();

    match &cli.command {
        Commands::Run { input, fresh, .. } => {
            println!("=== Starting Feature Extraction ===");
            println!("Input directory: {}", input.display());
            println!("Spool directory: {}", coordinator.config().driver.spool_dir.display());
            println!("Batch size: {}", coordinator.config().batch.batch_size);

            let cancel = Arc::new(AtomicBool::new(false));
            let handler_flag = Arc::clone(&cancel);
            if let Err(e) = ctrlc::set_handler(move || {
                if handler_flag.swap(true, Ordering::SeqCst) {
                    eprintln!("\nSecond interrupt, exiting immediately");
                    std::process::exit(130);
                }
                eprintln!("\nInterrupt received; finishing the current batch before stopping");
            }) {
                log::warn!("Could not install interrupt handler: {}", e);
            }

            let driver = SpoolDriver::new(&coordinator.config().driver);
            let report = match coordinator.run(input, driver, cancel, !fresh) {
                Ok(report) => report,
                Err(e) => {
                    // Still show where things stand so the run can be resumed or inspected
                    if let Ok(status) = coordinator.status() {
                        println!("\n{}", status);
                    }
                    return Err(e);
                }
            };

            if let Some(stats) = &report.discovery {
                println!("\n{}", reporter.discovery_summary(stats));
            } else {
                println!("\nResumed from saved progress");
            }
            println!("{}", reporter.run_summary(&report.outcome));
            match &report.merge {
                Some(merge) => println!("{}", reporter.merge_summary(merge)),
                None => println!("No merge performed"),
            }
            println!("=== Feature Extraction Complete ===");
        }

        Commands::Merge { input, .. } => {
            println!("=== Starting CSV Merge ===");
            let report = coordinator.merge_only(input.as_deref())?;
            println!("{}", reporter.merge_summary(&report));
            println!("=== CSV Merge Complete ===");
        }

        Commands::Status => {
            println!("{}", coordinator.status()?);
        }

        Commands::Clear => {
            coordinator.clear()?;
            println!("Saved progress cleared");
        }
    }
    Ok(())
}
