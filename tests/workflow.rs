mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{export_csv, fast_pipeline_config, ScriptedDriver};
use mir_harvester::workflow::WorkflowCoordinator;
use mir_harvester::{BatchStatus, HarvestError, SpoolDriver, StateStore};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct Collection {
    dir: TempDir,
}

impl Collection {
    /// `music/` with five tracks plus files discovery must ignore.
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("album")).unwrap();
        for name in ["a.mp3", "b.flac", "album/c.wav", "album/d.mp3", "e.ogg"] {
            fs::write(music.join(name), b"not really audio").unwrap();
        }
        fs::write(music.join("cover.jpg"), b"jpeg").unwrap();
        fs::write(music.join(".hidden.mp3"), b"hidden").unwrap();
        Self { dir }
    }

    fn music(&self) -> PathBuf {
        self.dir.path().join("music")
    }

    fn coordinator(&self, batch_size: usize) -> WorkflowCoordinator {
        let mut config = fast_pipeline_config(self.dir.path());
        config.batch.batch_size = batch_size;
        WorkflowCoordinator::new(config)
    }
}

fn no_cancel() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn merged_filenames(path: &Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.records().map(|r| r.unwrap()[0].to_string()).collect()
}

#[test]
fn discovers_processes_and_merges() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);

    let report = coordinator.run(&collection.music(), ScriptedDriver::new(), no_cancel(), true).unwrap();

    let stats = report.discovery.as_ref().unwrap();
    assert_eq!(stats.total_files, 5);
    assert!(!report.resumed);
    assert_eq!(report.outcome.total_batches, 3);
    assert_eq!(report.outcome.completed, 3);
    assert_eq!(report.outcome.artifacts.len(), 3);

    let merge = report.merge.unwrap();
    assert_eq!(merge.total_rows, 5);
    assert_eq!(
        merged_filenames(merge.output_path.as_ref().unwrap()),
        vec!["a.mp3", "b.flac", "c.wav", "d.mp3", "e.ogg"]
    );
    assert!(collection.dir.path().join("state/batch_report.csv").exists());

    let status = coordinator.status().unwrap();
    assert!(status.contains("5/5 files processed"));
    assert!(status.contains("3 valid artifacts"));
}

#[test]
fn cancelled_run_skips_merge_and_resumes_later() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);
    let cancel = no_cancel();
    let driver = ScriptedDriver { cancel_on_upload: Some((1, Arc::clone(&cancel))), ..ScriptedDriver::new() };

    let first = coordinator.run(&collection.music(), driver, cancel, true).unwrap();

    assert!(first.outcome.cancelled);
    assert_eq!(first.outcome.completed, 1);
    assert!(first.merge.is_none());

    let second = coordinator.run(&collection.music(), ScriptedDriver::new(), no_cancel(), true).unwrap();

    assert!(second.resumed);
    assert!(second.discovery.is_none());
    assert_eq!(second.outcome.attempts_this_run, 2);
    assert_eq!(second.outcome.processed_files, 5);
    assert_eq!(second.merge.unwrap().total_rows, 5);
}

#[test]
fn fresh_run_ignores_saved_progress() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(5);
    coordinator.run(&collection.music(), ScriptedDriver::new(), no_cancel(), true).unwrap();

    let report = coordinator.run(&collection.music(), ScriptedDriver::new(), no_cancel(), false).unwrap();

    assert!(!report.resumed);
    assert_eq!(report.outcome.attempts_this_run, 1);
}

#[test]
fn interrupted_batch_is_recovered_as_a_failed_attempt() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);
    let store = StateStore::new(&coordinator.config().state_path);

    let (mut state, _) = coordinator.prepare_state(&collection.music(), true).unwrap();
    state.start_batch(1).unwrap();
    store.save(&state).unwrap();

    let (recovered, discovery) = coordinator.prepare_state(&collection.music(), true).unwrap();

    assert!(discovery.is_none());
    let batch = recovered.batch(1).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.attempts, 1);
    assert_eq!(batch.last_error.as_deref(), Some("interrupted before completion"));
    assert_eq!(recovered.current_batch, None);
    assert_eq!(store.load().unwrap().unwrap(), recovered);
}

#[test]
fn saved_progress_for_another_root_is_refused() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);
    coordinator.prepare_state(&collection.music(), true).unwrap();

    let other = collection.music().join("album");
    let err = coordinator.prepare_state(&other, true).unwrap_err();
    assert!(matches!(err, HarvestError::State(_)));

    coordinator.clear().unwrap();
    assert!(coordinator.prepare_state(&other, true).is_ok());
}

#[test]
fn empty_or_missing_roots_are_errors() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);
    let empty = collection.dir.path().join("empty");
    fs::create_dir_all(&empty).unwrap();

    let err = coordinator.run(&empty, ScriptedDriver::new(), no_cancel(), true).unwrap_err();
    assert!(matches!(err, HarvestError::NoInputFiles(_)));

    let err = coordinator
        .run(&collection.dir.path().join("missing"), ScriptedDriver::new(), no_cancel(), true)
        .unwrap_err();
    assert!(matches!(err, HarvestError::InvalidRoot(_)));
}

#[test]
fn no_exports_means_no_merge() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(5);
    let driver = ScriptedDriver { never_export: true, ..ScriptedDriver::new() };

    let report = coordinator.run(&collection.music(), driver, no_cancel(), true).unwrap();

    assert_eq!(report.outcome.missing_exports, vec![1]);
    assert!(report.merge.is_none());
}

#[test]
fn clear_removes_saved_progress() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);
    coordinator.prepare_state(&collection.music(), true).unwrap();

    coordinator.clear().unwrap();

    assert!(!coordinator.config().state_path.exists());
    assert!(coordinator.status().unwrap().contains("No saved progress"));
    // Idempotent
    coordinator.clear().unwrap();
}

/// Stand-in for the engine front-end: answers each manifest in the spool
/// inbox with an outbox CSV and a done marker.
fn spawn_spool_engine(spool: PathBuf, stop: Arc<AtomicBool>) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut answered = 0;
        while !stop.load(Ordering::SeqCst) {
            let manifest = spool.join("inbox/manifest.json");
            let done = spool.join("done");
            if manifest.exists() && !done.exists() {
                let parsed = fs::read_to_string(&manifest)
                    .ok()
                    .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok());
                if let Some(parsed) = parsed {
                    let files: Vec<PathBuf> = parsed["files"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|name| {
                            let name = name.as_str().unwrap();
                            PathBuf::from(name.split_once('_').map_or(name, |(_, rest)| rest))
                        })
                        .collect();
                    let outbox = spool.join("outbox");
                    fs::create_dir_all(&outbox).unwrap();
                    let partial = outbox.join("export.part");
                    fs::write(&partial, export_csv(&files, "128")).unwrap();
                    fs::rename(&partial, outbox.join("export.csv")).unwrap();
                    fs::write(&done, b"").unwrap();
                    answered += 1;
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
        answered
    })
}

#[test]
fn spool_driver_round_trip() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(3);
    let spool = coordinator.config().driver.spool_dir.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let engine = spawn_spool_engine(spool.clone(), Arc::clone(&stop));

    let driver = SpoolDriver::new(&coordinator.config().driver);
    let result = coordinator.run(&collection.music(), driver, no_cancel(), true);
    stop.store(true, Ordering::SeqCst);
    let answered = engine.join().unwrap();

    let report = result.unwrap();
    assert_eq!(answered, 2);
    assert_eq!(report.outcome.completed, 2);
    let merge = report.merge.unwrap();
    assert_eq!(
        merged_filenames(merge.output_path.as_ref().unwrap()),
        vec!["a.mp3", "b.flac", "c.wav", "d.mp3", "e.ogg"]
    );
    assert!(!spool.join("outbox/export.csv").exists());
}

#[test]
fn second_spool_run_starts_from_a_clean_session() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(3);
    let spool = coordinator.config().driver.spool_dir.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let engine = spawn_spool_engine(spool.clone(), Arc::clone(&stop));

    let first = coordinator.run(
        &collection.music(),
        SpoolDriver::new(&coordinator.config().driver),
        no_cancel(),
        true,
    );
    // The last batch's done marker is still there
    let done_left = spool.join("done").exists();
    let second = coordinator.run(
        &collection.music(),
        SpoolDriver::new(&coordinator.config().driver),
        no_cancel(),
        false,
    );
    stop.store(true, Ordering::SeqCst);
    let answered = engine.join().unwrap();

    assert!(done_left);
    assert!(first.unwrap().outcome.missing_exports.is_empty());
    let second = second.unwrap();
    assert_eq!(second.outcome.completed, 2);
    assert!(second.outcome.missing_exports.is_empty());
    assert_eq!(answered, 4);
    assert_eq!(second.merge.unwrap().total_rows, 5);
}

#[test]
fn fresh_plan_sets_earlier_artifacts_aside() {
    let collection = Collection::new();
    collection
        .coordinator(2)
        .run(&collection.music(), ScriptedDriver::new(), no_cancel(), true)
        .unwrap();

    // Replanned with bigger batches: only batch_001 is produced again
    let coordinator = collection.coordinator(5);
    let report = coordinator.run(&collection.music(), ScriptedDriver::new(), no_cancel(), false).unwrap();

    let merge = report.merge.unwrap();
    assert_eq!(merge.batch_files_found, 1);
    assert_eq!(merge.total_rows, 5);

    let artifact_dir = &coordinator.config().artifact_dir;
    let archives: Vec<PathBuf> = fs::read_dir(artifact_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].file_name().unwrap().to_string_lossy().starts_with("superseded_"));
    let mut kept: Vec<String> = fs::read_dir(&archives[0])
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    kept.sort();
    assert_eq!(kept, vec!["batch_001_results.csv", "batch_002_results.csv", "batch_003_results.csv"]);
}

#[test]
fn resuming_keeps_artifacts_in_place() {
    let collection = Collection::new();
    let coordinator = collection.coordinator(2);
    let cancel = no_cancel();
    let driver = ScriptedDriver { cancel_on_upload: Some((1, Arc::clone(&cancel))), ..ScriptedDriver::new() };
    coordinator.run(&collection.music(), driver, cancel, true).unwrap();

    let report = coordinator.run(&collection.music(), ScriptedDriver::new(), no_cancel(), true).unwrap();

    // batch_001 from the cancelled run plus the two written now
    assert_eq!(report.merge.unwrap().batch_files_found, 3);
    assert!(coordinator.config().artifact_dir.join("batch_001_results.csv").exists());
}
