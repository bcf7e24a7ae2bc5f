use crate::audio::discovery::AudioFileRef;
use crate::batch::state::Batch;
use crate::{HarvestError, Result};

/// Split `files` into contiguous batches of at most `batch_size`, keeping order.
/// Ids start at 1 and follow creation order.
pub fn plan_batches(files: &[AudioFileRef], batch_size: usize, max_attempts: u32) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(HarvestError::InvalidConfig("batch_size must be at least 1".into()));
    }

    let batches: Vec<Batch> = files
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| Batch::new(index as u32 + 1, chunk.to_vec(), max_attempts))
        .collect();

    log::info!(
        "Planned {} batches of up to {} files for {} files",
        batches.len(),
        batch_size,
        files.len()
    );
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::discovery::AudioFormat;
    use crate::batch::state::BatchStatus;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn files(n: usize) -> Vec<AudioFileRef> {
        (0..n)
            .map(|i| AudioFileRef {
                path: PathBuf::from(format!("song_{}.wav", i)),
                size_bytes: 2048,
                format: AudioFormat::Wav,
            })
            .collect()
    }

    #[test]
    fn concatenated_batches_equal_input() {
        for n in 0..25 {
            let input = files(n);
            for size in 1..=8 {
                let batches = plan_batches(&input, size, 3).unwrap();
                let rebuilt: Vec<AudioFileRef> =
                    batches.iter().flat_map(|b| b.files.iter().cloned()).collect();
                assert_eq!(rebuilt, input, "n={} size={}", n, size);
                assert!(batches.iter().all(|b| !b.files.is_empty() && b.files.len() <= size));
                assert_eq!(batches.len(), n.div_ceil(size));
            }
        }
    }

    #[test]
    fn seven_files_in_threes() {
        let batches = plan_batches(&files(7), 3, 3).unwrap();
        let shape: Vec<(u32, usize)> = batches.iter().map(|b| (b.id, b.files.len())).collect();
        assert_eq!(shape, vec![(1, 3), (2, 3), (3, 1)]);
        for batch in &batches {
            assert_eq!(batch.status, BatchStatus::Pending);
            assert_eq!(batch.attempts, 0);
            assert_eq!(batch.max_attempts, 3);
            assert!(batch.started_at.is_none());
        }
    }

    #[test]
    fn no_files_no_batches() {
        assert!(plan_batches(&[], 10, 3).unwrap().is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(plan_batches(&files(3), 0, 3), Err(HarvestError::InvalidConfig(_))));
    }
}
