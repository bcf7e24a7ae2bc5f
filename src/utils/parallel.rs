use std::sync::atomic::AtomicUsize;
use std::sync::Once;
use rayon::prelude::*;

static POOL_INIT: Once = Once::new();

pub trait ParallelProcessor {
    fn init_parallel_processing() {
        // Configure the global pool once; a pool built elsewhere is kept as is
        POOL_INIT.call_once(|| {
            if let Err(e) = rayon::ThreadPoolBuilder::new()
                .num_threads(num_cpus::get())
                .build_global()
            {
                log::debug!("Global thread pool already configured: {}", e);
            }
        });
        log::debug!("Using {} CPU threads for processing", rayon::current_num_threads());
    }

    fn get_progress_counter() -> AtomicUsize {
        AtomicUsize::new(0)
    }

    /// Map every item on the pool. Output order matches input order.
    fn parallel_map<T, F, R>(items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Send + Sync,
    {
        items.par_iter().map(f).collect()
    }
}
