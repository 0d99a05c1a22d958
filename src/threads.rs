//! Worker pool used by training, encoding and batch search.

use crate::{IndexError, StateError};

/// Size the global rayon pool. Must run before any parallel work; once the
/// pool exists its size is fixed and this fails with `AlreadyInitialized`.
pub fn set_num_threads(threads: usize) -> Result<(), IndexError> {
    if threads == 0 {
        return Err(IndexError::invalid_parameter("threads", "must be positive"));
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("ann-index-{i}"))
        .build_global()
        .map_err(|err| {
            tracing::warn!(threads, error = %err, "global thread pool already configured");
            IndexError::from(StateError::AlreadyInitialized("thread pool"))
        })?;
    tracing::info!(threads, "configured global thread pool");
    Ok(())
}

/// Threads available to parallel work.
pub fn current_num_threads() -> usize {
    rayon::current_num_threads()
}
