//! Window checkpoints.
//!
//! A run is split into windows of `window_size` entities. After each full
//! window with work left, the caller must confirm before continuing.

/// Entities per window when nothing else is configured.
pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Where a run stands relative to its window checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryStatus {
    /// A full window just finished and entities remain.
    pub at_boundary: bool,
    pub remaining: usize,
}

/// Check whether `cumulative_processed` sits on a checkpoint.
///
/// Nothing processed is never a boundary, nor is a finished run.
pub fn check_boundary(
    cumulative_processed: usize,
    total_entities: usize,
    window_size: usize,
) -> BoundaryStatus {
    let remaining = total_entities.saturating_sub(cumulative_processed);
    let at_boundary = window_size > 0
        && cumulative_processed > 0
        && cumulative_processed % window_size == 0
        && remaining > 0;

    BoundaryStatus {
        at_boundary,
        remaining,
    }
}

/// Length of the window starting at `cumulative_processed`.
///
/// Runs up to the next multiple of `window_size`, capped by what remains.
pub fn next_window_len(
    cumulative_processed: usize,
    total_entities: usize,
    window_size: usize,
) -> usize {
    let remaining = total_entities.saturating_sub(cumulative_processed);
    if window_size == 0 {
        return remaining;
    }
    let to_checkpoint = window_size - cumulative_processed % window_size;
    to_checkpoint.min(remaining)
}
