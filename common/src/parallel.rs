//! Parallel processing utilities over z-slabs of a [`Buffer3`](crate::Buffer3).

use std::ops::Range;

use rayon::prelude::*;

/// Multiplier for number of chunks relative to CPU threads.
/// Using 3x threads provides good load balancing when some chunks finish faster.
const CHUNKS_PER_THREAD: usize = 3;

/// Compute optimal chunk size for the given length.
#[inline]
fn auto_chunk_size(len: usize) -> usize {
    let num_chunks = rayon::current_num_threads() * CHUNKS_PER_THREAD;
    (len / num_chunks).max(1)
}

/// Splits `0..depth` into contiguous, non-overlapping slab ranges.
pub fn slab_ranges(depth: usize) -> Vec<Range<usize>> {
    let chunk = auto_chunk_size(depth);
    (0..depth)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(depth))
        .collect()
}

/// Folds every slab of `0..depth` in parallel and reduces the partial results.
///
/// `reduce` must be associative and commutative; slabs finish in any order.
pub fn par_fold_slabs<A, Fold, Reduce>(depth: usize, fold: Fold, reduce: Reduce) -> Option<A>
where
    A: Send,
    Fold: Fn(Range<usize>) -> A + Sync + Send,
    Reduce: Fn(A, A) -> A + Sync + Send,
{
    slab_ranges(depth)
        .into_par_iter()
        .map(fold)
        .reduce_with(reduce)
}

/// Extension trait for splitting a flat volume into whole z-slices.
pub trait ParSlicesMutAuto<'a, T: Send + 'a> {
    /// Yields `(first_slice_index, chunk)` pairs, each chunk holding complete slices.
    fn par_slices_mut_auto(
        &'a mut self,
        slice_len: usize,
    ) -> impl IndexedParallelIterator<Item = (usize, &'a mut [T])>;
}

impl<'a, T: Send + 'a> ParSlicesMutAuto<'a, T> for [T] {
    fn par_slices_mut_auto(
        &'a mut self,
        slice_len: usize,
    ) -> impl IndexedParallelIterator<Item = (usize, &'a mut [T])> {
        assert!(slice_len > 0, "slice_len must be > 0");
        assert_eq!(
            self.len() % slice_len,
            0,
            "length must be a multiple of slice_len"
        );
        let slices = self.len() / slice_len;
        let chunk_slices = auto_chunk_size(slices);
        self.par_chunks_mut(slice_len * chunk_slices)
            .enumerate()
            .map(move |(idx, chunk)| (idx * chunk_slices, chunk))
    }
}
