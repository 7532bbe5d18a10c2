use super::error::HeapError;
use super::pool::Pool;
use super::stats::HeapStats;

/// Width of the size word that prefixes every chunk. The client-visible
/// address of an allocation is its chunk base plus this.
pub const SIZE_WORD: u32 = 4;

/// Smallest chunk the allocator will ever create: a free chunk must hold its
/// size word, two list links, and a footer.
pub const MIN_FREE_SIZE: u32 = 16;

/// Offset sentinel meaning "none". Never a valid chunk or user offset.
pub const INVALID_OFFSET: u32 = u32::MAX;

/// Bin 0..15 cover the even sizes 2..=32; bin 16 catches everything larger.
pub(crate) const BIN_COUNT: usize = 17;

const SIZE_MASK: u32 = !1;

/// Round a byte count up to the next even value.
#[inline]
pub(crate) fn round_even(n: u32) -> u32 {
    n + (n & 1)
}

/// Bin index for a chunk of `size` bytes.
#[inline]
pub(crate) fn bin_index(size: u32) -> usize {
    if size < 33 {
        ((size - 1) / 2) as usize
    } else {
        16
    }
}

/// Boundary-tag allocator over a fixed pool.
///
/// Every chunk starts with a size word whose low bit records whether the
/// *physically preceding* chunk is used. Free chunks additionally carry two
/// circular-list link words after the header and a flag-free copy of the
/// size in their last word, so the successor can find them for backward
/// coalescing. Free chunks of similar sizes share one of 17 bins; the fit
/// search is first-fit within a bin, scanning bins upward.
///
/// The raw size word is never touched directly outside the masked accessors
/// below.
pub struct BinnedAllocator {
    pub(crate) pool: Pool,
    pub(crate) bins: [u32; BIN_COUNT],
    /// Used/free status of the last chunk, which has no successor header to
    /// carry its prev-used bit.
    pub(crate) final_prev_used: bool,
    pub(crate) stats: HeapStats,
}

impl BinnedAllocator {
    /// Create an allocator managing `pool_bytes` of fresh memory.
    ///
    /// An odd size is rounded down by one byte (charged to overhead). The
    /// whole usable region starts life as a single binned free chunk.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::PoolTooSmall` if the usable size cannot hold one
    /// minimum free chunk plus a size word, and `HeapError::PoolTooLarge`
    /// for `u32::MAX`, which collides with the "none" offset sentinel.
    pub fn new(pool_bytes: u32) -> Result<Self, HeapError> {
        if pool_bytes == u32::MAX {
            return Err(HeapError::PoolTooLarge {
                requested: pool_bytes,
                max: u32::MAX - 1,
            });
        }
        let usable = pool_bytes & SIZE_MASK;
        if usable < MIN_FREE_SIZE + SIZE_WORD {
            return Err(HeapError::PoolTooSmall {
                requested: pool_bytes,
                min: MIN_FREE_SIZE + SIZE_WORD,
            });
        }

        let mut heap = Self {
            pool: Pool::new(usable),
            bins: [INVALID_OFFSET; BIN_COUNT],
            final_prev_used: false,
            stats: HeapStats::default(),
        };

        // One free chunk spanning everything. The first chunk has no
        // predecessor; its prev-used bit is true by convention.
        heap.set_chunk_size(0, usable);
        heap.set_prev_used(0, true);
        heap.write_boundary(0, usable, false);
        heap.push_free(0);
        heap.stats.free_blocks = 1;
        heap.stats.free_mem = usable;

        Ok(heap)
    }

    /// Usable pool size in bytes.
    #[must_use]
    pub fn pool_size(&self) -> u32 {
        self.pool.len()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    // ------------------------------------------------------------------
    // chunk field accessors
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn chunk_size(&self, chunk: u32) -> u32 {
        self.pool.read_word(chunk) & SIZE_MASK
    }

    #[inline]
    pub(crate) fn prev_used(&self, chunk: u32) -> bool {
        self.pool.read_word(chunk) & 1 == 1
    }

    #[inline]
    pub(crate) fn set_chunk_size(&mut self, chunk: u32, size: u32) {
        let flag = self.pool.read_word(chunk) & 1;
        self.pool.write_word(chunk, size | flag);
    }

    #[inline]
    pub(crate) fn set_prev_used(&mut self, chunk: u32, used: bool) {
        let size = self.chunk_size(chunk);
        self.pool.write_word(chunk, size | u32::from(used));
    }

    #[inline]
    pub(crate) fn next_link(&self, chunk: u32) -> u32 {
        self.pool.read_word(chunk + SIZE_WORD)
    }

    #[inline]
    fn set_next_link(&mut self, chunk: u32, link: u32) {
        self.pool.write_word(chunk + SIZE_WORD, link);
    }

    #[inline]
    pub(crate) fn prev_link(&self, chunk: u32) -> u32 {
        self.pool.read_word(chunk + 2 * SIZE_WORD)
    }

    #[inline]
    fn set_prev_link(&mut self, chunk: u32, link: u32) {
        self.pool.write_word(chunk + 2 * SIZE_WORD, link);
    }

    /// Physical successor, or `None` for the last chunk.
    #[inline]
    pub(crate) fn next_chunk(&self, chunk: u32) -> Option<u32> {
        let next = chunk + self.chunk_size(chunk);
        (next < self.pool.len()).then_some(next)
    }

    /// Physical predecessor, located through its footer. Only exists when
    /// the predecessor is free (its footer is valid) and this is not the
    /// first chunk.
    #[inline]
    fn prev_chunk(&self, chunk: u32) -> Option<u32> {
        if chunk == 0 || self.prev_used(chunk) {
            return None;
        }
        let prev_size = self.pool.read_word(chunk - SIZE_WORD);
        Some(chunk - prev_size)
    }

    /// Whether `chunk` itself is used. A chunk's own status lives in its
    /// successor's prev-used bit, or in `final_prev_used` for the last one.
    #[inline]
    pub(crate) fn is_used(&self, chunk: u32) -> bool {
        match self.next_chunk(chunk) {
            Some(next) => self.prev_used(next),
            None => self.final_prev_used,
        }
    }

    /// Write a chunk's size, propagate its status into the successor's
    /// prev-used bit (or `final_prev_used`), and lay down the footer when
    /// the chunk is free. The chunk's own prev-used bit is preserved.
    pub(crate) fn write_boundary(&mut self, chunk: u32, size: u32, used: bool) {
        debug_assert!(size >= MIN_FREE_SIZE && size & 1 == 0);
        self.set_chunk_size(chunk, size);
        match self.next_chunk(chunk) {
            Some(next) => self.set_prev_used(next, used),
            None => self.final_prev_used = used,
        }
        if !used {
            self.pool.write_word(chunk + size - SIZE_WORD, size);
        }
    }

    // ------------------------------------------------------------------
    // free-list bins
    // ------------------------------------------------------------------

    /// Link a free chunk into the bin for its size, just after the head.
    pub(crate) fn push_free(&mut self, chunk: u32) {
        let bin = bin_index(self.chunk_size(chunk));
        let head = self.bins[bin];
        if head == INVALID_OFFSET {
            self.bins[bin] = chunk;
            self.set_next_link(chunk, chunk);
            self.set_prev_link(chunk, chunk);
        } else {
            let after = self.next_link(head);
            self.set_prev_link(chunk, head);
            self.set_next_link(chunk, after);
            self.set_prev_link(after, chunk);
            self.set_next_link(head, chunk);
        }
    }

    /// Unlink a free chunk from its bin. The chunk's own link words are left
    /// as-is.
    pub(crate) fn unlink_free(&mut self, chunk: u32) {
        let bin = bin_index(self.chunk_size(chunk));
        if self.bins[bin] == chunk {
            let next = self.next_link(chunk);
            self.bins[bin] = if next == chunk { INVALID_OFFSET } else { next };
        }
        let next = self.next_link(chunk);
        let prev = self.prev_link(chunk);
        self.set_prev_link(next, prev);
        self.set_next_link(prev, next);
    }

    /// First free chunk that can hold `need` bytes, scanning from the bin
    /// for `need` upward. Bins are unsorted; within one, first fit wins.
    fn find_fit(&self, need: u32) -> Option<u32> {
        for bin in bin_index(need)..BIN_COUNT {
            let head = self.bins[bin];
            if head == INVALID_OFFSET {
                continue;
            }
            let mut cur = head;
            loop {
                if self.chunk_size(cur) >= need {
                    return Some(cur);
                }
                cur = self.next_link(cur);
                if cur == head {
                    break;
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // alloc / free
    // ------------------------------------------------------------------

    /// Allocate `n` bytes. Returns the user offset (just past the size
    /// word), or `None` if no free chunk fits; the caller may compact and
    /// retry.
    pub fn alloc(&mut self, n: u32) -> Option<u32> {
        let Some(padded) = n.checked_add(SIZE_WORD).and_then(|v| v.checked_add(v & 1)) else {
            self.stats.fails += 1;
            return None;
        };
        let need = padded.max(MIN_FREE_SIZE);

        let Some(winner) = self.find_fit(need) else {
            self.stats.fails += 1;
            return None;
        };
        let size = self.chunk_size(winner);
        debug_assert!(size >= need);
        self.unlink_free(winner);

        // Carve the used chunk from the tail so the remainder keeps the
        // winner's base and bin geometry.
        let split = size - need >= MIN_FREE_SIZE;
        let used_size = if split { need } else { size };
        let used = winner + (size - used_size);

        self.write_boundary(used, used_size, true);
        if split {
            // The remainder's boundary write also clears the used chunk's
            // prev-used bit, which is stale payload garbage after the carve.
            self.write_boundary(winner, size - used_size, false);
            self.push_free(winner);
            self.stats.free_blocks += 1;
        }

        self.stats.allocations += 1;
        self.stats.used_blocks += 1;
        self.stats.free_blocks -= 1;
        self.stats.used_mem += used_size;
        self.stats.free_mem -= used_size;

        Some(used + SIZE_WORD)
    }

    /// Return the allocation at `user_offset` to the pool, eagerly merging
    /// with free neighbors on both sides.
    ///
    /// # Panics
    ///
    /// Panics if `user_offset` is outside the pool. An in-bounds offset that
    /// was never returned by [`alloc`](Self::alloc) corrupts the heap; the
    /// integrity checker exists to catch that in tests.
    pub fn free(&mut self, user_offset: u32) {
        assert!(user_offset >= SIZE_WORD, "user offset {user_offset} has no header");
        let chunk = user_offset - SIZE_WORD;
        let size = self.chunk_size(chunk);

        self.write_boundary(chunk, size, false);
        self.push_free(chunk);

        self.stats.frees += 1;
        self.stats.used_blocks -= 1;
        self.stats.free_blocks += 1;
        self.stats.used_mem -= size;
        self.stats.free_mem += size;

        if let Some(next) = self.next_chunk(chunk) {
            if !self.is_used(next) {
                self.merge(chunk, next);
            }
        }
        if let Some(prev) = self.prev_chunk(chunk) {
            self.merge(prev, chunk);
        }
    }

    /// Merge two physically adjacent free chunks into the first.
    fn merge(&mut self, first: u32, second: u32) {
        debug_assert_eq!(first + self.chunk_size(first), second);
        self.unlink_free(first);
        self.unlink_free(second);
        let merged = self.chunk_size(first) + self.chunk_size(second);
        self.write_boundary(first, merged, false);
        self.push_free(first);
        self.stats.free_blocks -= 1;
        self.stats.merges += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_even() {
        assert_eq!(round_even(0), 0);
        assert_eq!(round_even(1), 2);
        assert_eq!(round_even(2), 2);
        assert_eq!(round_even(33), 34);
    }

    #[test]
    fn test_bin_index_classes() {
        // Bins 0..15 cover the even sizes 2..=32.
        assert_eq!(bin_index(2), 0);
        assert_eq!(bin_index(4), 1);
        assert_eq!(bin_index(16), 7);
        assert_eq!(bin_index(32), 15);
        // Everything larger shares the catch-all.
        assert_eq!(bin_index(33), 16);
        assert_eq!(bin_index(34), 16);
        assert_eq!(bin_index(1 << 20), 16);
    }

    #[test]
    fn test_new_single_free_chunk() {
        let heap = BinnedAllocator::new(256).unwrap();
        let s = heap.stats();
        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.used_blocks, 0);
        assert_eq!(s.free_mem, 256);
        assert_eq!(s.used_mem, 0);
        assert_eq!(heap.chunk_size(0), 256);
        assert!(heap.prev_used(0));
        assert!(!heap.final_prev_used);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_new_rounds_odd_size_down() {
        let heap = BinnedAllocator::new(257).unwrap();
        assert_eq!(heap.pool_size(), 256);
        assert_eq!(heap.stats().free_mem, 256);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_new_rejects_tiny_pool() {
        let Err(err) = BinnedAllocator::new(12) else {
            panic!("tiny pool accepted");
        };
        assert_eq!(err, HeapError::PoolTooSmall { requested: 12, min: 20 });
    }

    #[test]
    fn test_new_rejects_sentinel_size() {
        let Err(err) = BinnedAllocator::new(u32::MAX) else {
            panic!("sentinel-sized pool accepted");
        };
        assert_eq!(
            err,
            HeapError::PoolTooLarge { requested: u32::MAX, max: u32::MAX - 1 }
        );
    }

    #[test]
    fn test_alloc_splits_from_tail() {
        let mut heap = BinnedAllocator::new(256).unwrap();
        let user = heap.alloc(20).unwrap();
        // need = round_even(20 + 4) = 24, carved at the high end.
        assert_eq!(user, 232 + SIZE_WORD);
        let s = heap.stats();
        assert_eq!(s.allocations, 1);
        assert_eq!(s.used_blocks, 1);
        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.used_mem, 24);
        assert_eq!(s.free_mem, 232);
        // Remainder keeps the base; used chunk sees a free predecessor.
        assert_eq!(heap.chunk_size(0), 232);
        assert!(!heap.prev_used(232));
        assert!(heap.final_prev_used);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_alloc_minimum_request() {
        let mut heap = BinnedAllocator::new(256).unwrap();
        // A 1-byte request still consumes a minimum free chunk.
        let _user = heap.alloc(1).unwrap();
        assert_eq!(heap.stats().used_mem, MIN_FREE_SIZE);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_alloc_no_split_consumes_whole_chunk() {
        let mut heap = BinnedAllocator::new(64).unwrap();
        // need = 44; remainder 64 - 44 = 20 >= 16 splits. Use 50 instead:
        // need = 54, remainder 10 < 16, so the whole chunk is consumed.
        let user = heap.alloc(50).unwrap();
        assert_eq!(user, SIZE_WORD);
        let s = heap.stats();
        assert_eq!(s.used_mem, 64);
        assert_eq!(s.free_mem, 0);
        assert_eq!(s.free_blocks, 0);
        assert!(heap.final_prev_used);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_alloc_failure_counts() {
        let mut heap = BinnedAllocator::new(64).unwrap();
        assert!(heap.alloc(100).is_none());
        assert_eq!(heap.stats().fails, 1);
        // Overflow-sized requests fail the same soft way.
        assert!(heap.alloc(u32::MAX - 1).is_none());
        assert_eq!(heap.stats().fails, 2);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_free_restores_single_chunk() {
        let mut heap = BinnedAllocator::new(256).unwrap();
        let user = heap.alloc(20).unwrap();
        heap.free(user);
        let s = heap.stats();
        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.used_blocks, 0);
        assert_eq!(s.free_mem, 256);
        assert_eq!(s.used_mem, 0);
        assert_eq!(s.merges, 1);
        assert_eq!(heap.chunk_size(0), 256);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let mut heap = BinnedAllocator::new(256).unwrap();
        let a = heap.alloc(30).unwrap();
        let b = heap.alloc(30).unwrap();
        let c = heap.alloc(30).unwrap();
        heap.free(a);
        heap.free(c);
        heap.check_integrity().unwrap();
        let before = heap.stats();
        // b's neighbors are both free: freeing it collapses everything.
        heap.free(b);
        let s = heap.stats();
        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.free_mem, 256);
        assert_eq!(s.merges, before.merges + 2);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_fit_search_skips_small_bins() {
        let mut heap = BinnedAllocator::new(512).unwrap();
        // Create a small free chunk (bin 11) and a large one (bin 16).
        let small = heap.alloc(20).unwrap(); // 24-byte chunk
        let _wall = heap.alloc(20).unwrap(); // keeps the two frees apart
        heap.free(small);
        heap.check_integrity().unwrap();
        // A 40-byte request must come from the catch-all bin, not bin 11.
        let big = heap.alloc(40).unwrap();
        assert!(heap.alloc(1).is_some());
        heap.free(big);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_exhaust_then_free_then_fit() {
        let mut heap = BinnedAllocator::new(256).unwrap();
        // Largest single allocation: n + 4 == pool size.
        let user = heap.alloc(252).unwrap();
        assert_eq!(heap.stats().free_mem, 0);
        assert!(heap.alloc(1).is_none());
        heap.free(user);
        assert_eq!(heap.stats().free_mem, 256);
        assert!(heap.alloc(252).is_some());
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_alternating_churn_keeps_stats_steady() {
        let mut heap = BinnedAllocator::new(1024).unwrap();
        for _ in 0..100 {
            let a = heap.alloc(48).unwrap();
            let b = heap.alloc(12).unwrap();
            heap.free(a);
            let c = heap.alloc(30).unwrap();
            heap.free(b);
            heap.free(c);
            heap.check_integrity().unwrap();
        }
        let s = heap.stats();
        assert_eq!(s.used_blocks, 0);
        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.free_mem, 1024);
        assert_eq!(s.allocations, 300);
        assert_eq!(s.frees, 300);
    }

    #[test]
    #[should_panic(expected = "outside pool")]
    fn test_free_out_of_range_panics() {
        let mut heap = BinnedAllocator::new(64).unwrap();
        heap.free(4096);
    }
}
