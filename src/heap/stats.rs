//! Heap counters. The core is single-threaded, so these are plain fields
//! snapshotted by value and always exact between operations.
//! `used_blocks` / `free_blocks` / `used_mem` / `free_mem` are gauges;
//! everything else only grows. The integrity checker re-derives the gauges
//! from a pool walk and faults on any disagreement.

/// Snapshot of heap activity, returned by `stats()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful allocations.
    pub allocations: u32,
    /// Frees, including those triggered by a dropped ref count.
    pub frees: u32,
    /// Allocation requests that found no fitting chunk.
    pub fails: u32,
    /// Coalescing merges of adjacent free chunks.
    pub merges: u32,
    /// Currently used chunks.
    pub used_blocks: u32,
    /// Currently free chunks.
    pub free_blocks: u32,
    /// Bytes in used chunks, headers included.
    pub used_mem: u32,
    /// Bytes in free chunks. `used_mem + free_mem` equals the pool size.
    pub free_mem: u32,
    /// Compaction passes completed.
    pub collections: u32,
    /// Chunks relocated by compaction. Unmoved chunks do not count.
    pub swaps: u32,
    /// Bytes relocated by compaction. Unmoved chunks do not count.
    pub bytes_moved: u32,
}
