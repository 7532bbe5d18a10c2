// public module: implementation details stay pub(crate)
pub mod heap;

// allocator
pub use heap::binned::{BinnedAllocator, INVALID_OFFSET, MIN_FREE_SIZE, SIZE_WORD};

// reference manager
pub use heap::refs::{Ref, RefHeap};

// stats
pub use heap::stats::HeapStats;

// errors
pub use heap::error::HeapError;
