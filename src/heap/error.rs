use std::fmt;

/// Errors surfaced by heap construction and by the integrity checker.
///
/// Ordinary out-of-memory is not an error: allocation returns `None` and
/// bumps the `fails` counter. Every variant below either rejects a bad
/// construction request or reports structural corruption found by
/// [`check_integrity`](crate::BinnedAllocator::check_integrity); the latter
/// always indicates a bug, not a recoverable condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    PoolTooSmall { requested: u32, min: u32 },
    PoolTooLarge { requested: u32, max: u32 },
    ChunkTooSmall { offset: u32, size: u32 },
    OddChunkSize { offset: u32, size: u32 },
    ChunkOutOfBounds { offset: u32, size: u32 },
    FooterMismatch { offset: u32, header: u32, footer: u32 },
    AdjacentFreeChunks { offset: u32 },
    PrevUsedMismatch { offset: u32 },
    BadBacklinks { offset: u32 },
    MissingFromBin { offset: u32, bin: usize },
    StrayBinEntry { offset: u32, bin: usize },
    WrongTotalSize { expected: u32, actual: u64 },
    BlockCountMismatch { counted_used: u32, counted_free: u32, stat_used: u32, stat_free: u32 },
    ByteCountMismatch { counted_used: u32, counted_free: u32, stat_used: u32, stat_free: u32 },
    HandleMismatch { handle: u32, offset: u32 },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::PoolTooSmall { requested, min } => {
                write!(f, "pool of {requested} bytes is below the minimum of {min}")
            }
            HeapError::PoolTooLarge { requested, max } => {
                write!(f, "pool of {requested} bytes exceeds the maximum of {max}")
            }
            HeapError::ChunkTooSmall { offset, size } => {
                write!(f, "chunk at {offset} has size {size}, below the 16-byte floor")
            }
            HeapError::OddChunkSize { offset, size } => {
                write!(f, "chunk at {offset} has odd size {size}")
            }
            HeapError::ChunkOutOfBounds { offset, size } => {
                write!(f, "chunk at {offset} with size {size} runs past the pool end")
            }
            HeapError::FooterMismatch { offset, header, footer } => {
                write!(f, "free chunk at {offset}: header size {header} != footer size {footer}")
            }
            HeapError::AdjacentFreeChunks { offset } => {
                write!(f, "free chunk at {offset} follows another free chunk")
            }
            HeapError::PrevUsedMismatch { offset } => {
                write!(f, "chunk at {offset}: prev-used flag disagrees with predecessor state")
            }
            HeapError::BadBacklinks { offset } => {
                write!(f, "free chunk at {offset} has inconsistent free-list links")
            }
            HeapError::MissingFromBin { offset, bin } => {
                write!(f, "free chunk at {offset} not found exactly once in bin {bin}")
            }
            HeapError::StrayBinEntry { offset, bin } => {
                write!(f, "bin {bin} references offset {offset}, which is not a free chunk of that class")
            }
            HeapError::WrongTotalSize { expected, actual } => {
                write!(f, "chunk sizes sum to {actual}, pool is {expected} bytes")
            }
            HeapError::BlockCountMismatch { counted_used, counted_free, stat_used, stat_free } => {
                write!(
                    f,
                    "walk counted {counted_used} used / {counted_free} free blocks, stats say {stat_used} / {stat_free}"
                )
            }
            HeapError::ByteCountMismatch { counted_used, counted_free, stat_used, stat_free } => {
                write!(
                    f,
                    "walk counted {counted_used} used / {counted_free} free bytes, stats say {stat_used} / {stat_free}"
                )
            }
            HeapError::HandleMismatch { handle, offset } => {
                write!(f, "handle {handle} does not resolve to a valid used chunk (offset {offset})")
            }
        }
    }
}

impl std::error::Error for HeapError {}
