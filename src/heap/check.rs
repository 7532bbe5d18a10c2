//! Read-only structural verification, used by the test suites after every
//! interesting operation. Any error returned here means a heap bug, not a
//! recoverable condition.

use fixedbitset::FixedBitSet;

use super::binned::{BinnedAllocator, INVALID_OFFSET, MIN_FREE_SIZE, SIZE_WORD, bin_index, round_even};
use super::error::HeapError;
use super::refs::RefHeap;

impl BinnedAllocator {
    /// Walk the whole pool and verify every structural invariant: chunk
    /// size floor, parity, and bounds, free-chunk footers, prev-used chain agreement
    /// (including the out-of-band final flag), no adjacent free chunks,
    /// exact-once bin membership with sane backlinks, and the stored
    /// statistics against fresh tallies.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        let pool_len = self.pool_size();
        // One bit per even offset marks chunks seen free during the walk.
        let mut free_seen = FixedBitSet::with_capacity((pool_len / 2) as usize + 1);

        let mut counted_free = 0u32;
        let mut counted_used = 0u32;
        let mut free_bytes = 0u32;
        let mut used_bytes = 0u32;
        let mut total: u64 = 0;
        let mut prev_status: Option<bool> = None;

        let mut cursor = Some(0u32);
        while let Some(chunk) = cursor {
            let size = self.chunk_size(chunk);
            if size < MIN_FREE_SIZE {
                return Err(HeapError::ChunkTooSmall { offset: chunk, size });
            }
            // The header word's low bit carries the prev-used flag, so the
            // masked size here is even whenever the accessors are intact;
            // the flag-free footer copy is checked for parity below.
            if size & 1 != 0 {
                return Err(HeapError::OddChunkSize { offset: chunk, size });
            }
            // A chunk must end exactly at the pool boundary or leave room
            // for a whole successor; anything else would send the walk (and
            // every later header read) out of bounds.
            let end = u64::from(chunk) + u64::from(size);
            if end > u64::from(pool_len)
                || (end < u64::from(pool_len)
                    && u64::from(pool_len) - end < u64::from(MIN_FREE_SIZE))
            {
                return Err(HeapError::ChunkOutOfBounds { offset: chunk, size });
            }

            match prev_status {
                // First chunk: prev-used is true by convention.
                None => {
                    if !self.prev_used(chunk) {
                        return Err(HeapError::PrevUsedMismatch { offset: chunk });
                    }
                }
                Some(prev_used) => {
                    if self.prev_used(chunk) != prev_used {
                        return Err(HeapError::PrevUsedMismatch { offset: chunk });
                    }
                }
            }

            let used = self.is_used(chunk);
            if used {
                counted_used += 1;
                used_bytes += size;
            } else {
                if prev_status == Some(false) {
                    return Err(HeapError::AdjacentFreeChunks { offset: chunk });
                }
                counted_free += 1;
                free_bytes += size;

                let footer = self.pool.read_word(chunk + size - SIZE_WORD);
                if footer & 1 != 0 {
                    return Err(HeapError::OddChunkSize { offset: chunk, size: footer });
                }
                if footer != size {
                    return Err(HeapError::FooterMismatch { offset: chunk, header: size, footer });
                }

                let next = self.next_link(chunk);
                let prev = self.prev_link(chunk);
                if next == INVALID_OFFSET || prev == INVALID_OFFSET {
                    return Err(HeapError::BadBacklinks { offset: chunk });
                }
                if self.prev_link(next) != chunk || self.next_link(prev) != chunk {
                    return Err(HeapError::BadBacklinks { offset: chunk });
                }
                self.check_in_bin(chunk)?;
                free_seen.insert((chunk / 2) as usize);
            }

            prev_status = Some(used);
            total += u64::from(size);
            cursor = self.next_chunk(chunk);
        }

        if total != u64::from(pool_len) {
            return Err(HeapError::WrongTotalSize { expected: pool_len, actual: total });
        }
        // The last chunk's status IS `final_prev_used` in this layout, so
        // there is no independent value to compare it against here; a wrong
        // flag surfaces below as a footer, bin, or tally mismatch.

        // Sweep the bins: every entry must be a free chunk the walk saw, in
        // the bin matching its size, and the member count must match.
        let mut bin_members = 0u32;
        for (bin, &head) in self.bins.iter().enumerate() {
            if head == INVALID_OFFSET {
                continue;
            }
            let mut walked = 0u32;
            let mut entry = head;
            loop {
                walked += 1;
                if walked > counted_free {
                    return Err(HeapError::BadBacklinks { offset: head });
                }
                if entry >= pool_len || !free_seen.contains((entry / 2) as usize) {
                    return Err(HeapError::StrayBinEntry { offset: entry, bin });
                }
                if bin_index(self.chunk_size(entry)) != bin {
                    return Err(HeapError::StrayBinEntry { offset: entry, bin });
                }
                bin_members += 1;
                entry = self.next_link(entry);
                if entry == head {
                    break;
                }
            }
        }
        if bin_members != counted_free {
            return Err(HeapError::BlockCountMismatch {
                counted_used,
                counted_free: bin_members,
                stat_used: counted_used,
                stat_free: counted_free,
            });
        }

        let stats = self.stats();
        if stats.used_blocks != counted_used || stats.free_blocks != counted_free {
            return Err(HeapError::BlockCountMismatch {
                counted_used,
                counted_free,
                stat_used: stats.used_blocks,
                stat_free: stats.free_blocks,
            });
        }
        if stats.used_mem != used_bytes || stats.free_mem != free_bytes {
            return Err(HeapError::ByteCountMismatch {
                counted_used: used_bytes,
                counted_free: free_bytes,
                stat_used: stats.used_mem,
                stat_free: stats.free_mem,
            });
        }
        Ok(())
    }

    /// Confirm `chunk` appears exactly once in the bin for its size class.
    fn check_in_bin(&self, chunk: u32) -> Result<(), HeapError> {
        let bin = bin_index(self.chunk_size(chunk));
        let head = self.bins[bin];
        if head == INVALID_OFFSET {
            return Err(HeapError::MissingFromBin { offset: chunk, bin });
        }
        let mut found = 0u32;
        let mut walked = 0u32;
        let mut entry = head;
        loop {
            walked += 1;
            // Runaway guard: a sane bin never holds more entries than there
            // are free blocks.
            if walked > self.stats().free_blocks + 1 {
                return Err(HeapError::BadBacklinks { offset: head });
            }
            if entry == chunk {
                found += 1;
            }
            entry = self.next_link(entry);
            if entry == head {
                break;
            }
        }
        if found != 1 {
            return Err(HeapError::MissingFromBin { offset: chunk, bin });
        }
        Ok(())
    }
}

impl RefHeap {
    /// Allocator-level integrity plus the handle table: every live handle
    /// must resolve to a distinct used chunk large enough for its request.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        self.alloc.check_integrity()?;

        let pool_len = self.alloc.pool_size();
        let mut used_at = FixedBitSet::with_capacity((pool_len / 2) as usize + 1);
        let mut cursor = Some(0u32);
        while let Some(chunk) = cursor {
            if self.alloc.is_used(chunk) {
                used_at.insert((chunk / 2) as usize);
            }
            cursor = self.alloc.next_chunk(chunk);
        }

        let mut claimed = FixedBitSet::with_capacity((pool_len / 2) as usize + 1);
        for (index, slot) in self.refs.iter().enumerate() {
            if !slot.is_live() {
                continue;
            }
            let handle = index as u32;
            if slot.offset < SIZE_WORD || slot.offset >= pool_len {
                return Err(HeapError::HandleMismatch { handle, offset: slot.offset });
            }
            let chunk = slot.offset - SIZE_WORD;
            let bit = (chunk / 2) as usize;
            if !used_at.contains(bit) || claimed.contains(bit) {
                return Err(HeapError::HandleMismatch { handle, offset: slot.offset });
            }
            claimed.insert(bit);

            let needed = round_even(slot.requested + SIZE_WORD).max(MIN_FREE_SIZE);
            if self.alloc.chunk_size(chunk) < needed {
                return Err(HeapError::HandleMismatch { handle, offset: slot.offset });
            }
        }
        Ok(())
    }
}
