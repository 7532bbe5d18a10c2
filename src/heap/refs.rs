use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::binned::{BinnedAllocator, INVALID_OFFSET, SIZE_WORD};
use super::error::HeapError;
use super::stats::HeapStats;

/// Ref count stored in a dead slot. Live counts saturate one below this, so
/// the marker can never be reached by `incr_ref`.
const DEAD_REF_COUNT: u32 = u32::MAX;

/// Slots pre-created at construction so early allocations never grow the
/// table.
const INITIAL_SLOTS: usize = 100;

/// Stable opaque handle to an allocation. Survives compaction; the raw
/// pointer behind it does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ref(u32);

impl Ref {
    /// The dense slot index behind this handle.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RefSlot {
    pub(crate) ref_count: u32,
    /// Bytes the client asked for. Zero marks a free slot.
    pub(crate) requested: u32,
    /// User offset of the backing chunk; rewritten by compaction.
    pub(crate) offset: u32,
}

impl RefSlot {
    const FREE: Self = Self {
        ref_count: DEAD_REF_COUNT,
        requested: 0,
        offset: INVALID_OFFSET,
    };

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.requested != 0
    }
}

/// Reference-counted facade over the allocator, plus the compaction pass.
///
/// Clients hold [`Ref`] handles instead of pointers. A handle stays valid
/// across [`compact`](RefHeap::compact); any pointer obtained through
/// [`pointer_of`](RefHeap::pointer_of) must be re-queried afterwards.
/// Compaction is never triggered implicitly; the usual pattern is to call
/// it after an allocation failure and retry.
pub struct RefHeap {
    pub(crate) alloc: BinnedAllocator,
    pub(crate) refs: Vec<RefSlot>,
    /// Double-free tripwire, one bit per handle slot.
    /// Only active when debug assertions are enabled.
    #[cfg(debug_assertions)]
    live_mask: FixedBitSet,
}

impl RefHeap {
    /// Create a heap managing `pool_bytes` of fresh memory.
    ///
    /// # Errors
    ///
    /// Returns `HeapError::PoolTooSmall` for pools that cannot hold a single
    /// minimum allocation, and `HeapError::PoolTooLarge` for the `u32::MAX`
    /// sentinel size.
    pub fn new(pool_bytes: u32) -> Result<Self, HeapError> {
        Ok(Self {
            alloc: BinnedAllocator::new(pool_bytes)?,
            refs: vec![RefSlot::FREE; INITIAL_SLOTS],
            #[cfg(debug_assertions)]
            live_mask: FixedBitSet::with_capacity(INITIAL_SLOTS),
        })
    }

    /// Usable pool size in bytes.
    #[must_use]
    pub fn pool_size(&self) -> u32 {
        self.alloc.pool_size()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.alloc.stats()
    }

    /// Allocate `n` bytes and return a handle with a ref count of 1, or
    /// `None` when no chunk fits (compact and retry, or give up).
    ///
    /// Every allocation's user area is at least 12 bytes regardless of `n`,
    /// which is what lets compaction stamp a handle word into live payloads.
    pub fn alloc_ref(&mut self, n: u32) -> Option<Ref> {
        if n == 0 {
            return None;
        }
        let user = self.alloc.alloc(n)?;

        let index = match self.refs.iter().position(|slot| !slot.is_live()) {
            Some(index) => index,
            None => {
                if self.refs.len() >= DEAD_REF_COUNT as usize {
                    // No representable slot left; hand the memory back.
                    self.alloc.free(user);
                    return None;
                }
                self.refs.push(RefSlot::FREE);
                self.refs.len() - 1
            }
        };

        self.refs[index] = RefSlot {
            ref_count: 1,
            requested: n,
            offset: user,
        };
        #[cfg(debug_assertions)]
        {
            if index >= self.live_mask.len() {
                self.live_mask.grow(index + 1);
            }
            self.live_mask.insert(index);
        }
        Some(Ref(index as u32))
    }

    #[inline]
    fn live_slot(&self, r: Ref) -> &RefSlot {
        let slot = &self.refs[r.0 as usize];
        assert!(slot.is_live(), "handle {} is not live", r.0);
        slot
    }

    /// Release the allocation behind `r` regardless of its ref count.
    ///
    /// # Panics
    ///
    /// Panics if `r` is dead or out of range; debug builds call out a
    /// repeated release explicitly.
    pub fn free_ref(&mut self, r: Ref) {
        // Double-free check (debug-only; release relies on the liveness
        // assert below).
        #[cfg(debug_assertions)]
        {
            let index = r.0 as usize;
            assert!(
                self.live_mask.contains(index),
                "Double free detected in RefHeap for handle {index}",
            );
            self.live_mask.set(index, false);
        }
        let slot = *self.live_slot(r);
        self.alloc.free(slot.offset);
        self.refs[r.0 as usize] = RefSlot::FREE;
    }

    /// Bump the ref count. Saturates rather than wrapping into the dead-slot
    /// marker.
    ///
    /// # Panics
    ///
    /// Panics if `r` is dead or out of range.
    pub fn incr_ref(&mut self, r: Ref) {
        self.live_slot(r);
        let slot = &mut self.refs[r.0 as usize];
        if slot.ref_count < DEAD_REF_COUNT - 1 {
            slot.ref_count += 1;
        }
    }

    /// Drop one reference. Returns `true` while the handle stays alive; on
    /// the last reference the allocation is released and `false` comes back.
    ///
    /// # Panics
    ///
    /// Panics if `r` is dead or out of range.
    pub fn decr_ref(&mut self, r: Ref) -> bool {
        self.live_slot(r);
        let slot = &mut self.refs[r.0 as usize];
        if slot.ref_count > 1 {
            slot.ref_count -= 1;
            true
        } else {
            self.free_ref(r);
            false
        }
    }

    /// Raw pointer to the allocation's user bytes. Invalidated by the next
    /// [`compact`](Self::compact).
    ///
    /// # Panics
    ///
    /// Panics if `r` is dead or out of range.
    #[must_use]
    pub fn pointer_of(&self, r: Ref) -> NonNull<u8> {
        self.alloc.pool.ptr_at(self.live_slot(r).offset)
    }

    /// Bytes originally requested for `r` (not the chunk size).
    ///
    /// # Panics
    ///
    /// Panics if `r` is dead or out of range.
    #[must_use]
    pub fn size_of(&self, r: Ref) -> u32 {
        self.live_slot(r).requested
    }

    /// Current ref count of `r`.
    ///
    /// # Panics
    ///
    /// Panics if `r` is dead or out of range.
    #[must_use]
    pub fn ref_count_of(&self, r: Ref) -> u32 {
        self.live_slot(r).ref_count
    }

    /// Slide every used chunk toward offset 0 (preserving physical order),
    /// fuse all free space into one trailing chunk, and rewrite the handle
    /// table so every live handle still resolves.
    ///
    /// Runs in five phases. Stamp: each live payload's first word is saved
    /// to a side buffer and replaced with its handle index, so the slide
    /// needs no chunk-to-handle map. Detach: every free chunk leaves its
    /// bin. Slide: used chunks move down over a write cursor. Tail: the
    /// remaining bytes become the single free chunk, or none when the pool
    /// is full. Unstamp: handle indices are read back out of the moved
    /// payloads, the saved words restored, and the table's offsets updated.
    pub fn compact(&mut self) {
        // Stamp.
        let mut backing = vec![0u32; self.refs.len()];
        for (index, slot) in self.refs.iter().enumerate() {
            if slot.is_live() {
                backing[index] = self.alloc.pool.read_word(slot.offset);
                self.alloc.pool.write_word(slot.offset, index as u32);
            }
        }

        // Detach: after this walk the bins are empty.
        let mut cursor = Some(0u32);
        while let Some(chunk) = cursor {
            let next = self.alloc.next_chunk(chunk);
            if !self.alloc.is_used(chunk) {
                self.alloc.unlink_free(chunk);
                self.alloc.stats.free_blocks -= 1;
            }
            cursor = next;
        }
        debug_assert_eq!(self.alloc.stats.free_blocks, 0);

        // Slide. The walk reads the old layout; the write cursor never
        // passes the chunk being visited, so moves only overwrite dead
        // space and already-visited ground.
        let mut write_cursor = 0u32;
        let mut cursor = Some(0u32);
        while let Some(chunk) = cursor {
            let next = self.alloc.next_chunk(chunk);
            if self.alloc.is_used(chunk) {
                let size = self.alloc.chunk_size(chunk);
                if chunk != write_cursor {
                    self.alloc.pool.move_bytes(chunk, write_cursor, size);
                    self.alloc.stats.bytes_moved += size;
                    self.alloc.stats.swaps += 1;
                }
                self.alloc.set_chunk_size(write_cursor, size);
                self.alloc.set_prev_used(write_cursor, true);
                write_cursor += size;
            }
            cursor = next;
        }

        // Tail.
        let free_size = self.alloc.pool.len() - write_cursor;
        if free_size > 0 {
            // Structurally 0 or >= one minimum chunk: every chunk is >= 16.
            debug_assert!(free_size >= super::binned::MIN_FREE_SIZE);
            self.alloc.set_chunk_size(write_cursor, free_size);
            self.alloc.set_prev_used(write_cursor, true);
            self.alloc.write_boundary(write_cursor, free_size, false);
            self.alloc.push_free(write_cursor);
            self.alloc.stats.free_blocks = 1;
        } else {
            self.alloc.final_prev_used = true;
        }
        self.alloc.stats.free_mem = free_size;

        // Unstamp.
        let mut chunk = 0u32;
        while chunk < write_cursor {
            let size = self.alloc.chunk_size(chunk);
            let user = chunk + SIZE_WORD;
            let index = self.alloc.pool.read_word(user) as usize;
            self.alloc.pool.write_word(user, backing[index]);
            self.refs[index].offset = user;
            chunk += size;
        }

        self.alloc.stats.collections += 1;
    }
}
