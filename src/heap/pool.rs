use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// The raw byte region backing a heap.
///
/// All bookkeeping above this layer speaks in `u32` offsets from the base.
/// Word access is unaligned: chunk sizes advance in steps of 2, so a header
/// word may sit on any even byte boundary.
///
/// Client payload bytes are reached through raw pointers handed out by
/// [`ptr_at`](Pool::ptr_at); the region is never viewed through a slice, so
/// those pointers stay valid while the pool is alive.
pub(crate) struct Pool {
    base: NonNull<u8>,
    len: u32,
}

// Safety: Pool owns its allocation and is safe to send between threads.
unsafe impl Send for Pool {}

impl Pool {
    /// Allocate a zero-filled region of `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero; aborts via `handle_alloc_error` if the
    /// underlying allocation fails.
    pub(crate) fn new(len: u32) -> Self {
        assert!(len > 0, "zero-size pool");
        let layout = Self::layout(len);
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self { base, len }
    }

    fn layout(len: u32) -> Layout {
        Layout::from_size_align(len as usize, 8).expect("pool layout")
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    /// Bounds check for a byte span. Always on: a bad offset is heap
    /// corruption or handle misuse, and must not become a silent wild access.
    #[inline]
    fn check_span(&self, offset: u32, count: u32) {
        assert!(
            u64::from(offset) + u64::from(count) <= u64::from(self.len),
            "span {offset}+{count} outside pool of {} bytes",
            self.len
        );
    }

    #[inline]
    pub(crate) fn read_word(&self, offset: u32) -> u32 {
        self.check_span(offset, 4);
        // Safety: span checked; read_unaligned because offsets are only
        // 2-aligned.
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    #[inline]
    pub(crate) fn write_word(&mut self, offset: u32, value: u32) {
        self.check_span(offset, 4);
        // Safety: span checked; write_unaligned for the same reason as reads.
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u32>()
                .write_unaligned(value);
        }
    }

    /// Raw pointer to the byte at `offset`.
    #[inline]
    pub(crate) fn ptr_at(&self, offset: u32) -> NonNull<u8> {
        self.check_span(offset, 1);
        // Safety: offset is in bounds and base is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
    }

    /// Move `count` bytes from `src` to `dst`. The ranges may overlap.
    pub(crate) fn move_bytes(&mut self, src: u32, dst: u32, count: u32) {
        self.check_span(src, count);
        self.check_span(dst, count);
        // Safety: both spans checked; ptr::copy permits overlap.
        unsafe {
            std::ptr::copy(
                self.base.as_ptr().add(src as usize),
                self.base.as_ptr().add(dst as usize),
                count as usize,
            );
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Safety: base was allocated in new() with this exact layout.
        unsafe {
            dealloc(self.base.as_ptr(), Self::layout(self.len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_roundtrip() {
        let mut pool = Pool::new(64);
        pool.write_word(0, 0xDEAD_BEEF);
        assert_eq!(pool.read_word(0), 0xDEAD_BEEF);
        // zero-filled on construction
        assert_eq!(pool.read_word(4), 0);
    }

    #[test]
    fn test_unaligned_words() {
        // Offsets congruent to 2 mod 4 are the norm for odd chunk layouts.
        let mut pool = Pool::new(64);
        pool.write_word(2, 0x1234_5678);
        pool.write_word(6, 0x9ABC_DEF0);
        assert_eq!(pool.read_word(2), 0x1234_5678);
        assert_eq!(pool.read_word(6), 0x9ABC_DEF0);
    }

    #[test]
    fn test_move_bytes_overlapping() {
        let mut pool = Pool::new(32);
        pool.write_word(8, 0x0102_0304);
        pool.write_word(12, 0x0506_0708);
        // Slide 8 bytes down by 4; the ranges overlap.
        pool.move_bytes(8, 4, 8);
        assert_eq!(pool.read_word(4), 0x0102_0304);
        assert_eq!(pool.read_word(8), 0x0506_0708);
    }

    #[test]
    fn test_ptr_at_writes_visible_to_words() {
        let mut pool = Pool::new(32);
        pool.write_word(0, 0x1122_3344);
        let bytes = 0x1122_3344u32.to_ne_bytes();
        for (i, &expected) in bytes.iter().enumerate() {
            let p = pool.ptr_at(i as u32);
            // Safety: Test code.
            unsafe { assert_eq!(p.as_ptr().read(), expected) };
        }
    }

    #[test]
    #[should_panic(expected = "outside pool")]
    fn test_read_past_end_panics() {
        let pool = Pool::new(16);
        let _ = pool.read_word(13);
    }

    #[test]
    #[should_panic(expected = "outside pool")]
    fn test_read_at_invalid_offset_panics() {
        // u32::MAX is the "none" sentinel; dereferencing it must trap,
        // not wrap around.
        let pool = Pool::new(16);
        let _ = pool.read_word(u32::MAX);
    }

    #[test]
    #[should_panic(expected = "zero-size pool")]
    fn test_zero_size_rejected() {
        let _ = Pool::new(0);
    }
}
