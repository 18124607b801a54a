//! The explicit-list allocator.
//!
//! Free blocks are additionally linked into a doubly-linked list threaded
//! through their own payload bytes: word 0 of a free payload holds the
//! offset of the previous list node, word 1 the offset of the next one.
//! Allocation only walks that list instead of the whole segment, freeing
//! pushes the block onto the list head (LIFO) and then merges it with free
//! neighbors to its right, and reallocation can grow a block in place by
//! absorbing those neighbors.
//!
//! Carrying the two links raises the minimum payload to two words, which
//! in turn raises the split threshold.

use core::fmt;
use core::ptr::{self, NonNull};

use super::header::{round_up, Header, State, ALIGNMENT, HEADER_SIZE};
use super::segment::{Segment, ValidatedOffset};
use super::{Corruption, FreeError, HeapStats, InitError, MAX_REQUEST_SIZE};

/// Payload word holding the offset of the previous free-list node.
const PREV: usize = 0;
/// Payload word holding the offset of the next free-list node.
const NEXT: usize = 1;
/// In-payload encoding of "no neighbor". Never a valid block offset, since
/// offsets are bounded by the segment size.
const NIL: usize = usize::MAX;

/// A first-fit heap that keeps its free blocks on an intrusive list.
pub struct ExplicitHeap {
    segment: Segment,
    stats: HeapStats,
    first_free: Option<ValidatedOffset>,
}

impl ExplicitHeap {
    /// Smallest payload a block of this variant may carry: room for the
    /// two list links of a free block.
    pub const MIN_PAYLOAD: usize = 2 * ALIGNMENT;

    /// Take over the region `[base, base + size)` and install a single free
    /// block spanning all of it.
    ///
    /// Fails with [`InitError::SegmentTooSmall`] when the region cannot
    /// hold one header plus a minimum payload and with
    /// [`InitError::SegmentMisaligned`] when base or size is not a multiple
    /// of [`ALIGNMENT`].
    ///
    /// # Safety
    /// The region must be valid for reads and writes and must not be
    /// accessed by anything else for the lifetime of the returned heap.
    pub unsafe fn init(base: *mut u8, size: usize) -> Result<Self, InitError> {
        if size < HEADER_SIZE + Self::MIN_PAYLOAD {
            return Err(InitError::SegmentTooSmall);
        }
        // SAFETY: the caller contract is forwarded verbatim.
        let mut segment = unsafe { Segment::new(base, size) }?;

        let whole = segment.offset_at(0);
        segment.set_header(whole, Header::free(size - HEADER_SIZE));
        let mut heap = Self {
            segment,
            stats: HeapStats {
                used_bytes: 0,
                used_blocks: 0,
                free_blocks: 1,
            },
            first_free: None,
        };
        heap.push_front(whole);
        Ok(heap)
    }

    /// The current bookkeeping counters.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// The size of the managed segment in bytes.
    pub fn segment_size(&self) -> usize {
        self.segment.size()
    }

    fn prev(&self, block: ValidatedOffset) -> Option<ValidatedOffset> {
        match self.segment.payload_word(block, PREV) {
            NIL => None,
            raw => Some(self.segment.offset_at(raw)),
        }
    }

    fn next(&self, block: ValidatedOffset) -> Option<ValidatedOffset> {
        match self.segment.payload_word(block, NEXT) {
            NIL => None,
            raw => Some(self.segment.offset_at(raw)),
        }
    }

    fn set_prev(&mut self, block: ValidatedOffset, to: Option<ValidatedOffset>) {
        self.segment
            .set_payload_word(block, PREV, to.map_or(NIL, |offset| offset.0));
    }

    fn set_next(&mut self, block: ValidatedOffset, to: Option<ValidatedOffset>) {
        self.segment
            .set_payload_word(block, NEXT, to.map_or(NIL, |offset| offset.0));
    }

    /// Make `block` the new head of the free list.
    fn push_front(&mut self, block: ValidatedOffset) {
        if let Some(head) = self.first_free {
            self.set_prev(head, Some(block));
        }
        self.set_prev(block, None);
        self.set_next(block, self.first_free);
        self.first_free = Some(block);
    }

    /// Take `block` out of the free list, stitching its neighbors (or the
    /// list head) together.
    fn unlink(&mut self, block: ValidatedOffset) {
        let (prev, next) = (self.prev(block), self.next(block));
        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.first_free = next,
        }
        if let Some(next) = next {
            self.set_prev(next, prev);
        }
    }

    /// Allocate a payload of at least `requested` bytes.
    ///
    /// The returned address is [`ALIGNMENT`]-aligned and stays valid until
    /// it is passed to [`free`](Self::free) or resized away by
    /// [`realloc`](Self::realloc). Returns `None` for a zero-sized request,
    /// for requests beyond [`MAX_REQUEST_SIZE`] and when no free block can
    /// take the request.
    pub fn alloc(&mut self, requested: usize) -> Option<NonNull<u8>> {
        if requested == 0 || requested > MAX_REQUEST_SIZE {
            return None;
        }
        let size = round_up(requested.max(Self::MIN_PAYLOAD), ALIGNMENT);
        // cheap rejection; the search below may still fail on fragmentation
        if size + self.stats.used_bytes > self.segment.size() {
            return None;
        }

        let block = self.find_fit(size)?;
        self.split(block, size);
        self.unlink(block);

        let header = self.segment.header(block);
        self.segment.set_header(block, Header::used(header.size()));
        self.stats.used_bytes += HEADER_SIZE + header.size();
        self.stats.used_blocks += 1;
        self.stats.free_blocks -= 1;
        Some(self.segment.payload_ptr(block))
    }

    /// First list node large enough for `size`, in list (LIFO) order.
    fn find_fit(&self, size: usize) -> Option<ValidatedOffset> {
        let mut cursor = self.first_free;
        while let Some(block) = cursor {
            if self.segment.header(block).size() >= size {
                return Some(block);
            }
            cursor = self.next(block);
        }
        None
    }

    /// Carve a trailing free block off `block` if the excess over `size`
    /// can host one, and push it onto the free list. The allocation status
    /// of `block` is preserved, so the split also serves the in-place
    /// shrink and grow of `realloc`.
    fn split(&mut self, block: ValidatedOffset, size: usize) {
        let header = self.segment.header(block);
        if header.size() - size >= HEADER_SIZE + Self::MIN_PAYLOAD {
            let tail = self.segment.offset_at(block.0 + HEADER_SIZE + size);
            self.segment
                .set_header(tail, Header::free(header.size() - size - HEADER_SIZE));
            self.segment.set_header(block, header.resized(size));
            self.push_front(tail);
            self.stats.free_blocks += 1;
        }
    }

    /// Absorb the blocks to the right of `block` while they are free.
    ///
    /// Every absorbed block is unlinked from the free list and its
    /// footprint (header included) is added to `block`'s payload. The
    /// status of `block` itself is preserved, as are its own list links
    /// when it is free: the links live in the first payload words, which
    /// absorbing a right neighbor does not touch.
    fn coalesce_right(&mut self, block: ValidatedOffset) {
        while let Some(right) = self.segment.following(block) {
            let neighbor = self.segment.header(right);
            if neighbor.state() == State::Used {
                break;
            }
            self.unlink(right);
            let header = self.segment.header(block);
            self.segment.set_header(
                block,
                header.resized(header.size() + HEADER_SIZE + neighbor.size()),
            );
            self.stats.free_blocks -= 1;
        }
    }

    /// Payload size `block` would reach by absorbing its free right
    /// neighbors. A read-only probe: the grow path of
    /// [`realloc`](Self::realloc) uses it to decide whether growing in
    /// place can succeed before mutating anything.
    fn reachable(&self, block: ValidatedOffset) -> usize {
        let mut size = self.segment.header(block).size();
        let mut cursor = self.segment.following(block);
        while let Some(right) = cursor {
            let neighbor = self.segment.header(right);
            if neighbor.state() == State::Used {
                break;
            }
            size += HEADER_SIZE + neighbor.size();
            cursor = self.segment.following(right);
        }
        size
    }

    /// Return the block behind `ptr` to the heap.
    ///
    /// Freeing a null pointer is a no-op. Pointers that were never handed
    /// out by [`alloc`](Self::alloc) are reported as
    /// [`FreeError::OutOfSegment`] where that is cheap to see, and freeing
    /// the same payload twice as [`FreeError::DoubleFree`]. The freed block
    /// becomes the new list head and is merged with free blocks to its
    /// right; a free block to its left stays separate until that block is
    /// itself touched.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = self
            .segment
            .payload_offset(ptr)
            .ok_or(FreeError::OutOfSegment)?;
        let header = self.segment.header(block);
        if header.state() == State::Free {
            return Err(FreeError::DoubleFree);
        }

        self.segment.set_header(block, Header::free(header.size()));
        self.stats.used_bytes -= HEADER_SIZE + header.size();
        self.stats.used_blocks -= 1;
        self.stats.free_blocks += 1;
        self.push_front(block);
        self.coalesce_right(block);
        Ok(())
    }

    /// Resize the allocation behind `ptr` to at least `new_size` bytes.
    ///
    /// `realloc(null, n)` allocates, `realloc(ptr, 0)` frees and returns
    /// `None`, and requests beyond [`MAX_REQUEST_SIZE`] are rejected with
    /// `None`. A shrinking request is served in place by splitting the
    /// block. A growing one is served in place as well when the free
    /// blocks immediately to the right provide enough room; only when they
    /// do not is the payload moved to a fresh block. On failure `None` is
    /// returned and the old allocation stays untouched.
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let old = match NonNull::new(ptr) {
            None => return self.alloc(new_size),
            Some(old) => old,
        };
        if new_size == 0 {
            let _ = self.free(old.as_ptr());
            return None;
        }
        if new_size > MAX_REQUEST_SIZE {
            return None;
        }

        let block = self.segment.payload_offset(old.as_ptr())?;
        let size = round_up(new_size.max(Self::MIN_PAYLOAD), ALIGNMENT);
        let current = self.segment.header(block).size();
        if current > size {
            self.split(block, size);
            let after = self.segment.header(block).size();
            self.stats.used_bytes -= current - after;
            return Some(old);
        }
        if current == size {
            return Some(old);
        }

        if self.reachable(block) >= size {
            self.coalesce_right(block);
            self.split(block, size);
            let after = self.segment.header(block).size();
            self.stats.used_bytes += after - current;
            return Some(old);
        }

        let new = self.alloc(new_size)?;
        // SAFETY: `new` names a block distinct from `old`, so the ranges
        // cannot overlap; its payload is at least `size > current` bytes,
        // so `current` bytes fit, and both pointers are valid for that
        // length inside the segment.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), current) };
        let freed = self.free(old.as_ptr());
        debug_assert!(freed.is_ok());
        Some(new)
    }

    /// Check every structural invariant of the heap.
    ///
    /// Walks the segment once, cross-checks the incrementally maintained
    /// counters and then walks the free list: every node must be a free
    /// block, the `prev` links must mirror the path taken, and the list
    /// must be exactly as long as the free-block counter says (which also
    /// rules out cycles).
    pub fn validate(&self) -> Result<(), Corruption> {
        if self.stats.used_bytes > self.segment.size() {
            return Err(Corruption::UsedBytesExceedSegment);
        }
        let walked = self.segment.census(Self::MIN_PAYLOAD)?;
        if walked.used_blocks != self.stats.used_blocks {
            return Err(Corruption::UsedBlockCountMismatch {
                walked: walked.used_blocks,
                counted: self.stats.used_blocks,
            });
        }
        if walked.free_blocks != self.stats.free_blocks {
            return Err(Corruption::FreeBlockCountMismatch {
                walked: walked.free_blocks,
                counted: self.stats.free_blocks,
            });
        }
        if walked.used_bytes != self.stats.used_bytes {
            return Err(Corruption::UsedBytesMismatch {
                walked: walked.used_bytes,
                counted: self.stats.used_bytes,
            });
        }

        let mut length = 0;
        let mut along_prev = None;
        let mut cursor = self.first_free;
        while let Some(block) = cursor {
            if length == self.stats.free_blocks {
                return Err(Corruption::FreeListLengthMismatch {
                    walked: length + 1,
                    counted: self.stats.free_blocks,
                });
            }
            if self.segment.header(block).state() == State::Used {
                return Err(Corruption::FreeListNodeNotFree { offset: block.0 });
            }
            let expected = along_prev.map_or(NIL, |offset: ValidatedOffset| offset.0);
            if self.segment.payload_word(block, PREV) != expected {
                return Err(Corruption::FreeListLinkBroken { offset: block.0 });
            }
            cursor = match self.segment.payload_word(block, NEXT) {
                NIL => None,
                raw => match self.segment.try_offset(raw) {
                    Some(next) => Some(next),
                    None => return Err(Corruption::FreeListLinkBroken { offset: block.0 }),
                },
            };
            along_prev = Some(block);
            length += 1;
        }
        if length != self.stats.free_blocks {
            return Err(Corruption::FreeListLengthMismatch {
                walked: length,
                counted: self.stats.free_blocks,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ExplicitHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // a link word rendered as an offset or as "nil"
        struct Link(usize);
        impl fmt::Display for Link {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.0 == NIL {
                    f.write_str("nil")
                } else {
                    write!(f, "{:#x}", self.0)
                }
            }
        }

        writeln!(
            f,
            "segment {:p}..{:p}, {} bytes in use",
            self.segment.base(),
            self.segment.base().wrapping_add(self.segment.size()),
            self.stats.used_bytes
        )?;
        for block in self.segment.blocks() {
            let header = self.segment.header(block);
            match header.state() {
                State::Used => {
                    writeln!(f, "  {:#08x}: {:>8} used", block.0, header.size())?;
                }
                State::Free => writeln!(
                    f,
                    "  {:#08x}: {:>8} free, prev {} next {}",
                    block.0,
                    header.size(),
                    Link(self.segment.payload_word(block, PREV)),
                    Link(self.segment.payload_word(block, NEXT)),
                )?,
            }
        }
        Ok(())
    }
}
