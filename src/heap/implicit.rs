//! The implicit-list allocator.
//!
//! Free blocks carry no extra bookkeeping: they are found by walking every
//! block from the segment start and skipping the allocated ones. That keeps
//! the per-block overhead at a single header word and the minimum payload
//! at one alignment unit, at the cost of allocation time growing with the
//! total number of blocks. Freeing never merges blocks; adjacent free
//! blocks are simply picked up one by one by later searches.

use core::fmt;
use core::ptr::{self, NonNull};

use super::header::{round_up, Header, State, ALIGNMENT, HEADER_SIZE};
use super::segment::{Segment, ValidatedOffset};
use super::{Corruption, FreeError, HeapStats, InitError, MAX_REQUEST_SIZE};

/// A first-fit heap that discovers free blocks by linear traversal.
pub struct ImplicitHeap {
    segment: Segment,
    stats: HeapStats,
}

impl ImplicitHeap {
    /// Smallest payload a block of this variant may carry.
    pub const MIN_PAYLOAD: usize = ALIGNMENT;

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
        Ok(Self {
            segment,
            stats: HeapStats {
                used_bytes: 0,
                used_blocks: 0,
                free_blocks: 1,
            },
        })
    }

    /// The current bookkeeping counters.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// The size of the managed segment in bytes.
    pub fn segment_size(&self) -> usize {
        self.segment.size()
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

        let header = self.segment.header(block);
        self.segment.set_header(block, Header::used(header.size()));
        self.stats.used_bytes += HEADER_SIZE + header.size();
        self.stats.used_blocks += 1;
        self.stats.free_blocks -= 1;
        Some(self.segment.payload_ptr(block))
    }

    /// First free block large enough for `size`, in address order.
    fn find_fit(&self, size: usize) -> Option<ValidatedOffset> {
        self.segment.blocks().find(|&block| {
            let header = self.segment.header(block);
            header.state() == State::Free && header.size() >= size
        })
    }

    /// Carve a trailing free block off `block` if the excess over `size`
    /// can host one; otherwise leave the block as padding-heavy as it is.
    /// The allocation status of `block` is preserved, so the split also
    /// serves the in-place shrink of `realloc`.
    fn split(&mut self, block: ValidatedOffset, size: usize) {
        let header = self.segment.header(block);
        if header.size() - size >= HEADER_SIZE + Self::MIN_PAYLOAD {
            let tail = self.segment.offset_at(block.0 + HEADER_SIZE + size);
            self.segment
                .set_header(tail, Header::free(header.size() - size - HEADER_SIZE));
            self.segment.set_header(block, header.resized(size));
            self.stats.free_blocks += 1;
        }
    }

    /// Return the block behind `ptr` to the heap.
    ///
    /// Freeing a null pointer is a no-op. Pointers that were never handed
    /// out by [`alloc`](Self::alloc) are reported as
    /// [`FreeError::OutOfSegment`] where that is cheap to see, and freeing
    /// the same payload twice as [`FreeError::DoubleFree`].
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
        Ok(())
    }

    /// Resize the allocation behind `ptr` to at least `new_size` bytes.
    ///
    /// `realloc(null, n)` allocates, `realloc(ptr, 0)` frees and returns
    /// `None`, and requests beyond [`MAX_REQUEST_SIZE`] are rejected with
    /// `None`. A shrinking request is served in place by splitting the
    /// block; a growing one moves the payload to a fresh block, since this
    /// variant has no way to reclaim the neighbor. On failure `None` is
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
    /// Walks the segment once and cross-checks the incrementally maintained
    /// counters against what the walk observes.
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
        Ok(())
    }
}

impl fmt::Debug for ImplicitHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "segment {:p}..{:p}, {} bytes in use",
            self.segment.base(),
            self.segment.base().wrapping_add(self.segment.size()),
            self.stats.used_bytes
        )?;
        for block in self.segment.blocks() {
            let header = self.segment.header(block);
            let status = match header.state() {
                State::Used => "used",
                State::Free => "free",
            };
            writeln!(f, "  {:#08x}: {:>8} {}", block.0, header.size(), status)?;
        }
        Ok(())
    }
}
