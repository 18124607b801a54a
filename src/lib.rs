//! First-fit heap allocators over a caller-supplied memory segment
//!
//! This crate manages a single fixed-size contiguous byte region — the
//! *segment* — and services variable-sized allocation requests out of it.
//! The segment is supplied by the caller, so the crate works anywhere a
//! stable byte region exists: a `static` array, a memory-mapped region, a
//! block handed down by a bootloader. Nothing is ever requested from an
//! operating system and the crate is `#![no_std]`.
//!
//! Two allocators share one on-segment format and differ in how they find
//! free memory:
//! - [`ImplicitHeap`] walks every block from the segment start. Smallest
//!   overhead, allocation cost grows with the block count, freed neighbors
//!   are never merged.
//! - [`ExplicitHeap`] keeps free blocks on a doubly-linked list threaded
//!   through their own payload bytes, merges freed blocks with free right
//!   neighbors and can grow an allocation in place.
//!
//! # Block format
//! The segment is a sequence of blocks, each a one-word header followed by
//! its payload; the byte after a payload is the next header:
//! ```text
//! ┌────────┬───────────────┬────────┬────────────┬────────┬───────────┐
//! │ used 24│ payload       │ free 16│ prev, next │ used 8 │ payload   │
//! └────────┴───────────────┴────────┴────────────┴────────┴───────────┘
//! ^ header word                      ^ free payloads carry list links
//! ```
//! The header word packs the payload size and an allocation bit; payload
//! sizes and block addresses are always multiples of [`ALIGNMENT`] (one
//! machine word), so the low bits of the size are free to carry the bit.
//!
//! The life of an allocation:
//! 1.  After initialization there is a single free block spanning the whole
//!     segment (minus its header).
//! 2.  `alloc` searches first-fit, splits a trailing free block off the
//!     found one when the excess can host it, and marks the block used.
//! 3.  `free` clears the bit. The explicit variant also pushes the block
//!     onto the free list and absorbs free blocks to its right; merging
//!     to the left would need a segment walk or a footer word, so a
//!     free-free pair left of a just-freed block survives until the left
//!     block is itself touched again.
//! 4.  `realloc` shrinks in place by splitting, returns the block unchanged
//!     when the rounded size already fits, and otherwise grows — in place
//!     when the explicit variant finds enough free space to the right, else
//!     by moving the payload to a fresh block.
//!
//! # Usage
//! Hand a heap its segment and keep the region alive for as long as the
//! heap is in use:
//! ```
//! use segalloc::ExplicitHeap;
//!
//! #[repr(align(8))]
//! struct Memory([u8; 1024]);
//! let mut memory = Memory([0; 1024]);
//!
//! let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();
//! let ptr = heap.alloc(100).unwrap();
//! let ptr = heap.realloc(ptr.as_ptr(), 200).unwrap();
//! heap.free(ptr.as_ptr()).unwrap();
//! assert!(heap.validate().is_ok());
//! ```
//!
//! For use as a global allocator there is [`Allocator`], which owns its
//! segment and wraps an [`ExplicitHeap`] in a spin lock:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segalloc::Allocator<4096> = segalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//!
//! # Diagnostics
//! Both heaps expose their bookkeeping via `stats()`, check all structural
//! invariants via `validate()` and print a block-by-block dump via their
//! `Debug` implementation. None of this is needed in regular operation.
#![no_std]

mod heap;

pub use heap::{
    Corruption, ExplicitHeap, FreeError, HeapStats, ImplicitHeap, InitError, ALIGNMENT,
    HEADER_SIZE, MAX_REQUEST_SIZE,
};

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

/// The backing memory of an [`Allocator`], aligned like a block address.
#[repr(align(8))]
struct Memory<const N: usize>([MaybeUninit<u8>; N]);

/// The lock-protected interior of an [`Allocator`]: the segment and the
/// heap serving from it, set up on first use.
struct Slot<const N: usize> {
    memory: Memory<N>,
    heap: Option<ExplicitHeap>,
}

impl<const N: usize> Slot<N> {
    fn heap(&mut self) -> &mut ExplicitHeap {
        let memory = &mut self.memory;
        self.heap.get_or_insert_with(|| {
            let base = memory.0.as_mut_ptr().cast::<u8>();
            // SAFETY: the slot owns `memory` and the surrounding mutex makes
            // this the only access path to it, so handing the region to the
            // heap for the slot's lifetime is exclusive. The region is
            // aligned via `#[repr(align)]` and non-null as part of a live
            // object.
            match unsafe { ExplicitHeap::init(base, N) } {
                Ok(heap) => heap,
                // `Allocator::new` rejects every `N` this could fail for
                Err(_) => unreachable!(),
            }
        })
    }
}

/// A self-contained, lock-protected allocator for use as the global one.
///
/// This is the convenience surface over [`ExplicitHeap`]: the segment is an
/// owned array of `N` bytes, a [`spin::Mutex`] serializes access and the
/// [`GlobalAlloc`] implementation maps the `Layout`-based interface onto the
/// heap. The heap itself stays single-threaded; the lock is the only
/// concurrency measure.
///
/// Since the handed-out pointers point into the owned array, a value of
/// this type must not move once the first allocation was served. Place it
/// in a `static`:
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segalloc::Allocator<4096> = segalloc::Allocator::new();
/// ```
///
/// Layouts with an alignment above [`ALIGNMENT`] are not supported and
/// reported as allocation failure.
pub struct Allocator<const N: usize> {
    inner: spin::Mutex<Slot<N>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, so it can initialize a `static`
    /// directly.
    ///
    /// # Panics
    /// This function panics if `N` is not a multiple of the word size or
    /// too small to hold even one block of the explicit variant.
    #[must_use = "assign the allocator to a `static` and register it with `#[global_allocator]`"]
    pub const fn new() -> Self {
        assert!(
            N >= HEADER_SIZE + 2 * ALIGNMENT,
            "too small heap memory: minimum size is one header plus two words"
        );
        assert!(
            N % ALIGNMENT == 0,
            "memory size has to be a multiple of the word size"
        );
        Self {
            inner: spin::Mutex::new(Slot {
                memory: Memory([MaybeUninit::uninit(); N]),
                heap: None,
            }),
        }
    }

    /// A snapshot of the underlying heap's bookkeeping.
    pub fn stats(&self) -> HeapStats {
        self.inner.lock().heap().stats()
    }
}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.inner
            .lock()
            .heap()
            .alloc(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // an allocator must not unwind, so a bogus pointer is dropped here
        let _ = self.inner.lock().heap().free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.inner
            .lock()
            .heap()
            .realloc(ptr, new_size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
