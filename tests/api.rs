//! Public-surface properties of the two allocator variants.
//!
//! Everything here goes through the exported API only; layout-level
//! checks against the segment internals live in the unit tests.

use segalloc::{ExplicitHeap, ImplicitHeap, InitError, ALIGNMENT, MAX_REQUEST_SIZE};

#[repr(align(8))]
struct Memory<const N: usize>([u8; N]);

impl<const N: usize> Memory<N> {
    fn new() -> Self {
        Memory([0; N])
    }
}

mod implicit {
    use super::*;

    #[test]
    fn init_checks_the_segment_size() {
        let mut memory = Memory::<64>::new();
        let base = memory.0.as_mut_ptr();

        assert!(matches!(
            unsafe { ImplicitHeap::init(base, 8) },
            Err(InitError::SegmentTooSmall)
        ));
        // one header plus one minimum payload is the smallest workable segment
        let heap = unsafe { ImplicitHeap::init(base, 16) }.unwrap();
        assert_eq!(heap.segment_size(), 16);
    }

    #[test]
    fn init_checks_the_segment_alignment() {
        let mut memory = Memory::<64>::new();

        assert!(matches!(
            unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 63) },
            Err(InitError::SegmentMisaligned)
        ));
        let skewed = unsafe { memory.0.as_mut_ptr().add(4) };
        assert!(matches!(
            unsafe { ImplicitHeap::init(skewed, 56) },
            Err(InitError::SegmentMisaligned)
        ));
    }

    #[test]
    fn invalid_requests_yield_none() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        assert!(heap.alloc(0).is_none());
        assert!(heap.alloc(MAX_REQUEST_SIZE + 1).is_none());
        assert_eq!(heap.stats().used_blocks, 0);
        heap.validate().unwrap();
    }

    #[test]
    fn pointers_are_aligned_and_in_bounds() {
        let mut memory = Memory::<1024>::new();
        let base = memory.0.as_mut_ptr();
        let mut heap = unsafe { ImplicitHeap::init(base, 1024) }.unwrap();

        for requested in [1, 7, 8, 13, 64, 100] {
            let ptr = heap.alloc(requested).unwrap().as_ptr();
            assert_eq!(ptr as usize % ALIGNMENT, 0);
            assert!(ptr as usize >= base as usize + ALIGNMENT);
            assert!((ptr as usize) < base as usize + 1024);
        }
        heap.validate().unwrap();
    }

    #[test]
    fn live_payloads_do_not_overlap() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let blocks: Vec<_> = (0_u8..4)
            .map(|fill| {
                let ptr = heap.alloc(48).unwrap();
                unsafe { ptr.as_ptr().write_bytes(fill, 48) };
                (ptr, fill)
            })
            .collect();
        for (ptr, fill) in blocks {
            for i in 0..48 {
                assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, fill);
            }
            heap.free(ptr.as_ptr()).unwrap();
        }
        assert_eq!(heap.stats().used_blocks, 0);
        heap.validate().unwrap();
    }

    #[test]
    fn free_of_null_changes_nothing() {
        let mut memory = Memory::<64>::new();
        let mut heap = unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 64) }.unwrap();

        let before = heap.stats();
        heap.free(std::ptr::null_mut()).unwrap();
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn realloc_of_null_behaves_like_alloc() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let ptr = heap.realloc(std::ptr::null_mut(), 100).unwrap();
        assert_eq!(heap.stats().used_blocks, 1);
        assert!(heap.realloc(std::ptr::null_mut(), 0).is_none());
        assert_eq!(heap.stats().used_blocks, 1);
        heap.free(ptr.as_ptr()).unwrap();
    }

    #[test]
    fn realloc_to_zero_behaves_like_free() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let ptr = heap.alloc(100).unwrap();
        assert!(heap.realloc(ptr.as_ptr(), 0).is_none());
        assert_eq!(heap.stats().used_blocks, 0);
        heap.validate().unwrap();
    }

    #[test]
    fn realloc_preserves_contents() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ImplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let ptr = heap.alloc(32).unwrap();
        for i in 0..32 {
            unsafe { ptr.as_ptr().add(i).write(i as u8) };
        }
        let _wall = heap.alloc(16).unwrap();

        let grown = heap.realloc(ptr.as_ptr(), 256).unwrap();
        for i in 0..32 {
            assert_eq!(unsafe { grown.as_ptr().add(i).read() }, i as u8);
        }
        let shrunk = heap.realloc(grown.as_ptr(), 16).unwrap();
        for i in 0..16 {
            assert_eq!(unsafe { shrunk.as_ptr().add(i).read() }, i as u8);
        }
        heap.validate().unwrap();
    }
}

mod explicit {
    use super::*;

    #[test]
    fn init_checks_the_segment_size() {
        let mut memory = Memory::<64>::new();
        let base = memory.0.as_mut_ptr();

        assert!(matches!(
            unsafe { ExplicitHeap::init(base, 16) },
            Err(InitError::SegmentTooSmall)
        ));
        // the free-list links need a two-word minimum payload
        let heap = unsafe { ExplicitHeap::init(base, 24) }.unwrap();
        assert_eq!(heap.segment_size(), 24);
    }

    #[test]
    fn init_checks_the_segment_alignment() {
        let mut memory = Memory::<64>::new();

        assert!(matches!(
            unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 63) },
            Err(InitError::SegmentMisaligned)
        ));
        let skewed = unsafe { memory.0.as_mut_ptr().add(4) };
        assert!(matches!(
            unsafe { ExplicitHeap::init(skewed, 56) },
            Err(InitError::SegmentMisaligned)
        ));
    }

    #[test]
    fn invalid_requests_yield_none() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        assert!(heap.alloc(0).is_none());
        assert!(heap.alloc(MAX_REQUEST_SIZE + 1).is_none());
        assert_eq!(heap.stats().used_blocks, 0);
        heap.validate().unwrap();
    }

    #[test]
    fn pointers_are_aligned_and_in_bounds() {
        let mut memory = Memory::<1024>::new();
        let base = memory.0.as_mut_ptr();
        let mut heap = unsafe { ExplicitHeap::init(base, 1024) }.unwrap();

        for requested in [1, 7, 8, 13, 64, 100] {
            let ptr = heap.alloc(requested).unwrap().as_ptr();
            assert_eq!(ptr as usize % ALIGNMENT, 0);
            assert!(ptr as usize >= base as usize + ALIGNMENT);
            assert!((ptr as usize) < base as usize + 1024);
        }
        heap.validate().unwrap();
    }

    #[test]
    fn live_payloads_do_not_overlap() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let blocks: Vec<_> = (0_u8..4)
            .map(|fill| {
                let ptr = heap.alloc(48).unwrap();
                unsafe { ptr.as_ptr().write_bytes(fill, 48) };
                (ptr, fill)
            })
            .collect();
        for (ptr, fill) in blocks {
            for i in 0..48 {
                assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, fill);
            }
            heap.free(ptr.as_ptr()).unwrap();
        }
        assert_eq!(heap.stats().used_blocks, 0);
        heap.validate().unwrap();
    }

    #[test]
    fn free_of_null_changes_nothing() {
        let mut memory = Memory::<64>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 64) }.unwrap();

        let before = heap.stats();
        heap.free(std::ptr::null_mut()).unwrap();
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn realloc_of_null_behaves_like_alloc() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let ptr = heap.realloc(std::ptr::null_mut(), 100).unwrap();
        assert_eq!(heap.stats().used_blocks, 1);
        heap.free(ptr.as_ptr()).unwrap();
    }

    #[test]
    fn realloc_to_zero_behaves_like_free() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let ptr = heap.alloc(100).unwrap();
        assert!(heap.realloc(ptr.as_ptr(), 0).is_none());
        assert_eq!(heap.stats().used_blocks, 0);
        // the lone freed block merges back into a single free block
        assert_eq!(heap.stats().free_blocks, 1);
        heap.validate().unwrap();
    }

    #[test]
    fn realloc_preserves_contents() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let ptr = heap.alloc(32).unwrap();
        for i in 0..32 {
            unsafe { ptr.as_ptr().add(i).write(i as u8) };
        }
        let _wall = heap.alloc(16).unwrap();

        let grown = heap.realloc(ptr.as_ptr(), 256).unwrap();
        for i in 0..32 {
            assert_eq!(unsafe { grown.as_ptr().add(i).read() }, i as u8);
        }
        let shrunk = heap.realloc(grown.as_ptr(), 16).unwrap();
        for i in 0..16 {
            assert_eq!(unsafe { shrunk.as_ptr().add(i).read() }, i as u8);
        }
        heap.validate().unwrap();
    }

    #[test]
    fn grow_in_place_returns_the_same_address() {
        let mut memory = Memory::<1024>::new();
        let mut heap = unsafe { ExplicitHeap::init(memory.0.as_mut_ptr(), 1024) }.unwrap();

        let p = heap.alloc(16).unwrap();
        let q = heap.alloc(16).unwrap();
        heap.free(q.as_ptr()).unwrap();

        assert_eq!(heap.realloc(p.as_ptr(), 40), Some(p));
        heap.validate().unwrap();
    }
}
