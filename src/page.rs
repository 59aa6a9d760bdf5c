use std::{mem, ptr::NonNull};

use crate::{
    allocator::{AllocError, Allocator},
    platform, AllocResult, Pointer,
};

const SEGMENT_HEADER_SIZE: usize = mem::size_of::<PageSegment>();

/// Size of the hidden word before every returned pointer that records the
/// distance back to the owning mapping.
const BACK_FIELD: usize = mem::size_of::<usize>();

/// Header stored at the start of each mapping.
///
/// ```text
///                     +------------------+
///   page mapping ->   | PageSegment      |
///                     +------------------+
///                     | alignment pad    | <- 0..alignment-1 bytes
///                     +------------------+
///                     | back distance    | <- one word, bytes back to the
///                     +------------------+    mapping start
///                     | offset           | -> returned by allocate()
///                     +------------------+
///                     | aligned memory   |
///                     +------------------+
/// ```
///
/// The header sits at the mapping start, which is page aligned, so its
/// fields are always naturally aligned no matter what alignment the caller
/// asked for. The back distance word can land on any byte boundary and is
/// accessed unaligned.
struct PageSegment {
    next: Pointer<PageSegment>,
    prev: Pointer<PageSegment>,
    /// Usable bytes, exactly as requested at allocation time.
    size: usize,
    /// Full mapped length, the value to unmap with.
    mapped: usize,
}

/// Page-granularity allocator: every allocation gets its own mapping
/// rounded up to a multiple of the system page size and is returned to
/// the OS whole on release. Mappings are tracked in a doubly-linked list
/// so the allocator can release stragglers when dropped.
///
/// Wasteful for small allocations by design; useful for big long-lived
/// buffers and as the simplest allocator that honors the full
/// [`Allocator`] contract, per-call alignment and offset included.
#[derive(Default)]
pub struct PageAllocator {
    segments: Pointer<PageSegment>,
}

impl PageAllocator {
    pub const fn new() -> Self {
        Self { segments: None }
    }

    unsafe fn link_segment(&mut self, mut segment: NonNull<PageSegment>) {
        segment.as_mut().prev = None;
        segment.as_mut().next = self.segments;
        if let Some(mut head) = self.segments {
            head.as_mut().prev = Some(segment);
        }
        self.segments = Some(segment);
    }

    unsafe fn unlink_segment(&mut self, segment: NonNull<PageSegment>) {
        if self.segments == Some(segment) {
            self.segments = segment.as_ref().next;
        }
        if let Some(mut prev) = segment.as_ref().prev {
            prev.as_mut().next = segment.as_ref().next;
        }
        if let Some(mut next) = segment.as_ref().next {
            next.as_mut().prev = segment.as_ref().prev;
        }
    }

    unsafe fn release_segment(segment: NonNull<PageSegment>) {
        platform::return_memory(segment.cast(), segment.as_ref().mapped);
    }

    unsafe fn segment_of(addr: NonNull<u8>) -> NonNull<PageSegment> {
        let distance = addr.as_ptr().sub(BACK_FIELD).cast::<usize>().read_unaligned();
        NonNull::new_unchecked(addr.as_ptr().sub(distance).cast())
    }
}

impl Allocator for PageAllocator {
    fn allocate(&mut self, size: usize, alignment: usize, offset: usize) -> AllocResult {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(offset <= size);

        // The offset is already accounted for inside size.
        let alloc_size = size + (alignment - 1) + SEGMENT_HEADER_SIZE + BACK_FIELD;
        let mapped = platform::page_align(alloc_size);

        unsafe {
            let Some(mapping) = platform::request_memory(mapped) else {
                return Err(AllocError);
            };

            let segment = mapping.cast::<PageSegment>();
            segment.as_ptr().write(PageSegment {
                next: None,
                prev: None,
                size,
                mapped,
            });
            self.link_segment(segment);

            let pre_aligned = mapping
                .as_ptr()
                .add(SEGMENT_HEADER_SIZE + BACK_FIELD + offset);
            let align_offset = (alignment - pre_aligned as usize % alignment) % alignment;
            let ret = mapping
                .as_ptr()
                .add(SEGMENT_HEADER_SIZE + BACK_FIELD + align_offset);

            let distance = ret as usize - mapping.as_ptr() as usize;
            ret.sub(BACK_FIELD).cast::<usize>().write_unaligned(distance);

            debug_assert_eq!((ret as usize + offset) % alignment, 0);

            Ok(NonNull::new_unchecked(ret))
        }
    }

    unsafe fn release(&mut self, addr: NonNull<u8>) {
        let segment = Self::segment_of(addr);
        self.unlink_segment(segment);
        Self::release_segment(segment);
    }

    unsafe fn allocation_size(&self, addr: NonNull<u8>) -> usize {
        Self::segment_of(addr).as_ref().size
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        unsafe {
            let mut iter = self.segments;
            while let Some(segment) = iter {
                iter = segment.as_ref().next;
                Self::release_segment(segment);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    #[test]
    fn zero_size_alloc() {
        let mut alloc = PageAllocator::new();
        unsafe {
            let x = alloc.allocate(0, 4, 0).unwrap();
            alloc.release(x);
        }
    }

    #[test]
    fn allocation_size_is_the_requested_size() {
        let mut alloc = PageAllocator::new();
        unsafe {
            for size in [12, 13, 106, 5000] {
                let x = alloc.allocate(size, 1, 0).unwrap();
                assert_eq!(alloc.allocation_size(x), size);
                alloc.release(x);
            }
        }
    }

    #[test]
    fn stress() {
        let mut alloc = PageAllocator::new();
        let mut rng = StdRng::seed_from_u64(121);
        let mut allocs = Vec::new();

        unsafe {
            for _ in 0..1_000 {
                if allocs.is_empty() || rng.gen_bool(0.2) {
                    let num_bytes = rng.gen_range(0..8 * 1024);
                    allocs.push(alloc.allocate(num_bytes, 4, 0).unwrap());
                } else {
                    let index = rng.gen_range(0..allocs.len());
                    alloc.release(allocs.swap_remove(index));
                }
            }

            for ptr in allocs {
                alloc.release(ptr);
            }
        }
    }

    #[test]
    fn alignment_and_offset() {
        let mut alloc = PageAllocator::new();
        let mut rng = StdRng::seed_from_u64(1001);
        let alignments = [1, 2, 4, 8, 16];
        let mut allocs = Vec::new();

        unsafe {
            for _ in 0..10_000 {
                if allocs.is_empty() || rng.gen_bool(0.7) {
                    let align = alignments[rng.gen_range(0..alignments.len())];
                    let offset = rng.gen_range(0..16);
                    let num_bytes = offset + rng.gen_range(0..8 * 1024);

                    let x = alloc.allocate(num_bytes, align, offset).unwrap();
                    assert_eq!((x.as_ptr() as usize + offset) % align, 0);
                    allocs.push(x);
                } else {
                    let index = rng.gen_range(0..allocs.len());
                    alloc.release(allocs.swap_remove(index));
                }
            }

            for ptr in allocs {
                alloc.release(ptr);
            }
        }
    }

    #[test]
    fn dropping_the_allocator_releases_stragglers() {
        // Mostly useful under Miri, which reports leaked mappings.
        let mut alloc = PageAllocator::new();
        let _a = alloc.allocate(128, 8, 0).unwrap();
        let _b = alloc.allocate(4096, 8, 0).unwrap();
        drop(alloc);
    }
}
