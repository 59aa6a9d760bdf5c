use std::{mem, ptr::NonNull};

use crate::{
    allocator::{AllocError, Allocator},
    AllocResult,
};

/// Size of the hidden size word stored before every returned pointer.
const SIZE_FIELD: usize = mem::size_of::<usize>();

/// Size of the hidden one-byte alignment offset stored before the size word.
const ALIGN_OFFSET_FIELD: usize = mem::size_of::<u8>();

/// A thin wrapper around the system `malloc`/`free`. On top of the libc
/// calls it supports arbitrary power-of-two alignments and can report the
/// size of a previous allocation, both paid for with a small hidden
/// bookkeeping area in front of every pointer:
///
/// ```text
///               +------------------+
///   malloc() -> | alignment pad    | <- 0..alignment-1 bytes
///               +------------------+
///               | align offset     | <- one byte, the pad size
///               +------------------+
///               | requested size   | <- one word
///               +------------------+
///               | offset           | -> returned by allocate()
///               +------------------+
///               | aligned memory   |
///               +------------------+
/// ```
///
/// `offset` bytes are reserved by the caller inside the requested size so
/// that `pointer + offset` meets the alignment; regions use this for their
/// front bounds sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocAllocator;

impl MallocAllocator {
    pub const fn new() -> Self {
        Self
    }
}

impl Allocator for MallocAllocator {
    fn allocate(&mut self, size: usize, alignment: usize, offset: usize) -> AllocResult {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(offset <= size);

        // The offset is already included in size, only the pad and the
        // hidden fields are extra.
        let new_size = size + (alignment - 1) + SIZE_FIELD + ALIGN_OFFSET_FIELD;

        unsafe {
            let alloc = libc::malloc(new_size).cast::<u8>();
            if alloc.is_null() {
                return Err(AllocError);
            }

            let pre_aligned = alloc.add(ALIGN_OFFSET_FIELD + SIZE_FIELD + offset);
            let align_offset = (alignment - pre_aligned as usize % alignment) % alignment;
            let aligned = pre_aligned.add(align_offset);
            let ret = aligned.sub(offset);

            let size_field = ret.sub(SIZE_FIELD).cast::<usize>();
            size_field.write_unaligned(size);

            let align_offset_field = size_field.cast::<u8>().sub(ALIGN_OFFSET_FIELD);
            *align_offset_field = align_offset as u8;

            Ok(NonNull::new_unchecked(ret))
        }
    }

    unsafe fn release(&mut self, addr: NonNull<u8>) {
        let align_offset_field = addr.as_ptr().sub(SIZE_FIELD + ALIGN_OFFSET_FIELD);
        let align_offset = *align_offset_field as usize;

        libc::free(align_offset_field.sub(align_offset).cast());
    }

    unsafe fn allocation_size(&self, addr: NonNull<u8>) -> usize {
        addr.as_ptr().sub(SIZE_FIELD).cast::<usize>().read_unaligned()
    }
}
