use std::{mem, ptr::NonNull};

use crate::Pointer;

/// Size of the block header in bytes. The header is a single packed word,
/// the link pointers of free blocks live inside the payload.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Size of the mirrored footer word in bytes.
pub(crate) const BLOCK_FOOTER_SIZE: usize = mem::size_of::<BlockFooter>();

/// Per-block bookkeeping cost: one header word plus one footer word.
pub(crate) const BLOCK_OVERHEAD: usize = BLOCK_HEADER_SIZE + BLOCK_FOOTER_SIZE;

/// Minimum payload size in bytes. Free blocks store their small-bin links
/// inside the payload, so every payload must fit a [`FreeLinks`].
pub(crate) const MIN_ALLOCATION_SIZE: usize = mem::size_of::<FreeLinks>();

const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);
const FENCEPOST_BIT: usize = 1 << (usize::BITS - 2);
const EXTERNAL_BIT: usize = 1 << (usize::BITS - 3);
const FLAGS_MASK: usize = ALLOCATED_BIT | FENCEPOST_BIT | EXTERNAL_BIT;
const SIZE_MASK: usize = !FLAGS_MASK;

/// Largest representable block payload. The top three bits of the header
/// word are flags, everything below is size.
pub(crate) const MAX_ALLOCATION_SIZE: usize = SIZE_MASK;

/// Packed block header. A block looks like this in memory:
///
/// ```text
/// +--------------------------+
/// | size | alloc|fence|ext   | <- BlockHeader, one word, top 3 bits flags.
/// +--------------------------+
/// |         payload          | <- User data while allocated, link words
/// |           ...            |    while free. At least MIN_ALLOCATION_SIZE.
/// +--------------------------+
/// | size                     | <- BlockFooter mirrors the size.
/// +--------------------------+
/// ```
///
/// The footer lets us walk backwards to the previous block in the segment,
/// and a header whose size disagrees with its footer marks the block as
/// corrupt. While a block is free its payload doubles as a [`FreeLinks`]
/// (small blocks) or a [`crate::tree::TreeLinks`] (tree blocks); both fit
/// because tree blocks are always larger than five words.
#[repr(transparent)]
pub(crate) struct BlockHeader {
    head: usize,
}

/// Mirror of the block size at the end of the payload.
#[repr(transparent)]
pub(crate) struct BlockFooter {
    foot: usize,
}

/// Circular doubly-linked list links threaded through the payload of free
/// small-bin blocks. The first field overlaps `next` of
/// [`crate::tree::TreeLinks`] so the minimum payload covers both shapes.
#[repr(C)]
pub(crate) struct FreeLinks {
    pub next: Pointer<BlockHeader>,
    pub prev: Pointer<BlockHeader>,
}

/// All accessors are associated functions taking a [`NonNull`] instead of
/// methods on `&self`/`&mut self`. Creating references into blocks would
/// alias the user's live pointers into the same memory, which Miri's
/// stacked borrows model rejects; raw pointer reads and writes don't.
impl BlockHeader {
    /// Returns the block header owning the given payload address.
    ///
    /// # Safety
    ///
    /// `address` must point exactly to the first byte after a valid block
    /// header, i.e. be an address previously handed out by the allocator.
    #[inline]
    pub unsafe fn from_data_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Address of the first payload byte of `block`.
    #[inline]
    pub unsafe fn data_address_of(block: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().offset(1)).cast()
    }

    /// Address of the footer word of `block`. Valid only after the size has
    /// been written to the header.
    #[inline]
    pub unsafe fn footer_of(block: NonNull<Self>) -> NonNull<BlockFooter> {
        let addr = block
            .as_ptr()
            .cast::<u8>()
            .add(BLOCK_HEADER_SIZE + Self::size_of(block));
        NonNull::new_unchecked(addr.cast())
    }

    /// View of the small-bin links stored in the payload. Only meaningful
    /// while the block is free.
    #[inline]
    pub unsafe fn links_of(block: NonNull<Self>) -> NonNull<FreeLinks> {
        Self::data_address_of(block).cast()
    }

    #[inline]
    pub unsafe fn size_of(block: NonNull<Self>) -> usize {
        (*block.as_ptr()).head & SIZE_MASK
    }

    #[inline]
    pub unsafe fn set_size(block: NonNull<Self>, size: usize) {
        debug_assert!(size <= MAX_ALLOCATION_SIZE);
        let head = &mut (*block.as_ptr()).head;
        *head = (*head & FLAGS_MASK) | size;
    }

    #[inline]
    pub unsafe fn is_allocated(block: NonNull<Self>) -> bool {
        (*block.as_ptr()).head & ALLOCATED_BIT != 0
    }

    #[inline]
    pub unsafe fn set_allocated(block: NonNull<Self>, allocated: bool) {
        let head = &mut (*block.as_ptr()).head;
        *head = (*head & !ALLOCATED_BIT) | (ALLOCATED_BIT * allocated as usize);
    }

    #[inline]
    pub unsafe fn is_fencepost(block: NonNull<Self>) -> bool {
        (*block.as_ptr()).head & FENCEPOST_BIT != 0
    }

    #[inline]
    pub unsafe fn set_fencepost(block: NonNull<Self>, fencepost: bool) {
        let head = &mut (*block.as_ptr()).head;
        *head = (*head & !FENCEPOST_BIT) | (FENCEPOST_BIT * fencepost as usize);
    }

    #[inline]
    pub unsafe fn is_external(block: NonNull<Self>) -> bool {
        (*block.as_ptr()).head & EXTERNAL_BIT != 0
    }

    #[inline]
    pub unsafe fn set_external(block: NonNull<Self>, external: bool) {
        let head = &mut (*block.as_ptr()).head;
        *head = (*head & !EXTERNAL_BIT) | (EXTERNAL_BIT * external as usize);
    }

    /// Copies the header size into the footer word. Must be called after
    /// every size change, the audit walk treats a disagreeing pair as
    /// corruption.
    #[inline]
    pub unsafe fn reconcile_footer(block: NonNull<Self>) {
        let size = Self::size_of(block);
        (*Self::footer_of(block).as_ptr()).foot = size;
    }

    /// Header and footer agree on the block size.
    #[inline]
    pub unsafe fn matches_footer(block: NonNull<Self>) -> bool {
        Self::size_of(block) == BlockFooter::size_of(Self::footer_of(block))
    }

    /// Writes a fresh free block of the given payload size: size, cleared
    /// allocated bit, external bit, reconciled footer and empty links. The
    /// fencepost bit is left untouched so segment initialization can mark
    /// the first block before initializing it.
    pub unsafe fn init(block: NonNull<Self>, size: usize, external: bool) {
        Self::set_size(block, size);
        Self::set_allocated(block, false);
        Self::set_external(block, external);
        Self::reconcile_footer(block);
        let links = Self::links_of(block).as_ptr();
        (*links).next = None;
        (*links).prev = None;
    }

    /// Next contiguous block in the same segment, or `None` if the block
    /// right after is the segment's closing fencepost.
    pub unsafe fn next_of(block: NonNull<Self>) -> Pointer<Self> {
        let next = block
            .as_ptr()
            .cast::<u8>()
            .add(BLOCK_HEADER_SIZE + Self::size_of(block) + BLOCK_FOOTER_SIZE)
            .cast::<Self>();
        let next = NonNull::new_unchecked(next);

        if Self::is_fencepost(next) {
            None
        } else {
            Some(next)
        }
    }

    /// Previous contiguous block, found by reading the footer word right
    /// before this header. Returns `None` for fencepost blocks, which by
    /// definition have nothing before them in their segment.
    pub unsafe fn prev_of(block: NonNull<Self>) -> Pointer<Self> {
        if Self::is_fencepost(block) {
            return None;
        }

        let footer = block
            .as_ptr()
            .cast::<u8>()
            .sub(BLOCK_FOOTER_SIZE)
            .cast::<BlockFooter>();
        let footer = NonNull::new_unchecked(footer);

        let prev = footer
            .as_ptr()
            .cast::<u8>()
            .sub(BlockFooter::size_of(footer) + BLOCK_HEADER_SIZE)
            .cast::<Self>();

        Some(NonNull::new_unchecked(prev))
    }
}

impl BlockFooter {
    #[inline]
    pub unsafe fn size_of(footer: NonNull<Self>) -> usize {
        (*footer.as_ptr()).foot & SIZE_MASK
    }

    /// Raw write used for the hidden segment alignment footer, which stores
    /// an offset rather than a block size.
    #[inline]
    pub unsafe fn write(footer: NonNull<Self>, value: usize) {
        (*footer.as_ptr()).foot = value;
    }

    #[inline]
    pub unsafe fn read(footer: NonNull<Self>) -> usize {
        (*footer.as_ptr()).foot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_one_word() {
        let word = mem::size_of::<usize>();
        assert_eq!(BLOCK_HEADER_SIZE, word);
        assert_eq!(BLOCK_FOOTER_SIZE, word);
        assert_eq!(MIN_ALLOCATION_SIZE, 2 * word);
    }

    #[test]
    fn flag_packing() {
        // A block with a 40 byte payload laid out in a local buffer.
        let mut buffer = [0usize; 8];
        unsafe {
            let block = NonNull::new_unchecked(buffer.as_mut_ptr().cast::<BlockHeader>());

            BlockHeader::init(block, 40, false);
            assert_eq!(BlockHeader::size_of(block), 40);
            assert!(!BlockHeader::is_allocated(block));
            assert!(!BlockHeader::is_fencepost(block));
            assert!(!BlockHeader::is_external(block));
            assert!(BlockHeader::matches_footer(block));

            BlockHeader::set_allocated(block, true);
            BlockHeader::set_fencepost(block, true);
            BlockHeader::set_external(block, true);
            assert_eq!(BlockHeader::size_of(block), 40);
            assert!(BlockHeader::is_allocated(block));
            assert!(BlockHeader::is_fencepost(block));
            assert!(BlockHeader::is_external(block));

            // Flags survive a size update and vice versa.
            BlockHeader::set_size(block, 16);
            assert!(BlockHeader::is_allocated(block));
            assert_eq!(BlockHeader::size_of(block), 16);

            BlockHeader::set_allocated(block, false);
            BlockHeader::set_fencepost(block, false);
            BlockHeader::set_external(block, false);
            assert_eq!(BlockHeader::size_of(block), 16);
        }
    }

    #[test]
    fn corruption_is_detectable() {
        let mut buffer = [0usize; 8];
        unsafe {
            let block = NonNull::new_unchecked(buffer.as_mut_ptr().cast::<BlockHeader>());
            BlockHeader::init(block, 48, false);
            assert!(BlockHeader::matches_footer(block));

            // Stomp the footer the way a buffer overrun would.
            let footer = BlockHeader::footer_of(block);
            BlockFooter::write(footer, 3);
            assert!(!BlockHeader::matches_footer(block));
        }
    }

    #[test]
    fn neighbour_navigation() {
        // Two 16 byte blocks back to back, then a fencepost.
        let mut buffer = [0usize; 16];
        unsafe {
            let first = NonNull::new_unchecked(buffer.as_mut_ptr().cast::<BlockHeader>());
            BlockHeader::init(first, 16, false);

            let second = NonNull::new_unchecked(buffer.as_mut_ptr().add(4).cast::<BlockHeader>());
            BlockHeader::init(second, 16, false);

            let fence = NonNull::new_unchecked(buffer.as_mut_ptr().add(8).cast::<BlockHeader>());
            BlockHeader::init(fence, 16, false);
            BlockHeader::set_fencepost(fence, true);

            assert_eq!(BlockHeader::next_of(first), Some(second));
            assert_eq!(BlockHeader::next_of(second), None);
            assert_eq!(BlockHeader::prev_of(second), Some(first));

            BlockHeader::set_fencepost(first, true);
            assert_eq!(BlockHeader::prev_of(first), None);
        }
    }
}
