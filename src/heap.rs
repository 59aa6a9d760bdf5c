use std::ptr::NonNull;

use crate::{
    allocator::{AllocError, Allocator},
    bins::{self, NUM_BINS, NUM_SMALL_BINS},
    bits,
    block::{
        BlockFooter, BlockHeader, BLOCK_FOOTER_SIZE, BLOCK_HEADER_SIZE, BLOCK_OVERHEAD,
        MAX_ALLOCATION_SIZE, MIN_ALLOCATION_SIZE,
    },
    platform,
    segment::{Segment, SEGMENT_HEADER_SIZE},
    AllocResult, Pointer,
};

/// Initial segment size of [`HeapAllocator::new`].
pub const DEFAULT_INITIAL_SEGMENT_SIZE: usize = 64 * 1024;

/// Alignment of [`HeapAllocator::new`].
pub const DEFAULT_HEAP_ALIGNMENT: usize = 4;

/// Byte and block counts gathered by walking every segment. See
/// [`HeapAllocator::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    /// Headers, footers, fenceposts and segment bookkeeping.
    pub overhead_bytes: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub regular_segments: usize,
    pub external_segments: usize,
}

/// Snapshot of a single block, produced by [`HeapAllocator::blocks`] and
/// [`HeapAllocator::corrupt_blocks`].
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// Address of the block header.
    pub addr: NonNull<u8>,
    /// Address of the block payload.
    pub data: NonNull<u8>,
    /// Address of the owning segment.
    pub segment: NonNull<u8>,
    pub size: usize,
    pub bin: usize,
    pub is_allocated: bool,
}

/// General purpose allocator in the dlmalloc family, designed to serve
/// requests of any size from memory obtained directly from the OS.
///
/// Free blocks are kept in 64 bins: 32 exact-fit small bins (stride 8, up
/// to 255 bytes) and 32 tree bins holding bitwise digital tries, with a
/// 64-bit bin map for constant-time non-empty-bin lookup. One distinguished
/// free block, the reserve, sits outside the bins and is the preferred
/// splitting source for medium requests, so common allocation patterns
/// never touch the trees at all. Memory comes from mmap'ed segments that
/// grow geometrically; oversized requests get their own external segment
/// which is unmapped as a whole on release.
///
/// The allocation cascade:
///
/// ```text
///              small request              medium request        large request
///             (<= 255 bytes)             (<= 32 MiB)            (> 32 MiB)
///                   |                         |                      |
///          +--------v--------+       +--------v--------+             |
///          |   small bins    |       |    tree bins    |             |
///          +--------+--------+       +--------+--------+             |
///                   |                         |                      |
///          +--------v--------+       +--------v--------+             |
///          |     reserve     |       |     reserve     |             |
///          +--------+--------+       +--------+--------+             |
///                   |                         |                      |
///          +--------v--------+       +--------v--------+    +--------v--------+
///          |    tree bins    |       |   new segment   |    | external segment|
///          +--------+--------+       +-----------------+    +-----------------+
///                   |
///          +--------v--------+
///          |   new segment   |
///          +-----------------+
/// ```
///
/// One instance is strictly single threaded and every operation takes
/// `&mut self`; wrap it in a [`crate::region::Region`] with a threading
/// policy (or a [`crate::region::SharedRegion`]) to share it.
pub struct HeapAllocator {
    /// Bin heads. Small bins point at circular lists, tree bins at trie
    /// roots; both live inside the payload of the free blocks themselves.
    pub(crate) bins: [Pointer<BlockHeader>; NUM_BINS],
    /// Bit `i` is set iff `bins[i]` is non-empty.
    pub(crate) bin_map: u64,
    /// Designated victim block, kept out of the bins.
    reserve: Pointer<BlockHeader>,
    /// Singly-linked list of every mapped segment, external ones included.
    head_segment: Pointer<Segment>,
    /// Size for the next system allocation, doubles on every use.
    new_segment_size: usize,
    alignment: usize,
    system_allocation: bool,
    block_merging: bool,
    segment_merging: bool,
}

impl HeapAllocator {
    /// Default configuration: 64 KiB initial segment, 4 byte alignment.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_INITIAL_SEGMENT_SIZE, DEFAULT_HEAP_ALIGNMENT)
    }

    /// Builds an allocator with the given initial segment size and
    /// alignment. The initial segment is mapped eagerly so the allocator
    /// is ready to serve without a system call on first allocation.
    pub fn with_config(initial_alloc_size: usize, alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        log::debug!("initializing heap allocator: {initial_alloc_size} bytes, alignment {alignment}");

        let mut allocator = Self {
            bins: [None; NUM_BINS],
            bin_map: 0,
            reserve: None,
            head_segment: None,
            new_segment_size: initial_alloc_size,
            alignment,
            system_allocation: true,
            block_merging: true,
            segment_merging: true,
        };

        unsafe {
            match allocator.alloc_new_segment(initial_alloc_size, false) {
                Ok(block) => {
                    allocator.link_block(block);
                }
                // Start empty, the first allocation will retry through the
                // system path.
                Err(_) => debug_assert!(false, "failed to map initial segment"),
            }
        }

        allocator
    }

    /// Whether exhausted bins may fall back to mapping new segments.
    /// Enabled by default.
    pub fn enable_system_allocation(&mut self, enable: bool) {
        self.system_allocation = enable;
    }

    /// Whether freed non-small blocks coalesce with free neighbours.
    /// Enabled by default.
    pub fn enable_block_merging(&mut self, enable: bool) {
        self.block_merging = enable;
    }

    /// Whether new segments fuse with physically adjacent ones. Enabled by
    /// default. Adjacency depends on where the OS happens to map pages, so
    /// tests asserting exact segment counts turn this off.
    pub fn enable_segment_merging(&mut self, enable: bool) {
        self.segment_merging = enable;
    }

    /// Allocates `num_bytes` bytes. The returned pointer is aligned to the
    /// configured alignment. Zero-sized requests return a real
    /// minimum-sized block.
    pub fn allocate(&mut self, num_bytes: usize) -> AllocResult {
        // The minimum covers the link words free blocks store in their
        // payload, and makes zero-byte allocations distinct and releasable.
        let alloc_size = num_bytes.max(MIN_ALLOCATION_SIZE);

        unsafe {
            let mem = if bins::is_small(alloc_size) {
                self.alloc_from_small_bin(alloc_size)
                    .or_else(|| self.alloc_from_reserve(alloc_size))
                    .or_else(|| self.alloc_from_tree_bin(alloc_size))
            } else if !bins::is_large(alloc_size) {
                self.alloc_from_tree_bin(alloc_size)
                    .or_else(|| self.alloc_from_reserve(alloc_size))
            } else {
                // Oversized requests skip the bins, they get their own
                // segment below.
                None
            };

            let mem = match mem {
                Some(mem) => Some(mem),
                None if self.system_allocation => self.alloc_from_system(alloc_size),
                None => None,
            };

            match mem {
                Some(mem) => {
                    debug_assert_eq!(
                        mem.as_ptr() as usize % self.alignment,
                        0,
                        "alignment incorrect"
                    );
                    Ok(mem)
                }
                None => Err(AllocError),
            }
        }
    }

    /// Releases a previously allocated pointer. Non-small blocks coalesce
    /// with free neighbours; a block backed by an external segment returns
    /// its whole segment to the OS.
    ///
    /// # Safety
    ///
    /// `addr` must have been returned by [`Self::allocate`] on this same
    /// instance and must not have been released already.
    pub unsafe fn release(&mut self, addr: NonNull<u8>) {
        let block = BlockHeader::from_data_address(addr);

        debug_assert!(
            self.block_belongs_to_allocator(block),
            "address doesn't belong to this allocator"
        );
        debug_assert!(BlockHeader::is_allocated(block), "double release");

        BlockHeader::set_allocated(block, false);

        if BlockHeader::is_external(block) {
            let segment = Segment::from_block(block);
            self.release_external_segment(segment);
        } else {
            self.link_block(block);
        }
    }

    /// Resets every non-external segment to a single spanning free block
    /// with fresh fenceposts and releases every external segment. All bins
    /// and the reserve are rebuilt from the reset segments.
    pub fn clear(&mut self) {
        unsafe {
            self.bins = [None; NUM_BINS];
            self.bin_map = 0;
            self.reserve = None;

            let mut iter = self.head_segment;
            while let Some(segment) = iter {
                iter = Segment::next_of(segment);

                if Segment::is_external(segment) {
                    self.release_external_segment(segment);
                    continue;
                }

                let offset = Segment::offset_of(segment);
                let block = Segment::first_block(segment);
                let size =
                    Segment::size_of(segment) - BLOCK_OVERHEAD - offset - BLOCK_FOOTER_SIZE;

                BlockHeader::init(block, size, false);
                BlockHeader::set_fencepost(block, true);

                let right_fence = self.split_block(block, MIN_ALLOCATION_SIZE);
                debug_assert!(right_fence != block);
                BlockHeader::set_allocated(right_fence, false);
                BlockHeader::set_fencepost(right_fence, true);

                self.link_block(block);
            }
        }
    }

    /// Verifies the header/footer mirror of every block in every segment.
    /// Returns `false` if any block is corrupt. This walks the entire
    /// heap, don't call it in a time-critical section.
    pub fn check(&self) -> bool {
        let mut valid = true;
        unsafe {
            self.for_each_block(|_, block| {
                valid &= BlockHeader::matches_footer(block);
            });
        }
        valid
    }

    /// Like [`Self::check`] but collects a snapshot of every corrupt block.
    pub fn corrupt_blocks(&self) -> Vec<BlockInfo> {
        let mut corrupt = Vec::new();
        unsafe {
            self.for_each_block(|segment, block| {
                if !BlockHeader::matches_footer(block) {
                    corrupt.push(Self::block_info(segment, block));
                }
            });
        }
        corrupt
    }

    /// Walks all segments and blocks accumulating byte and block counts.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();

        unsafe {
            let mut iter = self.head_segment;
            while let Some(segment) = iter {
                if Segment::is_external(segment) {
                    stats.external_segments += 1;
                } else {
                    stats.regular_segments += 1;
                }
                stats.overhead_bytes += Segment::overhead_of(segment);

                let mut block = Some(Segment::first_block(segment));
                while let Some(b) = block {
                    let size = BlockHeader::size_of(b);
                    if BlockHeader::is_allocated(b) {
                        stats.allocated_bytes += size;
                        stats.allocated_blocks += 1;
                    } else {
                        stats.free_bytes += size;
                        stats.free_blocks += 1;
                    }
                    stats.overhead_bytes += BLOCK_OVERHEAD;
                    block = BlockHeader::next_of(b);
                }

                iter = Segment::next_of(segment);
            }
        }

        stats
    }

    /// Enumerates every block in every segment.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        unsafe {
            self.for_each_block(|segment, block| {
                blocks.push(Self::block_info(segment, block));
            });
        }
        blocks
    }

    unsafe fn block_info(segment: NonNull<Segment>, block: NonNull<BlockHeader>) -> BlockInfo {
        let size = BlockHeader::size_of(block);
        BlockInfo {
            addr: block.cast(),
            data: BlockHeader::data_address_of(block),
            segment: segment.cast(),
            size,
            bin: bins::bin_index(size),
            is_allocated: BlockHeader::is_allocated(block),
        }
    }

    /// Visits every block of every segment in address order within each
    /// segment. The closing fenceposts are not visited, [`BlockHeader::next_of`]
    /// stops at them.
    unsafe fn for_each_block(&self, mut f: impl FnMut(NonNull<Segment>, NonNull<BlockHeader>)) {
        let mut iter = self.head_segment;
        while let Some(segment) = iter {
            let mut block = Some(Segment::first_block(segment));
            while let Some(b) = block {
                f(segment, b);
                block = BlockHeader::next_of(b);
            }
            iter = Segment::next_of(segment);
        }
    }

    unsafe fn alloc_from_small_bin(&mut self, num_bytes: usize) -> Pointer<u8> {
        let first_bin = bins::bin_index(num_bytes);
        debug_assert!(first_bin < NUM_SMALL_BINS);

        // Mask the map down to small bins that hold blocks of at least the
        // requested size.
        let bin_map =
            self.bin_map & !((1u64 << first_bin) - 1) & ((1u64 << NUM_SMALL_BINS) - 1);

        let bin_index = bits::find_first_set(bin_map);
        if bin_index == 0 {
            return None;
        }
        let bin_index = bin_index - 1;

        debug_assert!(bin_index < NUM_SMALL_BINS);
        let block = self.bins[bin_index]?;
        debug_assert!(!BlockHeader::is_allocated(block));

        self.unlink_small_bin_block(block, bin_index);

        // A block at least twice the request is worth splitting even in
        // the exact-fit class.
        let block_size = BlockHeader::size_of(block);
        let block = if block_size >= 2 * num_bytes {
            let split = self.split_block(block, num_bytes);
            // Mark before relinking the remainder or coalescing would
            // absorb the split right back.
            BlockHeader::set_allocated(split, true);
            if split != block {
                self.link_block(block);
            }
            split
        } else {
            block
        };

        BlockHeader::set_allocated(block, true);
        Some(BlockHeader::data_address_of(block))
    }

    unsafe fn alloc_from_tree_bin(&mut self, num_bytes: usize) -> Pointer<u8> {
        // Only tree bins are searched here; small requests that fall
        // through their bins start at the first tree bin.
        let first_bin = bins::bin_index(num_bytes).max(NUM_SMALL_BINS);

        let mut bin_map = self.bin_map & !((1u64 << first_bin) - 1);

        let (block, bin_index) = loop {
            let bin_index = bits::find_first_set(bin_map);
            if bin_index == 0 {
                return None;
            }
            let bin_index = bin_index - 1;
            bin_map = bits::reset_bit(bin_map, bin_index);

            if let Some(block) = self.find_tree_block(bin_index, num_bytes) {
                break (block, bin_index);
            }
        };

        let block_size = BlockHeader::size_of(block);
        self.unlink_tree_block(block, bin_index);
        debug_assert!(!BlockHeader::is_allocated(block));

        let block = if block_size > num_bytes + BLOCK_OVERHEAD {
            let split = self.split_block(block, num_bytes);
            BlockHeader::set_allocated(split, true);
            if split != block {
                self.link_block(block);
            }
            split
        } else {
            block
        };

        BlockHeader::set_allocated(block, true);
        Some(BlockHeader::data_address_of(block))
    }

    unsafe fn alloc_from_reserve(&mut self, num_bytes: usize) -> Pointer<u8> {
        let reserve = self.reserve?;
        if BlockHeader::size_of(reserve) < num_bytes + BLOCK_OVERHEAD {
            return None;
        }

        let block = self.split_reserve_block(num_bytes);
        BlockHeader::set_allocated(block, true);
        Some(BlockHeader::data_address_of(block))
    }

    unsafe fn alloc_from_system(&mut self, num_bytes: usize) -> Pointer<u8> {
        debug_assert!(self.system_allocation);
        let is_external = bins::is_large(num_bytes);

        // Segment sizes double on every trip to the system so the segment
        // count stays logarithmic in the total footprint.
        let new_segment_size = (num_bytes + BLOCK_OVERHEAD)
            .max(self.new_segment_size)
            .min(MAX_ALLOCATION_SIZE - BLOCK_OVERHEAD);
        self.new_segment_size = self.new_segment_size.saturating_mul(2);

        let block = self.alloc_new_segment(new_segment_size, is_external).ok()?;

        let block = if !is_external && BlockHeader::size_of(block) > num_bytes + BLOCK_OVERHEAD {
            let split = self.split_block(block, num_bytes);
            if split != block {
                BlockHeader::set_allocated(split, true);
                self.link_block(block);
            }
            split
        } else {
            block
        };

        BlockHeader::set_allocated(block, true);
        Some(BlockHeader::data_address_of(block))
    }

    /// Files a free block: coalesces it with its neighbours (unless small),
    /// then installs it as the reserve if it beats the current one, or
    /// routes it to its bin. Returns the block that ended up linked, which
    /// differs from the input when coalescing merged backwards.
    unsafe fn link_block(&mut self, block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let mut block = block;
        let mut block_size = BlockHeader::size_of(block);

        // Small blocks go straight back to their exact-fit bin, merging
        // them would only churn the lists.
        let is_small = bins::is_small(block_size);
        if self.block_merging && !is_small {
            block = self.coalesce_adjacent_blocks(block);
            block_size = BlockHeader::size_of(block);
        }

        if !is_small && self.reserve.is_none() {
            self.reserve = Some(block);
        } else if let Some(reserve) = self.reserve {
            if block_size > BlockHeader::size_of(reserve) {
                // Bigger candidate: demote the old reserve to its bin.
                let old_reserve = self.unlink_reserve_block();
                self.link_block_to_bins(old_reserve);
                self.reserve = Some(block);
            } else {
                self.link_block_to_bins(block);
            }
        } else {
            self.link_block_to_bins(block);
        }

        debug_assert!(BlockHeader::matches_footer(block));
        block
    }

    unsafe fn link_block_to_bins(&mut self, block: NonNull<BlockHeader>) {
        let block_size = BlockHeader::size_of(block);
        let bin_index = bins::bin_index(block_size);

        if bins::is_small(block_size) {
            self.link_small_block(block, bin_index);
        } else {
            self.link_tree_block(block, bin_index);
        }
    }

    unsafe fn link_small_block(&mut self, block: NonNull<BlockHeader>, bin_index: usize) {
        debug_assert!(bin_index < NUM_SMALL_BINS);
        let links = BlockHeader::links_of(block).as_ptr();

        match self.bins[bin_index] {
            // First block in the bin links to itself.
            None => {
                (*links).next = Some(block);
                (*links).prev = Some(block);
            }
            // Splice in right before the head.
            Some(head) => {
                let head_links = BlockHeader::links_of(head).as_ptr();
                let tail = (*head_links).prev.unwrap();
                let tail_links = BlockHeader::links_of(tail).as_ptr();

                (*links).prev = Some(tail);
                (*links).next = Some(head);
                (*tail_links).next = Some(block);
                (*head_links).prev = Some(block);
            }
        }

        self.bins[bin_index] = Some(block);
        self.bin_map = bits::set_bit(self.bin_map, bin_index);
    }

    /// Removes a free block from wherever it is linked: the reserve slot,
    /// a small bin or a tree bin.
    unsafe fn unlink_block(&mut self, block: NonNull<BlockHeader>) {
        let block_size = BlockHeader::size_of(block);

        if self.reserve == Some(block) {
            self.unlink_reserve_block();
        } else if bins::is_small(block_size) {
            self.unlink_small_bin_block(block, bins::bin_index(block_size));
        } else {
            self.unlink_tree_block(block, bins::bin_index(block_size));
        }
    }

    unsafe fn unlink_small_bin_block(&mut self, block: NonNull<BlockHeader>, bin_index: usize) {
        debug_assert!(!BlockHeader::is_allocated(block));
        debug_assert_eq!(bins::bin_index(BlockHeader::size_of(block)), bin_index);

        // The list is circular, a linked block always has valid links.
        let links = BlockHeader::links_of(block).as_ptr();
        let next = (*links).next.unwrap();
        let prev = (*links).prev.unwrap();

        (*BlockHeader::links_of(prev).as_ptr()).next = Some(next);
        (*BlockHeader::links_of(next).as_ptr()).prev = Some(prev);

        if self.bins[bin_index] == Some(block) {
            if next == block {
                self.bins[bin_index] = None;
                self.bin_map = bits::reset_bit(self.bin_map, bin_index);
            } else {
                self.bins[bin_index] = Some(next);
            }
        }

        (*links).next = None;
        (*links).prev = None;
    }

    unsafe fn unlink_reserve_block(&mut self) -> NonNull<BlockHeader> {
        let block = self.reserve.take().unwrap();
        let links = BlockHeader::links_of(block).as_ptr();
        (*links).next = None;
        (*links).prev = None;
        block
    }

    /// Merges `block` with its free neighbours. At most three blocks fuse
    /// in one step (prev + self + next), which is all that can ever be
    /// free at once since linking coalesces eagerly. Fenceposts never
    /// merge outward: the navigation primitives already stop at them.
    unsafe fn coalesce_adjacent_blocks(
        &mut self,
        block: NonNull<BlockHeader>,
    ) -> NonNull<BlockHeader> {
        let mut to_merge = [block; 3];
        let mut count = 0;

        if let Some(prev) = BlockHeader::prev_of(block) {
            if !BlockHeader::is_allocated(prev) {
                debug_assert!(BlockHeader::matches_footer(prev));
                to_merge[count] = prev;
                count += 1;
                self.unlink_block(prev);
            }
        }

        to_merge[count] = block;
        count += 1;

        if let Some(next) = BlockHeader::next_of(block) {
            if !BlockHeader::is_allocated(next) {
                to_merge[count] = next;
                count += 1;
                self.unlink_block(next);
            }
        }

        let merged = if count > 1 {
            Self::merge_blocks(&to_merge[..count])
        } else {
            block
        };

        debug_assert!(BlockHeader::matches_footer(merged));
        merged
    }

    /// Fuses a run of contiguous unlinked free blocks into the leftmost
    /// one, which keeps its flags. Returns the merged block, unlinked.
    unsafe fn merge_blocks(blocks: &[NonNull<BlockHeader>]) -> NonNull<BlockHeader> {
        debug_assert!(blocks.len() > 1);

        let mut total_size = 0;
        for &block in blocks {
            debug_assert_eq!(Segment::from_block(block), Segment::from_block(blocks[0]));
            total_size += BlockHeader::size_of(block) + BLOCK_OVERHEAD;
        }

        let merged = blocks[0];
        BlockHeader::set_size(merged, total_size - BLOCK_OVERHEAD);
        BlockHeader::reconcile_footer(merged);
        merged
    }

    /// Splits the requested size off the reserve and re-files what's left:
    /// the shrunken reserve stays in place unless it became small, in
    /// which case it moves to its exact-fit bin.
    unsafe fn split_reserve_block(&mut self, num_bytes: usize) -> NonNull<BlockHeader> {
        let reserve = self.reserve.unwrap();
        let block = self.split_block(reserve, num_bytes);

        if block == reserve {
            // Remainder too small to keep, hand out the whole reserve.
            return self.unlink_reserve_block();
        }

        if bins::is_small(BlockHeader::size_of(reserve)) {
            let old_reserve = self.unlink_reserve_block();
            self.link_block_to_bins(old_reserve);
        }

        block
    }

    /// Carves `num_bytes` (plus any alignment correction) off the end of a
    /// free block. The original block keeps its flags and shrinks to the
    /// remainder; the returned tail is a fresh block inheriting only the
    /// external bit. When the remainder would drop below the minimum the
    /// block is returned whole.
    unsafe fn split_block(
        &self,
        block: NonNull<BlockHeader>,
        num_bytes: usize,
    ) -> NonNull<BlockHeader> {
        debug_assert!(!BlockHeader::is_allocated(block));
        debug_assert!(num_bytes >= MIN_ALLOCATION_SIZE);
        debug_assert!(BlockHeader::size_of(block) >= num_bytes + BLOCK_OVERHEAD);

        let remainder = BlockHeader::size_of(block) - num_bytes - BLOCK_OVERHEAD;

        // The tail's payload must land on the configured alignment; the
        // correction bytes move from the remainder into the tail.
        let correction = (block.as_ptr() as usize + remainder + BLOCK_OVERHEAD + BLOCK_HEADER_SIZE)
            % self.alignment;

        if remainder < correction + MIN_ALLOCATION_SIZE + BLOCK_OVERHEAD {
            return block;
        }

        let remainder = remainder - correction;
        let num_bytes = num_bytes + correction;

        BlockHeader::set_size(block, remainder);
        BlockHeader::reconcile_footer(block);

        let split = NonNull::new_unchecked(
            block
                .as_ptr()
                .cast::<u8>()
                .add(remainder + BLOCK_OVERHEAD)
                .cast::<BlockHeader>(),
        );
        BlockHeader::init(split, num_bytes, BlockHeader::is_external(block));
        BlockHeader::set_fencepost(split, false);

        split
    }

    /// Maps a fresh segment big enough for `num_bytes` plus all
    /// bookkeeping and links it in. Returns the segment's usable block.
    unsafe fn alloc_new_segment(
        &mut self,
        num_bytes: usize,
        is_external: bool,
    ) -> Result<NonNull<BlockHeader>, AllocError> {
        let mut length = platform::page_align(num_bytes + SEGMENT_HEADER_SIZE + BLOCK_OVERHEAD);

        // The mapping must also fit the hidden alignment footer, the pad
        // and the right fencepost while still serving num_bytes from the
        // first block.
        let worst_case = num_bytes
            + SEGMENT_HEADER_SIZE
            + BLOCK_OVERHEAD
            + BLOCK_FOOTER_SIZE
            + MIN_ALLOCATION_SIZE
            + BLOCK_OVERHEAD
            + 2 * (self.alignment - 1);
        if length < worst_case {
            length = platform::page_align(worst_case);
        }

        log::trace!("mapping new segment of {length} bytes (external: {is_external})");

        let Some(address) = platform::request_memory(length) else {
            log::error!("segment mapping of {length} bytes failed");
            return Err(AllocError);
        };

        let segment = address.cast::<Segment>();
        (*segment.as_ptr()).next = None;
        (*segment.as_ptr()).prev = None;
        (*segment.as_ptr()).flags = 0;
        Segment::set_size(segment, length - SEGMENT_HEADER_SIZE);
        Segment::set_external(segment, is_external);
        Segment::set_offset(segment, 0);

        Ok(self.link_segment(segment))
    }

    /// Adds a mapped segment to the segment list, fusing it into a
    /// physically adjacent one when allowed. Lays out the left fencepost
    /// block and splits off the right fencepost. Returns the usable block,
    /// initialized free and unlinked.
    unsafe fn link_segment(&mut self, segment: NonNull<Segment>) -> NonNull<BlockHeader> {
        let is_external = Segment::is_external(segment);

        // Find the list tail, watching for an adjacent segment on the way.
        // Being adjacent to two segments at once is so unlikely it isn't
        // even checked.
        let mut merge_into = None;
        let mut tail = None;
        let mut iter = self.head_segment;
        while let Some(existing) = iter {
            if self.segment_merging && !is_external && Segment::are_adjacent(existing, segment)
            {
                merge_into = Some(existing);
                break;
            }
            tail = Some(existing);
            iter = Segment::next_of(existing);
        }

        let (block, block_size) = if let Some(expanded) = merge_into {
            let num_bytes = Segment::size_of(segment) + SEGMENT_HEADER_SIZE;
            Segment::set_size(expanded, Segment::size_of(expanded) + num_bytes);

            // The predecessor's right fencepost sits directly before the
            // new mapping. Recycle it into the usable block spanning both
            // payloads; the new mapping's segment header becomes payload.
            let fence_footer = NonNull::new_unchecked(
                segment
                    .as_ptr()
                    .cast::<u8>()
                    .sub(BLOCK_FOOTER_SIZE)
                    .cast::<BlockFooter>(),
            );
            let fence_size = BlockFooter::size_of(fence_footer);
            let block = NonNull::new_unchecked(
                fence_footer
                    .as_ptr()
                    .cast::<u8>()
                    .sub(fence_size + BLOCK_HEADER_SIZE)
                    .cast::<BlockHeader>(),
            );
            debug_assert!(BlockHeader::is_fencepost(block));
            debug_assert!(BlockHeader::matches_footer(block));

            log::trace!("fusing new mapping into adjacent segment");

            (block, num_bytes + fence_size)
        } else {
            // Pad the segment start so the first payload lands on the
            // configured alignment, and record the pad size.
            let unpadded = Segment::first_block(segment);
            let data = BlockHeader::data_address_of(unpadded).as_ptr() as usize;
            let offset = (self.alignment - data % self.alignment) % self.alignment;
            Segment::set_offset(segment, offset);

            let block = Segment::first_block(segment);
            let block_size =
                Segment::size_of(segment) - BLOCK_OVERHEAD - offset - BLOCK_FOOTER_SIZE;

            if let Some(tail) = tail {
                (*tail.as_ptr()).next = Some(segment);
                (*segment.as_ptr()).prev = Some(tail);
            } else {
                self.head_segment = Some(segment);
            }
            (*segment.as_ptr()).next = None;

            (block, block_size)
        };

        BlockHeader::init(block, block_size, is_external);
        // A fused block continues an existing segment, only a fresh first
        // block is the left fencepost.
        BlockHeader::set_fencepost(block, merge_into.is_none());

        // Split off a minimum-length tail as the right fencepost. It only
        // marks the end of the segment: unallocated, but never linked into
        // any bin.
        let right_fence = self.split_block(block, MIN_ALLOCATION_SIZE);
        debug_assert!(right_fence != block);
        BlockHeader::set_allocated(right_fence, false);
        BlockHeader::set_fencepost(right_fence, true);

        block
    }

    /// Unlinks and unmaps an external segment wholesale.
    unsafe fn release_external_segment(&mut self, segment: NonNull<Segment>) {
        debug_assert!(Segment::is_external(segment));
        log::trace!(
            "releasing external segment of {} bytes",
            Segment::total_size_of(segment)
        );

        if self.head_segment == Some(segment) {
            self.head_segment = Segment::next_of(segment);
        } else if let Some(prev) = (*segment.as_ptr()).prev {
            (*prev.as_ptr()).next = Segment::next_of(segment);
        }
        if let Some(next) = Segment::next_of(segment) {
            (*next.as_ptr()).prev = (*segment.as_ptr()).prev;
        }

        platform::return_memory(segment.cast(), Segment::total_size_of(segment));
    }

    /// The owner check behind release's debug assertion: recover the
    /// owning segment and make sure it is one of ours.
    unsafe fn block_belongs_to_allocator(&self, block: NonNull<BlockHeader>) -> bool {
        let owner = Segment::from_block(block);

        let mut iter = self.head_segment;
        while let Some(segment) = iter {
            if segment == owner {
                return Segment::contains(segment, block);
            }
            iter = Segment::next_of(segment);
        }

        false
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        unsafe {
            let mut iter = self.head_segment;
            while let Some(segment) = iter {
                iter = Segment::next_of(segment);
                platform::return_memory(segment.cast(), Segment::total_size_of(segment));
            }
        }
    }
}

impl Allocator for HeapAllocator {
    /// The heap allocator carries one alignment fixed at construction;
    /// per-call alignment and offset are served by the wrappers that
    /// support them.
    fn allocate(&mut self, size: usize, _alignment: usize, _offset: usize) -> AllocResult {
        HeapAllocator::allocate(self, size)
    }

    unsafe fn release(&mut self, addr: NonNull<u8>) {
        HeapAllocator::release(self, addr)
    }

    unsafe fn allocation_size(&self, _addr: NonNull<u8>) -> usize {
        // Not implemented: the header encodes the block size but it is not
        // part of the public contract.
        0
    }
}
