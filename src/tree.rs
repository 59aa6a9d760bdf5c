//! Tree-bin engine. Each tree bin is a bitwise digital trie keyed on block
//! size: starting from the bin's root, the size is shifted so the highest
//! routing bit sits in the most significant position (see
//! [`bins::tree_bin_shift`]), and each level consumes one bit to pick a
//! child. Blocks of the same size don't nest deeper, they form a circular
//! chain hanging off the trie node for that size.
//!
//! A trie node is an ordinary free block whose payload holds a
//! [`TreeLinks`]. The bin root and non-head chain members both have a
//! `None` parent; they are told apart by comparing against the bin slot.

use std::ptr::NonNull;

use crate::{
    bins::{self, NUM_BINS, NUM_SMALL_BINS},
    bits,
    block::BlockHeader,
    heap::HeapAllocator,
    Pointer,
};

/// Trie links threaded through the payload of a free tree-bin block. The
/// first two fields overlap [`crate::block::FreeLinks`], so a block can be
/// reinterpreted between the two shapes based on which bin class owns it.
/// Tree blocks are at least 256 bytes, five words always fit.
#[repr(C)]
pub(crate) struct TreeLinks {
    /// Next block in the same-size chain.
    pub next: Pointer<BlockHeader>,
    /// Previous block in the same-size chain.
    pub prev: Pointer<BlockHeader>,
    /// Trie parent, `None` for the bin root and for non-head chain members.
    pub parent: Pointer<BlockHeader>,
    /// Left (0) and right (1) trie children.
    pub child: [Pointer<BlockHeader>; 2],
}

impl TreeLinks {
    #[inline]
    pub unsafe fn of(block: NonNull<BlockHeader>) -> *mut TreeLinks {
        BlockHeader::data_address_of(block).cast().as_ptr()
    }
}

impl HeapAllocator {
    /// Inserts a free block into the trie of the given bin.
    pub(crate) unsafe fn link_tree_block(&mut self, block: NonNull<BlockHeader>, bin_index: usize) {
        debug_assert!((NUM_SMALL_BINS..NUM_BINS).contains(&bin_index));
        let block_size = BlockHeader::size_of(block);
        let links = TreeLinks::of(block);

        let Some(root) = self.bins[bin_index] else {
            (*links).parent = None;
            (*links).child = [None, None];
            (*links).next = Some(block);
            (*links).prev = Some(block);
            self.bins[bin_index] = Some(block);
            self.bin_map = bits::set_bit(self.bin_map, bin_index);
            return;
        };

        // Walk the routing bits of the size, most significant first.
        let mut routing = block_size << bins::tree_bin_shift(bin_index);

        let mut iter = root;
        loop {
            let iter_links = TreeLinks::of(iter);
            let branch = bits::word_msb(routing);

            let Some(child) = (*iter_links).child[branch] else {
                // Reached a free slot, attach as a fresh leaf.
                (*iter_links).child[branch] = Some(block);
                (*links).parent = Some(iter);
                (*links).child = [None, None];
                (*links).next = Some(block);
                (*links).prev = Some(block);
                return;
            };

            if BlockHeader::size_of(child) == block_size {
                // Same size, splice into the chain right after its head.
                debug_assert!(block != child);
                let head_links = TreeLinks::of(child);
                let head_next = (*head_links).next.unwrap();

                (*links).next = Some(head_next);
                (*links).prev = Some(child);
                (*links).parent = None;
                (*links).child = [None, None];
                (*TreeLinks::of(head_next)).prev = Some(block);
                (*head_links).next = Some(block);
                return;
            }

            routing <<= 1;
            iter = child;
        }
    }

    /// Best-fit lookup: among the blocks of size at least `num_bytes` in
    /// this bin, returns the one with minimum excess, or `None` if the bin
    /// holds no block big enough.
    ///
    /// Descends by the routing bits of the *request*. Whenever descent
    /// takes the left child, the right child leads to strictly larger
    /// sizes, so the most recent such right subtree is remembered: once
    /// the path dead-ends, that subtree holds the smallest sizes above
    /// everything on the path, and its minimum lives on the leftmost
    /// spine. Every spine node is compared, a parent can be smaller than
    /// all of its descendants' leaves.
    pub(crate) unsafe fn find_tree_block(
        &self,
        bin_index: usize,
        num_bytes: usize,
    ) -> Pointer<BlockHeader> {
        debug_assert!((NUM_SMALL_BINS..NUM_BINS).contains(&bin_index));
        let root = self.bins[bin_index]?;

        let mut routing = num_bytes << bins::tree_bin_shift(bin_index);

        let mut best: Pointer<BlockHeader> = None;
        let mut best_excess = usize::MAX;
        let mut fallback: Pointer<BlockHeader> = None;

        let mut iter = Some(root);
        while let Some(node) = iter {
            let size = BlockHeader::size_of(node);
            if size >= num_bytes {
                let excess = size - num_bytes;
                if excess < best_excess {
                    best = Some(node);
                    best_excess = excess;
                    if excess == 0 {
                        return best;
                    }
                }
            }

            let links = TreeLinks::of(node);
            let right = (*links).child[1];
            iter = (*links).child[bits::word_msb(routing)];
            if right.is_some() && right != iter {
                fallback = right;
            }
            routing <<= 1;
        }

        let mut iter = fallback;
        while let Some(node) = iter {
            let size = BlockHeader::size_of(node);
            if size >= num_bytes {
                let excess = size - num_bytes;
                if excess < best_excess {
                    best = Some(node);
                    best_excess = excess;
                    if excess == 0 {
                        break;
                    }
                }
            }
            let links = TreeLinks::of(node);
            iter = (*links).child[0].or((*links).child[1]);
        }

        best
    }

    /// Removes a block from the trie of the given bin.
    pub(crate) unsafe fn unlink_tree_block(
        &mut self,
        block: NonNull<BlockHeader>,
        bin_index: usize,
    ) {
        let links = TreeLinks::of(block);
        let next = (*links).next.unwrap();
        let prev = (*links).prev.unwrap();

        if next != block {
            // Part of a same-size chain. The head owns the trie node, so
            // removing it promotes the next chain member into the trie.
            if (*links).parent.is_some() || self.bins[bin_index] == Some(block) {
                self.replace_tree_block(block, next, bin_index);
            }

            (*TreeLinks::of(prev)).next = Some(next);
            (*TreeLinks::of(next)).prev = Some(prev);
        } else if (*links).child[0].is_none() && (*links).child[1].is_none() {
            // Solitary leaf: detach from its parent, or empty the bin.
            if self.bins[bin_index] == Some(block) {
                self.bins[bin_index] = None;
                self.bin_map = bits::reset_bit(self.bin_map, bin_index);
            } else {
                Self::unlink_tree_leaf(block);
            }
        } else {
            // Interior node: substitute any leaf from its own subtree.
            let leaf = Self::find_tree_leaf(block);
            Self::unlink_tree_leaf(leaf);
            self.replace_tree_block(block, leaf, bin_index);
        }

        (*links).next = None;
        (*links).prev = None;
        (*links).parent = None;
    }

    /// Rewires the trie so `repl` takes over `block`'s position: parent
    /// link, both children, and the bin slot if `block` was the root.
    unsafe fn replace_tree_block(
        &mut self,
        block: NonNull<BlockHeader>,
        repl: NonNull<BlockHeader>,
        bin_index: usize,
    ) {
        let links = TreeLinks::of(block);
        let repl_links = TreeLinks::of(repl);
        debug_assert!((*links).parent.is_some() || self.bins[bin_index] == Some(block));

        if let Some(parent) = (*links).parent {
            let parent_links = TreeLinks::of(parent);
            if (*parent_links).child[0] == Some(block) {
                (*parent_links).child[0] = Some(repl);
            } else if (*parent_links).child[1] == Some(block) {
                (*parent_links).child[1] = Some(repl);
            }
        }

        (*repl_links).parent = (*links).parent;
        (*repl_links).child = (*links).child;

        for child in (*repl_links).child.into_iter().flatten() {
            (*TreeLinks::of(child)).parent = Some(repl);
        }

        if self.bins[bin_index] == Some(block) {
            self.bins[bin_index] = Some(repl);
            (*repl_links).parent = None;
        }

        debug_assert!((*repl_links).child[0] != Some(repl));
        debug_assert!((*repl_links).child[1] != Some(repl));
    }

    /// Detaches a leaf from its parent. The leaf keeps its own links, the
    /// caller either discards or re-wires them.
    unsafe fn unlink_tree_leaf(leaf: NonNull<BlockHeader>) {
        let parent = (*TreeLinks::of(leaf)).parent.unwrap();
        let parent_links = TreeLinks::of(parent);

        if (*parent_links).child[0] == Some(leaf) {
            (*parent_links).child[0] = None;
        } else {
            (*parent_links).child[1] = None;
        }
    }

    /// Any leaf in the subtree under `root`, found by following the first
    /// available child. Used as the replacement when an interior node is
    /// removed; it doesn't have to be the smallest, just a leaf.
    unsafe fn find_tree_leaf(root: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let mut iter = root;
        loop {
            let links = TreeLinks::of(iter);
            match (*links).child[0].or((*links).child[1]) {
                Some(child) => iter = child,
                None => return iter,
            }
        }
    }
}
