//! Interval set over a sparse 64 bit byte address space.
//!
//! A `BlockStructure` records which byte offsets belong to something: the
//! bytes a chunk match covers in build space, the bytes of a layer that
//! came from a given part of the build, the bytes nobody has claimed yet.
//! Builds can be many gigabytes, so nothing is tracked per byte. Instead
//! the structure keeps a sorted, merged list of `(offset, size)` blocks.
//!
//! The list is a doubly linked list stored in an arena: nodes live in a
//! `Vec` and refer to each other by index, and freed slots are recycled
//! through a free list. Splicing at a known position is O(1) and the whole
//! structure is dropped or cloned in one go.

use std::fmt;

/// Which end of the list an operation walks from.
///
/// The direction never changes the result. It only changes how quickly
/// the affected position is found, so callers appending near the end of
/// a structure should pass `FromEnd`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchDirection {
    FromStart,
    FromEnd,
}

/// One contiguous run of bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockEntry {
    offset: u64,
    size: u64,
}

impl BlockEntry {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte in the block.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Clone, Debug)]
struct Node {
    entry: BlockEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An ordered set of non overlapping, non adjacent byte blocks.
///
/// Invariants held after every public operation:
/// - blocks are sorted ascending by offset;
/// - no block has zero size;
/// - for consecutive blocks `a` and `b`, `a.end() < b.offset()`.
#[derive(Clone, Default)]
pub struct BlockStructure {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    foot: Option<usize>,
    num_blocks: usize,
}

impl BlockStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a structure holding a single block.
    pub fn from_block(offset: u64, size: u64) -> Self {
        let mut structure = Self::new();
        structure.add(offset, size, SearchDirection::FromStart);
        structure
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn head(&self) -> Option<BlockEntry> {
        self.head.map(|idx| self.nodes[idx].entry)
    }

    pub fn foot(&self) -> Option<BlockEntry> {
        self.foot.map(|idx| self.nodes[idx].entry)
    }

    /// Sum of the sizes of all blocks.
    pub fn total_size(&self) -> u64 {
        self.iter().map(|block| block.size).sum()
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            structure: self,
            cursor: self.head,
        }
    }

    /// Removes every block and releases the arena.
    pub fn empty(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.foot = None;
        self.num_blocks = 0;
    }

    /// Adds `[offset, offset + size)` to the set.
    ///
    /// Overlapping or touching blocks are merged with the new range, and
    /// the merge is cascaded until no neighbour touches the result.
    pub fn add(&mut self, offset: u64, size: u64, direction: SearchDirection) {
        if size == 0 {
            return;
        }
        let end = offset.saturating_add(size);

        match direction {
            SearchDirection::FromStart => {
                //First block that ends at or after the new offset.
                let mut cursor = self.head;
                while let Some(idx) = cursor {
                    if self.nodes[idx].entry.end() >= offset {
                        break;
                    }
                    cursor = self.nodes[idx].next;
                }

                match cursor {
                    None => {
                        self.insert_after(self.foot, BlockEntry::new(offset, end - offset));
                    }
                    Some(idx) if self.nodes[idx].entry.offset > end => {
                        let prev = self.nodes[idx].prev;
                        self.insert_after(prev, BlockEntry::new(offset, end - offset));
                    }
                    Some(idx) => {
                        self.merge_into(idx, offset, end);
                        self.collect_overlaps_forward(idx);
                    }
                }
            }
            SearchDirection::FromEnd => {
                //Last block that starts at or before the new end.
                let mut cursor = self.foot;
                while let Some(idx) = cursor {
                    if self.nodes[idx].entry.offset <= end {
                        break;
                    }
                    cursor = self.nodes[idx].prev;
                }

                match cursor {
                    None => {
                        self.insert_after(None, BlockEntry::new(offset, end - offset));
                    }
                    Some(idx) if self.nodes[idx].entry.end() < offset => {
                        self.insert_after(Some(idx), BlockEntry::new(offset, end - offset));
                    }
                    Some(idx) => {
                        self.merge_into(idx, offset, end);
                        self.collect_overlaps_backward(idx);
                    }
                }
            }
        }
    }

    /// Removes `[offset, offset + size)` from the set.
    ///
    /// Blocks fully inside the range are deleted, blocks straddling one
    /// edge are trimmed and a block containing the whole range is split.
    pub fn remove(&mut self, offset: u64, size: u64, direction: SearchDirection) {
        if size == 0 || self.is_empty() {
            return;
        }
        let end = offset.saturating_add(size);

        match direction {
            SearchDirection::FromStart => {
                let mut cursor = self.head;
                while let Some(idx) = cursor {
                    let entry = self.nodes[idx].entry;
                    let next = self.nodes[idx].next;
                    if entry.offset >= end {
                        break;
                    }
                    if entry.end() > offset {
                        self.chop(idx, offset, end);
                    }
                    cursor = next;
                }
            }
            SearchDirection::FromEnd => {
                let mut cursor = self.foot;
                while let Some(idx) = cursor {
                    let entry = self.nodes[idx].entry;
                    let prev = self.nodes[idx].prev;
                    if entry.end() <= offset {
                        break;
                    }
                    if entry.offset < end {
                        self.chop(idx, offset, end);
                    }
                    cursor = prev;
                }
            }
        }
    }

    /// Adds every block of `other` to this structure.
    pub fn add_structure(&mut self, other: &BlockStructure) {
        for block in other.iter() {
            self.add(block.offset, block.size, SearchDirection::FromEnd);
        }
    }

    /// Removes every block of `other` from this structure.
    pub fn remove_structure(&mut self, other: &BlockStructure) {
        for block in other.iter() {
            self.remove(block.offset, block.size, SearchDirection::FromStart);
        }
    }

    /// Selects bytes as if all blocks were laid end to end.
    ///
    /// Treating the blocks as one serial run with the gaps squeezed out,
    /// takes `count` bytes starting at serial position `first_byte` and
    /// adds the real offset ranges they occupy to `out`. Returns how many
    /// bytes were selected, which is less than `count` when the structure
    /// runs out of bytes.
    pub fn select_serial_bytes(
        &self,
        first_byte: u64,
        count: u64,
        out: &mut BlockStructure,
    ) -> u64 {
        let mut serial_pos = 0u64;
        let mut selected = 0u64;

        for block in self.iter() {
            if selected == count {
                break;
            }
            let block_serial_start = serial_pos;
            serial_pos += block.size;
            if serial_pos <= first_byte {
                continue;
            }

            let local_start = first_byte.max(block_serial_start) - block_serial_start;
            let take = (block.size - local_start).min(count - selected);
            out.add(block.offset + local_start, take, SearchDirection::FromEnd);
            selected += take;
        }

        selected
    }

    /// Returns the byte ranges present in both `self` and `other`.
    pub fn intersect(&self, other: &BlockStructure) -> BlockStructure {
        let (Some(head), Some(foot)) = (self.head(), self.foot()) else {
            return BlockStructure::new();
        };

        let mut result = other.clone();
        result.remove(0, head.offset, SearchDirection::FromStart);

        let mut previous: Option<BlockEntry> = None;
        for block in self.iter() {
            if let Some(prev) = previous {
                result.remove(prev.end(), block.offset - prev.end(), SearchDirection::FromStart);
            }
            previous = Some(block);
        }

        result.remove(foot.end(), u64::MAX - foot.end(), SearchDirection::FromEnd);
        result
    }

    fn alloc(&mut self, entry: BlockEntry) -> usize {
        let node = Node {
            entry,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Links a new node after `prev`, or at the head when `prev` is `None`.
    fn insert_after(&mut self, prev: Option<usize>, entry: BlockEntry) -> usize {
        let idx = self.alloc(entry);
        let next = match prev {
            Some(p) => self.nodes[p].next,
            None => self.head,
        };

        self.nodes[idx].prev = prev;
        self.nodes[idx].next = next;

        match prev {
            Some(p) => self.nodes[p].next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.nodes[n].prev = Some(idx),
            None => self.foot = Some(idx),
        }

        self.num_blocks += 1;
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;

        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.foot = prev,
        }

        self.free.push(idx);
        self.num_blocks -= 1;
    }

    fn merge_into(&mut self, idx: usize, offset: u64, end: u64) {
        let entry = &mut self.nodes[idx].entry;
        let new_start = entry.offset.min(offset);
        let new_end = entry.end().max(end);
        entry.offset = new_start;
        entry.size = new_end - new_start;
    }

    fn collect_overlaps_forward(&mut self, idx: usize) {
        while let Some(next) = self.nodes[idx].next {
            let next_entry = self.nodes[next].entry;
            let current_end = self.nodes[idx].entry.end();
            if next_entry.offset > current_end {
                break;
            }
            self.merge_into(idx, next_entry.offset, next_entry.end());
            self.unlink(next);
        }
    }

    fn collect_overlaps_backward(&mut self, idx: usize) {
        while let Some(prev) = self.nodes[idx].prev {
            let prev_entry = self.nodes[prev].entry;
            let current_start = self.nodes[idx].entry.offset;
            if prev_entry.end() < current_start {
                break;
            }
            self.merge_into(idx, prev_entry.offset, prev_entry.end());
            self.unlink(prev);
        }
    }

    /// Cuts `[offset, end)` out of the block at `idx`, which must overlap it.
    fn chop(&mut self, idx: usize, offset: u64, end: u64) {
        let entry = self.nodes[idx].entry;

        if offset <= entry.offset && end >= entry.end() {
            self.unlink(idx);
        } else if offset > entry.offset && end < entry.end() {
            self.nodes[idx].entry.size = offset - entry.offset;
            self.insert_after(Some(idx), BlockEntry::new(end, entry.end() - end));
        } else if offset <= entry.offset {
            self.nodes[idx].entry = BlockEntry::new(end, entry.end() - end);
        } else {
            self.nodes[idx].entry.size = offset - entry.offset;
        }
    }
}

impl PartialEq for BlockStructure {
    fn eq(&self, other: &Self) -> bool {
        self.num_blocks == other.num_blocks && self.iter().eq(other.iter())
    }
}

impl Eq for BlockStructure {}

impl fmt::Debug for BlockStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|block| (block.offset, block.size)))
            .finish()
    }
}

/// Iterator over the blocks of a `BlockStructure`, in offset order.
pub struct BlockIter<'a> {
    structure: &'a BlockStructure,
    cursor: Option<usize>,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = &self.structure.nodes[idx];
        self.cursor = node.next;
        Some(node.entry)
    }
}
