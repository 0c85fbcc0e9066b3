//! Suballocators divide a linear address space into smaller allocated ranges.
//!
//! A suballocator does not own any memory itself; it only does the offset
//! bookkeeping for whoever does, which is what allows the
//! [`BufferManager`] to stay decoupled from the allocation policy.
//!
//! [`BufferManager`]: crate::buffer::BufferManager

use self::slab::{NodeSlab, SlotId};
use crate::{misalignment, DeviceSize};
use std::{
    error::Error,
    fmt::{self, Display, Formatter},
};

/// The capability every range allocator must provide in order to be usable by
/// the [`BufferManager`].
///
/// An implementation tracks which parts of the range `[0, total)` are in use,
/// where `total` is the sum of all [`grow`] calls. It never touches the
/// memory the range describes.
///
/// [`BufferManager`]: crate::buffer::BufferManager
/// [`grow`]: Self::grow
pub trait Suballocator {
    /// The iterator returned by [`suballocations`].
    ///
    /// [`suballocations`]: Self::suballocations
    type Suballocations<'a>: Iterator<Item = Segment>
    where
        Self: 'a;

    /// Reserves `size` bytes at an offset that is a multiple of `alignment`
    /// and returns that offset.
    ///
    /// An `alignment` of zero is treated as an alignment of one.
    ///
    /// # Errors
    ///
    /// - Returns [`ZeroSize`] if `size` is zero. This is a caller-contract
    ///   violation, not a capacity condition.
    /// - Returns [`OutOfRegionMemory`] if no free range can satisfy the
    ///   request. The caller decides whether to [`grow`] and retry.
    ///
    /// [`ZeroSize`]: SuballocatorError::ZeroSize
    /// [`OutOfRegionMemory`]: SuballocatorError::OutOfRegionMemory
    /// [`grow`]: Self::grow
    fn allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<DeviceSize, SuballocatorError>;

    /// Releases a previously allocated range.
    ///
    /// The `(offset, size)` pair must exactly match a prior [`allocate`]
    /// result that has not been released yet.
    ///
    /// # Errors
    ///
    /// - Returns [`InvalidFree`] if no used range exactly matches. This
    ///   includes freeing at an offset that lies strictly inside a range,
    ///   freeing with a mismatched size, and freeing a range that is already
    ///   free. The tracked state is left untouched in every such case.
    ///
    /// [`allocate`]: Self::allocate
    /// [`InvalidFree`]: SuballocatorError::InvalidFree
    fn deallocate(&mut self, offset: DeviceSize, size: DeviceSize)
        -> Result<(), SuballocatorError>;

    /// Appends `size` bytes of free space at the end of the tracked range.
    ///
    /// Used by the owner after its backing storage has grown.
    fn grow(&mut self, size: DeviceSize);

    /// Returns whether the whole tracked range is one free segment.
    fn is_empty(&self) -> bool;

    /// Returns the total amount of free space that is left.
    fn free_size(&self) -> DeviceSize;

    /// Returns an iterator over the tracked segments, in address order.
    fn suballocations(&self) -> Self::Suballocations<'_>;
}

/// A contiguous byte range tracked by a suballocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    /// The offset where the segment begins.
    pub offset: DeviceSize,

    /// The size of the segment.
    pub size: DeviceSize,

    /// Whether the segment is free or in use.
    pub state: SegmentState,
}

/// Tells us whether a [`Segment`] is free or in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentState {
    Free,
    Used,
}

/// Error that can be returned by a [`Suballocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// A zero-size allocation was requested.
    ZeroSize,

    /// There is no free range large enough to satisfy the request.
    OutOfRegionMemory,

    /// The freed range does not exactly match a currently used segment.
    InvalidFree,
}

impl Error for SuballocatorError {}

impl Display for SuballocatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::ZeroSize => "a zero-size allocation was requested",
            Self::OutOfRegionMemory => "out of region memory",
            Self::InvalidFree => "the freed range does not match a used segment",
        };

        f.write_str(msg)
    }
}

/// A [suballocator] that uses the first-fit policy over a chain of segments.
///
/// The allocator keeps every tracked byte in exactly one segment of a
/// doubly-linked chain ordered by address, with no gaps and no overlaps. An
/// allocation walks the chain from the start and takes the first free segment
/// it fits into, splitting off a leading free segment when alignment padding
/// is needed and a trailing one when the segment is larger than the request.
/// A free marks the segment unused and immediately coalesces it with free
/// neighbors, which is what keeps repeated allocate/free cycles from
/// fragmenting adjacent free space indefinitely.
///
/// The chain nodes live in a slab and reference each other through stable
/// slot IDs, so splicing and merging never move other nodes.
///
/// [suballocator]: Suballocator
#[derive(Debug)]
pub struct FirstFitAllocator {
    nodes: NodeSlab<SegmentNode>,
    head: SlotId,
    total_size: DeviceSize,
    free_size: DeviceSize,
}

#[derive(Clone, Copy, Debug)]
struct SegmentNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    offset: DeviceSize,
    size: DeviceSize,
    state: SegmentState,
}

impl FirstFitAllocator {
    /// Creates a new `FirstFitAllocator` tracking the range `[0, size)`.
    ///
    /// `size` may be zero, in which case the allocator tracks nothing until
    /// the first [`grow`].
    ///
    /// [`grow`]: Suballocator::grow
    pub fn new(size: DeviceSize) -> Self {
        let mut nodes = NodeSlab::new(32);
        let head = nodes.allocate(SegmentNode {
            prev: None,
            next: None,
            offset: 0,
            size,
            state: SegmentState::Free,
        });

        FirstFitAllocator {
            nodes,
            head,
            total_size: size,
            free_size: size,
        }
    }

    /// Returns the total size of the tracked range.
    pub fn total_size(&self) -> DeviceSize {
        self.total_size
    }

    /// Fits an allocation inside the target free segment, splitting off the
    /// parts of the segment that the allocation does not cover.
    ///
    /// `offset` and `size` must describe a subrange of the segment.
    fn split(&mut self, node_id: SlotId, offset: DeviceSize, size: DeviceSize) {
        let node = *self.nodes.get(node_id);

        debug_assert!(node.state == SegmentState::Free);
        debug_assert!(offset >= node.offset);
        debug_assert!(offset + size <= node.offset + node.size);

        let padding_front = offset - node.offset;
        let padding_back = node.offset + node.size - offset - size;

        if padding_front > 0 {
            let padding_id = self.nodes.allocate(SegmentNode {
                prev: node.prev,
                next: Some(node_id),
                offset: node.offset,
                size: padding_front,
                state: SegmentState::Free,
            });

            if let Some(prev_id) = node.prev {
                self.nodes.get_mut(prev_id).next = Some(padding_id);
            } else {
                self.head = padding_id;
            }

            let node = self.nodes.get_mut(node_id);
            node.prev = Some(padding_id);
            node.offset = offset;
            node.size -= padding_front;
        }

        if padding_back > 0 {
            let padding_id = self.nodes.allocate(SegmentNode {
                prev: Some(node_id),
                next: node.next,
                offset: offset + size,
                size: padding_back,
                state: SegmentState::Free,
            });

            if let Some(next_id) = node.next {
                self.nodes.get_mut(next_id).prev = Some(padding_id);
            }

            let node = self.nodes.get_mut(node_id);
            node.next = Some(padding_id);
            node.size -= padding_back;
        }
    }

    /// Coalesces the target free segment with its neighbors while they are
    /// free, re-rooting the chain if the head gets merged away.
    fn coalesce(&mut self, node_id: SlotId) {
        debug_assert!(self.nodes.get(node_id).state == SegmentState::Free);

        while let Some(prev_id) = self.nodes.get(node_id).prev {
            let prev = *self.nodes.get(prev_id);

            if prev.state != SegmentState::Free {
                break;
            }

            {
                let node = self.nodes.get_mut(node_id);
                node.prev = prev.prev;
                node.offset = prev.offset;
                node.size += prev.size;
            }

            if let Some(prev_id) = prev.prev {
                self.nodes.get_mut(prev_id).next = Some(node_id);
            }

            if self.head == prev_id {
                self.head = node_id;
            }

            self.nodes.free(prev_id);
        }

        while let Some(next_id) = self.nodes.get(node_id).next {
            let next = *self.nodes.get(next_id);

            if next.state != SegmentState::Free {
                break;
            }

            {
                let node = self.nodes.get_mut(node_id);
                node.next = next.next;
                node.size += next.size;
            }

            if let Some(next_id) = next.next {
                self.nodes.get_mut(next_id).prev = Some(node_id);
            }

            self.nodes.free(next_id);
        }
    }
}

impl Suballocator for FirstFitAllocator {
    type Suballocations<'a>
        = Suballocations<'a>
    where
        Self: 'a;

    fn allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<DeviceSize, SuballocatorError> {
        if size == 0 {
            return Err(SuballocatorError::ZeroSize);
        }

        let mut cursor = Some(self.head);

        while let Some(node_id) = cursor {
            let node = *self.nodes.get(node_id);

            if node.state == SegmentState::Free {
                // Checking the padding against the leftover size instead of
                // checking `align_up(offset) + size` against the segment end
                // keeps the arithmetic from overflowing.
                let padding = misalignment(node.offset, alignment);

                if node.size >= size && node.size - size >= padding {
                    let offset = node.offset + padding;

                    self.split(node_id, offset, size);
                    self.nodes.get_mut(node_id).state = SegmentState::Used;
                    self.free_size -= size;

                    return Ok(offset);
                }
            }

            cursor = node.next;
        }

        Err(SuballocatorError::OutOfRegionMemory)
    }

    fn deallocate(
        &mut self,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), SuballocatorError> {
        let mut cursor = Some(self.head);

        while let Some(node_id) = cursor {
            let node = *self.nodes.get(node_id);

            if node.offset == offset {
                if node.state != SegmentState::Used || node.size != size {
                    return Err(SuballocatorError::InvalidFree);
                }

                self.nodes.get_mut(node_id).state = SegmentState::Free;
                self.free_size += size;
                self.coalesce(node_id);

                return Ok(());
            }

            // The chain is ordered by address, so a matching segment can no
            // longer come up. This also rejects frees of a subrange.
            if node.offset > offset {
                break;
            }

            cursor = node.next;
        }

        Err(SuballocatorError::InvalidFree)
    }

    fn grow(&mut self, size: DeviceSize) {
        if size == 0 {
            return;
        }

        self.total_size += size;
        self.free_size += size;

        let mut tail = self.head;
        while let Some(next) = self.nodes.get(tail).next {
            tail = next;
        }

        let node = *self.nodes.get(tail);
        if node.state == SegmentState::Free {
            self.nodes.get_mut(tail).size += size;
        } else {
            let new_id = self.nodes.allocate(SegmentNode {
                prev: Some(tail),
                next: None,
                offset: node.offset + node.size,
                size,
                state: SegmentState::Free,
            });
            self.nodes.get_mut(tail).next = Some(new_id);
        }
    }

    fn is_empty(&self) -> bool {
        let head = self.nodes.get(self.head);

        head.state == SegmentState::Free && head.next.is_none()
    }

    fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    fn suballocations(&self) -> Self::Suballocations<'_> {
        Suballocations {
            nodes: &self.nodes,
            cursor: Some(self.head),
        }
    }
}

/// An iterator over the segments of a [`FirstFitAllocator`], in address
/// order.
#[derive(Clone, Debug)]
pub struct Suballocations<'a> {
    nodes: &'a NodeSlab<SegmentNode>,
    cursor: Option<SlotId>,
}

impl Iterator for Suballocations<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Self::Item> {
        let node_id = self.cursor?;
        let node = self.nodes.get(node_id);
        self.cursor = node.next;

        Some(Segment {
            offset: node.offset,
            size: node.size,
            state: node.state,
        })
    }
}

mod slab {
    use std::num::NonZeroUsize;

    /// Backing store for the segment chain.
    ///
    /// The slab doesn't hand out references but rather IDs that are relative
    /// to the pool. This simplifies the chain logic because the pool can be
    /// moved and hence also resized without invalidating links, and freed
    /// slots are reused for the nodes created by later splits.
    #[derive(Debug)]
    pub(super) struct NodeSlab<T> {
        pool: Vec<T>,
        // Unsorted list of free slots.
        free_list: Vec<SlotId>,
    }

    impl<T> NodeSlab<T> {
        pub fn new(capacity: usize) -> Self {
            NodeSlab {
                pool: Vec::with_capacity(capacity),
                free_list: Vec::new(),
            }
        }

        /// Fills a slot with the provided value and returns its ID.
        pub fn allocate(&mut self, val: T) -> SlotId {
            if let Some(id) = self.free_list.pop() {
                self.pool[id.index()] = val;

                id
            } else {
                self.pool.push(val);

                // The pool is guaranteed to be non-empty after the push.
                SlotId(NonZeroUsize::new(self.pool.len()).unwrap())
            }
        }

        /// Returns the slot with the given ID to the slab to be reused.
        ///
        /// The ID must not be used to access the slot afterward.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_list.contains(&id));
            self.free_list.push(id);
        }

        pub fn get(&self, id: SlotId) -> &T {
            debug_assert!(!self.free_list.contains(&id));

            &self.pool[id.index()]
        }

        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            debug_assert!(!self.free_list.contains(&id));

            &mut self.pool[id.index()]
        }
    }

    /// ID of a slot in a `NodeSlab`. The actual index is kept private to this
    /// module to make the chain code easier to reason about.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(super) struct SlotId(NonZeroUsize);

    impl SlotId {
        fn index(self) -> usize {
            self.0.get() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks that the chain is contiguous, non-overlapping and sums to the
    /// tracked total, and returns the segments for further inspection.
    fn check_chain(allocator: &FirstFitAllocator) -> Vec<Segment> {
        let segments: Vec<_> = allocator.suballocations().collect();

        let mut expected_offset = 0;
        for segment in &segments {
            assert_eq!(segment.offset, expected_offset);
            expected_offset += segment.size;
        }
        assert_eq!(expected_offset, allocator.total_size());

        let free: DeviceSize = segments
            .iter()
            .filter(|segment| segment.state == SegmentState::Free)
            .map(|segment| segment.size)
            .sum();
        assert_eq!(free, allocator.free_size());

        segments
    }

    #[test]
    fn first_fit_takes_lowest_offset() {
        let mut allocator = FirstFitAllocator::new(1024);

        assert_eq!(allocator.allocate(128, 1).unwrap(), 0);
        assert_eq!(allocator.allocate(128, 1).unwrap(), 128);
        allocator.deallocate(0, 128).unwrap();

        // The freed hole at the start is the first fit again.
        assert_eq!(allocator.allocate(64, 1).unwrap(), 0);
        check_chain(&allocator);
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut allocator = FirstFitAllocator::new(1024);

        assert_eq!(allocator.allocate(0, 4), Err(SuballocatorError::ZeroSize));
        assert!(allocator.is_empty());
    }

    #[test]
    fn respects_alignment() {
        let mut allocator = FirstFitAllocator::new(1024);

        assert_eq!(allocator.allocate(10, 1).unwrap(), 0);

        let offset = allocator.allocate(100, 256).unwrap();
        assert_eq!(offset % 256, 0);
        assert_eq!(offset, 256);

        // Zero alignment counts as one.
        assert_eq!(allocator.allocate(6, 0).unwrap(), 10);
        check_chain(&allocator);
    }

    #[test]
    fn exact_fit_does_not_split() {
        let mut allocator = FirstFitAllocator::new(256);

        assert_eq!(allocator.allocate(256, 1).unwrap(), 0);
        assert_eq!(check_chain(&allocator).len(), 1);
        assert_eq!(
            allocator.allocate(1, 1),
            Err(SuballocatorError::OutOfRegionMemory),
        );

        allocator.deallocate(0, 256).unwrap();
        assert!(allocator.is_empty());
    }

    #[test]
    fn round_trip_restores_layout() {
        let mut allocator = FirstFitAllocator::new(1024);
        allocator.allocate(100, 1).unwrap();
        let before = check_chain(&allocator);

        let offset = allocator.allocate(200, 16).unwrap();
        assert!(offset % 16 == 0 && offset + 200 <= allocator.total_size());
        allocator.deallocate(offset, 200).unwrap();

        assert_eq!(check_chain(&allocator), before);
    }

    #[test]
    fn coalescing_is_order_independent() {
        // Free A, C, then B; the result must be a single free segment no
        // matter the order, so try every permutation.
        let permutations: &[[usize; 3]] = &[
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in permutations {
            let mut allocator = FirstFitAllocator::new(300);
            let offsets = [
                allocator.allocate(100, 1).unwrap(),
                allocator.allocate(100, 1).unwrap(),
                allocator.allocate(100, 1).unwrap(),
            ];
            assert_eq!(offsets, [0, 100, 200]);

            for &i in order {
                allocator.deallocate(offsets[i], 100).unwrap();
            }

            assert!(allocator.is_empty(), "freeing in order {order:?}");
            let segments = check_chain(&allocator);
            assert_eq!(segments.len(), 1);
            assert_eq!(segments[0].size, 300);
        }
    }

    #[test]
    fn coalescing_rescues_first_fit_from_fragmentation() {
        let mut allocator = FirstFitAllocator::new(256);

        // Exhaust the range with small blocks, free them all, and the full
        // range must be allocatable again in one piece.
        let offsets: Vec<_> = (0..16).map(|_| allocator.allocate(16, 1).unwrap()).collect();
        assert_eq!(
            allocator.allocate(1, 1),
            Err(SuballocatorError::OutOfRegionMemory),
        );

        for offset in offsets {
            allocator.deallocate(offset, 16).unwrap();
        }

        assert_eq!(allocator.allocate(256, 1).unwrap(), 0);
    }

    #[test]
    fn misuse_is_detected_without_mutation() {
        let mut allocator = FirstFitAllocator::new(1024);
        let offset = allocator.allocate(100, 1).unwrap();
        let before = check_chain(&allocator);

        // No used segment starts at offset 7.
        assert_eq!(
            allocator.deallocate(7, 4),
            Err(SuballocatorError::InvalidFree),
        );
        // Size mismatch.
        assert_eq!(
            allocator.deallocate(offset, 99),
            Err(SuballocatorError::InvalidFree),
        );
        // Offset strictly inside the used segment.
        assert_eq!(
            allocator.deallocate(offset + 1, 99),
            Err(SuballocatorError::InvalidFree),
        );
        // Past the end of the tracked range.
        assert_eq!(
            allocator.deallocate(4096, 1),
            Err(SuballocatorError::InvalidFree),
        );

        assert_eq!(check_chain(&allocator), before);

        // Double free.
        allocator.deallocate(offset, 100).unwrap();
        assert_eq!(
            allocator.deallocate(offset, 100),
            Err(SuballocatorError::InvalidFree),
        );
    }

    #[test]
    fn grow_merges_into_trailing_free_segment() {
        let mut allocator = FirstFitAllocator::new(0);
        assert!(allocator.is_empty());

        allocator.grow(100);
        assert_eq!(allocator.total_size(), 100);
        assert_eq!(check_chain(&allocator).len(), 1);

        // With a used segment at the end, growth must append a new segment.
        allocator.allocate(100, 1).unwrap();
        allocator.grow(50);
        let segments = check_chain(&allocator);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].offset, 100);
        assert_eq!(segments[1].state, SegmentState::Free);

        assert_eq!(allocator.allocate(50, 1).unwrap(), 100);
    }

    #[test]
    fn chain_invariant_survives_mixed_usage() {
        let mut allocator = FirstFitAllocator::new(1 << 16);
        let mut live = Vec::new();

        for i in 0..64u64 {
            let size = (i % 7 + 1) * 16;
            let alignment = 1 << (i % 5);
            let offset = allocator.allocate(size, alignment).unwrap();
            assert_eq!(offset % alignment, 0);
            live.push((offset, size));
            check_chain(&allocator);

            if i % 3 == 0 {
                let (offset, size) = live.swap_remove((i as usize * 7) % live.len());
                allocator.deallocate(offset, size).unwrap();
                check_chain(&allocator);
            }

            if i % 11 == 0 {
                allocator.grow(128);
                check_chain(&allocator);
            }
        }

        for (offset, size) in live {
            allocator.deallocate(offset, size).unwrap();
            check_chain(&allocator);
        }

        assert!(allocator.is_empty());
    }
}
