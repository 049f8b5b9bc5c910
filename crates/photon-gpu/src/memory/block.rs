//! Region bookkeeping for one fixed-size memory block.
//!
//! [`MemoryBlock`] carves logical buffers out of a single `capacity`-byte range.
//! It never touches the device: the Vulkan-backed [`MemoryPool`](super::MemoryPool)
//! layers buffer creation and binding on top of it.
//!
//! # Algorithm
//!
//! Free space is kept as a vector of `{offset, length}` regions sorted by offset.
//! Two free regions are never adjacent; a deallocation that touches a free
//! neighbour is merged into it on the spot. Allocation is first-fit and carves
//! from the start of the chosen region.
//!
//! Every allocation length is rounded up to the block alignment, so every
//! offset the block hands out is a multiple of it.

use std::collections::HashMap;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::handle::{BufferHandle, HandleAllocator};

/// A contiguous byte range inside a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub length: u64,
}

impl Region {
    /// One past the last byte.
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A live buffer's placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsedRegion {
    pub offset: u64,
    pub length: u64,
    pub usage: vk::BufferUsageFlags,
}

/// A buffer moved by [`MemoryBlock::defrag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub handle: BufferHandle,
    pub old_offset: u64,
    pub new_offset: u64,
    pub length: u64,
}

/// Occupancy snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub capacity: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub largest_free_region: u64,
    pub used_regions: usize,
    pub free_regions: usize,
}

/// Sub-allocator state for one memory block.
#[derive(Clone, Debug)]
pub struct MemoryBlock {
    capacity: u64,
    alignment: u64,
    used: HashMap<BufferHandle, UsedRegion>,
    free: Vec<Region>,
    handles: HandleAllocator,
}

impl MemoryBlock {
    /// Create a block with byte granularity.
    pub fn new(capacity: u64) -> Self {
        Self::with_alignment(capacity, 1)
    }

    /// Create a block whose allocations are rounded up to `alignment` bytes.
    ///
    /// `alignment` must be a power of two.
    pub fn with_alignment(capacity: u64, alignment: u64) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "block alignment must be a power of two, got {alignment}"
        );
        let free = if capacity > 0 {
            vec![Region {
                offset: 0,
                length: capacity,
            }]
        } else {
            Vec::new()
        };
        Self {
            capacity,
            alignment,
            used: HashMap::new(),
            free,
            handles: HandleAllocator::new(),
        }
    }

    /// Total bytes managed by this block.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocation granularity.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Size an allocation of `size` bytes actually occupies, or `None` if
    /// rounding it up to the alignment overflows.
    pub fn effective_size(&self, size: u64) -> Option<u64> {
        size.checked_next_multiple_of(self.alignment)
    }

    /// Reserve `size` bytes (rounded up to the block alignment).
    ///
    /// Fails with [`GpuError::OutOfMemory`] when the block lacks the bytes
    /// altogether and with [`GpuError::Fragmented`] when the bytes exist but
    /// are split across regions, in which case [`defrag`](Self::defrag)
    /// followed by the same request succeeds.
    pub fn allocate(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<BufferHandle> {
        if size == 0 {
            return Err(GpuError::InvalidState(
                "zero-sized allocation requested".to_string(),
            ));
        }
        let Some(size) = self.effective_size(size) else {
            return Err(GpuError::OutOfMemory {
                requested: size,
                free: self.free_bytes(),
            });
        };

        let Some(index) = self.free.iter().position(|r| r.length >= size) else {
            let free = self.free_bytes();
            return Err(if free < size {
                GpuError::OutOfMemory {
                    requested: size,
                    free,
                }
            } else {
                GpuError::Fragmented {
                    requested: size,
                    free,
                    largest: self.largest_free_region(),
                }
            });
        };

        let region = &mut self.free[index];
        let offset = region.offset;
        region.offset += size;
        region.length -= size;
        if region.length == 0 {
            self.free.remove(index);
        }

        let handle = BufferHandle(self.handles.acquire());
        self.used.insert(
            handle,
            UsedRegion {
                offset,
                length: size,
                usage,
            },
        );

        tracing::trace!(%handle, offset, size, "block allocate");
        Ok(handle)
    }

    /// Release a buffer and coalesce its bytes into the free list.
    pub fn deallocate(&mut self, handle: BufferHandle) -> Result<UsedRegion> {
        let region = self
            .used
            .remove(&handle)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle} is not live in this block")))?;
        self.handles.release(handle.0);

        let freed = Region {
            offset: region.offset,
            length: region.length,
        };
        let at = self.free.partition_point(|r| r.offset < freed.offset);

        let merges_left = at > 0 && self.free[at - 1].end() == freed.offset;
        let merges_right = at < self.free.len() && freed.end() == self.free[at].offset;

        match (merges_left, merges_right) {
            (true, true) => {
                // Bridge: left absorbs the freed bytes and the right region.
                let right = self.free.remove(at);
                self.free[at - 1].length += freed.length + right.length;
            }
            (true, false) => self.free[at - 1].length += freed.length,
            (false, true) => {
                let right = &mut self.free[at];
                right.offset = freed.offset;
                right.length += freed.length;
            }
            (false, false) => self.free.insert(at, freed),
        }

        tracing::trace!(
            %handle,
            offset = region.offset,
            length = region.length,
            "block deallocate"
        );
        Ok(region)
    }

    /// Pack every live buffer towards offset 0 in ascending-offset order.
    ///
    /// Handles are unchanged; only offsets move. Afterwards the free list is a
    /// single trailing region (or empty if the block is full). Returns the
    /// buffers whose offset changed, in ascending new-offset order.
    pub fn defrag(&mut self) -> Vec<Relocation> {
        let mut order: Vec<(&BufferHandle, &mut UsedRegion)> = self.used.iter_mut().collect();
        order.sort_unstable_by_key(|(_, region)| region.offset);

        let mut cursor = 0;
        let mut moved = Vec::new();
        for (&handle, region) in order {
            if region.offset != cursor {
                moved.push(Relocation {
                    handle,
                    old_offset: region.offset,
                    new_offset: cursor,
                    length: region.length,
                });
                region.offset = cursor;
            }
            cursor += region.length;
        }

        self.free.clear();
        if cursor < self.capacity {
            self.free.push(Region {
                offset: cursor,
                length: self.capacity - cursor,
            });
        }

        tracing::debug!(relocated = moved.len(), used = cursor, "block defrag");
        moved
    }

    /// Placement of a live buffer.
    pub fn region(&self, handle: BufferHandle) -> Result<UsedRegion> {
        self.used
            .get(&handle)
            .copied()
            .ok_or_else(|| GpuError::InvalidHandle(format!("{handle} is not live in this block")))
    }

    /// Whether `handle` is live.
    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.used.contains_key(&handle)
    }

    /// Live handles in unspecified order.
    pub fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.used.keys().copied()
    }

    /// Free regions in ascending offset order.
    pub fn free_regions(&self) -> &[Region] {
        &self.free
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.length).sum()
    }

    /// Total bytes held by live buffers.
    pub fn used_bytes(&self) -> u64 {
        self.used.values().map(|r| r.length).sum()
    }

    /// Length of the largest free region.
    pub fn largest_free_region(&self) -> u64 {
        self.free.iter().map(|r| r.length).max().unwrap_or(0)
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> BlockStats {
        BlockStats {
            capacity: self.capacity,
            used_bytes: self.used_bytes(),
            free_bytes: self.free_bytes(),
            largest_free_region: self.largest_free_region(),
            used_regions: self.used.len(),
            free_regions: self.free.len(),
        }
    }

    /// Check every structural invariant of the block.
    ///
    /// Conservation of bytes, no overlap between any two regions, free list
    /// sorted and never adjacent.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(GpuError::InvalidState(msg));

        for pair in self.free.windows(2) {
            if pair[0].end() > pair[1].offset {
                return fail(format!("free regions overlap or unsorted: {pair:?}"));
            }
            if pair[0].end() == pair[1].offset {
                return fail(format!("free regions adjacent: {pair:?}"));
            }
        }
        if let Some(r) = self.free.iter().find(|r| r.length == 0) {
            return fail(format!("empty free region at {}", r.offset));
        }

        let mut all: Vec<Region> = self
            .used
            .values()
            .map(|u| Region {
                offset: u.offset,
                length: u.length,
            })
            .chain(self.free.iter().copied())
            .collect();
        all.sort_unstable_by_key(|r| r.offset);
        for pair in all.windows(2) {
            if pair[0].end() > pair[1].offset {
                return fail(format!("regions overlap: {pair:?}"));
            }
        }
        if let Some(last) = all.last() {
            if last.end() > self.capacity {
                return fail(format!("region {last:?} exceeds capacity {}", self.capacity));
            }
        }

        let total = self.used_bytes() + self.free_bytes();
        if total != self.capacity {
            return fail(format!(
                "used + free = {total} but capacity is {}",
                self.capacity
            ));
        }

        if let Some(r) = self.used.values().find(|r| r.offset % self.alignment != 0) {
            return fail(format!("misaligned region at {}", r.offset));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::STORAGE_BUFFER;

    fn region(offset: u64, length: u64) -> Region {
        Region { offset, length }
    }

    #[test]
    fn new_block_is_one_free_region() {
        let block = MemoryBlock::new(1024);
        assert_eq!(block.free_regions(), &[region(0, 1024)]);
        assert_eq!(block.used_bytes(), 0);
        block.validate().unwrap();
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let mut block = MemoryBlock::with_alignment(1024, 256);
        let err = block.allocate(u64::MAX - 10, USAGE).unwrap_err();
        match err {
            GpuError::OutOfMemory { requested, free } => {
                assert_eq!(requested, u64::MAX - 10);
                assert_eq!(free, 1024);
            }
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
        assert_eq!(block.free_regions(), &[region(0, 1024)]);
    }

    #[test]
    fn restored_snapshot_undoes_defrag() {
        let mut block = MemoryBlock::new(1024);
        let a = block.allocate(100, USAGE).unwrap();
        let b = block.allocate(100, USAGE).unwrap();
        block.deallocate(a).unwrap();

        let snapshot = block.clone();
        assert_eq!(block.defrag().len(), 1);
        assert_eq!(block.region(b).unwrap().offset, 0);

        block = snapshot;
        assert_eq!(block.region(b).unwrap().offset, 100);
        assert_eq!(block.free_regions(), &[region(0, 100), region(200, 824)]);
        block.validate().unwrap();
    }

    #[test]
    fn handle_reuse_takes_lowest_free() {
        let mut block = MemoryBlock::new(1024);
        assert_eq!(block.allocate(64, USAGE).unwrap().index(), 0);
        assert_eq!(block.allocate(64, USAGE).unwrap().index(), 1);
        assert_eq!(block.allocate(64, USAGE).unwrap().index(), 2);
        block.deallocate(BufferHandle(1)).unwrap();
        assert_eq!(block.allocate(32, USAGE).unwrap().index(), 1);
        block.validate().unwrap();
    }

    #[test]
    fn end_to_end_first_fit_scenario() {
        let mut block = MemoryBlock::new(1024);
        let h0 = block.allocate(400, USAGE).unwrap();
        let h1 = block.allocate(400, USAGE).unwrap();
        assert_eq!((h0.index(), h1.index()), (0, 1));

        let err = block.allocate(400, USAGE).unwrap_err();
        assert!(
            matches!(
                err,
                GpuError::OutOfMemory {
                    requested: 400,
                    free: 224
                }
            ),
            "unexpected error: {err}"
        );

        block.deallocate(h0).unwrap();
        assert_eq!(block.free_regions(), &[region(0, 400), region(800, 224)]);

        let h = block.allocate(224, USAGE).unwrap();
        assert_eq!(h.index(), 0);
        let placed = block.region(h).unwrap();
        assert_eq!((placed.offset, placed.length), (0, 224));
        assert_eq!(block.free_regions(), &[region(224, 176), region(800, 224)]);
        block.validate().unwrap();
    }

    #[test]
    fn exact_fit_removes_free_region() {
        let mut block = MemoryBlock::new(256);
        block.allocate(256, USAGE).unwrap();
        assert!(block.free_regions().is_empty());
        assert!(matches!(
            block.allocate(1, USAGE),
            Err(GpuError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn free_merges_left() {
        let mut block = MemoryBlock::new(300);
        let a = block.allocate(100, USAGE).unwrap();
        let b = block.allocate(100, USAGE).unwrap();
        let _c = block.allocate(100, USAGE).unwrap();
        block.deallocate(a).unwrap();
        block.deallocate(b).unwrap();
        assert_eq!(block.free_regions(), &[region(0, 200)]);
        block.validate().unwrap();
    }

    #[test]
    fn free_merges_right() {
        let mut block = MemoryBlock::new(300);
        let _a = block.allocate(100, USAGE).unwrap();
        let b = block.allocate(100, USAGE).unwrap();
        // Tail region {200, 100} is free.
        block.deallocate(b).unwrap();
        assert_eq!(block.free_regions(), &[region(100, 200)]);
        block.validate().unwrap();
    }

    #[test]
    fn free_bridges_two_regions() {
        let mut block = MemoryBlock::new(400);
        let a = block.allocate(100, USAGE).unwrap();
        let b = block.allocate(100, USAGE).unwrap();
        let c = block.allocate(100, USAGE).unwrap();
        let _d = block.allocate(100, USAGE).unwrap();
        block.deallocate(a).unwrap();
        block.deallocate(c).unwrap();
        assert_eq!(block.free_regions(), &[region(0, 100), region(200, 100)]);

        block.deallocate(b).unwrap();
        assert_eq!(block.free_regions(), &[region(0, 300)]);
        block.validate().unwrap();
    }

    #[test]
    fn free_without_neighbours_inserts_sorted() {
        let mut block = MemoryBlock::new(500);
        let handles: Vec<_> = (0..5).map(|_| block.allocate(100, USAGE).unwrap()).collect();
        block.deallocate(handles[3]).unwrap();
        block.deallocate(handles[1]).unwrap();
        assert_eq!(block.free_regions(), &[region(100, 100), region(300, 100)]);
        block.validate().unwrap();
    }

    #[test]
    fn double_free_is_invalid_handle() {
        let mut block = MemoryBlock::new(128);
        let a = block.allocate(16, USAGE).unwrap();
        block.deallocate(a).unwrap();
        let err = block.deallocate(a).unwrap_err();
        assert!(matches!(err, GpuError::InvalidHandle(ref msg) if msg.contains("buffer#0")));
        assert!(matches!(
            block.deallocate(BufferHandle(9)),
            Err(GpuError::InvalidHandle(_))
        ));
    }

    #[test]
    fn fragmented_then_defrag_then_retry() {
        let mut block = MemoryBlock::new(1000);
        let _a = block.allocate(300, USAGE).unwrap();
        let b = block.allocate(300, USAGE).unwrap();
        let _c = block.allocate(300, USAGE).unwrap();
        // B's hole {300,300} and the tail {900,100} are kept apart by C.
        block.deallocate(b).unwrap();

        let err = block.allocate(350, USAGE).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Fragmented {
                requested: 350,
                free: 400,
                largest: 300
            }
        ));

        let moved = block.defrag();
        assert_eq!(moved.len(), 1);
        assert_eq!(block.free_regions(), &[region(600, 400)]);

        let h = block.allocate(350, USAGE).unwrap();
        assert_eq!(block.region(h).unwrap().offset, 600);
        block.validate().unwrap();
    }

    #[test]
    fn defrag_keeps_handles_and_is_idempotent() {
        let mut block = MemoryBlock::new(1000);
        let hs: Vec<_> = (0..5).map(|_| block.allocate(100, USAGE).unwrap()).collect();
        block.deallocate(hs[0]).unwrap();
        block.deallocate(hs[2]).unwrap();

        block.defrag();
        let first = block.free_regions().to_vec();
        assert_eq!(first, vec![region(300, 700)]);
        for h in [hs[1], hs[3], hs[4]] {
            assert!(block.contains(h));
        }
        assert_eq!(block.region(hs[1]).unwrap().offset, 0);
        assert_eq!(block.region(hs[3]).unwrap().offset, 100);
        assert_eq!(block.region(hs[4]).unwrap().offset, 200);

        let moved = block.defrag();
        assert!(moved.is_empty());
        assert_eq!(block.free_regions(), first.as_slice());
        block.validate().unwrap();
    }

    #[test]
    fn defrag_of_full_block_leaves_no_free_region() {
        let mut block = MemoryBlock::new(200);
        block.allocate(100, USAGE).unwrap();
        block.allocate(100, USAGE).unwrap();
        assert!(block.defrag().is_empty());
        assert!(block.free_regions().is_empty());
        block.validate().unwrap();
    }

    #[test]
    fn alignment_rounds_sizes_and_offsets() {
        let mut block = MemoryBlock::with_alignment(1024, 256);
        let a = block.allocate(10, USAGE).unwrap();
        let b = block.allocate(300, USAGE).unwrap();
        assert_eq!(block.region(a).unwrap().length, 256);
        assert_eq!(block.region(b).unwrap().offset, 256);
        assert_eq!(block.region(b).unwrap().length, 512);
        assert!(matches!(
            block.allocate(257, USAGE),
            Err(GpuError::OutOfMemory { requested: 512, free: 256 })
        ));
        block.validate().unwrap();
    }

    #[test]
    fn zero_size_rejected() {
        let mut block = MemoryBlock::new(64);
        assert!(matches!(
            block.allocate(0, USAGE),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn usage_flags_are_recorded() {
        let mut block = MemoryBlock::new(64);
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        let h = block.allocate(16, usage).unwrap();
        assert_eq!(block.region(h).unwrap().usage, usage);
    }

    #[test]
    fn stats_report_largest_region() {
        let mut block = MemoryBlock::new(1000);
        let a = block.allocate(100, USAGE).unwrap();
        block.allocate(100, USAGE).unwrap();
        block.deallocate(a).unwrap();
        let stats = block.stats();
        assert_eq!(stats.used_bytes, 100);
        assert_eq!(stats.free_bytes, 900);
        assert_eq!(stats.largest_free_region, 800);
        assert_eq!(stats.free_regions, 2);
        assert_eq!(stats.used_regions, 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Alloc(u64),
            Free(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => (1u64..300).prop_map(Op::Alloc),
                2 => any::<usize>().prop_map(Op::Free),
            ]
        }

        fn run(block: &mut MemoryBlock, ops: &[Op]) -> Vec<BufferHandle> {
            let mut live = Vec::new();
            for op in ops {
                match *op {
                    Op::Alloc(size) => {
                        if let Ok(h) = block.allocate(size, USAGE) {
                            live.push(h);
                        }
                    }
                    Op::Free(pick) => {
                        if !live.is_empty() {
                            let h = live.swap_remove(pick % live.len());
                            block.deallocate(h).unwrap();
                        }
                    }
                }
                block.validate().unwrap();
            }
            live
        }

        proptest! {
            #[test]
            fn invariants_hold_after_every_call(
                ops in prop::collection::vec(op(), 1..200),
                align_shift in 0u32..5,
            ) {
                let mut block = MemoryBlock::with_alignment(4096, 1 << align_shift);
                run(&mut block, &ops);
            }

            #[test]
            fn fragmented_request_succeeds_after_defrag(
                ops in prop::collection::vec(op(), 1..200),
                request in 1u64..2048,
            ) {
                let mut block = MemoryBlock::new(2048);
                run(&mut block, &ops);
                let before: Vec<_> = block
                    .handles()
                    .map(|h| (h, block.region(h).unwrap().length))
                    .collect();

                match block.allocate(request, USAGE) {
                    Err(GpuError::Fragmented { .. }) => {
                        block.defrag();
                        block.validate().unwrap();
                        for (h, len) in &before {
                            prop_assert_eq!(block.region(*h).unwrap().length, *len);
                        }
                        prop_assert!(block.allocate(request, USAGE).is_ok());
                    }
                    Err(GpuError::OutOfMemory { requested, free }) => {
                        prop_assert!(free < requested);
                    }
                    Err(e) => prop_assert!(false, "unexpected error {e}"),
                    Ok(_) => {}
                }
                block.validate().unwrap();
            }

            #[test]
            fn defrag_twice_is_stable(ops in prop::collection::vec(op(), 1..200)) {
                let mut block = MemoryBlock::new(4096);
                run(&mut block, &ops);
                block.defrag();
                let once = block.free_regions().to_vec();
                prop_assert!(once.len() <= 1);
                prop_assert!(block.defrag().is_empty());
                prop_assert_eq!(block.free_regions(), once.as_slice());
            }
        }
    }
}
