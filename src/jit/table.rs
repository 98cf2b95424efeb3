//! Block table: slot metadata, the intrusive free list and the code arena.
//!
//! Every slot pairs a [`SlotRecord`] with a fixed-size buffer in the
//! [`CodeArena`]. Slots move through three states:
//!
//! - free: on the free list, `guest_start == FREE_GUEST_START`, size 0
//! - reserved: handed to the translator by [`BlockTable::allocate`], size 0
//! - live: bound to a guest range by [`BlockTable::bind`], size > 0
//!
//! Metadata lives in ordinary heap memory; only the arena is executable.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{debug, trace, warn};

use super::arena::CodeArena;
use super::bitmap::DirtyBitmaps;
use super::error::JitError;
use super::eviction;
use super::region::{self, Region, RegionClass};
use crate::config::JitConfig;

/// `guest_start` of a slot on the free list.
pub const FREE_GUEST_START: u32 = 0xFFFF_FFFF;

/// Identity of a slot: its position in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u16);

impl SlotIndex {
    pub const fn new(index: u16) -> Self {
        SlotIndex(index)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A slot index paired with the generation it was bound in.
///
/// Freeing a slot bumps its generation, so handles to the old translation
/// stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub index: SlotIndex,
    pub generation: u32,
}

/// Metadata for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    guest_start: u32,
    guest_size: u32,
    next_free: Option<SlotIndex>,
    invocations: u16,
    is_thumb: bool,
    generation: u32,
}

impl SlotRecord {
    fn free(next_free: Option<SlotIndex>) -> Self {
        Self {
            guest_start: FREE_GUEST_START,
            guest_size: 0,
            next_free,
            invocations: 0,
            is_thumb: false,
            generation: 0,
        }
    }

    pub fn guest_start(&self) -> u32 {
        self.guest_start
    }

    pub fn guest_size(&self) -> u32 {
        self.guest_size
    }

    /// Last guest address covered, inclusive of the closing byte used for overlap tests.
    pub fn guest_end(&self) -> u64 {
        u64::from(self.guest_start) + u64::from(self.guest_size)
    }

    pub fn next_free(&self) -> Option<SlotIndex> {
        self.next_free
    }

    pub fn invocations(&self) -> u16 {
        self.invocations
    }

    pub fn is_thumb(&self) -> bool {
        self.is_thumb
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_free(&self) -> bool {
        self.guest_start == FREE_GUEST_START
    }

    pub fn is_reserved(&self) -> bool {
        !self.is_free() && self.guest_size == 0
    }

    pub fn is_live(&self) -> bool {
        self.guest_size != 0
    }

    /// Closed-interval overlap with `[start, end]`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.is_live() && end >= u64::from(self.guest_start) && start <= self.guest_end()
    }
}

/// Fixed-capacity table of translated blocks.
pub struct BlockTable {
    records: Vec<SlotRecord>,
    arena: CodeArena,
    first_free: Option<SlotIndex>,
    free_count: usize,
    bitmaps: DirtyBitmaps,
    entries: HashMap<(u32, bool), SlotIndex>,
    eviction_batch: usize,
    sweeps: u64,
    evicted: u64,
}

impl BlockTable {
    /// Map both arenas and link every slot into the free list in index order.
    pub fn new(config: &JitConfig) -> Result<Self, JitError> {
        config.validate()?;
        let capacity = config.capacity;

        let records = (0..capacity)
            .map(|i| {
                let next = i + 1;
                SlotRecord::free((next < capacity).then(|| SlotIndex::new(next as u16)))
            })
            .collect();
        let arena = CodeArena::new(capacity, config.buffer_size)?;

        debug!(
            capacity,
            buffer_size = config.buffer_size,
            eviction_batch = config.eviction_batch(),
            "block table mapped"
        );

        Ok(Self {
            records,
            arena,
            first_free: Some(SlotIndex::new(0)),
            free_count: capacity,
            bitmaps: DirtyBitmaps::new(config.buffer_size),
            entries: HashMap::new(),
            eviction_batch: config.eviction_batch(),
            sweeps: 0,
            evicted: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.arena.buffer_size()
    }

    pub fn eviction_batch(&self) -> usize {
        self.eviction_batch
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_live()).count()
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn first_free(&self) -> Option<SlotIndex> {
        self.first_free
    }

    pub fn records(&self) -> &[SlotRecord] {
        &self.records
    }

    pub fn record(&self, index: SlotIndex) -> Option<&SlotRecord> {
        self.records.get(index.as_usize())
    }

    pub fn bitmaps(&self) -> &DirtyBitmaps {
        &self.bitmaps
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    /// Walk the free list from its head.
    ///
    /// The walk stops after `capacity` steps, so a corrupted chain cannot
    /// loop forever.
    pub fn free_list(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        let mut cursor = self.first_free;
        std::iter::from_fn(move || {
            let index = cursor?;
            cursor = self.records.get(index.as_usize()).and_then(|r| r.next_free);
            Some(index)
        })
        .take(self.records.len())
    }

    fn check_index(&self, index: SlotIndex) -> Result<(), JitError> {
        if index.as_usize() < self.records.len() {
            Ok(())
        } else {
            Err(JitError::InvalidSlot(u32::from(index.get())))
        }
    }

    fn pop_free(&mut self) -> Option<SlotIndex> {
        let index = self.first_free?;
        let record = &mut self.records[index.as_usize()];
        self.first_free = record.next_free.take();
        // Clearing the sentinel moves the slot from free to reserved.
        record.guest_start = 0;
        self.free_count -= 1;
        Some(index)
    }

    /// Hand out a free slot, running one eviction sweep if none is left.
    ///
    /// Only fails if the mapping cannot be re-protected, or if every slot is
    /// reserved and none is live to evict.
    pub fn allocate(&mut self) -> Result<SlotIndex, JitError> {
        if let Some(index) = self.pop_free() {
            return Ok(index);
        }
        self.sweep()?;
        self.pop_free().ok_or(JitError::Exhausted)
    }

    /// Publish a reserved slot's guest range and make it findable.
    pub fn bind(
        &mut self,
        index: SlotIndex,
        guest_start: u32,
        guest_size: u32,
        is_thumb: bool,
    ) -> Result<BlockHandle, JitError> {
        self.check_index(index)?;
        if !self.records[index.as_usize()].is_reserved() {
            return Err(JitError::NotReserved(index));
        }
        let invalid_range = JitError::InvalidRange {
            start: guest_start,
            size: guest_size,
        };
        let Some(last) = guest_size
            .checked_sub(1)
            .and_then(|len| guest_start.checked_add(len))
        else {
            return Err(invalid_range);
        };
        let start_region = Region::of(guest_start);
        if start_region.class() == RegionClass::NotJitable || Region::of(last) != start_region {
            return Err(invalid_range);
        }

        let start = region::canonicalize(guest_start);
        let record = &mut self.records[index.as_usize()];
        record.guest_start = start;
        record.guest_size = guest_size;
        record.is_thumb = is_thumb;
        record.invocations = 0;
        let handle = BlockHandle {
            index,
            generation: record.generation,
        };

        self.bitmaps.mark_range(start, guest_size);
        let replaced = self.entries.insert((start, is_thumb), index);
        if let Some(previous) = replaced.filter(|&previous| previous != index) {
            // The older translation is unreachable now; give its slot back.
            trace!(%previous, %index, start = format_args!("{:#010x}", start), "entry replaced");
            self.release(previous);
            self.arena.poison(previous)?;
            self.rebuild_bitmaps();
        }
        Ok(handle)
    }

    /// Copy translated code into a reserved or live slot's buffer.
    pub fn write_code(&mut self, index: SlotIndex, code: &[u8]) -> Result<(), JitError> {
        self.check_index(index)?;
        if self.records[index.as_usize()].is_free() {
            return Err(JitError::NotReserved(index));
        }
        if code.len() > self.arena.buffer_size() {
            return Err(JitError::CodeTooLarge {
                len: code.len(),
                capacity: self.arena.buffer_size(),
            });
        }
        self.arena.write(index, code)?;
        Ok(())
    }

    /// Live slot translated for `address` in the given mode.
    pub fn lookup(&self, address: u32, is_thumb: bool) -> Option<SlotIndex> {
        self.entries
            .get(&(region::canonicalize(address), is_thumb))
            .copied()
    }

    pub fn handle(&self, index: SlotIndex) -> Option<BlockHandle> {
        let record = self.record(index)?;
        record.is_live().then_some(BlockHandle {
            index,
            generation: record.generation,
        })
    }

    /// Host entry point for a handle, if its translation is still live.
    pub fn entry_point(&self, handle: BlockHandle) -> Option<*const u8> {
        let record = self.record(handle.index)?;
        (record.is_live() && record.generation == handle.generation)
            .then(|| self.arena.entry_ptr(handle.index))
    }

    pub fn record_invocation(&mut self, index: SlotIndex) {
        if let Some(record) = self.records.get_mut(index.as_usize()) {
            record.invocations = record.invocations.saturating_add(1);
        }
    }

    /// Return one slot to the free list and rebuild the bitmaps.
    pub fn free(&mut self, index: SlotIndex) -> Result<(), JitError> {
        self.check_index(index)?;
        if self.records[index.as_usize()].is_free() {
            warn!(%index, "double free rejected");
            return Err(JitError::DoubleFree(index));
        }
        self.release(index);
        self.arena.poison(index)?;
        self.rebuild_bitmaps();
        Ok(())
    }

    /// Free a batch of slots with a single bitmap rebuild.
    ///
    /// The whole batch is validated before anything is freed: an
    /// out-of-range index, a free slot, or a repeated index rejects the call
    /// and leaves the table untouched.
    pub fn free_many(&mut self, indices: &[SlotIndex]) -> Result<usize, JitError> {
        let mut seen = HashSet::with_capacity(indices.len());
        for &index in indices {
            self.check_index(index)?;
            if self.records[index.as_usize()].is_free() || !seen.insert(index) {
                warn!(%index, "double free rejected");
                return Err(JitError::DoubleFree(index));
            }
        }
        if indices.is_empty() {
            return Ok(0);
        }

        for &index in indices {
            self.release(index);
        }
        self.arena.poison_many(indices)?;
        self.rebuild_bitmaps();
        Ok(indices.len())
    }

    /// Metadata half of a free: unlink the entry, push onto the free list.
    fn release(&mut self, index: SlotIndex) {
        let record = &mut self.records[index.as_usize()];
        if record.is_live() {
            let key = (record.guest_start, record.is_thumb);
            if self.entries.get(&key) == Some(&index) {
                self.entries.remove(&key);
            }
        }
        trace!(
            %index,
            start = format_args!("{:#010x}", record.guest_start),
            size = record.guest_size,
            "slot freed"
        );

        record.guest_start = FREE_GUEST_START;
        record.guest_size = 0;
        record.invocations = 0;
        record.is_thumb = false;
        record.generation = record.generation.wrapping_add(1);
        record.next_free = self.first_free;
        self.first_free = Some(index);
        self.free_count += 1;
    }

    /// Free the least-invoked live slots and age every counter.
    pub fn sweep(&mut self) -> Result<usize, JitError> {
        let candidates = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_live())
            .map(|(i, r)| (SlotIndex::new(i as u16), r.invocations));
        let victims = eviction::select_victims(candidates, self.eviction_batch);

        for record in &mut self.records {
            record.invocations = 0;
        }
        let freed = self.free_many(&victims)?;

        self.sweeps += 1;
        self.evicted += freed as u64;
        debug!(freed, sweep = self.sweeps, "eviction sweep");
        Ok(freed)
    }

    /// Live slots whose closed guest interval meets `[start, end]`.
    pub fn overlapping(&self, start: u64, end: u64) -> Vec<SlotIndex> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.overlaps(start, end))
            .map(|(i, _)| SlotIndex::new(i as u16))
            .collect()
    }

    /// Recompute the dirty bitmaps from the surviving live slots.
    pub fn rebuild_bitmaps(&mut self) {
        self.bitmaps.clear();
        for record in self.records.iter().filter(|r| r.is_live()) {
            self.bitmaps.mark_range(record.guest_start, record.guest_size);
        }
    }

    pub fn mark_used(&mut self, address: u32) {
        self.bitmaps.mark_used(region::canonicalize(address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::arena::is_poisoned;

    fn table(capacity: usize, buffer_size: usize) -> BlockTable {
        BlockTable::new(&JitConfig {
            capacity,
            buffer_size,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_new_table_links_in_index_order() {
        let table = table(4, 16);
        let order: Vec<u16> = table.free_list().map(|i| i.get()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(table.free_count(), 4);
        assert!(table.records().iter().all(|r| r.is_free()));
    }

    #[test]
    fn test_allocate_reserves_slot() {
        let mut table = table(4, 16);
        let slot = table.allocate().unwrap();
        assert_eq!(slot, SlotIndex::new(0));
        let record = table.record(slot).unwrap();
        assert!(record.is_reserved());
        assert!(!record.is_free());
        assert_eq!(table.free_count(), 3);
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut table = table(4, 16);
        let slot = table.allocate().unwrap();
        let handle = table.bind(slot, 0x0200_0100, 32, true).unwrap();

        assert_eq!(table.lookup(0x0200_0100, true), Some(slot));
        assert_eq!(table.lookup(0x0204_0100, true), Some(slot));
        assert_eq!(table.lookup(0x0200_0100, false), None);
        assert!(table.entry_point(handle).is_some());
        assert!(table.bitmaps().is_marked(0x0200_0100));
    }

    #[test]
    fn test_rebind_same_entry_frees_older_block() {
        let mut table = table(4, 16);
        let a = table.allocate().unwrap();
        let old = table.bind(a, 0x0200_0100, 32, true).unwrap();
        let b = table.allocate().unwrap();
        // A mirror of the same address is the same entry.
        table.bind(b, 0x0204_0100, 16, true).unwrap();

        assert!(table.record(a).unwrap().is_free());
        assert!(table.entry_point(old).is_none());
        assert_eq!(table.lookup(0x0200_0100, true), Some(b));
        assert_eq!(table.free_count(), 3);
        assert!(is_poisoned(table.arena().buffer(a).unwrap()));

        // Once the replacement goes, nothing is left behind.
        table.free(b).unwrap();
        assert_eq!(table.lookup(0x0200_0100, true), None);
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.bitmaps().marked_granules(), 0);
    }

    #[test]
    fn test_bind_other_mode_keeps_both() {
        let mut table = table(4, 16);
        let arm = table.allocate().unwrap();
        table.bind(arm, 0x0800_0000, 16, false).unwrap();
        let thumb = table.allocate().unwrap();
        table.bind(thumb, 0x0800_0000, 16, true).unwrap();
        assert_eq!(table.lookup(0x0800_0000, false), Some(arm));
        assert_eq!(table.lookup(0x0800_0000, true), Some(thumb));
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_bind_rejects_bad_ranges() {
        let mut table = table(4, 16);
        let slot = table.allocate().unwrap();
        assert!(matches!(
            table.bind(slot, 0x0200_0000, 0, false),
            Err(JitError::InvalidRange { .. })
        ));
        assert!(matches!(
            table.bind(slot, 0x0400_0000, 4, false),
            Err(JitError::InvalidRange { .. })
        ));
        assert!(matches!(
            table.bind(slot, 0x02FF_FFFC, 8, false),
            Err(JitError::InvalidRange { .. })
        ));
        assert!(matches!(
            table.bind(SlotIndex::new(1), 0x0200_0000, 4, false),
            Err(JitError::NotReserved(_))
        ));
    }

    #[test]
    fn test_free_poisons_and_stales_handle() {
        let mut table = table(4, 16);
        let slot = table.allocate().unwrap();
        table.write_code(slot, &[0x90, 0x90, 0xC3]).unwrap();
        let handle = table.bind(slot, 0x0800_0000, 16, false).unwrap();
        assert!(!is_poisoned(table.arena().buffer(slot).unwrap()));

        table.free(slot).unwrap();
        assert!(is_poisoned(table.arena().buffer(slot).unwrap()));
        assert!(table.entry_point(handle).is_none());
        assert_eq!(table.lookup(0x0800_0000, false), None);
        assert_eq!(table.first_free(), Some(slot));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut table = table(4, 16);
        let slot = table.allocate().unwrap();
        table.free(slot).unwrap();
        assert!(matches!(table.free(slot), Err(JitError::DoubleFree(_))));
        assert_eq!(table.free_list().count(), 4);
    }

    #[test]
    fn test_free_many_is_atomic() {
        let mut table = table(4, 16);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert!(matches!(
            table.free_many(&[a, b, a]),
            Err(JitError::DoubleFree(_))
        ));
        assert_eq!(table.free_count(), 2);
        assert!(matches!(
            table.free_many(&[a, SlotIndex::new(9)]),
            Err(JitError::InvalidSlot(9))
        ));
        assert_eq!(table.free_many(&[a, b]).unwrap(), 2);
        assert_eq!(table.free_count(), 4);
    }

    #[test]
    fn test_allocate_sweeps_when_full() {
        let mut table = table(4, 16);
        for i in 0..4u32 {
            let slot = table.allocate().unwrap();
            table.bind(slot, i * 16, 16, false).unwrap();
        }
        assert_eq!(table.free_count(), 0);

        let slot = table.allocate().unwrap();
        assert_eq!(table.sweeps(), 1);
        assert_eq!(table.evicted(), 2);
        assert_eq!(table.free_count(), 1);
        assert!(table.record(slot).unwrap().is_reserved());
    }

    #[test]
    fn test_all_reserved_is_exhausted() {
        let mut table = table(2, 16);
        table.allocate().unwrap();
        table.allocate().unwrap();
        assert!(matches!(table.allocate(), Err(JitError::Exhausted)));
    }

    #[test]
    fn test_write_code_limits() {
        let mut table = table(2, 16);
        assert!(matches!(
            table.write_code(SlotIndex::new(0), &[0; 4]),
            Err(JitError::NotReserved(_))
        ));
        let slot = table.allocate().unwrap();
        assert!(matches!(
            table.write_code(slot, &[0; 17]),
            Err(JitError::CodeTooLarge { len: 17, capacity: 16 })
        ));
    }

    #[test]
    fn test_invocations_saturate() {
        let mut table = table(2, 16);
        let slot = table.allocate().unwrap();
        table.bind(slot, 0x0300_0000, 4, false).unwrap();
        for _ in 0..70_000 {
            table.record_invocation(slot);
        }
        assert_eq!(table.record(slot).unwrap().invocations(), u16::MAX);
    }

    #[test]
    fn test_overlapping_uses_closed_intervals() {
        let mut table = table(4, 16);
        let a = table.allocate().unwrap();
        table.bind(a, 0, 16, false).unwrap();
        let b = table.allocate().unwrap();
        table.bind(b, 16, 16, false).unwrap();

        assert_eq!(table.overlapping(20, 28), vec![b]);
        assert_eq!(table.overlapping(16, 16), vec![a, b]);
        assert_eq!(table.overlapping(33, 40), Vec::<SlotIndex>::new());
    }
}
