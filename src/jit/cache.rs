//! The block cache context: enablement, entry, and write invalidation.
//!
//! [`JitCache`] is owned by the CPU core. The CPU step loop calls
//! [`JitCache::enter`] on instruction fetch, the memory subsystem calls
//! [`JitCache::invalidate_memory`] on every guest store, and the host
//! toggles the cache through [`JitCache::set_wanted`] + [`JitCache::reset`].

use serde::Serialize;
use tracing::{debug, info};

use super::error::JitError;
use super::region::{self, Region, RegionClass};
use super::table::{BlockHandle, BlockTable, SlotIndex};
use crate::config::JitConfig;

/// Read-only view of the guest CPU needed to pick a translation.
pub trait GuestCpu {
    /// Address of the next instruction to execute.
    fn pc(&self) -> u32;
    /// Whether the CPU is decoding 16-bit Thumb instructions.
    fn is_thumb(&self) -> bool;
}

/// Minimal [`GuestCpu`] for hosts that keep their state elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuState {
    pub pc: u32,
    pub thumb: bool,
}

impl GuestCpu for CpuState {
    fn pc(&self) -> u32 {
        self.pc
    }

    fn is_thumb(&self) -> bool {
        self.thumb
    }
}

/// Whether the arenas are currently mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    Disabled,
    Enabled,
}

/// Outcome of [`JitCache::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// The cache is not active.
    Disabled,
    /// The program counter is outside every jitable region.
    NotJitable,
    /// A translated block is already executing.
    Reentrant,
    /// No translation for this address and mode yet.
    Miss,
    /// A live translation; the caller dispatches to `code` and then calls
    /// [`JitCache::leave`].
    Hit {
        handle: BlockHandle,
        code: *const u8,
    },
}

/// Counters accumulated across enable/disable cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub allocations: u64,
    pub sweeps: u64,
    pub evicted: u64,
    pub invalidations: u64,
    pub fast_path_skips: u64,
    pub full_scans: u64,
    pub invalidated_blocks: u64,
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
}

/// Block cache owned by one emulated CPU.
pub struct JitCache {
    config: JitConfig,
    wanted: bool,
    table: Option<BlockTable>,
    executing: Option<BlockHandle>,
    /// The table was torn down under an executing block.
    flushed_while_entered: bool,
    stats: JitStats,
}

impl JitCache {
    /// Validate `config`; the arenas are mapped by the first [`reset`](Self::reset)
    /// that finds the cache wanted.
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        config.validate()?;
        Ok(Self {
            wanted: config.enabled,
            config,
            table: None,
            executing: None,
            flushed_while_entered: false,
            stats: JitStats::default(),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn is_wanted(&self) -> bool {
        self.wanted
    }

    pub fn is_active(&self) -> bool {
        self.table.is_some()
    }

    pub fn is_entered(&self) -> bool {
        self.executing.is_some()
    }

    pub fn state(&self) -> CacheState {
        if self.is_active() {
            CacheState::Enabled
        } else {
            CacheState::Disabled
        }
    }

    pub fn table(&self) -> Option<&BlockTable> {
        self.table.as_ref()
    }

    fn table_mut(&mut self) -> Result<&mut BlockTable, JitError> {
        self.table.as_mut().ok_or(JitError::Inactive)
    }

    pub fn stats(&self) -> JitStats {
        let mut stats = self.stats.clone();
        if let Some(table) = &self.table {
            stats.sweeps += table.sweeps();
            stats.evicted += table.evicted();
        }
        stats
    }

    /// Record the host's intent; takes effect on the next [`reset`](Self::reset).
    pub fn set_wanted(&mut self, wanted: bool) {
        self.wanted = wanted;
    }

    /// Drive at most one enable/disable transition toward `wanted`.
    pub fn reset(&mut self) -> Result<(), JitError> {
        match (self.wanted, self.is_active()) {
            (true, false) => {
                // A fresh table starts with every slot free and clean bitmaps.
                self.table = Some(BlockTable::new(&self.config)?);
                info!(
                    capacity = self.config.capacity,
                    buffer_size = self.config.buffer_size,
                    "jit cache enabled"
                );
            }
            (false, true) => {
                self.teardown();
                info!("jit cache disabled");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn reset_to(&mut self, wanted: bool) -> Result<(), JitError> {
        self.set_wanted(wanted);
        self.reset()
    }

    fn teardown(&mut self) {
        if let Some(table) = self.table.take() {
            self.stats.sweeps += table.sweeps();
            self.stats.evicted += table.evicted();
        }
        if self.executing.take().is_some() {
            self.flushed_while_entered = true;
        }
    }

    /// Memory timing changed: every translation may bake in stale cycle
    /// counts, so drop the arenas and rebuild them.
    pub fn wait_state_changed(&mut self) -> Result<(), JitError> {
        if self.is_active() {
            self.teardown();
            self.stats.flushes += 1;
            debug!("wait states changed, cache flushed");
        }
        self.reset()
    }

    /// Look up a translation for the CPU's current fetch address.
    ///
    /// On a hit the block's invocation counter is bumped and the cache is
    /// marked entered until [`leave`](Self::leave).
    pub fn enter<C: GuestCpu + ?Sized>(&mut self, cpu: &C) -> Entry {
        let Some(table) = self.table.as_mut() else {
            return Entry::Disabled;
        };
        if self.executing.is_some() {
            return Entry::Reentrant;
        }
        let pc = cpu.pc();
        if !region::is_jitable(pc) {
            return Entry::NotJitable;
        }

        let handle = table
            .lookup(pc, cpu.is_thumb())
            .and_then(|index| table.handle(index));
        match handle.and_then(|h| table.entry_point(h).map(|code| (h, code))) {
            Some((handle, code)) => {
                table.record_invocation(handle.index);
                self.executing = Some(handle);
                self.flushed_while_entered = false;
                self.stats.hits += 1;
                Entry::Hit { handle, code }
            }
            None => {
                self.stats.misses += 1;
                Entry::Miss
            }
        }
    }

    /// Clear the reentrancy guard after translated code returns.
    ///
    /// Returns `true` if the block that was executing got invalidated while
    /// it ran (self-modifying code, or a flush or disable from inside the
    /// block), in which case the CPU must refetch.
    pub fn leave(&mut self) -> bool {
        let Some(handle) = self.executing.take() else {
            // A rebuilt table may reuse the slot and generation, so the
            // handle cannot be checked against it.
            return std::mem::take(&mut self.flushed_while_entered);
        };
        self.table
            .as_ref()
            .is_none_or(|table| table.entry_point(handle).is_none())
    }

    /// Fast negative check: `true` means a write of `size` bytes at
    /// `address` cannot touch any live translation.
    pub fn quick_invalid_check(&self, address: u32, size: u32) -> bool {
        // A write spilling into the next region needs that region's bits too.
        if Region::of(address.saturating_add(size)) != Region::of(address) {
            return false;
        }
        self.table.as_ref().is_some_and(|table| {
            table
                .bitmaps()
                .quick_invalid_check(region::canonicalize(address), size)
        })
    }

    /// Free every translation whose guest range meets the closed interval
    /// `[address, address + size]`. Returns the number of slots freed.
    ///
    /// Writes outside jitable memory, or while the cache is inactive, are no-ops.
    pub fn invalidate_memory(&mut self, address: u32, size: u32) -> Result<usize, JitError> {
        if self.table.is_none() {
            return Ok(0);
        }
        self.stats.invalidations += 1;

        // Split at 16 MiB region boundaries so each piece has one class.
        let end = (u64::from(address) + u64::from(size)).min(u64::from(u32::MAX));
        let mut start = u64::from(address);
        let mut freed = 0;
        loop {
            let piece_end = (start | 0x00FF_FFFF).min(end);
            freed += self.invalidate_piece(start as u32, (piece_end - start) as u32)?;
            if piece_end >= end {
                break;
            }
            start = piece_end + 1;
        }

        if freed > 0 {
            debug!(
                address = format_args!("{:#010x}", address),
                size, freed, "invalidated translations"
            );
        }
        Ok(freed)
    }

    fn invalidate_piece(&mut self, address: u32, size: u32) -> Result<usize, JitError> {
        let Some(table) = self.table.as_mut() else {
            return Ok(0);
        };

        let victims = match region::classify(address) {
            RegionClass::NotJitable => return Ok(0),
            RegionClass::ReadOnlyJitable => {
                let start = u64::from(address);
                table.overlapping(start, start + u64::from(size))
            }
            RegionClass::WritableJitable => {
                let start = region::canonicalize(address);
                if table.bitmaps().quick_invalid_check(start, size) {
                    self.stats.fast_path_skips += 1;
                    return Ok(0);
                }
                let Some((base, mask)) = Region::of(start).tracked_span() else {
                    return Ok(0);
                };
                let region_last = u64::from(base | mask);
                let mirror = u64::from(mask) + 1;
                let start = u64::from(start);
                let end = start + u64::from(size);
                let mut victims = table.overlapping(start, end);
                // Blocks that run past the region end continue into the next mirror.
                let mut extra = table.overlapping(start + mirror, end + mirror);
                if end > region_last {
                    // The write wraps onto the next mirror, i.e. the region's start.
                    let wrapped = u64::from(base) + (end - region_last - 1);
                    extra.extend(table.overlapping(u64::from(base), wrapped));
                }
                for index in extra {
                    if !victims.contains(&index) {
                        victims.push(index);
                    }
                }
                victims
            }
        };
        self.stats.full_scans += 1;

        let freed = table.free_many(&victims)?;
        self.stats.invalidated_blocks += freed as u64;
        Ok(freed)
    }

    /// Note that a translation covers `address`.
    pub fn mark_used(&mut self, address: u32) {
        if let Some(table) = self.table.as_mut() {
            table.mark_used(address);
        }
    }

    pub fn allocate_block(&mut self) -> Result<SlotIndex, JitError> {
        let index = self.table_mut()?.allocate()?;
        self.stats.allocations += 1;
        Ok(index)
    }

    pub fn free_block(&mut self, index: SlotIndex) -> Result<(), JitError> {
        self.table_mut()?.free(index)
    }

    pub fn free_blocks(&mut self, indices: &[SlotIndex]) -> Result<usize, JitError> {
        self.table_mut()?.free_many(indices)
    }

    pub fn write_block(&mut self, index: SlotIndex, code: &[u8]) -> Result<(), JitError> {
        self.table_mut()?.write_code(index, code)
    }

    pub fn bind_block(
        &mut self,
        index: SlotIndex,
        guest_start: u32,
        guest_size: u32,
        is_thumb: bool,
    ) -> Result<BlockHandle, JitError> {
        self.table_mut()?
            .bind(index, guest_start, guest_size, is_thumb)
    }

    pub fn lookup(&self, address: u32, is_thumb: bool) -> Option<SlotIndex> {
        self.table.as_ref()?.lookup(address, is_thumb)
    }
}
