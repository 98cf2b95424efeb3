//! Error types for the block cache.

use super::memory::MemoryError;
use super::table::SlotIndex;

/// Errors surfaced by the block cache and its configuration layer.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// The configuration cannot produce a working arena.
    #[error("invalid jit configuration: {0}")]
    InvalidConfig(String),

    /// A config file could not be read or parsed.
    #[error("failed to load jit configuration: {0}")]
    Config(String),

    /// The slot was already on the free list.
    #[error("slot {0} is already free")]
    DoubleFree(SlotIndex),

    /// The index is outside the table.
    #[error("slot index {0} is out of range")]
    InvalidSlot(u32),

    /// The slot must be allocated but not yet bound for this operation.
    #[error("slot {0} is not reserved")]
    NotReserved(SlotIndex),

    /// The guest range is empty, not jitable, or crosses a region boundary.
    #[error("guest range {start:#010x}+{size} cannot be cached")]
    InvalidRange { start: u32, size: u32 },

    /// Every slot is reserved by the translator; nothing can be evicted.
    #[error("every slot is reserved, nothing to evict")]
    Exhausted,

    /// Translated code does not fit in one executable buffer.
    #[error("translated code is {len} bytes but buffers hold {capacity}")]
    CodeTooLarge { len: usize, capacity: usize },

    /// The block table is not mapped.
    #[error("jit cache is not active")]
    Inactive,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
