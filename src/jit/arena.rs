//! Code arena: one fixed-size executable buffer per block table slot.

use super::memory::{ExecutableMemory, MemoryError};
use super::table::SlotIndex;

/// Trap encoding written over every free buffer.
///
/// Entering a freed buffer faults immediately instead of running stale code.
#[cfg(target_arch = "x86_64")]
pub const POISON_PATTERN: &[u8] = &[0x0F, 0x0B]; // ud2
#[cfg(target_arch = "aarch64")]
pub const POISON_PATTERN: &[u8] = &[0x00, 0x00, 0x20, 0xD4]; // brk #0
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const POISON_PATTERN: &[u8] = &[0x00];

/// Fixed-capacity arena of executable buffers, index-aligned with the slot table.
pub struct CodeArena {
    memory: ExecutableMemory,
    buffer_size: usize,
    slots: usize,
}

impl CodeArena {
    /// Map `slots` buffers of `buffer_size` bytes, poison all of them and
    /// seal the mapping read/execute.
    pub fn new(slots: usize, buffer_size: usize) -> Result<Self, MemoryError> {
        let total = slots
            .checked_mul(buffer_size)
            .ok_or(MemoryError::InvalidSize)?;
        let mut memory = ExecutableMemory::new(total)?;
        memory.fill(0, total, POISON_PATTERN)?;
        memory.make_executable()?;

        Ok(Self {
            memory,
            buffer_size,
            slots,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Host address of the first byte of a slot's buffer.
    pub fn entry_ptr(&self, index: SlotIndex) -> *const u8 {
        debug_assert!(index.as_usize() < self.slots);
        // SAFETY: index < slots, so the offset stays inside the mapping.
        unsafe { self.memory.as_ptr().add(self.offset(index)) }
    }

    /// Current contents of a slot's buffer.
    pub fn buffer(&self, index: SlotIndex) -> Result<&[u8], MemoryError> {
        self.memory.bytes(self.offset(index), self.buffer_size)
    }

    /// Copy translated code into a buffer; the unused tail keeps the poison pattern.
    pub fn write(&mut self, index: SlotIndex, code: &[u8]) -> Result<(), MemoryError> {
        if code.len() > self.buffer_size {
            return Err(MemoryError::InvalidSize);
        }
        let offset = self.offset(index);
        self.memory.patch(offset, self.buffer_size, |dest| {
            dest[..code.len()].copy_from_slice(code);
            poison(&mut dest[code.len()..]);
        })
    }

    pub fn poison(&mut self, index: SlotIndex) -> Result<(), MemoryError> {
        self.memory.fill(self.offset(index), self.buffer_size, POISON_PATTERN)
    }

    /// Poison several buffers with one protection round trip over their span.
    pub fn poison_many(&mut self, indices: &[SlotIndex]) -> Result<(), MemoryError> {
        let (Some(lo), Some(hi)) = (indices.iter().min(), indices.iter().max()) else {
            return Ok(());
        };
        let base = self.offset(*lo);
        let len = self.offset(*hi) + self.buffer_size - base;
        let buffer_size = self.buffer_size;

        self.memory.patch(base, len, |span| {
            for index in indices {
                let start = index.as_usize() * buffer_size - base;
                poison(&mut span[start..start + buffer_size]);
            }
        })
    }

    fn offset(&self, index: SlotIndex) -> usize {
        index.as_usize() * self.buffer_size
    }
}

fn poison(dest: &mut [u8]) {
    for (byte, src) in dest.iter_mut().zip(POISON_PATTERN.iter().cycle()) {
        *byte = *src;
    }
}

/// True when every byte of `buf` follows the poison pattern.
pub fn is_poisoned(buf: &[u8]) -> bool {
    buf.iter()
        .zip(POISON_PATTERN.iter().cycle())
        .all(|(byte, expected)| byte == expected)
}
