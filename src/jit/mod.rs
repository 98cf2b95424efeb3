//! Translated block cache for the ARM core.
//!
//! This module owns the lifecycle of translated code buffers:
//! - Guest address classification (`region`)
//! - Executable memory and the per-slot code arena (`memory`, `arena`)
//! - Dirty bitmaps over work RAM (`bitmap`)
//! - The slot table and its free list (`table`)
//! - Eviction under pressure (`eviction`)
//! - Enablement, entry and write invalidation (`cache`)
//!
//! Code generation itself is the translator's job; it talks to this module
//! through `allocate_block` / `write_block` / `bind_block`.

pub mod arena;
pub mod bitmap;
mod cache;
mod error;
pub mod eviction;
pub mod memory;
pub mod region;
pub mod table;

pub use cache::{CacheState, CpuState, Entry, GuestCpu, JitCache, JitStats};
pub use error::JitError;
pub use region::{RegionClass, classify, is_jitable};
pub use table::{BlockHandle, BlockTable, SlotIndex, SlotRecord};
