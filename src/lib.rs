//! armjit - block cache for a dynamic recompiler of the GBA's ARM core
//!
//! This library manages the buffers a translator fills with host code: it
//! allocates them from a fixed arena, evicts the least used ones, and drops
//! translations when the guest writes over code it already translated.
//! For C/C++ embedding, use the FFI module functions.

pub mod config;
pub mod ffi;
pub mod jit;
pub mod workload;

// Re-export commonly used types
pub use config::JitConfig;
pub use jit::{CpuState, Entry, GuestCpu, JitCache, JitError, JitStats, SlotIndex};

// Re-export FFI types for C bindings
pub use ffi::*;
