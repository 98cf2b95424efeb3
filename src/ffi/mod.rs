//! C FFI for embedding the block cache
//!
//! This module provides a C-compatible API for hosting the cache inside an
//! emulator core written in C. All public functions use `extern "C"` ABI.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Valid cache instances created by `armjit_new()`
//! - Proper lifetime management (the cache must outlive all operations)

mod cache_ffi;
mod error;
mod types;

// Re-export all FFI types and functions for public use
#[allow(unused_imports)]
pub use cache_ffi::*;
#[allow(unused_imports)]
pub use error::*;
#[allow(unused_imports)]
pub use types::*;

/// Version information
pub const ARMJIT_VERSION_MAJOR: u32 = 0;
pub const ARMJIT_VERSION_MINOR: u32 = 1;
pub const ARMJIT_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn armjit_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}

/// Get the major version number
#[unsafe(no_mangle)]
pub extern "C" fn armjit_version_major() -> u32 {
    ARMJIT_VERSION_MAJOR
}

/// Get the minor version number
#[unsafe(no_mangle)]
pub extern "C" fn armjit_version_minor() -> u32 {
    ARMJIT_VERSION_MINOR
}

/// Get the patch version number
#[unsafe(no_mangle)]
pub extern "C" fn armjit_version_patch() -> u32 {
    ARMJIT_VERSION_PATCH
}
