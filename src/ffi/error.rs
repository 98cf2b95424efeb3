//! Error handling FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use super::cache_ffi::{get_wrapper, get_wrapper_mut};
use super::types::ArmJit;
use std::ffi::c_char;

/// Get the last error message.
///
/// Returns a pointer to the error message string, or NULL if no error.
/// The returned pointer is valid until the next API call that may set an error.
///
/// # Example (C)
/// ```c
/// if (armjit_free_block(jit, index) != ARMJIT_OK) {
///     printf("Error: %s\n", armjit_get_error(jit));
/// }
/// ```
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_get_error(jit: *const ArmJit) -> *const c_char {
    get_wrapper(jit)
        .and_then(|wrapper| wrapper.last_error.as_ref())
        .map_or(std::ptr::null(), |error| error.as_ptr())
}

/// Clear the last error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_clear_error(jit: *mut ArmJit) {
    if let Some(wrapper) = get_wrapper_mut(jit) {
        wrapper.clear_error();
    }
}

/// Check if there is a pending error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_has_error(jit: *const ArmJit) -> bool {
    get_wrapper(jit).is_some_and(|wrapper| wrapper.last_error.is_some())
}
