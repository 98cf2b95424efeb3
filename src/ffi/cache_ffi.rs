//! Cache lifecycle and operation FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use super::types::{ARMJIT_SLOT_NONE, ArmJit, ArmJitErrorFn, ArmJitResult, CacheWrapper};
use crate::config::{DEFAULT_BUFFER_SIZE, DEFAULT_CAPACITY, JitConfig};
use crate::jit::{CpuState, Entry, JitCache, SlotIndex, region};

/// Create a cache instance.
///
/// `capacity` and `buffer_size` of 0 select the defaults (5120 slots of
/// 1024 bytes). The arenas are not mapped until `armjit_reset()` runs with
/// the cache wanted. Returns NULL if the configuration is invalid.
/// The returned cache must be freed with `armjit_free()`.
///
/// # Example (C)
/// ```c
/// armjit *jit = armjit_new(0, 0, true);
/// armjit_reset(jit);
/// // ... run the core ...
/// armjit_free(jit);
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn armjit_new(capacity: usize, buffer_size: usize, wanted: bool) -> *mut ArmJit {
    let config = JitConfig {
        enabled: wanted,
        capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
        buffer_size: if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        },
        ..Default::default()
    };
    match JitCache::new(config) {
        Ok(cache) => Box::into_raw(Box::new(CacheWrapper::new(cache))) as *mut ArmJit,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Free a cache instance, unmapping both arenas.
///
/// # Safety
///
/// - `jit` must be a pointer returned by `armjit_new()` (or NULL)
/// - `jit` must not have been freed already
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_free(jit: *mut ArmJit) {
    if jit.is_null() {
        return;
    }
    let _ = Box::from_raw(jit as *mut CacheWrapper);
}

/// Set the error callback function (or NULL to disable).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_set_error_callback(
    jit: *mut ArmJit,
    callback: ArmJitErrorFn,
    userdata: *mut std::ffi::c_void,
) {
    if let Some(wrapper) = get_wrapper_mut(jit) {
        wrapper.error_callback = callback;
        wrapper.error_userdata = userdata;
    }
}

/// Record whether the host wants the cache; applied by `armjit_reset()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_set_wanted(jit: *mut ArmJit, wanted: bool) {
    if let Some(wrapper) = get_wrapper_mut(jit) {
        wrapper.cache.set_wanted(wanted);
    }
}

/// Reconcile the mapped state with the wanted flag.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_reset(jit: *mut ArmJit) -> ArmJitResult {
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let result = wrapper.cache.reset();
    wrapper.report(result).0
}

/// Returns true while the arenas are mapped.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_is_active(jit: *const ArmJit) -> bool {
    get_wrapper(jit).is_some_and(|wrapper| wrapper.cache.is_active())
}

/// Look up a translation for `pc`.
///
/// Returns the host entry point on a hit, NULL otherwise. After a non-NULL
/// return the host runs the code and then calls `armjit_leave()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_enter(jit: *mut ArmJit, pc: u32, thumb: bool) -> *const u8 {
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return std::ptr::null();
    };
    match wrapper.cache.enter(&CpuState { pc, thumb }) {
        Entry::Hit { code, .. } => code,
        _ => std::ptr::null(),
    }
}

/// Leave translated code. Returns true if the block invalidated itself.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_leave(jit: *mut ArmJit) -> bool {
    get_wrapper_mut(jit).is_some_and(|wrapper| wrapper.cache.leave())
}

/// Report a guest write of `size` bytes at `address`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_invalidate_memory(
    jit: *mut ArmJit,
    address: u32,
    size: u32,
) -> ArmJitResult {
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let result = wrapper.cache.invalidate_memory(address, size);
    wrapper.report(result).0
}

/// Memory wait states changed: flush every translation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_wait_state_changed(jit: *mut ArmJit) -> ArmJitResult {
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let result = wrapper.cache.wait_state_changed();
    wrapper.report(result).0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_mark_used(jit: *mut ArmJit, address: u32) {
    if let Some(wrapper) = get_wrapper_mut(jit) {
        wrapper.cache.mark_used(address);
    }
}

/// Allocate a slot for a new translation, evicting if necessary.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_allocate_block(jit: *mut ArmJit, out_index: *mut u16) -> ArmJitResult {
    if out_index.is_null() {
        return ArmJitResult::ErrorInvalidArg;
    }
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let result = wrapper.cache.allocate_block();
    let (code, index) = wrapper.report(result);
    if let Some(index) = index {
        *out_index = index.get();
    }
    code
}

/// Copy `len` bytes of translated code into a reserved or live slot.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_write_block(
    jit: *mut ArmJit,
    index: u16,
    code: *const u8,
    len: usize,
) -> ArmJitResult {
    if code.is_null() && len != 0 {
        return ArmJitResult::ErrorInvalidArg;
    }
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let bytes = if len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(code, len)
    };
    let result = wrapper.cache.write_block(SlotIndex::new(index), bytes);
    wrapper.report(result).0
}

/// Publish the guest range a reserved slot translates.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_bind_block(
    jit: *mut ArmJit,
    index: u16,
    guest_start: u32,
    guest_size: u32,
    thumb: bool,
) -> ArmJitResult {
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let result = wrapper
        .cache
        .bind_block(SlotIndex::new(index), guest_start, guest_size, thumb);
    wrapper.report(result).0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_free_block(jit: *mut ArmJit, index: u16) -> ArmJitResult {
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let result = wrapper.cache.free_block(SlotIndex::new(index));
    wrapper.report(result).0
}

/// Free a list of slots terminated by `ARMJIT_SLOT_NONE` (0xFFFF).
///
/// At most `capacity` indices are read before the terminator; a longer list
/// is rejected without freeing anything.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn armjit_free_blocks(jit: *mut ArmJit, indices: *const u16) -> ArmJitResult {
    if indices.is_null() {
        return ArmJitResult::ErrorInvalidArg;
    }
    let Some(wrapper) = get_wrapper_mut(jit) else {
        return ArmJitResult::ErrorInvalidArg;
    };
    let limit = wrapper.cache.config().capacity;

    let mut list = Vec::new();
    loop {
        let raw = *indices.add(list.len());
        if raw == ARMJIT_SLOT_NONE {
            break;
        }
        if list.len() == limit {
            wrapper.set_error("slot list is not terminated");
            return ArmJitResult::ErrorInvalidArg;
        }
        list.push(SlotIndex::new(raw));
    }

    let result = wrapper.cache.free_blocks(&list);
    wrapper.report(result).0
}

#[unsafe(no_mangle)]
pub extern "C" fn armjit_is_jitable_region(address: u32) -> bool {
    region::is_jitable(address)
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper_mut(jit: *mut ArmJit) -> Option<&'static mut CacheWrapper> {
    if jit.is_null() {
        None
    } else {
        Some(&mut *(jit as *mut CacheWrapper))
    }
}

/// Helper to get an immutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper(jit: *const ArmJit) -> Option<&'static CacheWrapper> {
    if jit.is_null() {
        None
    } else {
        Some(&*(jit as *const CacheWrapper))
    }
}
