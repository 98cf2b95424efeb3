//! FFI type definitions for the C API.

use std::ffi::c_char;

use crate::jit::{JitCache, JitError};

/// Slot list terminator accepted by `armjit_free_blocks`.
pub const ARMJIT_SLOT_NONE: u16 = u16::MAX;

/// Result codes for FFI operations.
///
/// These map to the `armjit_result` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmJitResult {
    /// Operation succeeded
    Ok = 0,
    /// The cache is disabled
    ErrorInactive = 1,
    /// Invalid argument passed to function
    ErrorInvalidArg = 2,
    /// Slot was already free
    ErrorDoubleFree = 3,
    /// Mapping or protecting executable memory failed
    ErrorMemory = 4,
    /// Configuration rejected
    ErrorConfig = 5,
    /// Every slot is reserved by the translator
    ErrorExhausted = 6,
}

impl ArmJitResult {
    pub fn is_ok(self) -> bool {
        self == ArmJitResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != ArmJitResult::Ok
    }
}

impl From<&JitError> for ArmJitResult {
    fn from(err: &JitError) -> Self {
        match err {
            JitError::Inactive => ArmJitResult::ErrorInactive,
            JitError::DoubleFree(_) => ArmJitResult::ErrorDoubleFree,
            JitError::Memory(_) => ArmJitResult::ErrorMemory,
            JitError::InvalidConfig(_) | JitError::Config(_) => ArmJitResult::ErrorConfig,
            JitError::Exhausted => ArmJitResult::ErrorExhausted,
            JitError::InvalidSlot(_)
            | JitError::NotReserved(_)
            | JitError::InvalidRange { .. }
            | JitError::CodeTooLarge { .. } => ArmJitResult::ErrorInvalidArg,
        }
    }
}

/// Error callback function type.
///
/// Called when an error occurs, with the error message and user data.
pub type ArmJitErrorFn =
    Option<unsafe extern "C" fn(message: *const c_char, userdata: *mut std::ffi::c_void)>;

/// Opaque cache instance type.
///
/// All operations require a valid `ArmJit` pointer created by `armjit_new()`.
#[repr(C)]
pub struct ArmJit {
    _private: [u8; 0],
}

/// Internal wrapper that holds the Rust cache and FFI state.
pub(crate) struct CacheWrapper {
    pub cache: JitCache,
    /// Last error message (as CString for FFI compatibility)
    pub last_error: Option<std::ffi::CString>,
    pub error_callback: ArmJitErrorFn,
    pub error_userdata: *mut std::ffi::c_void,
}

impl CacheWrapper {
    pub fn new(cache: JitCache) -> Self {
        Self {
            cache,
            last_error: None,
            error_callback: None,
            error_userdata: std::ptr::null_mut(),
        }
    }

    /// Set an error message and optionally call the error callback.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let msg = message.into();
        let c_msg = std::ffi::CString::new(msg).unwrap_or_default();

        if let Some(callback) = self.error_callback {
            unsafe {
                callback(c_msg.as_ptr(), self.error_userdata);
            }
        }

        self.last_error = Some(c_msg);
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Convert a cache result into a result code, recording any error.
    pub fn report<T>(&mut self, result: Result<T, JitError>) -> (ArmJitResult, Option<T>) {
        match result {
            Ok(value) => (ArmJitResult::Ok, Some(value)),
            Err(err) => {
                let code = ArmJitResult::from(&err);
                self.set_error(err.to_string());
                (code, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::jit::SlotIndex;

    fn wrapper() -> CacheWrapper {
        CacheWrapper::new(JitCache::new(JitConfig::default()).unwrap())
    }

    #[test]
    fn test_result_codes() {
        assert!(ArmJitResult::Ok.is_ok());
        assert!(!ArmJitResult::Ok.is_err());
        assert!(ArmJitResult::ErrorMemory.is_err());
        assert_eq!(
            ArmJitResult::from(&JitError::DoubleFree(SlotIndex::new(3))),
            ArmJitResult::ErrorDoubleFree
        );
        assert_eq!(
            ArmJitResult::from(&JitError::CodeTooLarge { len: 2, capacity: 1 }),
            ArmJitResult::ErrorInvalidArg
        );
    }

    #[test]
    fn test_report_records_error() {
        let mut wrapper = wrapper();
        let (code, value) = wrapper.report::<()>(Err(JitError::Inactive));
        assert_eq!(code, ArmJitResult::ErrorInactive);
        assert!(value.is_none());
        assert_eq!(
            wrapper.last_error.as_ref().unwrap().to_str().unwrap(),
            "jit cache is not active"
        );
        wrapper.clear_error();
        assert!(wrapper.last_error.is_none());
    }
}
