//! Block cache configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::jit::JitError;

/// Total cacheable translations when nothing else is configured.
pub const DEFAULT_CAPACITY: usize = 5120;
/// Bytes per executable buffer, and the dirty bitmap granule.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Smallest buffer that can hold a translated block plus its exit stub.
pub const MIN_BUFFER_SIZE: usize = 16;
/// Slot indices are 16-bit; `u16::MAX` is reserved as the C list terminator.
pub const MAX_CAPACITY: usize = u16::MAX as usize;

/// Runtime configuration for the block cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Whether the cache should be active (the host's "wanted" flag)
    pub enabled: bool,
    /// Number of slots in the block table and code arena
    pub capacity: usize,
    /// Bytes per executable buffer; must be a power of two
    pub buffer_size: usize,
    /// Slots freed per eviction sweep (None = half the capacity)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_batch: Option<usize>,
    /// Front-end log level hint: the `armjit` binary installs an
    /// `armjit=trace` filter when set. The library itself always emits its
    /// trace events and leaves filtering to the subscriber.
    pub trace: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: DEFAULT_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            eviction_batch: None,
            trace: false,
        }
    }
}

impl JitConfig {
    /// Effective sweep size.
    pub fn eviction_batch(&self) -> usize {
        self.eviction_batch.unwrap_or((self.capacity / 2).max(1))
    }

    /// Reject configurations that cannot produce a working arena.
    pub fn validate(&self) -> Result<(), JitError> {
        if self.capacity == 0 {
            return Err(JitError::InvalidConfig("capacity must be non-zero".to_string()));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(JitError::InvalidConfig(format!(
                "capacity {} exceeds the maximum of {}",
                self.capacity, MAX_CAPACITY
            )));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(JitError::InvalidConfig(format!(
                "buffer size {} is below the minimum of {}",
                self.buffer_size, MIN_BUFFER_SIZE
            )));
        }
        if !self.buffer_size.is_power_of_two() {
            return Err(JitError::InvalidConfig(format!(
                "buffer size {} is not a power of two",
                self.buffer_size
            )));
        }
        if self.capacity.checked_mul(self.buffer_size).is_none() {
            return Err(JitError::InvalidConfig("code arena size overflows".to_string()));
        }
        let batch = self.eviction_batch();
        if batch == 0 || batch > self.capacity {
            return Err(JitError::InvalidConfig(format!(
                "eviction batch {} must be between 1 and the capacity ({})",
                batch, self.capacity
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, JitError> {
        let config: JitConfig = toml::from_str(content)
            .map_err(|e| JitError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, JitError> {
        let content = fs::read_to_string(path)
            .map_err(|e| JitError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, JitError> {
        toml::to_string_pretty(self)
            .map_err(|e| JitError::Config(format!("failed to serialize config: {}", e)))
    }
}
