//! Configuration for the bridge runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BridgeError, Result};

/// Smallest heap arena accepted by [`RuntimeConfig::validate`].
pub const MIN_HEAP_SIZE: usize = 4 * 1024;

/// Smallest per-instance execution stack.
pub const MIN_STACK_SIZE: usize = 1024;

/// WebAssembly page size in bytes.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Runtime configuration.
///
/// Sizes are in bytes. The heap arena bounds the sum of every live
/// instance's execution stack and linear memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Heap arena size
    pub heap_size: usize,

    /// Execution stack used by [`crate::ModuleInstance::load_with_defaults`]
    pub default_stack_size: usize,

    /// Linear memory bound used by [`crate::ModuleInstance::load_with_defaults`]
    pub default_memory_size: usize,

    /// Native stack added on top of the guest stack for each call worker
    pub worker_stack_headroom: usize,

    /// Per-call timeout in milliseconds (0 = wait indefinitely)
    pub call_timeout_ms: u64,

    /// Fuel granted to each call (None = no metering)
    pub fuel_limit: Option<u64>,

    /// Compiler optimization level (0-2)
    pub optimization_level: u8,

    /// Namespace used by [`crate::Runtime::register`]
    pub import_namespace: String,

    /// Elements a guest table may hold, summed over growth
    pub max_table_elements: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size: 256 * 1024,          // 256 KB
            default_stack_size: 16 * 1024,  // 16 KB
            default_memory_size: 64 * 1024, // one page
            worker_stack_headroom: 256 * 1024,
            call_timeout_ms: 0,
            fuel_limit: None,
            optimization_level: 2,
            import_namespace: "env".to_string(),
            max_table_elements: 10_000,
        }
    }
}

impl RuntimeConfig {
    /// Tight budget matching a microcontroller deployment: 128 KB heap,
    /// 16 KB guest stack, one page of linear memory.
    pub fn esp32() -> Self {
        Self {
            heap_size: 128 * 1024,
            default_stack_size: 16 * 1024,
            default_memory_size: 64 * 1024,
            ..Default::default()
        }
    }

    /// Create a minimal config with fuel metering and a call timeout
    pub fn minimal() -> Self {
        Self {
            heap_size: 96 * 1024,
            default_stack_size: 8 * 1024,
            fuel_limit: Some(10_000_000),
            call_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            heap_size: 4 * 1024 * 1024,
            default_stack_size: 256 * 1024,
            default_memory_size: 1024 * 1024,
            call_timeout_ms: 5_000,
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse a JSON config.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| BridgeError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check sizes and levels.
    pub fn validate(&self) -> Result<()> {
        if self.heap_size < MIN_HEAP_SIZE {
            return Err(BridgeError::InvalidSize {
                what: "heap",
                detail: format!("{} bytes is below the {} byte minimum", self.heap_size, MIN_HEAP_SIZE),
            });
        }
        validate_stack_size(self.default_stack_size)?;
        validate_memory_size(self.default_memory_size)?;
        if self.optimization_level > 2 {
            return Err(BridgeError::ConfigError(format!(
                "optimization level {} out of range 0-2",
                self.optimization_level
            )));
        }
        if self.import_namespace.is_empty() {
            return Err(BridgeError::ConfigError("import namespace is empty".to_string()));
        }
        Ok(())
    }

    /// Builder: set heap size
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    /// Builder: set default stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    /// Builder: set default linear memory bound
    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.default_memory_size = bytes;
        self
    }

    /// Builder: set call timeout
    pub fn call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = ms;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }

    /// Builder: set worker stack headroom
    pub fn worker_stack_headroom(mut self, bytes: usize) -> Self {
        self.worker_stack_headroom = bytes;
        self
    }

    /// Builder: set the per-table element cap
    pub fn table_elements(mut self, elements: usize) -> Self {
        self.max_table_elements = elements;
        self
    }

    /// Builder: set the default import namespace
    pub fn import_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.import_namespace = namespace.into();
        self
    }
}

pub(crate) fn validate_stack_size(bytes: usize) -> Result<()> {
    if bytes < MIN_STACK_SIZE {
        return Err(BridgeError::InvalidSize {
            what: "stack",
            detail: format!("{} bytes is below the {} byte minimum", bytes, MIN_STACK_SIZE),
        });
    }
    Ok(())
}

pub(crate) fn validate_memory_size(bytes: usize) -> Result<()> {
    if bytes == 0 {
        return Err(BridgeError::InvalidSize {
            what: "memory",
            detail: "linear memory bound must be non-zero".to_string(),
        });
    }
    Ok(())
}
