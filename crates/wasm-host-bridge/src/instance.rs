//! Module instances: load, link and instantiate one guest module.

use std::collections::BTreeMap;
use std::fmt;

use crate::arena::ArenaRegion;
use crate::bridge::{self, CallStats};
use crate::config::{validate_memory_size, validate_stack_size};
use crate::error::{BridgeError, Result};
use crate::interpreter::{InstanceLimits, Interpreter, WasmtimeInterpreter};
use crate::runtime::Runtime;
use crate::value::{FuncSignature, Value};

/// Module header magic.
const WASM_MAGIC: [u8; 4] = *b"\0asm";

/// Binary format version accepted.
const WASM_VERSION: [u8; 4] = [1, 0, 0, 0];

/// Validate the 8-byte module header.
pub fn check_header(bytecode: &[u8]) -> Result<()> {
    if bytecode.len() < 8 {
        return Err(BridgeError::MalformedBytecode(format!(
            "{} bytes is shorter than the 8 byte header",
            bytecode.len()
        )));
    }
    if bytecode[..4] != WASM_MAGIC {
        return Err(BridgeError::MalformedBytecode(format!(
            "bad magic {:02x?}",
            &bytecode[..4]
        )));
    }
    if bytecode[4..8] != WASM_VERSION {
        return Err(BridgeError::MalformedBytecode(format!(
            "unsupported version {:02x?}",
            &bytecode[4..8]
        )));
    }
    Ok(())
}

/// An export as seen by callers.
#[derive(Debug, Clone, Copy)]
pub struct ExportedFunction<'i> {
    name: &'i str,
    signature: &'i FuncSignature,
}

impl<'i> ExportedFunction<'i> {
    /// Export name.
    pub fn name(&self) -> &'i str {
        self.name
    }

    /// Declared type.
    pub fn signature(&self) -> &'i FuncSignature {
        self.signature
    }

    /// Number of parameters (the required `argc`).
    pub fn param_count(&self) -> usize {
        self.signature.params.len()
    }

    /// Number of results.
    pub fn result_count(&self) -> usize {
        self.signature.results.len()
    }
}

/// One loaded, linked and instantiated module.
///
/// The instance borrows its bytecode and its runtime, owns an execution
/// stack region and (if the module defines memory) a linear memory region
/// in the runtime's arena, and releases both when dropped.
pub struct ModuleInstance<'a, I: Interpreter = WasmtimeInterpreter> {
    // Declared first so the interpreter instance is torn down before the
    // regions backing it are released.
    pub(crate) raw: I::Instance,
    pub(crate) runtime: &'a Runtime<I>,
    bytecode: &'a [u8],
    pub(crate) exports: BTreeMap<String, FuncSignature>,
    pub(crate) limits: InstanceLimits,
    stack_region: ArenaRegion,
    memory_region: Option<ArenaRegion>,
    last_error: Option<String>,
}

impl<'a, I: Interpreter> ModuleInstance<'a, I> {
    /// Load `bytecode` with a `stack_size` byte execution stack and a
    /// `memory_size` byte linear memory bound.
    ///
    /// The first load seals the runtime's native import table. Loads on
    /// one runtime are serialized.
    pub fn load(runtime: &'a Runtime<I>, bytecode: &'a [u8], stack_size: usize, memory_size: usize) -> Result<Self> {
        runtime.track(Self::load_inner(runtime, bytecode, stack_size, memory_size))
    }

    /// Load with the runtime's default stack and memory sizes.
    pub fn load_with_defaults(runtime: &'a Runtime<I>, bytecode: &'a [u8]) -> Result<Self> {
        let config = runtime.config();
        Self::load(runtime, bytecode, config.default_stack_size, config.default_memory_size)
    }

    fn load_inner(runtime: &'a Runtime<I>, bytecode: &'a [u8], stack_size: usize, memory_size: usize) -> Result<Self> {
        validate_stack_size(stack_size)?;
        validate_memory_size(memory_size)?;
        check_header(bytecode)?;

        let _guard = runtime.load_guard();
        runtime.seal_imports();

        let limits = InstanceLimits { stack_size, memory_size };
        let interpreter = runtime.interpreter();

        let module = interpreter.load(bytecode, &limits)?;
        let info = interpreter.describe(&module);
        tracing::debug!(
            bytes = bytecode.len(),
            imports = info.imports.len(),
            exports = info.exports.len(),
            "module decoded"
        );

        if info.memory_count > 1 {
            return Err(BridgeError::MalformedBytecode(format!(
                "module defines {} linear memories, at most one is supported",
                info.memory_count
            )));
        }
        if let Some(memory) = &info.memory {
            if memory.min_bytes > memory_size as u64 {
                return Err(BridgeError::MemoryLimit {
                    required: memory.min_bytes,
                    limit: memory_size,
                });
            }
        }

        let imports = runtime.imports();
        for import in &info.imports {
            imports.check_import(import)?;
        }

        let (stack_region, memory_region) = runtime.arena().allocate_pair(
            (stack_size, "execution stack"),
            info.memory.map(|_| (memory_size, "linear memory")),
        )?;

        let linker = interpreter.link(&module, &imports)?;
        drop(imports);
        let raw = interpreter.instantiate(&module, &linker, &limits)?;

        let exports: BTreeMap<String, FuncSignature> =
            info.exports.into_iter().map(|e| (e.name, e.signature)).collect();

        tracing::info!(
            exports = exports.len(),
            stack_size,
            memory_size,
            arena_used = runtime.memory_usage().used,
            "module loaded"
        );

        Ok(Self {
            raw,
            runtime,
            bytecode,
            exports,
            limits,
            stack_region,
            memory_region,
            last_error: None,
        })
    }

    /// Look up an export by exact, case-sensitive name.
    pub fn exported_function(&self, name: &str) -> Option<ExportedFunction<'_>> {
        self.exports
            .get_key_value(name)
            .map(|(name, signature)| ExportedFunction { name, signature })
    }

    /// All exported functions, ordered by name.
    pub fn exports(&self) -> impl Iterator<Item = ExportedFunction<'_>> {
        self.exports
            .iter()
            .map(|(name, signature)| ExportedFunction { name, signature })
    }

    /// Call `function` with `argc` arguments taken from `argv`. On success
    /// the result (if any) overwrites `argv[0]`. See [`crate::call`].
    pub fn call(&mut self, function: &str, argc: usize, argv: &mut [u32]) -> Result<CallStats> {
        bridge::call(self, function, argc, argv)
    }

    /// Call `function` with typed arguments. See [`crate::invoke`].
    pub fn invoke(&mut self, function: &str, args: &[Value]) -> Result<CallStats> {
        bridge::invoke(self, function, args)
    }

    /// Detail of the most recent failed call on this instance. Not cleared
    /// by later successes.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The bytecode this instance was loaded from.
    pub fn bytecode(&self) -> &'a [u8] {
        self.bytecode
    }

    /// Sizes fixed at load time.
    pub fn limits(&self) -> InstanceLimits {
        self.limits
    }

    /// The runtime this instance was loaded against.
    pub fn runtime(&self) -> &'a Runtime<I> {
        self.runtime
    }

    /// Arena bytes held by this instance.
    pub fn reserved_bytes(&self) -> usize {
        self.stack_region.len() + self.memory_region.as_ref().map_or(0, ArenaRegion::len)
    }

    /// Fuel left after the last call, if metering is on.
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.runtime.interpreter().remaining_fuel(&self.raw)
    }

    /// Destroy the interpreter instance and release the arena regions.
    /// Dropping the instance has the same effect.
    pub fn unload(self) {
        let runtime = self.runtime;
        runtime.interpreter().destroy(self.raw);
        tracing::debug!(released = self.stack_region.len(), "module unloaded");
    }

    /// Remember the error of a failed call and pass the result through.
    pub(crate) fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.last_error = Some(error.to_string());
        }
        result
    }
}

impl<I: Interpreter> fmt::Debug for ModuleInstance<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("bytes", &self.bytecode.len())
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .field("stack_region", &self.stack_region)
            .field("memory_region", &self.memory_region)
            .field("last_error", &self.last_error)
            .finish()
    }
}
