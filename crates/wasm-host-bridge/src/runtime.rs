//! Runtime context: the heap arena, the native import table and the
//! interpreter, shared by every module instance loaded against it.

use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard};

use crate::arena::{HeapArena, MemoryUsage};
use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result};
use crate::imports::{HostCall, HostResult, NativeImportTable, NativeSignature};
use crate::instance::check_header;
use crate::interpreter::{ImportDecl, InstanceLimits, Interpreter, ModuleInfo, WasmtimeInterpreter};

/// Owns the heap arena, the native import table and the interpreter.
///
/// A runtime is an explicit value: pass it by reference to
/// [`crate::ModuleInstance::load`]. Use [`RuntimeCell`] where exactly one
/// runtime per process is wanted.
pub struct Runtime<I: Interpreter = WasmtimeInterpreter> {
    config: RuntimeConfig,
    arena: HeapArena,
    imports: RwLock<NativeImportTable>,
    interpreter: I,
    load_lock: Mutex<()>,
    last_error: Mutex<Option<String>>,
}

impl Runtime {
    /// Validate `config`, reserve the heap arena and create the wasmtime
    /// interpreter.
    pub fn initialize(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let interpreter = WasmtimeInterpreter::new(&config)?;
        Self::with_interpreter(config, interpreter)
    }

    /// Default configuration with a `bytes` heap arena.
    pub fn with_heap_size(bytes: usize) -> Result<Self> {
        Self::initialize(RuntimeConfig::default().heap_size(bytes))
    }
}

impl<I: Interpreter> Runtime<I> {
    /// Build a runtime around an existing interpreter.
    pub fn with_interpreter(config: RuntimeConfig, interpreter: I) -> Result<Self> {
        config.validate()?;
        let arena = HeapArena::new(config.heap_size)?;

        tracing::info!(
            heap_size = config.heap_size,
            stack_size = config.default_stack_size,
            memory_size = config.default_memory_size,
            timeout_ms = config.call_timeout_ms,
            "runtime initialized"
        );

        Ok(Self {
            config,
            arena,
            imports: RwLock::new(NativeImportTable::new()),
            interpreter,
            load_lock: Mutex::new(()),
            last_error: Mutex::new(None),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the interpreter.
    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    /// Register a native import in the default namespace
    /// (`config.import_namespace`).
    pub fn register<F>(&self, name: &str, signature: NativeSignature, function: F) -> Result<()>
    where
        F: Fn(&mut HostCall<'_>) -> HostResult + Send + Sync + 'static,
    {
        let namespace = self.config.import_namespace.clone();
        self.register_in(&namespace, name, signature, function)
    }

    /// Register a native import under an explicit namespace.
    pub fn register_in<F>(&self, namespace: &str, name: &str, signature: NativeSignature, function: F) -> Result<()>
    where
        F: Fn(&mut HostCall<'_>) -> HostResult + Send + Sync + 'static,
    {
        let result = self
            .imports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(namespace, name, signature, function);
        self.track(result)
    }

    /// Whether a module has been loaded, closing registration.
    pub fn is_sealed(&self) -> bool {
        self.imports().is_sealed()
    }

    /// Number of registered native imports.
    pub fn import_count(&self) -> usize {
        self.imports().len()
    }

    /// Decode `bytecode` and describe it without linking or reserving
    /// anything. Resolution of each import can be checked with
    /// [`Runtime::check_import`].
    pub fn inspect(&self, bytecode: &[u8]) -> Result<ModuleInfo> {
        check_header(bytecode)?;
        let limits = InstanceLimits {
            stack_size: self.config.default_stack_size,
            memory_size: self.config.default_memory_size,
        };
        let module = self.interpreter.load(bytecode, &limits)?;
        Ok(self.interpreter.describe(&module))
    }

    /// Check one import against the native import table.
    pub fn check_import(&self, import: &ImportDecl) -> Result<()> {
        self.imports().check_import(import)
    }

    /// Detail of the most recent failed runtime operation. Not cleared by
    /// later successes.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Arena usage snapshot.
    ///
    /// Covers instance stacks and linear memories only. Compiled code and
    /// other interpreter allocations are not counted.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.arena.usage()
    }

    /// Emit the arena usage snapshot at info level.
    pub fn log_memory_usage(&self) {
        let usage = self.memory_usage();
        tracing::info!(
            capacity = usage.capacity,
            used = usage.used,
            peak = usage.peak,
            largest_free_block = usage.largest_free_block,
            live_regions = usage.live_regions,
            "{}",
            usage
        );
    }

    pub(crate) fn arena(&self) -> &HeapArena {
        &self.arena
    }

    pub(crate) fn imports(&self) -> RwLockReadGuard<'_, NativeImportTable> {
        self.imports.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn seal_imports(&self) {
        let mut imports = self.imports.write().unwrap_or_else(PoisonError::into_inner);
        if !imports.is_sealed() {
            tracing::debug!(imports = imports.len(), "sealing native import table");
            imports.seal();
        }
    }

    /// Serializes loads against the arena.
    pub(crate) fn load_guard(&self) -> MutexGuard<'_, ()> {
        self.load_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_error(&self, error: &BridgeError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    /// Remember the error of a failed operation and pass the result through.
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.record_error(error);
        }
        result
    }
}

impl<I: Interpreter> fmt::Debug for Runtime<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("usage", &self.memory_usage())
            .field("imports", &self.import_count())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// Initialize-once slot for a [`Runtime`].
///
/// ```rust,ignore
/// static RUNTIME: RuntimeCell = RuntimeCell::new();
///
/// let runtime = RUNTIME.initialize(RuntimeConfig::esp32())?;
/// ```
pub struct RuntimeCell<I: Interpreter = WasmtimeInterpreter> {
    slot: OnceLock<Runtime<I>>,
}

impl<I: Interpreter> RuntimeCell<I> {
    /// Create an empty cell.
    pub const fn new() -> Self {
        Self { slot: OnceLock::new() }
    }

    /// Initialize with an interpreter built by `make`. Fails with
    /// [`BridgeError::AlreadyInitialized`] if the cell is occupied, leaving
    /// the existing runtime untouched.
    pub fn initialize_with<F>(&self, config: RuntimeConfig, make: F) -> Result<&Runtime<I>>
    where
        F: FnOnce(&RuntimeConfig) -> Result<I>,
    {
        if let Some(existing) = self.slot.get() {
            return existing.track(Err(BridgeError::AlreadyInitialized));
        }

        config.validate()?;
        let interpreter = make(&config)?;
        let runtime = Runtime::with_interpreter(config, interpreter)?;

        match self.slot.set(runtime) {
            Ok(()) => self.slot.get().ok_or(BridgeError::AlreadyInitialized),
            // Lost a race with another initializer
            Err(_) => match self.slot.get() {
                Some(existing) => existing.track(Err(BridgeError::AlreadyInitialized)),
                None => Err(BridgeError::AlreadyInitialized),
            },
        }
    }

    /// The runtime, if initialized.
    pub fn get(&self) -> Option<&Runtime<I>> {
        self.slot.get()
    }
}

impl RuntimeCell {
    /// Initialize with the wasmtime interpreter.
    pub fn initialize(&self, config: RuntimeConfig) -> Result<&Runtime> {
        self.initialize_with(config, WasmtimeInterpreter::new)
    }
}

impl<I: Interpreter> Default for RuntimeCell<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::NativeType;
    use crate::value::Value;

    #[test]
    fn test_initialize_validates_sizes() {
        assert!(matches!(
            Runtime::with_heap_size(100),
            Err(BridgeError::InvalidSize { what: "heap", .. })
        ));

        let config = RuntimeConfig::default().stack_size(8);
        assert!(matches!(
            Runtime::initialize(config),
            Err(BridgeError::InvalidSize { what: "stack", .. })
        ));
    }

    #[test]
    fn test_fresh_runtime_state() {
        let runtime = Runtime::with_heap_size(64 * 1024).unwrap();
        let usage = runtime.memory_usage();
        assert_eq!(usage.capacity, 64 * 1024);
        assert_eq!(usage.used, 0);
        assert_eq!(usage.live_regions, 0);
        assert!(runtime.last_error().is_none());
        assert!(!runtime.is_sealed());
        runtime.log_memory_usage();
    }

    #[test]
    fn test_cell_initializes_once() {
        let cell: RuntimeCell = RuntimeCell::new();
        assert!(cell.get().is_none());

        let first = cell.initialize(RuntimeConfig::esp32()).unwrap();
        assert_eq!(first.config().heap_size, 128 * 1024);

        let err = cell.initialize(RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyInitialized));

        // The first runtime survives and remembers the failure
        let runtime = cell.get().unwrap();
        assert_eq!(runtime.config().heap_size, 128 * 1024);
        assert_eq!(runtime.last_error().as_deref(), Some("runtime already initialized"));
    }

    #[test]
    fn test_cell_failed_initialize_leaves_cell_empty() {
        let cell: RuntimeCell = RuntimeCell::new();
        assert!(cell.initialize(RuntimeConfig::default().heap_size(1)).is_err());
        assert!(cell.get().is_none());
        assert!(cell.initialize(RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn test_register_uses_default_namespace() {
        let config = RuntimeConfig::default().import_namespace("hal");
        let runtime = Runtime::initialize(config).unwrap();
        runtime
            .register("native_millis", NativeSignature::new(&[], Some(NativeType::U32)), |_| {
                Ok(Some(Value::from_u32(0)))
            })
            .unwrap();

        assert_eq!(runtime.import_count(), 1);
        assert!(runtime.imports().resolve("hal", "native_millis").is_some());
        assert!(runtime.imports().resolve("env", "native_millis").is_none());
    }

    #[test]
    fn test_register_errors_are_tracked() {
        let runtime = Runtime::with_heap_size(64 * 1024).unwrap();
        let sig = NativeSignature::new(&[NativeType::I32], None);
        runtime.register("native_print_int", sig.clone(), |_| Ok(None)).unwrap();

        let err = runtime.register("native_print_int", sig, |_| Ok(None)).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateImport(_)));
        assert!(runtime.last_error().unwrap().contains("env.native_print_int"));
    }
}
