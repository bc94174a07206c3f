//! The interpreter seam.
//!
//! The bridge never executes bytecode itself. It drives an [`Interpreter`]
//! through a narrow set of operations: decode a module, describe its
//! imports and exports, link it against the native import table,
//! instantiate it within fixed limits, invoke an export, and tear the
//! instance down. [`WasmtimeInterpreter`] is the shipped implementation.

mod wasmtime_backend;

pub use wasmtime_backend::{EpochInterrupt, HostState, WasmtimeInstance, WasmtimeInterpreter, WasmtimeModule};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::imports::NativeImportTable;
use crate::value::{FuncSignature, Value};

/// Per-instance sizes fixed at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLimits {
    /// Guest execution stack in bytes
    pub stack_size: usize,
    /// Linear memory bound in bytes
    pub memory_size: usize,
}

/// Execution budget for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallBudget {
    /// Arm the interrupt so [`InterruptHandle::interrupt`] can stop the call
    pub interruptible: bool,
    /// Fuel granted to the call
    pub fuel: Option<u64>,
}

/// What a module import refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    /// A function with the given type
    Function(FuncSignature),
    /// A linear memory
    Memory,
    /// A table, global, or anything else
    Other,
}

/// One declared import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    /// Namespace (module) name
    pub module: String,
    /// Field name
    pub name: String,
    /// Kind and type
    pub kind: ImportKind,
}

/// One exported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDecl {
    /// Export name
    pub name: String,
    /// Function type
    pub signature: FuncSignature,
}

/// The module's own linear memory, if it defines one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDecl {
    /// Initial size in bytes
    pub min_bytes: u64,
    /// Declared maximum in bytes
    pub max_bytes: Option<u64>,
}

/// Static description of a decoded module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Imports in declaration order
    pub imports: Vec<ImportDecl>,
    /// Exported functions
    pub exports: Vec<ExportDecl>,
    /// Defined memory (the largest, when several are declared)
    pub memory: Option<MemoryDecl>,
    /// Number of memories the module defines
    pub memory_count: usize,
}

/// Stops an in-flight call from another thread.
pub trait InterruptHandle: Send {
    /// Request that the current call trap with [`crate::TrapKind::Interrupted`].
    fn interrupt(&self);
}

/// An embeddable WebAssembly virtual machine.
pub trait Interpreter: Send + Sync + 'static {
    /// Decoded, validated module
    type Module: Send + Sync;
    /// Import resolution state produced by [`Interpreter::link`]
    type Linker;
    /// Instantiated module with its own store
    type Instance: Send;
    /// Handle used by the timeout watchdog
    type Interrupt: InterruptHandle;

    /// Decode and validate bytecode for an instance with `limits`.
    fn load(&self, bytecode: &[u8], limits: &InstanceLimits) -> Result<Self::Module>;

    /// Report imports, exports, and memory requirements.
    fn describe(&self, module: &Self::Module) -> ModuleInfo;

    /// Bind every entry of the import table.
    fn link(&self, module: &Self::Module, imports: &NativeImportTable) -> Result<Self::Linker>;

    /// Create an instance and run its start routine.
    fn instantiate(
        &self,
        module: &Self::Module,
        linker: &Self::Linker,
        limits: &InstanceLimits,
    ) -> Result<Self::Instance>;

    /// Call an export. Runs on whatever thread calls it.
    fn invoke(
        &self,
        instance: &mut Self::Instance,
        function: &str,
        args: &[Value],
        budget: &CallBudget,
    ) -> Result<Option<Value>>;

    /// Handle that can interrupt calls on `instance`.
    fn interrupt_handle(&self, instance: &Self::Instance) -> Self::Interrupt;

    /// Fuel left after the last call, if metering is on.
    fn remaining_fuel(&self, instance: &Self::Instance) -> Option<u64>;

    /// Release an instance.
    fn destroy(&self, instance: Self::Instance) {
        drop(instance);
    }
}
