//! # WASM Host Bridge
//!
//! Embedded WebAssembly host bridge: runs untrusted guest modules inside a
//! fixed memory budget and exposes native I/O to them through a vetted set
//! of imports.
//!
//! The bridge owns a bounded heap arena, loads and links a module against
//! a table of native imports, marshals arguments and results across the
//! guest/host boundary, and runs every call on its own worker thread so a
//! guest fault or stack overflow never reaches the caller's stack.
//!
//! ## Components
//!
//! | Component | Type | Role |
//! |-----------|------|------|
//! | Heap arena | [`HeapArena`] | Fixed pool every instance's stack and linear memory are carved from |
//! | Native import table | [`NativeImportTable`] | `(namespace, name) -> (signature, host fn)`, sealed at the first load |
//! | Runtime context | [`Runtime`], [`RuntimeCell`] | Owns the arena, the table and the interpreter |
//! | Module instance | [`ModuleInstance`] | One loaded, linked, instantiated module |
//! | Invocation bridge | [`call`], [`invoke`] | Word marshaling and isolated dispatch |
//! | Board imports | [`BoardHostFunctions`] | GPIO, timing and console imports over a [`Board`] |
//!
//! The interpreter is a collaborator behind the [`Interpreter`] trait;
//! [`WasmtimeInterpreter`] is the shipped implementation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wasm_host_bridge::{ModuleInstance, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::initialize(RuntimeConfig::esp32())?;
//! let mut instance = ModuleInstance::load(&runtime, &bytecode, 16 * 1024, 64 * 1024)?;
//!
//! let mut argv = [42, 58];
//! instance.call("add", 2, &mut argv)?;
//! assert_eq!(argv[0], 100);
//!
//! runtime.log_memory_usage();
//! ```
//!
//! ## Features
//!
//! - `board` - GPIO / timing / print native imports and [`SimulatedBoard`] (default)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod bridge;
pub mod config;
pub mod error;
pub mod imports;
pub mod instance;
pub mod interpreter;
pub mod runtime;
pub mod value;

#[cfg(feature = "board")]
pub mod host_functions;

#[cfg(test)]
mod tests;

// Re-export main types
pub use arena::{ArenaRegion, HeapArena, MemoryUsage};
pub use bridge::{call, invoke, CallBenchmark, CallStats};
pub use config::RuntimeConfig;
pub use error::{BridgeError, ErrorCategory, HostError, Result, Trap, TrapKind};
pub use imports::{GuestMemory, GuestPtr, HostCall, HostResult, NativeImportTable, NativeSignature, NativeType};
pub use instance::{ExportedFunction, ModuleInstance};
pub use interpreter::{
    CallBudget, ImportDecl, ImportKind, InstanceLimits, InterruptHandle, Interpreter, ModuleInfo, WasmtimeInterpreter,
};
pub use runtime::{Runtime, RuntimeCell};
pub use value::{FuncSignature, Value, ValueKind};

#[cfg(feature = "board")]
pub use host_functions::{Board, BoardHostFunctions, PinMode, SimulatedBoard};
