//! Error types for the host bridge.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::ValueKind;

/// Broad failure classes, used by embedders to decide whether to halt,
/// retry with a different module, or carry on with the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Invalid sizes, double initialization, late registration. Fatal.
    Configuration,
    /// Malformed bytecode, linking failures, arena exhaustion during load.
    Load,
    /// Per-call failures; the instance stays usable.
    Invocation,
    /// An allocation needed by a call could not be made.
    ResourceExhaustion,
}

/// What kind of guest fault aborted a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrapKind {
    /// Guest recursion exceeded the instance's execution stack
    StackOverflow,
    /// Out-of-bounds or misaligned linear memory access
    MemoryOutOfBounds,
    /// `unreachable` instruction executed
    Unreachable,
    /// Division by zero, integer overflow, invalid float conversion
    Arithmetic,
    /// Bad indirect call (null entry, signature mismatch, table bounds)
    IndirectCall,
    /// The per-call fuel budget ran out
    FuelExhausted,
    /// The call was interrupted by the timeout watchdog
    Interrupted,
    /// A native import returned an error
    HostFunction,
    /// A native import panicked
    HostPanic,
    /// Anything the interpreter reports that does not fit above
    Other,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrapKind::StackOverflow => "stack overflow",
            TrapKind::MemoryOutOfBounds => "memory out of bounds",
            TrapKind::Unreachable => "unreachable",
            TrapKind::Arithmetic => "arithmetic",
            TrapKind::IndirectCall => "indirect call",
            TrapKind::FuelExhausted => "fuel exhausted",
            TrapKind::Interrupted => "interrupted",
            TrapKind::HostFunction => "host function",
            TrapKind::HostPanic => "host panic",
            TrapKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A classified guest trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    /// Trap category
    pub kind: TrapKind,
    /// Interpreter-provided detail
    pub detail: String,
}

impl Trap {
    /// Create a trap of the given kind.
    pub fn new(kind: TrapKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} trap: {}", self.kind, self.detail)
    }
}

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A runtime was already initialized in this slot
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// A heap, stack, or memory size is out of range
    #[error("invalid {what} size: {detail}")]
    InvalidSize {
        /// Which size was rejected
        what: &'static str,
        /// Why
        detail: String,
    },

    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Native imports must be registered before the first load
    #[error("native import table is sealed: cannot register '{0}' after a module was loaded")]
    ImportTableSealed(String),

    /// The same namespace/name pair was registered twice
    #[error("duplicate native import: {0}")]
    DuplicateImport(String),

    /// The interpreter could not be set up
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// Bytecode failed header or format validation
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),

    /// The heap arena cannot satisfy a reservation
    #[error("arena exhaustion: {purpose} needs {requested} bytes, largest free block is {available} bytes")]
    ArenaExhausted {
        /// What the region was for
        purpose: &'static str,
        /// Bytes requested (after alignment)
        requested: usize,
        /// Largest contiguous free block
        available: usize,
    },

    /// The module's minimum linear memory exceeds the configured bound
    #[error("linear memory limit too small: module requires {required} bytes, limit is {limit} bytes")]
    MemoryLimit {
        /// Declared minimum in bytes
        required: u64,
        /// Configured maximum in bytes
        limit: usize,
    },

    /// A module import has no matching native import
    #[error("unresolved import: {module}.{name}")]
    UnresolvedImport {
        /// Import namespace
        module: String,
        /// Import name
        name: String,
    },

    /// A module import is registered with a different signature
    #[error("signature mismatch for import {module}.{name}: module declares {declared}, host provides {provided}")]
    SignatureMismatch {
        /// Import namespace
        module: String,
        /// Import name
        name: String,
        /// Signature the guest declares
        declared: String,
        /// Signature the host registered
        provided: String,
    },

    /// The start routine trapped or instantiation otherwise failed
    #[error("instantiation trap: {0}")]
    InstantiationTrap(Trap),

    /// No export with this name
    #[error("export not found: {0}")]
    ExportNotFound(String),

    /// `argc` disagrees with the function's parameter count
    #[error("argument count mismatch for '{function}': expected {expected}, got {actual}")]
    ArgCountMismatch {
        /// Function name
        function: String,
        /// Declared parameter count
        expected: usize,
        /// Supplied `argc`
        actual: usize,
    },

    /// A typed argument disagrees with the declared parameter type
    #[error("argument {index} of '{function}' is {actual}, function takes {expected}")]
    ArgTypeMismatch {
        /// Function name
        function: String,
        /// Argument position
        index: usize,
        /// Declared parameter type
        expected: ValueKind,
        /// Supplied value type
        actual: ValueKind,
    },

    /// `argv` cannot hold the arguments or the result
    #[error("argument buffer too small for '{function}': need {needed} words, have {actual}")]
    ArgBufferTooSmall {
        /// Function name
        function: String,
        /// Words required
        needed: usize,
        /// Words supplied
        actual: usize,
    },

    /// The function's signature cannot be expressed in the call convention
    #[error("unsupported signature for '{function}': {detail}")]
    UnsupportedSignature {
        /// Function name
        function: String,
        /// What is unsupported
        detail: String,
    },

    /// The guest trapped
    #[error("trap in '{function}': {trap}")]
    Trap {
        /// Function that was called
        function: String,
        /// Classified trap
        trap: Trap,
    },

    /// The call exceeded the configured timeout and was interrupted
    #[error("call to '{function}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Function that was called
        function: String,
        /// Configured limit
        timeout_ms: u64,
    },

    /// Resource exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::AlreadyInitialized
            | BridgeError::InvalidSize { .. }
            | BridgeError::ConfigError(_)
            | BridgeError::ImportTableSealed(_)
            | BridgeError::DuplicateImport(_)
            | BridgeError::Interpreter(_)
            | BridgeError::Io(_) => ErrorCategory::Configuration,

            BridgeError::MalformedBytecode(_)
            | BridgeError::ArenaExhausted { .. }
            | BridgeError::MemoryLimit { .. }
            | BridgeError::UnresolvedImport { .. }
            | BridgeError::SignatureMismatch { .. }
            | BridgeError::InstantiationTrap(_) => ErrorCategory::Load,

            BridgeError::ExportNotFound(_)
            | BridgeError::ArgCountMismatch { .. }
            | BridgeError::ArgTypeMismatch { .. }
            | BridgeError::ArgBufferTooSmall { .. }
            | BridgeError::UnsupportedSignature { .. }
            | BridgeError::Trap { .. }
            | BridgeError::Timeout { .. } => ErrorCategory::Invocation,

            BridgeError::ResourceExhausted(_) => ErrorCategory::ResourceExhaustion,
        }
    }

    /// The trap behind this error, if the guest trapped.
    pub fn trap(&self) -> Option<&Trap> {
        match self {
            BridgeError::Trap { trap, .. } | BridgeError::InstantiationTrap(trap) => Some(trap),
            _ => None,
        }
    }
}

/// Failure raised by a native import. Turns into a `HostFunction` trap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// A guest pointer range falls outside linear memory
    #[error("guest access out of bounds: offset {offset} + {len} bytes exceeds memory of {memory_size} bytes")]
    OutOfBounds {
        /// Guest offset
        offset: u32,
        /// Access length
        len: usize,
        /// Current linear memory size
        memory_size: usize,
    },

    /// The guest exports no linear memory
    #[error("guest has no linear memory")]
    NoMemory,

    /// No NUL terminator within the allowed length
    #[error("unterminated guest string at offset {0}")]
    UnterminatedString(u32),

    /// Guest string is not UTF-8
    #[error("guest string at offset {0} is not valid UTF-8")]
    InvalidUtf8(u32),

    /// Argument index or type does not match the signature
    #[error("argument {index}: {detail}")]
    Argument {
        /// Argument position
        index: usize,
        /// What went wrong
        detail: String,
    },

    /// Return value type does not match the signature
    #[error("result mismatch: {0}")]
    ResultMismatch(String),

    /// The host rejected an argument value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(BridgeError::AlreadyInitialized.category(), ErrorCategory::Configuration);
        assert_eq!(
            BridgeError::UnresolvedImport {
                module: "env".into(),
                name: "native_delay".into()
            }
            .category(),
            ErrorCategory::Load
        );
        assert_eq!(BridgeError::ExportNotFound("x".into()).category(), ErrorCategory::Invocation);
        assert_eq!(
            BridgeError::ResourceExhausted("worker".into()).category(),
            ErrorCategory::ResourceExhaustion
        );
    }

    #[test]
    fn test_trap_accessor() {
        let err = BridgeError::Trap {
            function: "fib".into(),
            trap: Trap::new(TrapKind::StackOverflow, "call stack exhausted"),
        };
        assert_eq!(err.trap().map(|t| t.kind), Some(TrapKind::StackOverflow));
        assert!(BridgeError::ExportNotFound("fib".into()).trap().is_none());
        assert!(err.to_string().contains("stack overflow trap"));
    }

    #[test]
    fn test_messages_carry_details() {
        let err = BridgeError::ArenaExhausted {
            purpose: "linear memory",
            requested: 131072,
            available: 65536,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("arena exhaustion"));
        assert!(msg.contains("131072"));

        let err = BridgeError::UnresolvedImport {
            module: "env".into(),
            name: "native_digital_write".into(),
        };
        assert_eq!(err.to_string(), "unresolved import: env.native_digital_write");
    }
}
