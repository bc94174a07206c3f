//! Native import table.
//!
//! Host functions are registered here under a `(namespace, name)` pair with
//! a fixed signature before any module is loaded. Linking resolves every
//! guest import against this table by exact name and exact lowered
//! signature.
//!
//! ## Guest pointers
//!
//! Pointer-like parameters arrive as offsets into the calling instance's
//! linear memory. Host code must go through [`GuestMemory`], which checks
//! every access against the current memory size:
//!
//! ```rust,ignore
//! runtime.register(
//!     "native_print_string",
//!     NativeSignature::new(&[NativeType::Ptr], None),
//!     |call| {
//!         let ptr = call.arg_ptr(0)?;
//!         let text = call.memory()?.read_cstr(ptr, 256)?;
//!         println!("{text}");
//!         Ok(None)
//!     },
//! )?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, HostError, Result};
use crate::interpreter::{ImportDecl, ImportKind};
use crate::value::{FuncSignature, Value, ValueKind};

/// Return type of every host function.
pub type HostResult = std::result::Result<Option<Value>, HostError>;

/// A registered host function.
pub type HostFn = Arc<dyn Fn(&mut HostCall<'_>) -> HostResult + Send + Sync>;

/// Host-side parameter types. Several lower to the same WebAssembly type;
/// the distinction drives the typed accessors on [`HostCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeType {
    /// Signed 32-bit integer
    I32,
    /// Unsigned 32-bit integer
    U32,
    /// Offset into the guest's linear memory
    Ptr,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl NativeType {
    /// The WebAssembly type this lowers to.
    pub fn lower(self) -> ValueKind {
        match self {
            NativeType::I32 | NativeType::U32 | NativeType::Ptr => ValueKind::I32,
            NativeType::I64 => ValueKind::I64,
            NativeType::F32 => ValueKind::F32,
            NativeType::F64 => ValueKind::F64,
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeType::I32 => "i32",
            NativeType::U32 => "u32",
            NativeType::Ptr => "ptr",
            NativeType::I64 => "i64",
            NativeType::F32 => "f32",
            NativeType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Signature of a native import.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeSignature {
    params: Vec<NativeType>,
    result: Option<NativeType>,
}

impl NativeSignature {
    /// Create a signature with at most one result.
    pub fn new(params: &[NativeType], result: Option<NativeType>) -> Self {
        Self {
            params: params.to_vec(),
            result,
        }
    }

    /// Parameter types.
    pub fn params(&self) -> &[NativeType] {
        &self.params
    }

    /// Result type.
    pub fn result(&self) -> Option<NativeType> {
        self.result
    }

    /// The WebAssembly function type a guest must declare to import this.
    pub fn lowered(&self) -> FuncSignature {
        FuncSignature {
            params: self.params.iter().map(|p| p.lower()).collect(),
            results: self.result.iter().map(|r| r.lower()).collect(),
        }
    }
}

impl fmt::Display for NativeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        write!(f, "({})", params.join(", "))?;
        match self.result {
            Some(result) => write!(f, " -> {result}"),
            None => f.write_str(" -> ()"),
        }
    }
}

/// An offset into guest linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestPtr(pub u32);

impl GuestPtr {
    /// Raw offset.
    pub fn offset(self) -> u32 {
        self.0
    }
}

/// Bounds-checked view of an instance's linear memory, valid for the
/// duration of one host call.
pub struct GuestMemory<'a> {
    data: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    /// Wrap the instance's memory bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Current memory size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, ptr: GuestPtr, len: usize) -> std::result::Result<Range<usize>, HostError> {
        let start = ptr.0 as usize;
        start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .map(|end| start..end)
            .ok_or(HostError::OutOfBounds {
                offset: ptr.0,
                len,
                memory_size: self.data.len(),
            })
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn read(&self, ptr: GuestPtr, len: usize) -> std::result::Result<&[u8], HostError> {
        let range = self.range(ptr, len)?;
        Ok(&self.data[range])
    }

    /// Copy `bytes` to `ptr`.
    pub fn write(&mut self, ptr: GuestPtr, bytes: &[u8]) -> std::result::Result<(), HostError> {
        let range = self.range(ptr, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&self, ptr: GuestPtr) -> std::result::Result<u32, HostError> {
        let bytes = self.read(ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, ptr: GuestPtr, value: u32) -> std::result::Result<(), HostError> {
        self.write(ptr, &value.to_le_bytes())
    }

    /// Read a NUL-terminated UTF-8 string of at most `max_len` bytes
    /// (terminator excluded).
    pub fn read_cstr(&self, ptr: GuestPtr, max_len: usize) -> std::result::Result<&str, HostError> {
        let start = ptr.0 as usize;
        if start >= self.data.len() {
            return Err(HostError::OutOfBounds {
                offset: ptr.0,
                len: 1,
                memory_size: self.data.len(),
            });
        }
        let end = self.data.len().min(start.saturating_add(max_len).saturating_add(1));
        let window = &self.data[start..end];
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(HostError::UnterminatedString(ptr.0))?;
        std::str::from_utf8(&window[..nul]).map_err(|_| HostError::InvalidUtf8(ptr.0))
    }
}

/// Arguments and memory access for one native call.
pub struct HostCall<'a> {
    name: &'a str,
    signature: &'a NativeSignature,
    args: &'a [Value],
    memory: Option<GuestMemory<'a>>,
}

impl<'a> HostCall<'a> {
    /// Assemble a call. Used by interpreter backends.
    pub fn new(
        name: &'a str,
        signature: &'a NativeSignature,
        args: &'a [Value],
        memory: Option<GuestMemory<'a>>,
    ) -> Self {
        Self {
            name,
            signature,
            args,
            memory,
        }
    }

    /// Import name being called.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Raw arguments.
    pub fn args(&self) -> &[Value] {
        self.args
    }

    fn arg(&self, index: usize, expected: NativeType) -> std::result::Result<Value, HostError> {
        let declared = self.signature.params.get(index).ok_or_else(|| HostError::Argument {
            index,
            detail: format!("{} takes {} arguments", self.name, self.signature.params.len()),
        })?;
        if *declared != expected {
            return Err(HostError::Argument {
                index,
                detail: format!("declared as {declared}, read as {expected}"),
            });
        }
        self.args.get(index).copied().ok_or_else(|| HostError::Argument {
            index,
            detail: "missing".to_string(),
        })
    }

    fn arg_word(&self, index: usize, expected: NativeType) -> std::result::Result<i32, HostError> {
        match self.arg(index, expected)? {
            Value::I32(v) => Ok(v),
            other => Err(HostError::Argument {
                index,
                detail: format!("expected a 32-bit integer, got {}", other.kind()),
            }),
        }
    }

    /// Signed 32-bit argument.
    pub fn arg_i32(&self, index: usize) -> std::result::Result<i32, HostError> {
        self.arg_word(index, NativeType::I32)
    }

    /// Unsigned 32-bit argument.
    pub fn arg_u32(&self, index: usize) -> std::result::Result<u32, HostError> {
        self.arg_word(index, NativeType::U32).map(|v| v as u32)
    }

    /// Guest pointer argument. Dereference it through [`HostCall::memory`].
    pub fn arg_ptr(&self, index: usize) -> std::result::Result<GuestPtr, HostError> {
        self.arg_word(index, NativeType::Ptr).map(|v| GuestPtr(v as u32))
    }

    /// Signed 64-bit argument.
    pub fn arg_i64(&self, index: usize) -> std::result::Result<i64, HostError> {
        match self.arg(index, NativeType::I64)? {
            Value::I64(v) => Ok(v),
            other => Err(HostError::Argument {
                index,
                detail: format!("expected i64, got {}", other.kind()),
            }),
        }
    }

    /// 32-bit float argument.
    pub fn arg_f32(&self, index: usize) -> std::result::Result<f32, HostError> {
        match self.arg(index, NativeType::F32)? {
            Value::F32(v) => Ok(v),
            other => Err(HostError::Argument {
                index,
                detail: format!("expected f32, got {}", other.kind()),
            }),
        }
    }

    /// 64-bit float argument.
    pub fn arg_f64(&self, index: usize) -> std::result::Result<f64, HostError> {
        match self.arg(index, NativeType::F64)? {
            Value::F64(v) => Ok(v),
            other => Err(HostError::Argument {
                index,
                detail: format!("expected f64, got {}", other.kind()),
            }),
        }
    }

    /// The caller's linear memory.
    pub fn memory(&mut self) -> std::result::Result<&mut GuestMemory<'a>, HostError> {
        self.memory.as_mut().ok_or(HostError::NoMemory)
    }
}

/// One entry of the import table.
#[derive(Clone)]
pub struct NativeImport {
    namespace: String,
    name: String,
    signature: NativeSignature,
    function: HostFn,
}

impl NativeImport {
    /// Import namespace (module name on the guest side).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Import name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered signature.
    pub fn signature(&self) -> &NativeSignature {
        &self.signature
    }

    /// Run the host function and check its return value against the
    /// signature.
    pub fn invoke(&self, call: &mut HostCall<'_>) -> HostResult {
        let returned = (self.function)(call)?;
        match (self.signature.result, returned) {
            (None, None) => Ok(None),
            (Some(expected), Some(value)) if expected.lower() == value.kind() => Ok(Some(value)),
            (expected, returned) => Err(HostError::ResultMismatch(format!(
                "{} returned {}, signature declares {}",
                self.name,
                returned.map_or("nothing".to_string(), |v| v.kind().to_string()),
                expected.map_or("nothing".to_string(), |t| t.to_string()),
            ))),
        }
    }
}

impl fmt::Debug for NativeImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeImport")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Registry of native imports, consulted at link time.
#[derive(Debug, Default)]
pub struct NativeImportTable {
    entries: BTreeMap<(String, String), NativeImport>,
    sealed: bool,
}

impl NativeImportTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Fails once the table is sealed or on a duplicate.
    pub fn register<F>(
        &mut self,
        namespace: &str,
        name: &str,
        signature: NativeSignature,
        function: F,
    ) -> Result<()>
    where
        F: Fn(&mut HostCall<'_>) -> HostResult + Send + Sync + 'static,
    {
        let qualified = format!("{namespace}.{name}");
        if self.sealed {
            return Err(BridgeError::ImportTableSealed(qualified));
        }
        let key = (namespace.to_string(), name.to_string());
        if self.entries.contains_key(&key) {
            return Err(BridgeError::DuplicateImport(qualified));
        }
        tracing::debug!(import = %qualified, signature = %signature, "registered native import");
        self.entries.insert(
            key,
            NativeImport {
                namespace: namespace.to_string(),
                name: name.to_string(),
                signature,
                function: Arc::new(function),
            },
        );
        Ok(())
    }

    /// Look up an entry by exact namespace and name.
    pub fn resolve(&self, namespace: &str, name: &str) -> Option<&NativeImport> {
        self.entries.get(&(namespace.to_string(), name.to_string()))
    }

    /// Check one module import against the table: it must be a function
    /// registered under the same namespace and name whose lowered signature
    /// equals the declared type.
    pub fn check_import(&self, import: &ImportDecl) -> Result<()> {
        let unresolved = || BridgeError::UnresolvedImport {
            module: import.module.clone(),
            name: import.name.clone(),
        };
        let ImportKind::Function(declared) = &import.kind else {
            return Err(unresolved());
        };
        let native = self.resolve(&import.module, &import.name).ok_or_else(unresolved)?;
        let provided = native.signature().lowered();
        if &provided != declared {
            return Err(BridgeError::SignatureMismatch {
                module: import.module.clone(),
                name: import.name.clone(),
                declared: declared.to_string(),
                provided: provided.to_string(),
            });
        }
        Ok(())
    }

    /// All entries, ordered by namespace then name.
    pub fn iter(&self) -> impl Iterator<Item = &NativeImport> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject further registration.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether registration is closed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}
