//! Values and signatures crossing the guest/host boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// WebAssembly value type as declared by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// 128-bit vector (never marshaled)
    V128,
    /// Any reference type (never marshaled)
    Ref,
}

impl ValueKind {
    /// Whether a value of this kind fits in one 32-bit argv word.
    pub fn is_word(self) -> bool {
        matches!(self, ValueKind::I32 | ValueKind::F32)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::V128 => "v128",
            ValueKind::Ref => "ref",
        };
        f.write_str(name)
    }
}

/// A primitive value passed to or returned from the guest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl Value {
    /// Unsigned 32-bit values travel as `i32` bit patterns.
    pub fn from_u32(value: u32) -> Self {
        Value::I32(value as i32)
    }

    /// The value's type.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
        }
    }

    /// Decode one argv word as a value of `kind`.
    pub fn from_word(kind: ValueKind, word: u32) -> Option<Self> {
        match kind {
            ValueKind::I32 => Some(Value::I32(word as i32)),
            ValueKind::F32 => Some(Value::F32(f32::from_bits(word))),
            _ => None,
        }
    }

    /// Encode as one argv word, if the value is 32 bits wide.
    pub fn to_word(self) -> Option<u32> {
        match self {
            Value::I32(v) => Some(v as u32),
            Value::F32(v) => Some(v.to_bits()),
            Value::I64(_) | Value::F64(_) => None,
        }
    }

    /// The `i32` payload, if any.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

/// A function type in WebAssembly terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncSignature {
    /// Parameter types in order
    pub params: Vec<ValueKind>,
    /// Result types in order
    pub results: Vec<ValueKind>,
}

impl FuncSignature {
    /// Create a signature.
    pub fn new(params: &[ValueKind], results: &[ValueKind]) -> Self {
        Self {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

impl fmt::Display for FuncSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", join(&self.params))?;
        match self.results.as_slice() {
            [] => f.write_str(" -> ()"),
            [single] => write!(f, " -> {single}"),
            many => write!(f, " -> ({})", join(many)),
        }
    }
}

fn join(kinds: &[ValueKind]) -> String {
    kinds.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
