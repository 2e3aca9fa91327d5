//! Runtime value representation
//!
//! Hosts hand argument tuples to the core as slices of [`Value`]. The core
//! never looks inside a callable; it only inspects values to derive type
//! signatures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A host callable. Errors raised by user code travel as `anyhow::Error`.
pub type Callable = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Wrap a closure as a [`Callable`]
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Dense numeric container with a fixed element width
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl TypedArray {
    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            TypedArray::Int8(v) => v.len(),
            TypedArray::Int16(v) => v.len(),
            TypedArray::Int32(v) => v.len(),
            TypedArray::Uint8(v) => v.len(),
            TypedArray::Uint16(v) => v.len(),
            TypedArray::Uint32(v) => v.len(),
            TypedArray::Float32(v) => v.len(),
            TypedArray::Float64(v) => v.len(),
        }
    }

    /// Whether the container holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element-width tag, independent of contents
    pub fn tag(&self) -> &'static str {
        match self {
            TypedArray::Int8(_) => "int8array",
            TypedArray::Int16(_) => "int16array",
            TypedArray::Int32(_) => "int32array",
            TypedArray::Uint8(_) => "uint8array",
            TypedArray::Uint16(_) => "uint16array",
            TypedArray::Uint32(_) => "uint32array",
            TypedArray::Float32(_) => "float32array",
            TypedArray::Float64(_) => "float64array",
        }
    }
}

/// Runtime value types
#[derive(Clone)]
pub enum Value {
    /// Explicit null
    Null,

    /// Absent value
    Undefined,

    /// Boolean value
    Bool(bool),

    /// Integer value
    Int(i64),

    /// Floating point value
    Float(f64),

    /// String value
    String(String),

    /// Callable value
    Function(Callable),

    /// Generic ordered sequence
    Array(Vec<Value>),

    /// Homogeneous dense numeric sequence
    TypedArray(TypedArray),

    /// Keyed composite value
    Object(BTreeMap<String, Value>),

    /// Host value the core cannot classify
    Opaque(String),
}

impl Value {
    /// Build an array value
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(items.into_iter().collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Undefined => write!(f, "Undefined"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Function(_) => write!(f, "Function(<callable>)"),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::TypedArray(arr) => f.debug_tuple("TypedArray").field(arr).finish(),
            Value::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Value::Opaque(name) => write!(f, "Opaque({})", name),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::TypedArray(a), Value::TypedArray(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<TypedArray> for Value {
    fn from(arr: TypedArray) -> Self {
        Value::TypedArray(arr)
    }
}
