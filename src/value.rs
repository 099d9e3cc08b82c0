//! Managed value model - what the host passes to and receives from native code
//!
//! Design: one dynamically typed enum covering every argument, field and
//! result shape. Values that native code may modify (by-reference cells,
//! string buffers, arrays, structures) are shared handles, so updates made
//! after a call are visible to every clone the caller holds.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::codec::TypeKey;
use crate::error::{config_error, Result};
use crate::layout::SemanticType;
use crate::memory::Pointer;
use crate::structure::StructRef;

#[derive(Clone)]
pub enum Value {
    /// Null pointer, null string, or an unset field
    Null,
    /// Result of a `void` function
    Void,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    NativeLong(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    WideString(String),
    Pointer(Pointer),
    Structure(StructRef),
    /// Elements that must be contiguous in native memory
    StructureArray(Vec<StructRef>),
    /// Fixed-size array field, or a primitive array argument copied back after the call
    Array(ArrayValue),
    /// Passed as a NULL-terminated `char**` (or `wchar_t**`)
    StringArray(ArrayValue),
    ByReference(ByReference),
    StringBuffer(StringBuffer),
    Callback(Arc<dyn Callback>),
    /// Trailing variable arguments, flattened at invocation
    Spread(Vec<Value>),
    Custom(CustomValue),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null) || matches!(self, Value::Pointer(p) if p.is_null())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant, widened
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(i64::from(v)),
            Value::Int16(v) => Some(i64::from(v)),
            Value::Int32(v) => Some(i64::from(v)),
            Value::Int64(v) | Value::NativeLong(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(f64::from(v)),
            Value::Float64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::WideString(s) => Some(s),
            _ => None,
        }
    }

    /// Pointer payload; `Null` reads as the null address
    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            Value::Pointer(p) => Some(*p),
            Value::Null => Some(Pointer::NULL),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructRef> {
        match self {
            Value::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) | Value::StringArray(a) => Some(a),
            _ => None,
        }
    }

    /// `Pointer(p)`, or `Null` for the null address
    pub fn from_pointer(p: Pointer) -> Self {
        if p.is_null() {
            Value::Null
        } else {
            Value::Pointer(p)
        }
    }

    /// The ABI-primitive type this value carries, if any
    pub fn primitive_type(&self) -> Option<SemanticType> {
        Some(match self {
            Value::Bool(_) => SemanticType::Bool,
            Value::Int8(_) => SemanticType::Int8,
            Value::Int16(_) => SemanticType::Int16,
            Value::Int32(_) => SemanticType::Int32,
            Value::Int64(_) => SemanticType::Int64,
            Value::NativeLong(_) => SemanticType::NativeLong,
            Value::Float32(_) => SemanticType::Float32,
            Value::Float64(_) => SemanticType::Float64,
            Value::Pointer(_) => SemanticType::RawPointer,
            _ => return None,
        })
    }

    /// Codec registry key of this value
    pub fn type_key(&self) -> Option<TypeKey> {
        Some(match self {
            Value::Null | Value::Void | Value::Spread(_) => return None,
            Value::Bool(_) => TypeKey::BOOL,
            Value::Int8(_) => TypeKey::INT8,
            Value::Int16(_) => TypeKey::INT16,
            Value::Int32(_) => TypeKey::INT32,
            Value::Int64(_) => TypeKey::INT64,
            Value::NativeLong(_) => TypeKey::NATIVE_LONG,
            Value::Float32(_) => TypeKey::FLOAT32,
            Value::Float64(_) => TypeKey::FLOAT64,
            Value::String(_) => TypeKey::STRING,
            Value::WideString(_) => TypeKey::WIDE_STRING,
            Value::Pointer(_) => TypeKey::POINTER,
            Value::Structure(s) => TypeKey::structure(s.def().name()),
            Value::Array(_) | Value::StringArray(_) | Value::StructureArray(_) => TypeKey::ARRAY,
            Value::ByReference(_) | Value::StringBuffer(_) => TypeKey::POINTER,
            Value::Callback(_) => TypeKey::CALLBACK,
            Value::Custom(c) => c.key().clone(),
        })
    }

    /// Short name used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::NativeLong(_) => "long",
            Value::Float32(_) => "float",
            Value::Float64(_) => "double",
            Value::String(_) => "string",
            Value::WideString(_) => "wide string",
            Value::Pointer(_) => "pointer",
            Value::Structure(_) => "structure",
            Value::StructureArray(_) => "structure array",
            Value::Array(_) => "array",
            Value::StringArray(_) => "string array",
            Value::ByReference(_) => "by-reference cell",
            Value::StringBuffer(_) => "string buffer",
            Value::Callback(_) => "callback",
            Value::Spread(_) => "spread",
            Value::Custom(_) => "custom",
        }
    }
}

fn same_arc<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) | (Void, Void) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int8(a), Int8(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (Int64(a), Int64(b)) | (NativeLong(a), NativeLong(b)) => a == b,
            (Float32(a), Float32(b)) => a == b,
            (Float64(a), Float64(b)) => a == b,
            (String(a), String(b)) | (WideString(a), WideString(b)) => a == b,
            (Pointer(a), Pointer(b)) => a == b,
            (Structure(a), Structure(b)) => a.ptr_eq(b),
            (StructureArray(a), StructureArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ptr_eq(y))
            }
            (Array(a), Array(b)) | (StringArray(a), StringArray(b)) => {
                a.ptr_eq(b) || a.to_vec() == b.to_vec()
            }
            (ByReference(a), ByReference(b)) => a.ptr_eq(b),
            (StringBuffer(a), StringBuffer(b)) => a.ptr_eq(b),
            (Callback(a), Callback(b)) => same_arc(a, b),
            (Spread(a), Spread(b)) => a == b,
            (Custom(a), Custom(b)) => a.key == b.key && same_arc(&a.payload, &b.payload),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Void => f.write_str("Void"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int8(v) => write!(f, "Int8({v})"),
            Value::Int16(v) => write!(f, "Int16({v})"),
            Value::Int32(v) => write!(f, "Int32({v})"),
            Value::Int64(v) => write!(f, "Int64({v})"),
            Value::NativeLong(v) => write!(f, "NativeLong({v})"),
            Value::Float32(v) => write!(f, "Float32({v})"),
            Value::Float64(v) => write!(f, "Float64({v})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::WideString(s) => write!(f, "WideString({s:?})"),
            Value::Pointer(p) => write!(f, "Pointer({p:?})"),
            Value::Structure(s) => write!(f, "Structure({s:?})"),
            Value::StructureArray(items) => write!(f, "StructureArray({items:?})"),
            Value::Array(a) => write!(f, "Array({:?})", a.to_vec()),
            Value::StringArray(a) => write!(f, "StringArray({:?})", a.to_vec()),
            Value::ByReference(r) => write!(f, "ByReference({}: {:?})", r.ty(), r.value()),
            Value::StringBuffer(b) => write!(f, "StringBuffer({:?}, cap {})", b.value(), b.capacity()),
            Value::Callback(cb) => write!(f, "Callback({:p})", Arc::as_ptr(cb) as *const ()),
            Value::Spread(items) => write!(f, "Spread({items:?})"),
            Value::Custom(c) => write!(f, "Custom({})", c.key),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                #[inline]
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Pointer => Pointer,
    StructRef => Structure,
    ByReference => ByReference,
    StringBuffer => StringBuffer,
    CustomValue => Custom,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Arc<dyn Callback>> for Value {
    fn from(cb: Arc<dyn Callback>) -> Self {
        Value::Callback(cb)
    }
}

// ============================================================================
// Shared handles
// ============================================================================

/// A shared, fixed-length list of values
#[derive(Clone, Default)]
pub struct ArrayValue(Arc<Mutex<Vec<Value>>>);

impl ArrayValue {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    /// `len` copies of `value`
    pub fn filled(len: usize, value: Value) -> Self {
        Self::new(vec![value; len])
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.lock().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> Result<()> {
        let mut items = self.0.lock();
        let len = items.len();
        let slot = items
            .get_mut(index)
            .ok_or_else(|| config_error!("array index {index} out of range for length {len}"))?;
        *slot = value;
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.0.lock().clone()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ArrayValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<Value>> for ArrayValue {
    fn from(items: Vec<Value>) -> Self {
        Self::new(items)
    }
}

/// A primitive passed by address and updated after the call
#[derive(Clone)]
pub struct ByReference {
    ty: SemanticType,
    cell: Arc<Mutex<Value>>,
}

impl ByReference {
    /// Cell of a primitive type holding `initial`
    pub fn new(ty: SemanticType, initial: Value) -> Result<Self> {
        if !ty.is_primitive() {
            return Err(config_error!("by-reference cells hold primitives, not {ty}"));
        }
        Ok(Self {
            ty,
            cell: Arc::new(Mutex::new(initial)),
        })
    }

    fn primitive(ty: SemanticType, initial: Value) -> Self {
        Self {
            ty,
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn int8(v: i8) -> Self {
        Self::primitive(SemanticType::Int8, Value::Int8(v))
    }

    pub fn int16(v: i16) -> Self {
        Self::primitive(SemanticType::Int16, Value::Int16(v))
    }

    pub fn int32(v: i32) -> Self {
        Self::primitive(SemanticType::Int32, Value::Int32(v))
    }

    pub fn int64(v: i64) -> Self {
        Self::primitive(SemanticType::Int64, Value::Int64(v))
    }

    pub fn native_long(v: i64) -> Self {
        Self::primitive(SemanticType::NativeLong, Value::NativeLong(v))
    }

    pub fn float32(v: f32) -> Self {
        Self::primitive(SemanticType::Float32, Value::Float32(v))
    }

    pub fn float64(v: f64) -> Self {
        Self::primitive(SemanticType::Float64, Value::Float64(v))
    }

    pub fn pointer(p: Pointer) -> Self {
        Self::primitive(SemanticType::RawPointer, Value::from_pointer(p))
    }

    #[inline]
    pub fn ty(&self) -> &SemanticType {
        &self.ty
    }

    pub fn value(&self) -> Value {
        self.cell.lock().clone()
    }

    pub fn set_value(&self, value: Value) {
        *self.cell.lock() = value;
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ByReference) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// A caller-owned narrow string buffer native code writes into
#[derive(Clone)]
pub struct StringBuffer {
    capacity: usize,
    cell: Arc<Mutex<String>>,
}

impl StringBuffer {
    /// Empty buffer holding up to `capacity` characters
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cell: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn with_content(content: &str, capacity: usize) -> Result<Self> {
        let len = content.chars().count();
        if len > capacity {
            return Err(config_error!("{len} characters do not fit a buffer of {capacity}"));
        }
        Ok(Self {
            capacity,
            cell: Arc::new(Mutex::new(content.to_string())),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn value(&self) -> String {
        self.cell.lock().clone()
    }

    pub fn set(&self, content: String) {
        *self.cell.lock() = content;
    }

    #[inline]
    pub fn ptr_eq(&self, other: &StringBuffer) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// A host value of a codec-managed type
#[derive(Clone)]
pub struct CustomValue {
    key: TypeKey,
    payload: Arc<dyn Any + Send + Sync>,
}

impl CustomValue {
    pub fn new<T: Any + Send + Sync>(key: TypeKey, payload: T) -> Self {
        Self {
            key,
            payload: Arc::new(payload),
        }
    }

    #[inline]
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}
