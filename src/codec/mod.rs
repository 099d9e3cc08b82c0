//! Codec registry - host types with custom native representations
//!
//! Design: A codec maps one semantic type to a native one in both
//! directions. The registry is keyed by [`TypeKey`] and is consulted before
//! the built-in conversions by fields, arguments, results and callbacks.

mod builtin;
mod encoding;

pub use builtin::{IntegerCodec, OFF_T, SIZE_T, UINT16, UINT32, UINT8};
pub use encoding::{default_encoding, encoding_by_name, Latin1, StringEncoding, Utf8};

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::Result;
use crate::layout::SemanticType;
use crate::value::Value;

/// Registry key naming a semantic type
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(Cow<'static, str>);

impl TypeKey {
    pub const VOID: TypeKey = TypeKey::from_static("void");
    pub const BOOL: TypeKey = TypeKey::from_static("bool");
    pub const INT8: TypeKey = TypeKey::from_static("int8");
    pub const INT16: TypeKey = TypeKey::from_static("int16");
    pub const INT32: TypeKey = TypeKey::from_static("int32");
    pub const INT64: TypeKey = TypeKey::from_static("int64");
    pub const NATIVE_LONG: TypeKey = TypeKey::from_static("long");
    pub const FLOAT32: TypeKey = TypeKey::from_static("float");
    pub const FLOAT64: TypeKey = TypeKey::from_static("double");
    pub const STRING: TypeKey = TypeKey::from_static("string");
    pub const WIDE_STRING: TypeKey = TypeKey::from_static("wstring");
    pub const POINTER: TypeKey = TypeKey::from_static("pointer");
    pub const ARRAY: TypeKey = TypeKey::from_static("array");
    pub const CALLBACK: TypeKey = TypeKey::from_static("callback");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Key of a composite definition
    pub fn structure(name: &str) -> Self {
        Self::new(format!("struct {name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.0)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a conversion happens, for codecs that care
#[derive(Debug, Clone, Copy)]
pub enum CodecContext<'a> {
    Argument { function: &'a str, index: usize },
    Result { function: &'a str },
    Field { structure: &'a str, field: &'a str },
    CallbackParameter { index: usize },
    CallbackResult,
}

/// Bidirectional conversion between a semantic value and its native form
pub trait Codec: Send + Sync {
    /// The type the value takes in native memory or on the ABI
    fn native_type(&self) -> SemanticType;

    fn to_native(&self, value: &Value, ctx: CodecContext<'_>) -> Result<Value>;

    fn from_native(&self, raw: Value, ctx: CodecContext<'_>) -> Result<Value>;

    /// Initial mirrored value of a field using this codec
    fn default_value(&self) -> Value {
        Value::Null
    }
}

static GLOBAL_CODECS: Lazy<CodecRegistry> = Lazy::new(CodecRegistry::with_builtins);

/// Thread-safe map from type key to codec
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Arc<RwLock<HashMap<TypeKey, Arc<dyn Codec>>>>,
}

impl CodecRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the unsigned and size integer codecs
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for codec in IntegerCodec::builtins() {
            registry.register(codec.key().clone(), Arc::new(codec));
        }
        registry
    }

    /// The process-wide registry
    pub fn global() -> &'static CodecRegistry {
        &GLOBAL_CODECS
    }

    /// Register `codec` for `key`, returning the codec it replaces
    pub fn register(&self, key: TypeKey, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        self.codecs.write().insert(key, codec)
    }

    pub fn unregister(&self, key: &TypeKey) -> Option<Arc<dyn Codec>> {
        self.codecs.write().remove(key)
    }

    #[inline]
    pub fn lookup(&self, key: &TypeKey) -> Option<Arc<dyn Codec>> {
        self.codecs.read().get(key).cloned()
    }

    /// Codec for a semantic type, if one is registered
    pub fn lookup_type(&self, ty: &SemanticType) -> Option<Arc<dyn Codec>> {
        if self.is_empty() {
            return None;
        }
        self.lookup(&ty.type_key())
    }

    /// Codec for a value's type, if one is registered
    pub fn lookup_value(&self, value: &Value) -> Option<Arc<dyn Codec>> {
        if self.is_empty() {
            return None;
        }
        value.type_key().and_then(|key| self.lookup(&key))
    }

    pub fn len(&self) -> usize {
        self.codecs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.read().is_empty()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.codecs.read().keys().cloned().collect();
        keys.sort();
        f.debug_struct("CodecRegistry").field("keys", &keys).finish()
    }
}
