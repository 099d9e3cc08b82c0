//! Layout calculator - C struct and union packing
//!
//! Design: A pure function from field declarations and a platform
//! descriptor to byte offsets, reproducing what the platform C compiler
//! does in a given alignment mode:
//! - `None` packs every field on a byte boundary
//! - `MsvcLike` caps alignment at 8
//! - `GnuLike` caps alignment at the size of `long` (8 on SPARC)
//!
//! Layouts that depend on instance data (arrays whose length is only known
//! once a value is assigned) resolve to [`Resolution::Deferred`] instead of
//! failing, unless resolution is forced.

mod calculator;
mod platform;


pub use calculator::calculate;
pub(crate) use calculator::{compute, natural_sizing};
pub use platform::{Arch, Os, Platform};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::callback::CallbackSignature;
use crate::codec::{Codec, TypeKey};
use crate::structure::StructDef;

/// Field packing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AlignmentMode {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "gnu")]
    GnuLike,
    #[serde(rename = "msvc")]
    MsvcLike,
    #[default]
    #[serde(rename = "platform")]
    PlatformDefault,
}

impl FromStr for AlignmentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "packed" => Ok(Self::None),
            "gnu" | "gnuc" | "gcc" => Ok(Self::GnuLike),
            "msvc" => Ok(Self::MsvcLike),
            "platform" | "default" => Ok(Self::PlatformDefault),
            other => Err(format!("unknown alignment mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeKind {
    Struct,
    Union,
}

/// How a composite field or argument is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Passing {
    /// Embedded inline
    ByValue,
    /// Stored as a pointer to separately allocated memory
    ByReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayLen {
    Fixed(usize),
    /// Taken from the instance's assigned array value
    Deferred,
}

/// The C-level meaning of a field, argument or return value
#[derive(Clone)]
pub enum SemanticType {
    Void,
    /// C `int` holding `0` or `-1`
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    /// C `long`, 4 or 8 bytes depending on the platform
    NativeLong,
    Float32,
    Float64,
    /// `char*` in the configured narrow encoding
    NarrowString,
    /// `wchar_t*`
    WideString,
    RawPointer,
    Composite(StructDef, Passing),
    Array(Box<SemanticType>, ArrayLen),
    CallbackRef(Arc<CallbackSignature>),
    /// A host type converted through a registered codec
    Custom(TypeKey),
}

impl SemanticType {
    /// Fixed-length array helper
    pub fn array(element: SemanticType, len: usize) -> Self {
        Self::Array(Box::new(element), ArrayLen::Fixed(len))
    }

    /// Array whose length comes from the assigned value
    pub fn deferred_array(element: SemanticType) -> Self {
        Self::Array(Box::new(element), ArrayLen::Deferred)
    }

    pub fn by_value(def: &StructDef) -> Self {
        Self::Composite(def.clone(), Passing::ByValue)
    }

    pub fn by_reference(def: &StructDef) -> Self {
        Self::Composite(def.clone(), Passing::ByReference)
    }

    pub fn callback(signature: CallbackSignature) -> Self {
        Self::CallbackRef(Arc::new(signature))
    }

    /// Types that cross the ABI without conversion
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::NativeLong
                | Self::Float32
                | Self::Float64
                | Self::RawPointer
        )
    }

    /// Types whose bits are safe to read no matter which union member wrote them
    pub fn is_plain_data(&self) -> bool {
        match self {
            Self::Array(element, _) => element.is_plain_data(),
            other => other.is_primitive(),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        match self {
            Self::Void => TypeKey::VOID,
            Self::Bool => TypeKey::BOOL,
            Self::Int8 => TypeKey::INT8,
            Self::Int16 => TypeKey::INT16,
            Self::Int32 => TypeKey::INT32,
            Self::Int64 => TypeKey::INT64,
            Self::NativeLong => TypeKey::NATIVE_LONG,
            Self::Float32 => TypeKey::FLOAT32,
            Self::Float64 => TypeKey::FLOAT64,
            Self::NarrowString => TypeKey::STRING,
            Self::WideString => TypeKey::WIDE_STRING,
            Self::RawPointer => TypeKey::POINTER,
            Self::Composite(def, _) => TypeKey::structure(def.name()),
            Self::Array(..) => TypeKey::ARRAY,
            Self::CallbackRef(_) => TypeKey::CALLBACK,
            Self::Custom(key) => key.clone(),
        }
    }
}

impl PartialEq for SemanticType {
    fn eq(&self, other: &Self) -> bool {
        use SemanticType::*;
        match (self, other) {
            (Composite(a, pa), Composite(b, pb)) => a.ptr_eq(b) && pa == pb,
            (Array(a, la), Array(b, lb)) => a == b && la == lb,
            (CallbackRef(a), CallbackRef(b)) => a == b,
            (Custom(a), Custom(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Bool => f.write_str("bool"),
            Self::Int8 => f.write_str("int8_t"),
            Self::Int16 => f.write_str("int16_t"),
            Self::Int32 => f.write_str("int32_t"),
            Self::Int64 => f.write_str("int64_t"),
            Self::NativeLong => f.write_str("long"),
            Self::Float32 => f.write_str("float"),
            Self::Float64 => f.write_str("double"),
            Self::NarrowString => f.write_str("char*"),
            Self::WideString => f.write_str("wchar_t*"),
            Self::RawPointer => f.write_str("void*"),
            Self::Composite(def, Passing::ByValue) => write!(f, "struct {}", def.name()),
            Self::Composite(def, Passing::ByReference) => write!(f, "struct {}*", def.name()),
            Self::Array(element, ArrayLen::Fixed(n)) => write!(f, "{element}[{n}]"),
            Self::Array(element, ArrayLen::Deferred) => write!(f, "{element}[]"),
            Self::CallbackRef(_) => f.write_str("callback"),
            Self::Custom(key) => write!(f, "{key}"),
        }
    }
}

impl fmt::Debug for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A declared field of a composite definition
#[derive(Clone)]
pub struct FieldDecl {
    pub(crate) name: String,
    pub(crate) ty: SemanticType,
    pub(crate) volatile: bool,
    pub(crate) codec: Option<Arc<dyn Codec>>,
    pub(crate) alignment: Option<usize>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, ty: SemanticType) -> Self {
        Self {
            name: name.into(),
            ty,
            volatile: false,
            codec: None,
            alignment: None,
        }
    }

    /// Skipped by bulk `write()`; written only through `write_field`
    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Fixed alignment replacing the mode-derived one
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &SemanticType {
        &self.ty
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    /// Type the field takes in native memory
    pub fn native_type(&self) -> SemanticType {
        match &self.codec {
            Some(codec) => codec.native_type(),
            None => self.ty.clone(),
        }
    }
}

impl fmt::Debug for FieldDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDecl")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("volatile", &self.volatile)
            .field("codec", &self.codec.is_some())
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// A field placed in a computed layout
#[derive(Clone)]
pub struct FieldDescriptor {
    pub name: String,
    /// Declared type
    pub ty: SemanticType,
    /// Type in native memory; differs from `ty` when a codec is attached
    pub native: SemanticType,
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub volatile: bool,
    pub codec: Option<Arc<dyn Codec>>,
    /// Element count for array fields
    pub array_len: Option<usize>,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{} ({} bytes, align {})",
            self.native, self.name, self.offset, self.size, self.alignment
        )
    }
}

/// Resolved placement of every field
#[derive(Debug, Clone)]
pub struct StructureLayout {
    pub(crate) name: String,
    pub(crate) kind: CompositeKind,
    pub(crate) mode: AlignmentMode,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) size: usize,
    pub(crate) alignment: usize,
}

impl StructureLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CompositeKind {
        self.kind
    }

    /// Mode after resolving `PlatformDefault`
    pub fn mode(&self) -> AlignmentMode {
        self.mode
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn offsets(&self) -> Vec<usize> {
        self.fields.iter().map(|f| f.offset).collect()
    }
}

/// Outcome of a layout computation
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(StructureLayout),
    /// `field` is an array whose length is not known yet
    Deferred { field: String },
}

impl Resolution {
    pub fn resolved(self) -> Option<StructureLayout> {
        match self {
            Self::Resolved(layout) => Some(layout),
            Self::Deferred { .. } => None,
        }
    }
}
