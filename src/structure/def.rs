//! Composite type definitions and their memoized layouts

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::StructRef;
use crate::abi::CallingConvention;
use crate::codec::Codec;
use crate::config;
use crate::error::{config_error, Result};
use crate::layout::{
    self, AlignmentMode, ArrayLen, CompositeKind, FieldDecl, Platform, Resolution, SemanticType,
    StructureLayout,
};

thread_local! {
    /// Definitions whose layout is being computed on this thread
    static COMPUTING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// Detects a definition that contains itself by value
struct NestingGuard {
    identity: usize,
}

impl NestingGuard {
    fn enter(def: &StructDef) -> Result<Self> {
        let identity = def.identity();
        let fresh = COMPUTING.with(|set| set.borrow_mut().insert(identity));
        if !fresh {
            return Err(config_error!("structure '{}' contains itself by value", def.name()));
        }
        Ok(Self { identity })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        COMPUTING.with(|set| set.borrow_mut().remove(&self.identity));
    }
}

struct DefInner {
    name: String,
    kind: CompositeKind,
    mode: AlignmentMode,
    /// Convention of trampolines stored in callback fields
    convention: CallingConvention,
    fields: OnceCell<Vec<FieldDecl>>,
    layout: OnceCell<Arc<StructureLayout>>,
}

/// A struct or union type: ordered fields plus an alignment mode
///
/// Cheap to clone; clones share the memoized layout. Definitions that
/// reference themselves (through by-reference fields) hold themselves alive
/// and live for the rest of the process, like any type declaration.
#[derive(Clone)]
pub struct StructDef {
    inner: Arc<DefInner>,
}

impl StructDef {
    pub fn builder(name: impl Into<String>) -> StructDefBuilder {
        StructDefBuilder {
            name: name.into(),
            mode: config::current().layout.default_alignment,
            convention: CallingConvention::C,
            fields: Vec::new(),
        }
    }

    /// Declare a definition whose fields are supplied later by [`define`](Self::define)
    ///
    /// Needed for definitions that refer to themselves.
    pub fn declare(name: impl Into<String>, kind: CompositeKind, mode: AlignmentMode) -> Self {
        Self::declare_with_convention(name, kind, mode, CallingConvention::C)
    }

    /// Like [`declare`](Self::declare), for types whose callback fields are
    /// called with `convention`
    pub fn declare_with_convention(
        name: impl Into<String>,
        kind: CompositeKind,
        mode: AlignmentMode,
        convention: CallingConvention,
    ) -> Self {
        Self {
            inner: Arc::new(DefInner {
                name: name.into(),
                kind,
                mode,
                convention,
                fields: OnceCell::new(),
                layout: OnceCell::new(),
            }),
        }
    }

    /// Supply the fields of a declared definition
    pub fn define(&self, fields: Vec<FieldDecl>) -> Result<()> {
        validate_fields(&self.inner.name, &fields)?;
        self.inner
            .fields
            .set(fields)
            .map_err(|_| config_error!("structure '{}' is already defined", self.inner.name))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn kind(&self) -> CompositeKind {
        self.inner.kind
    }

    #[inline]
    pub fn is_union(&self) -> bool {
        self.inner.kind == CompositeKind::Union
    }

    #[inline]
    pub fn mode(&self) -> AlignmentMode {
        self.inner.mode
    }

    #[inline]
    pub fn convention(&self) -> CallingConvention {
        self.inner.convention
    }

    pub fn fields(&self) -> Result<&[FieldDecl]> {
        self.inner
            .fields
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| config_error!("structure '{}' was declared but never defined", self.inner.name))
    }

    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.fields()?
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| config_error!("structure '{}' has no field '{name}'", self.inner.name))
    }

    /// Whether any field's length comes from instance data
    pub fn has_deferred_fields(&self) -> bool {
        self.inner.fields.get().is_some_and(|fields| {
            fields
                .iter()
                .any(|f| matches!(f.native_type(), SemanticType::Array(_, ArrayLen::Deferred)))
        })
    }

    /// The memoized layout on the current platform
    ///
    /// Fails for definitions with deferred array fields, whose layout is
    /// per instance.
    pub fn layout(&self) -> Result<Arc<StructureLayout>> {
        if let Some(layout) = self.inner.layout.get() {
            return Ok(layout.clone());
        }
        let _nesting = NestingGuard::enter(self)?;
        self.inner
            .layout
            .get_or_try_init(|| self.forced(&Platform::current()).map(Arc::new))
            .cloned()
    }

    /// Forced layout on `platform`, memoized only for the current platform
    pub fn layout_for(&self, platform: &Platform) -> Result<Arc<StructureLayout>> {
        if *platform == Platform::current() {
            return self.layout();
        }
        let _nesting = NestingGuard::enter(self)?;
        self.forced(platform).map(Arc::new)
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.layout()?.size())
    }

    pub fn alignment(&self) -> Result<usize> {
        Ok(self.layout()?.alignment())
    }

    /// Unmemoized computation used by instances with deferred arrays
    pub(crate) fn compute(
        &self,
        platform: &Platform,
        force: bool,
        deferred_len: &dyn Fn(usize) -> Option<usize>,
    ) -> Result<Resolution> {
        layout::compute(
            &self.inner.name,
            self.fields()?,
            self.inner.kind,
            self.inner.mode,
            platform,
            force,
            deferred_len,
        )
    }

    fn forced(&self, platform: &Platform) -> Result<StructureLayout> {
        match self.compute(platform, true, &|_| None)? {
            Resolution::Resolved(layout) => Ok(layout),
            Resolution::Deferred { field } => Err(config_error!(
                "array field '{field}' of '{}' must be initialized",
                self.inner.name
            )),
        }
    }

    /// A new zeroed instance
    pub fn instantiate(&self) -> StructRef {
        StructRef::new(self)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &StructDef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for StructDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StructDef({})", self.inner.name)
    }
}

fn validate_fields(name: &str, fields: &[FieldDecl]) -> Result<()> {
    if fields.is_empty() {
        return Err(config_error!("structure '{name}' has unknown size (no fields)"));
    }
    let mut seen = HashSet::with_capacity(fields.len());
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(config_error!("structure '{name}' declares field '{}' twice", field.name));
        }
        if matches!(field.ty, SemanticType::Void) {
            return Err(config_error!("field '{}' of '{name}' is void", field.name));
        }
    }
    Ok(())
}

/// Declarative field list for a [`StructDef`]
pub struct StructDefBuilder {
    name: String,
    mode: AlignmentMode,
    convention: CallingConvention,
    fields: Vec<FieldDecl>,
}

impl StructDefBuilder {
    pub fn field(self, name: impl Into<String>, ty: SemanticType) -> Self {
        self.push(FieldDecl::new(name, ty))
    }

    /// A field skipped by bulk `write()`
    pub fn volatile_field(self, name: impl Into<String>, ty: SemanticType) -> Self {
        self.push(FieldDecl::new(name, ty).volatile())
    }

    pub fn field_with_codec(
        self,
        name: impl Into<String>,
        ty: SemanticType,
        codec: Arc<dyn Codec>,
    ) -> Self {
        self.push(FieldDecl::new(name, ty).with_codec(codec))
    }

    /// A field with a fixed alignment
    pub fn aligned_field(self, name: impl Into<String>, ty: SemanticType, alignment: usize) -> Self {
        self.push(FieldDecl::new(name, ty).with_alignment(alignment))
    }

    pub fn push(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    pub fn align(mut self, mode: AlignmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Calling convention for callbacks stored in this type's fields
    pub fn convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn build(self) -> Result<StructDef> {
        self.finish(CompositeKind::Struct)
    }

    pub fn build_union(self) -> Result<StructDef> {
        self.finish(CompositeKind::Union)
    }

    fn finish(self, kind: CompositeKind) -> Result<StructDef> {
        let def = StructDef::declare_with_convention(self.name, kind, self.mode, self.convention);
        def.define(self.fields)?;
        Ok(def)
    }
}
