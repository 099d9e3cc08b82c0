//! Structure instances and their synchronization with native memory

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::guard::ReadGuard;
use super::StructDef;
use crate::abi::CallingConvention;
use crate::callback::CallbackRegistry;
use crate::codec::{default_encoding, CodecContext, StringEncoding};
use crate::error::{config_error, Result};
use crate::layout::{
    natural_sizing, ArrayLen, FieldDecl, Passing, Platform, Resolution, SemanticType,
    StructureLayout,
};
use crate::logging::log_codec_conversion;
use crate::marshal;
use crate::memory::{MemoryRegion, NativeString, Pointer};
use crate::value::{ArrayValue, Value};

struct Shared {
    def: StructDef,
    /// Base address once memory exists, readable without taking the state lock
    address: AtomicUsize,
    state: Mutex<Structure>,
}

/// Shared handle to a structure or union instance
///
/// Clones refer to the same instance. Callers follow single-writer
/// discipline: the lock protects the mirrored values, not the pairing of
/// values and native bytes.
#[derive(Clone)]
pub struct StructRef {
    inner: Arc<Shared>,
}

/// Mutable state of one instance
struct Structure {
    def: StructDef,
    /// Memoized for the definition, or resolved per instance for deferred arrays
    layout: Option<Arc<StructureLayout>>,
    region: Option<MemoryRegion>,
    values: Vec<Value>,
    /// Transient native strings keyed by slot name (`field` or `field[i]`)
    strings: HashMap<String, NativeString>,
    /// Authoritative union member
    selected: Option<usize>,
    platform: Platform,
    encoding: Arc<dyn StringEncoding>,
}

impl StructRef {
    /// A new instance of `def` with zeroed fields and no memory yet
    pub fn new(def: &StructDef) -> Self {
        Self {
            inner: Arc::new(Shared {
                def: def.clone(),
                address: AtomicUsize::new(0),
                state: Mutex::new(Structure {
                    def: def.clone(),
                    layout: None,
                    region: None,
                    values: Vec::new(),
                    strings: HashMap::new(),
                    selected: None,
                    platform: Platform::current(),
                    encoding: default_encoding(),
                }),
            }),
        }
    }

    /// `count` contiguous zeroed instances; element 0 owns the memory
    pub fn new_array(def: &StructDef, count: usize) -> Result<Vec<StructRef>> {
        StructRef::new(def).to_array_view(count)
    }

    /// `count` instances over native memory at `address`, each read
    ///
    /// # Safety
    /// `address` must hold `count` contiguous instances of `def` and stay
    /// valid while the instances are used.
    pub unsafe fn array_at(def: &StructDef, address: Pointer, count: usize) -> Result<Vec<StructRef>> {
        let size = def.size()?;
        let total = size
            .checked_mul(count)
            .ok_or_else(|| config_error!("{count} elements of '{}' overflow the address space", def.name()))?;
        let first = StructRef::new(def);
        first.attach(MemoryRegion::foreign(address, Some(total))?)?;
        first.read()?;
        first.to_array_view(count)
    }

    #[inline]
    pub fn def(&self) -> &StructDef {
        &self.inner.def
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Structure) -> Result<R>) -> Result<R> {
        let mut state = self.inner.state.lock();
        state.init_values();
        let result = f(&mut state);
        let address = state
            .region
            .as_ref()
            .and_then(|region| region.address().ok())
            .map_or(0, Pointer::address);
        self.inner.address.store(address, Ordering::Release);
        result
    }

    /// Last known base address, without locking
    #[inline]
    pub(crate) fn cached_address(&self) -> Pointer {
        Pointer::new(self.inner.address.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    #[inline]
    pub fn ptr_eq(&self, other: &StructRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Size in bytes; fixed once resolved
    pub fn size(&self) -> Result<usize> {
        self.with_state(|s| Ok(s.layout()?.size()))
    }

    pub fn layout(&self) -> Result<Arc<StructureLayout>> {
        self.with_state(Structure::layout)
    }

    /// Base address, allocating owned memory if the instance has none
    pub fn pointer(&self) -> Result<Pointer> {
        self.with_state(|s| {
            s.ensure_memory()?;
            s.memory()?.address()
        })
    }

    /// Address for a by-reference slot; never locks an instance that has memory
    pub(crate) fn address_or_allocate(&self) -> Result<Pointer> {
        let address = self.cached_address();
        if address.is_null() {
            self.pointer()
        } else {
            Ok(address)
        }
    }

    /// A non-owning view of the instance's memory
    pub fn region(&self) -> Result<MemoryRegion> {
        self.with_state(|s| {
            s.ensure_memory()?;
            s.memory()?.view()
        })
    }

    /// Serialize every non-volatile field (a union: only its selected field)
    pub fn write(&self) -> Result<()> {
        self.pointer()?;
        self.with_state(Structure::write_all)
    }

    /// Refresh the mirrored values from native memory
    ///
    /// Re-entering an instance already being read is a no-op.
    pub fn read(&self) -> Result<()> {
        let Some(_guard) = ReadGuard::enter(self.identity()) else {
            return Ok(());
        };
        self.pointer()?;
        self.with_state(Structure::read_all)
    }

    /// Read a single field, returning its new value
    pub fn read_field(&self, name: &str) -> Result<Value> {
        let _guard = ReadGuard::enter(self.identity());
        self.pointer()?;
        self.with_state(|s| {
            let index = s.def.field_index(name)?;
            let layout = s.layout()?;
            s.read_field_at(index, &layout)
        })
    }

    /// Write a single field, volatile or not; on a union this selects it
    pub fn write_field(&self, name: &str) -> Result<()> {
        self.pointer()?;
        self.with_state(|s| {
            let index = s.def.field_index(name)?;
            if s.def.is_union() {
                s.selected = Some(index);
            }
            let layout = s.layout()?;
            s.write_field_at(index, &layout)
        })
    }

    /// Mirrored value of a field
    pub fn get(&self, name: &str) -> Result<Value> {
        self.with_state(|s| {
            let index = s.def.field_index(name)?;
            s.materialize(index)?;
            Ok(s.values[index].clone())
        })
    }

    /// Replace the mirrored value of a field; native memory is untouched until `write()`
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let me = self.identity();
        self.with_state(|s| {
            let index = s.def.field_index(name)?;
            let decl = &s.def.fields()?[index];
            if let (SemanticType::Composite(_, Passing::ByValue), Value::Structure(child)) = (&decl.ty, &value) {
                if child.identity() == me {
                    return Err(config_error!("structure '{}' cannot contain itself", s.def.name()));
                }
            }
            if decl.codec.is_none() && !accepts(&decl.ty, &value) {
                return Err(config_error!(
                    "field '{name}' of '{}' is {}, not {}",
                    s.def.name(),
                    decl.ty,
                    value.kind_name()
                ));
            }
            if let (SemanticType::Array(_, ArrayLen::Deferred), Some(layout)) = (&decl.ty, &s.layout) {
                let fixed = layout.fields()[index].array_len;
                if value.as_array().map(ArrayValue::len) != fixed {
                    return Err(config_error!(
                        "array field '{name}' of '{}' keeps {} elements once its size is known",
                        s.def.name(),
                        fixed.unwrap_or(0)
                    ));
                }
            }
            s.values[index] = value;
            Ok(())
        })
    }

    /// Use `len(self)` bytes of `region` at `offset` as this instance's memory
    pub fn bind_memory(&self, region: &MemoryRegion, offset: usize) -> Result<()> {
        let size = self.size()?;
        self.attach(region.share(offset, size)?)
    }

    /// Use native memory at `address` as this instance's memory
    ///
    /// # Safety
    /// `address` must be valid for reads and writes of `size()` bytes while
    /// the instance uses it.
    pub unsafe fn bind_address(&self, address: Pointer) -> Result<()> {
        let size = self.size()?;
        self.attach(MemoryRegion::foreign(address, Some(size))?)
    }

    pub(crate) fn attach(&self, region: MemoryRegion) -> Result<()> {
        self.with_state(|s| {
            s.region = Some(region);
            Ok(())
        })
    }

    /// `count` instances over contiguous memory starting at this one
    ///
    /// Owned memory that is too small grows (preserving content). Memory
    /// shared from another instance must already be large enough. Foreign
    /// memory is taken to extend over all `count` elements: callers viewing
    /// a native array must not ask for more elements than it holds. Element 0
    /// is `self`; the others are read from memory.
    pub fn to_array_view(&self, count: usize) -> Result<Vec<StructRef>> {
        if count == 0 {
            return Err(config_error!("an array view needs at least one element"));
        }
        let size = self.size()?;
        let needed = size
            .checked_mul(count)
            .ok_or_else(|| config_error!("{count} elements of '{}' overflow the address space", self.def().name()))?;
        let base = self.with_state(|s| {
            s.ensure_memory()?;
            let region = s.memory_mut()?;
            let short = region.len().is_some_and(|len| len < needed);
            if short && region.is_owned() {
                region.grow_preserving(needed)?;
            }
            if short && region.is_foreign() {
                // SAFETY: the caller vouches for `count` elements at this address
                return unsafe { MemoryRegion::foreign(region.address()?, Some(needed)) };
            }
            region.view()
        })?;

        let mut elements = Vec::with_capacity(count);
        elements.push(self.clone());
        for index in 1..count {
            let element = StructRef::new(self.def());
            element.attach(base.share(index * size, size)?)?;
            element.read()?;
            elements.push(element);
        }
        Ok(elements)
    }

    /// Select the authoritative member of a union
    pub fn set_type(&self, name: &str) -> Result<()> {
        self.with_state(|s| {
            if !s.def.is_union() {
                return Err(config_error!("'{}' is not a union", s.def.name()));
            }
            s.selected = Some(s.def.field_index(name)?);
            Ok(())
        })
    }

    pub fn selected_field(&self) -> Option<String> {
        let state = self.inner.state.lock();
        let index = state.selected?;
        state.def.fields().ok().map(|fields| fields[index].name.clone())
    }

    /// Read a union's memory as an instance of `def`
    ///
    /// A member declared with `def` by value becomes the selected field and
    /// holds the returned instance.
    pub fn typed_value(&self, def: &StructDef) -> Result<StructRef> {
        self.pointer()?;
        let instance = StructRef::new(def);
        let size = instance.size()?;
        self.with_state(|s| {
            if !s.def.is_union() {
                return Err(config_error!("'{}' is not a union", s.def.name()));
            }
            instance.attach(s.memory()?.share(0, size)?)?;
            instance.read()?;
            let member = s.def.fields()?.iter().position(|f| {
                matches!(&f.ty, SemanticType::Composite(d, Passing::ByValue) if d.ptr_eq(def))
            });
            if let Some(index) = member {
                s.selected = Some(index);
                s.values[index] = Value::Structure(instance.clone());
            }
            Ok(instance.clone())
        })
    }

    /// Zero the instance's native memory; mirrored values are kept
    pub fn clear(&self) -> Result<()> {
        self.with_state(|s| {
            let size = s.layout()?.size();
            s.ensure_memory()?;
            s.memory()?.fill(0, size, 0)
        })
    }

    /// Copy of the instance's native bytes
    pub fn native_bytes(&self) -> Result<Vec<u8>> {
        self.with_state(|s| {
            let size = s.layout()?.size();
            s.ensure_memory()?;
            s.memory()?.read_bytes(0, size)
        })
    }

    /// Byte-wise equality of native memory
    pub fn content_eq(&self, other: &StructRef) -> Result<bool> {
        if self.ptr_eq(other) {
            return Ok(true);
        }
        Ok(self.native_bytes()? == other.native_bytes()?)
    }

    /// Field listing with offsets and a hex dump of native memory
    pub fn dump(&self) -> Result<String> {
        let address = self.pointer()?;
        self.with_state(|s| {
            let layout = s.layout()?;
            let kind = if s.def.is_union() { "union" } else { "struct" };
            let mut out = format!(
                "{kind} {}({address}) ({} bytes) {{\n",
                s.def.name(),
                layout.size()
            );
            for (index, field) in layout.fields().iter().enumerate() {
                let marker = if s.selected == Some(index) { '*' } else { ' ' };
                out.push_str(&format!(
                    " {marker}{} {}@0x{:x}={:?}\n",
                    field.native, field.name, field.offset, s.values[index]
                ));
            }
            out.push_str("}\nmemory dump\n");
            let bytes = s.memory()?.read_bytes(0, layout.size())?;
            for chunk in bytes.chunks(4) {
                out.push('[');
                for byte in chunk {
                    out.push_str(&format!("{byte:02x}"));
                }
                out.push_str("]\n");
            }
            Ok(out)
        })
    }
}

impl fmt::Debug for StructRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.def().name(), self.cached_address())
    }
}

impl Structure {
    fn init_values(&mut self) {
        if self.values.is_empty() {
            if let Ok(fields) = self.def.fields() {
                self.values = fields.iter().map(initial_value).collect();
            }
        }
    }

    fn layout(&mut self) -> Result<Arc<StructureLayout>> {
        if let Some(layout) = &self.layout {
            return Ok(layout.clone());
        }
        let layout = if self.def.has_deferred_fields() {
            let values = &self.values;
            let len_of = |index: usize| values.get(index).and_then(Value::as_array).map(ArrayValue::len);
            match self.def.compute(&self.platform, true, &len_of)? {
                Resolution::Resolved(layout) => Arc::new(layout),
                Resolution::Deferred { field } => {
                    return Err(config_error!(
                        "array field '{field}' of '{}' must be initialized",
                        self.def.name()
                    ))
                }
            }
        } else {
            self.def.layout_for(&self.platform)?
        };
        self.layout = Some(layout.clone());
        Ok(layout)
    }

    fn ensure_memory(&mut self) -> Result<()> {
        if self.region.is_none() {
            let size = self.layout()?.size();
            self.region = Some(MemoryRegion::allocate(size)?);
        }
        Ok(())
    }

    fn memory(&self) -> Result<&MemoryRegion> {
        self.region
            .as_ref()
            .ok_or_else(|| config_error!("structure '{}' has no memory", self.def.name()))
    }

    fn memory_mut(&mut self) -> Result<&mut MemoryRegion> {
        let name = self.def.name();
        self.region
            .as_mut()
            .ok_or_else(|| config_error!("structure '{name}' has no memory"))
    }

    /// Create by-value members and fixed arrays on first use
    fn materialize(&mut self, index: usize) -> Result<()> {
        if matches!(self.values[index], Value::Null) {
            let decl = &self.def.fields()?[index];
            if decl.codec.is_none() {
                self.values[index] = materialized_value(&decl.ty);
            }
        }
        Ok(())
    }

    /// Field I/O context plus the mirrored values, borrowed disjointly
    fn split(&mut self) -> Result<(FieldIo<'_>, &mut Vec<Value>)> {
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| config_error!("structure '{}' has no memory", self.def.name()))?;
        Ok((
            FieldIo {
                structure: self.def.name(),
                convention: self.def.convention(),
                region,
                strings: &mut self.strings,
                platform: &self.platform,
                encoding: &*self.encoding,
            },
            &mut self.values,
        ))
    }

    fn write_all(&mut self) -> Result<()> {
        let layout = self.layout()?;
        self.ensure_memory()?;
        if self.def.is_union() {
            if let Some(index) = self.selected {
                self.write_field_at(index, &layout)?;
            }
            return Ok(());
        }
        for (index, field) in layout.fields().iter().enumerate() {
            if !field.volatile {
                self.write_field_at(index, &layout)?;
            }
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<()> {
        let layout = self.layout()?;
        self.ensure_memory()?;
        let union = self.def.is_union();
        for (index, field) in layout.fields().iter().enumerate() {
            // Arbitrary bits must not be dereferenced as a pointer
            if union && self.selected != Some(index) && !field.native.is_plain_data() {
                continue;
            }
            self.read_field_at(index, &layout)?;
        }
        Ok(())
    }

    fn write_field_at(&mut self, index: usize, layout: &StructureLayout) -> Result<()> {
        let field = &layout.fields()[index];
        self.materialize(index)?;
        let (mut io, values) = self.split()?;
        let value = &values[index];
        match &field.codec {
            Some(codec) => {
                let ctx = CodecContext::Field {
                    structure: io.structure,
                    field: &field.name,
                };
                let native = codec.to_native(value, ctx)?;
                log_codec_conversion(&field.name, "to_native");
                io.store(&field.native, field.offset, field.size, &native, &field.name)
            }
            None => io.store(&field.native, field.offset, field.size, value, &field.name),
        }
    }

    fn read_field_at(&mut self, index: usize, layout: &StructureLayout) -> Result<Value> {
        let field = &layout.fields()[index];
        self.materialize(index)?;
        let (mut io, values) = self.split()?;
        let value = match &field.codec {
            Some(codec) => {
                let raw = io.fetch(&field.native, field.offset, field.size, &Value::Null, &field.name)?;
                let ctx = CodecContext::Field {
                    structure: io.structure,
                    field: &field.name,
                };
                log_codec_conversion(&field.name, "from_native");
                codec.from_native(raw, ctx)?
            }
            None => io.fetch(&field.native, field.offset, field.size, &values[index], &field.name)?,
        };
        values[index] = value.clone();
        Ok(value)
    }
}

/// What a single field access needs from its instance
struct FieldIo<'a> {
    structure: &'a str,
    convention: CallingConvention,
    region: &'a MemoryRegion,
    strings: &'a mut HashMap<String, NativeString>,
    platform: &'a Platform,
    encoding: &'a dyn StringEncoding,
}

impl FieldIo<'_> {
    fn mismatch(&self, ty: &SemanticType, value: &Value, slot: &str) -> crate::Error {
        config_error!(
            "field '{slot}' of '{}' is {ty}, not {}",
            self.structure,
            value.kind_name()
        )
    }

    fn store(&mut self, ty: &SemanticType, offset: usize, size: usize, value: &Value, slot: &str) -> Result<()> {
        match ty {
            primitive if primitive.is_primitive() => {
                marshal::write_primitive(primitive, self.region, offset, value, self.platform)
            }
            SemanticType::NarrowString | SemanticType::WideString => {
                let address = match value {
                    Value::Null | Value::Pointer(_) => {
                        self.strings.remove(slot);
                        value.as_pointer().unwrap_or(Pointer::NULL)
                    }
                    Value::String(text) | Value::WideString(text) => {
                        let native = if matches!(ty, SemanticType::WideString) {
                            NativeString::wide(text)?
                        } else {
                            NativeString::narrow(text, self.encoding)?
                        };
                        let address = native.pointer();
                        // Replacing the cached copy frees the previous string
                        self.strings.insert(slot.to_string(), native);
                        address
                    }
                    other => return Err(self.mismatch(ty, other, slot)),
                };
                self.region.set_pointer(offset, address)
            }
            SemanticType::Composite(_, Passing::ByValue) => {
                let Value::Structure(child) = value else {
                    return Err(self.mismatch(ty, value, slot));
                };
                child.attach(self.region.share(offset, size)?)?;
                child.write()
            }
            SemanticType::Composite(_, Passing::ByReference) => {
                let address = match value {
                    Value::Null => Pointer::NULL,
                    Value::Pointer(p) => *p,
                    // Memory is allocated if needed; the referenced fields are not written
                    Value::Structure(child) => child.address_or_allocate()?,
                    other => return Err(self.mismatch(ty, other, slot)),
                };
                self.region.set_pointer(offset, address)
            }
            SemanticType::Array(element, _) => {
                let Some(items) = value.as_array() else {
                    return Err(config_error!(
                        "array field '{slot}' of '{}' must be initialized",
                        self.structure
                    ));
                };
                let stride = natural_sizing(element, self.platform, None)?.size;
                let count = size / stride;
                let items = items.to_vec();
                if items.len() != count {
                    return Err(config_error!(
                        "array field '{slot}' of '{}' holds {} elements, expected {count}",
                        self.structure,
                        items.len()
                    ));
                }
                for (i, item) in items.iter().enumerate() {
                    self.store(element, offset + i * stride, stride, item, &format!("{slot}[{i}]"))?;
                }
                Ok(())
            }
            SemanticType::CallbackRef(_) => {
                let address = match value {
                    Value::Null => Pointer::NULL,
                    Value::Pointer(p) => *p,
                    Value::Callback(callback) => {
                        CallbackRegistry::global().trampoline(callback, self.convention)?
                    }
                    other => return Err(self.mismatch(ty, other, slot)),
                };
                self.region.set_pointer(offset, address)
            }
            other => Err(config_error!(
                "field '{slot}' of '{}' has type {other}, which cannot be stored",
                self.structure
            )),
        }
    }

    fn fetch(&mut self, ty: &SemanticType, offset: usize, size: usize, current: &Value, slot: &str) -> Result<Value> {
        Ok(match ty {
            primitive if primitive.is_primitive() => {
                marshal::read_primitive(primitive, self.region, offset, self.platform)?
            }
            SemanticType::NarrowString => {
                let address = self.region.get_pointer(offset)?;
                if address.is_null() {
                    Value::Null
                } else {
                    // SAFETY: the field is declared to hold a NUL-terminated string
                    Value::String(self.encoding.decode(&unsafe { address.read_c_bytes() }))
                }
            }
            SemanticType::WideString => {
                let address = self.region.get_pointer(offset)?;
                if address.is_null() {
                    Value::Null
                } else {
                    // SAFETY: the field is declared to hold a NUL-terminated wide string
                    Value::WideString(unsafe { address.read_wide_string() })
                }
            }
            SemanticType::Composite(def, Passing::ByValue) => {
                let child = match current {
                    Value::Structure(child) => child.clone(),
                    _ => StructRef::new(def),
                };
                child.attach(self.region.share(offset, size)?)?;
                child.read()?;
                Value::Structure(child)
            }
            SemanticType::Composite(def, Passing::ByReference) => {
                let address = self.region.get_pointer(offset)?;
                match current {
                    _ if address.is_null() => Value::Null,
                    // Same address keeps the same instance. If native code freed
                    // and reallocated another object there, this one is stale.
                    Value::Structure(child) if child.cached_address() == address => {
                        child.read()?;
                        current.clone()
                    }
                    _ => {
                        let child = StructRef::new(def);
                        // SAFETY: the field is declared to point at an instance of `def`
                        unsafe { child.bind_address(address)? };
                        child.read()?;
                        Value::Structure(child)
                    }
                }
            }
            SemanticType::Array(element, _) => {
                let stride = natural_sizing(element, self.platform, None)?.size;
                let count = size / stride;
                let items = match current.as_array() {
                    Some(items) if items.len() == count => items.clone(),
                    _ => ArrayValue::filled(count, Value::Null),
                };
                for i in 0..count {
                    let previous = items.get(i).unwrap_or(Value::Null);
                    let value = self.fetch(element, offset + i * stride, stride, &previous, &format!("{slot}[{i}]"))?;
                    items.set(i, value)?;
                }
                Value::Array(items)
            }
            SemanticType::CallbackRef(_) => {
                let address = self.region.get_pointer(offset)?;
                match current {
                    Value::Callback(callback)
                        if CallbackRegistry::global()
                            .lookup(callback, self.convention)
                            .is_some_and(|binding| binding.trampoline() == address) =>
                    {
                        current.clone()
                    }
                    _ => Value::from_pointer(address),
                }
            }
            other => {
                return Err(config_error!(
                    "field '{slot}' of '{}' has type {other}, which cannot be read",
                    self.structure
                ))
            }
        })
    }
}

fn initial_value(decl: &FieldDecl) -> Value {
    match &decl.codec {
        Some(codec) => codec.default_value(),
        None => zero_value(&decl.ty),
    }
}

/// Zero of a type; by-value members and arrays are created on first use
fn zero_value(ty: &SemanticType) -> Value {
    match ty {
        SemanticType::Bool => Value::Bool(false),
        SemanticType::Int8 => Value::Int8(0),
        SemanticType::Int16 => Value::Int16(0),
        SemanticType::Int32 => Value::Int32(0),
        SemanticType::Int64 => Value::Int64(0),
        SemanticType::NativeLong => Value::NativeLong(0),
        SemanticType::Float32 => Value::Float32(0.0),
        SemanticType::Float64 => Value::Float64(0.0),
        _ => Value::Null,
    }
}

fn materialized_value(ty: &SemanticType) -> Value {
    match ty {
        SemanticType::Composite(def, Passing::ByValue) => Value::Structure(StructRef::new(def)),
        SemanticType::Array(element, ArrayLen::Fixed(n)) => {
            Value::Array(ArrayValue::new((0..*n).map(|_| materialized_value(element)).collect()))
        }
        other => zero_value(other),
    }
}

/// Whether `value` may be assigned to a field of type `ty`
fn accepts(ty: &SemanticType, value: &Value) -> bool {
    use SemanticType as T;
    match (ty, value) {
        (T::Bool, Value::Bool(_)) => true,
        (T::Int8 | T::Int16 | T::Int32 | T::Int64 | T::NativeLong, v) => v.as_i64().is_some(),
        (T::Float32, Value::Float32(_)) => true,
        (T::Float64, Value::Float32(_) | Value::Float64(_)) => true,
        (T::RawPointer, Value::Null | Value::Pointer(_)) => true,
        (
            T::NarrowString | T::WideString,
            Value::Null | Value::Pointer(_) | Value::String(_) | Value::WideString(_),
        ) => true,
        (T::Composite(def, _), Value::Structure(s)) => s.def().ptr_eq(def),
        (T::Composite(_, Passing::ByReference), Value::Null | Value::Pointer(_)) => true,
        (T::Array(element, len), Value::Array(items)) => {
            let fits = match len {
                ArrayLen::Fixed(n) => items.len() == *n,
                ArrayLen::Deferred => true,
            };
            fits && items.to_vec().iter().all(|item| accepts(element, item))
        }
        (T::CallbackRef(_), Value::Null | Value::Pointer(_) | Value::Callback(_)) => true,
        (T::Custom(key), Value::Custom(c)) => c.key() == key,
        _ => false,
    }
}
