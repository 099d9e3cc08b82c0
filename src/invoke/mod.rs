//! Invocation marshaler - calling native functions with managed values
//!
//! Design: a call runs in three phases around one `CallFrame`:
//! 1. Marshal - every argument becomes one raw slot; anything native code
//!    may write through (cells, buffers, arrays) gets pooled scratch memory
//! 2. Dispatch - the slots go through a [`RawInvoker`] (libffi by default)
//! 3. Restore - structures are re-read and scratch memory is copied back
//!    into the caller's handles before the buffers return to the pool
//!
//! Everything the native side may still point at during the call (strings,
//! scratch buffers, trampolines) is owned by the frame until it drops.

mod dispatch;

#[cfg(test)]
mod tests;

pub use dispatch::{FfiInvoker, RawArg, RawInvoker, RawValue, ReturnCategory};
pub(crate) use dispatch::build_cif;

use std::borrow::Cow;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::abi::CallingConvention;
use crate::callback::{CallbackBinding, CallbackRegistry};
use crate::codec::{default_encoding, CodecContext, CodecRegistry, StringEncoding};
use crate::error::{config_error, Result};
use crate::layout::{Platform, SemanticType};
use crate::logging::{log_codec_conversion, log_invoke, log_invoke_error, log_invoke_return, perf};
use crate::marshal;
use crate::memory::{NativeString, Pointer};
use crate::pool::{self, ScratchBuffer};
use crate::structure::StructRef;
use crate::value::{ArrayValue, ByReference, StringBuffer, Value};

/// Most arguments a single call may take, after spreading varargs
pub const MAX_NARGS: usize = 32;

/// Collaborators a [`Function`] uses
#[derive(Clone)]
pub struct InvokeOptions {
    pub codecs: CodecRegistry,
    pub callbacks: Arc<CallbackRegistry>,
    pub invoker: Arc<dyn RawInvoker>,
    pub encoding: Arc<dyn StringEncoding>,
    pub platform: Platform,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            codecs: CodecRegistry::global().clone(),
            callbacks: CallbackRegistry::global().clone(),
            invoker: Arc::new(FfiInvoker),
            encoding: default_encoding(),
            platform: Platform::current(),
        }
    }
}

impl std::fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("codecs", &self.codecs)
            .field("encoding", &self.encoding)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

/// A native function at a known address
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    address: Pointer,
    convention: CallingConvention,
    options: InvokeOptions,
}

impl Function {
    /// # Safety
    /// `address` must be a function that stays loaded while this handle is
    /// used; every `invoke` must describe its real signature.
    pub unsafe fn from_address(
        name: impl Into<String>,
        address: Pointer,
        convention: CallingConvention,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            convention,
            options: InvokeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn address(&self) -> Pointer {
        self.address
    }

    #[inline]
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    #[inline]
    pub fn options(&self) -> &InvokeOptions {
        &self.options
    }

    /// Call with this function's own calling convention
    pub fn invoke(&self, return_type: &SemanticType, args: &[Value]) -> Result<Value> {
        self.invoke_with(self.convention, return_type, args)
    }

    /// Call under `convention`, converting `args` and the result
    pub fn invoke_with(
        &self,
        convention: CallingConvention,
        return_type: &SemanticType,
        args: &[Value],
    ) -> Result<Value> {
        let _timer = perf::track(&self.name);
        let result = self.call(convention, return_type, args);
        match &result {
            Ok(_) => log_invoke_return(&self.name),
            Err(err) => log_invoke_error(&self.name, &err.to_string()),
        }
        result
    }

    fn call(&self, convention: CallingConvention, return_type: &SemanticType, args: &[Value]) -> Result<Value> {
        let args = flatten_spread(args)?;
        if args.len() > MAX_NARGS {
            return Err(config_error!(
                "'{}' called with {} arguments, the maximum is {MAX_NARGS}",
                self.name,
                args.len()
            ));
        }

        let options = &self.options;
        let codec = options.codecs.lookup_type(return_type);
        let native = codec.as_ref().map_or_else(|| return_type.clone(), |c| c.native_type());
        let category = marshal::return_category(&native, &options.platform)?;

        let mut frame = CallFrame::new(self, convention);
        for (index, arg) in args.iter().enumerate() {
            frame.push(index, arg)?;
        }

        log_invoke(&self.name, frame.slots.len());
        // SAFETY: `from_address` callers vouched for the address and signature;
        // every pointer slot is owned by `frame` until after the call.
        let raw = unsafe {
            options
                .invoker
                .invoke_raw(self.address, convention, &frame.slots, category)?
        };
        frame.restore()?;

        let value = marshal::value_from_raw(&native, raw, &options.platform, &*options.encoding)?;
        match codec {
            Some(codec) => {
                log_codec_conversion(return_type.type_key().as_str(), "from_native");
                codec.from_native(value, CodecContext::Result { function: &self.name })
            }
            None => Ok(value),
        }
    }

    /// Call a function returning C `int`
    pub fn invoke_int(&self, args: &[Value]) -> Result<i32> {
        let value = self.invoke(&SemanticType::Int32, args)?;
        value
            .as_i32()
            .ok_or_else(|| config_error!("'{}' returned {}, not int", self.name, value.kind_name()))
    }

    /// Call a function returning C `long`
    pub fn invoke_long(&self, args: &[Value]) -> Result<i64> {
        let value = self.invoke(&SemanticType::NativeLong, args)?;
        value
            .as_i64()
            .ok_or_else(|| config_error!("'{}' returned {}, not long", self.name, value.kind_name()))
    }

    pub fn invoke_double(&self, args: &[Value]) -> Result<f64> {
        let value = self.invoke(&SemanticType::Float64, args)?;
        value
            .as_f64()
            .ok_or_else(|| config_error!("'{}' returned {}, not double", self.name, value.kind_name()))
    }

    pub fn invoke_pointer(&self, args: &[Value]) -> Result<Pointer> {
        let value = self.invoke(&SemanticType::RawPointer, args)?;
        value
            .as_pointer()
            .ok_or_else(|| config_error!("'{}' returned {}, not a pointer", self.name, value.kind_name()))
    }

    /// Call a function returning `char*` (or `wchar_t*` when `wide`); NULL is `None`
    pub fn invoke_string(&self, args: &[Value], wide: bool) -> Result<Option<String>> {
        let ty = if wide {
            SemanticType::WideString
        } else {
            SemanticType::NarrowString
        };
        match self.invoke(&ty, args)? {
            Value::Null => Ok(None),
            Value::String(s) | Value::WideString(s) => Ok(Some(s)),
            other => Err(config_error!(
                "'{}' returned {}, not a string",
                self.name,
                other.kind_name()
            )),
        }
    }

    pub fn invoke_void(&self, args: &[Value]) -> Result<()> {
        self.invoke(&SemanticType::Void, args).map(|_| ())
    }
}

/// Expand a trailing [`Value::Spread`] and append the NULL sentinel
fn flatten_spread(args: &[Value]) -> Result<Cow<'_, [Value]>> {
    let misplaced = |values: &[Value]| values.iter().any(|v| matches!(v, Value::Spread(_)));
    match args.split_last() {
        Some((Value::Spread(rest), head)) => {
            if misplaced(head) || misplaced(rest) {
                return Err(config_error!("variable arguments must be the last argument"));
            }
            let mut flat = Vec::with_capacity(head.len() + rest.len() + 1);
            flat.extend_from_slice(head);
            flat.extend_from_slice(rest);
            flat.push(Value::Null);
            Ok(Cow::Owned(flat))
        }
        _ if misplaced(args) => Err(config_error!("variable arguments must be the last argument")),
        _ => Ok(Cow::Borrowed(args)),
    }
}

fn slot_of(raw: RawValue) -> Result<RawArg> {
    Ok(match raw {
        RawValue::I8(v) => RawArg::I8(v),
        RawValue::I16(v) => RawArg::I16(v),
        RawValue::I32(v) => RawArg::I32(v),
        RawValue::I64(v) => RawArg::I64(v),
        RawValue::F32(v) => RawArg::F32(v),
        RawValue::F64(v) => RawArg::F64(v),
        RawValue::Pointer(p) => RawArg::Pointer(p),
        RawValue::Void => return Err(config_error!("void is not an argument")),
    })
}

/// Copy-back owed to a caller handle after the call
enum Restore {
    Cell { cell: ByReference, buffer: usize },
    Text { target: StringBuffer, buffer: usize },
    Array { array: ArrayValue, element: SemanticType, stride: usize, buffer: usize },
    Strings { array: ArrayValue, wide: Vec<bool>, buffer: usize },
}

/// Native resources of one call
struct CallFrame<'f> {
    function: &'f Function,
    convention: CallingConvention,
    slots: SmallVec<[RawArg; 8]>,
    scratch: SmallVec<[ScratchBuffer; 4]>,
    strings: Vec<NativeString>,
    bindings: Vec<Arc<CallbackBinding>>,
    structures: Vec<StructRef>,
    restores: Vec<Restore>,
}

impl<'f> CallFrame<'f> {
    fn new(function: &'f Function, convention: CallingConvention) -> Self {
        Self {
            function,
            convention,
            slots: SmallVec::new(),
            scratch: SmallVec::new(),
            strings: Vec::new(),
            bindings: Vec::new(),
            structures: Vec::new(),
            restores: Vec::new(),
        }
    }

    fn options(&self) -> &'f InvokeOptions {
        &self.function.options
    }

    /// Borrow a zeroed scratch buffer for the duration of the call
    fn scratch(&mut self, min: usize) -> Result<usize> {
        self.scratch.push(pool::acquire(min.max(1))?);
        Ok(self.scratch.len() - 1)
    }

    fn push(&mut self, index: usize, arg: &Value) -> Result<()> {
        let slot = match self.options().codecs.lookup_value(arg) {
            Some(codec) => {
                let key = arg.type_key().map(|k| k.to_string()).unwrap_or_default();
                log_codec_conversion(&key, "to_native");
                let native = codec.to_native(
                    arg,
                    CodecContext::Argument {
                        function: &self.function.name,
                        index,
                    },
                )?;
                self.convert(index, &native)?
            }
            None => self.convert(index, arg)?,
        };
        self.slots.push(slot);
        Ok(())
    }

    fn convert(&mut self, index: usize, arg: &Value) -> Result<RawArg> {
        let platform = &self.options().platform;
        Ok(match arg {
            Value::Null => RawArg::Pointer(Pointer::NULL),
            Value::Structure(s) => {
                s.write()?;
                self.structures.push(s.clone());
                RawArg::Pointer(s.pointer()?)
            }
            Value::ByReference(cell) => {
                let size = marshal::primitive_size(cell.ty(), platform)
                    .ok_or_else(|| config_error!("by-reference cells hold primitives, not {}", cell.ty()))?;
                let buffer = self.scratch(size)?;
                marshal::write_primitive(cell.ty(), self.scratch[buffer].region(), 0, &cell.value(), platform)?;
                self.restores.push(Restore::Cell { cell: cell.clone(), buffer });
                RawArg::Pointer(self.scratch[buffer].pointer())
            }
            Value::Callback(callback) => {
                let binding = self.options().callbacks.get_or_create(callback, self.convention)?;
                let trampoline = binding.trampoline();
                self.bindings.push(binding);
                RawArg::Pointer(trampoline)
            }
            Value::WideString(text) => {
                let native = NativeString::wide(text)?;
                let address = native.pointer();
                self.strings.push(native);
                RawArg::Pointer(address)
            }
            Value::String(text) => {
                let native = NativeString::narrow(text, &*self.options().encoding)?;
                let address = native.pointer();
                self.strings.push(native);
                RawArg::Pointer(address)
            }
            Value::StringBuffer(target) => self.string_buffer(target)?,
            Value::StringArray(array) => self.string_array(array)?,
            Value::Array(array) => self.primitive_array(index, array)?,
            Value::StructureArray(elements) => structure_array(elements, &mut self.structures)?,
            Value::Spread(_) => {
                return Err(config_error!("variable arguments must be the last argument"))
            }
            Value::Void => return Err(config_error!("argument {index} is void")),
            Value::Custom(custom) => {
                return Err(config_error!(
                    "argument {index} has type '{}' but no codec is registered for it",
                    custom.key()
                ))
            }
            primitive => {
                let ty = primitive
                    .primitive_type()
                    .ok_or_else(|| config_error!("unsupported argument {index}: {}", primitive.kind_name()))?;
                slot_of(marshal::raw_for_type(&ty, primitive, platform)?)?
            }
        })
    }

    fn string_buffer(&mut self, target: &StringBuffer) -> Result<RawArg> {
        let encoding = &self.options().encoding;
        let bytes = encoding.encode(&target.value())?;
        let size = (target.capacity() * encoding.max_bytes_per_char()).max(bytes.len()) + 1;
        let buffer = self.scratch(size)?;
        self.scratch[buffer].region().write_bytes(0, &bytes)?;
        self.restores.push(Restore::Text { target: target.clone(), buffer });
        Ok(RawArg::Pointer(self.scratch[buffer].pointer()))
    }

    /// NULL-terminated `char**` (or `wchar_t**`)
    fn string_array(&mut self, array: &ArrayValue) -> Result<RawArg> {
        let platform = &self.options().platform;
        let items = array.to_vec();
        let buffer = self.scratch((items.len() + 1) * platform.pointer_size)?;
        let mut wide = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let native = match item {
                Value::Null => None,
                Value::String(text) => Some(NativeString::narrow(text, &*self.options().encoding)?),
                Value::WideString(text) => Some(NativeString::wide(text)?),
                other => {
                    return Err(config_error!(
                        "string array element {i} is {}, not a string",
                        other.kind_name()
                    ))
                }
            };
            wide.push(matches!(item, Value::WideString(_)));
            let address = native.as_ref().map_or(Pointer::NULL, NativeString::pointer);
            self.scratch[buffer]
                .region()
                .set_pointer(i * platform.pointer_size, address)?;
            self.strings.extend(native);
        }
        self.restores.push(Restore::Strings { array: array.clone(), wide, buffer });
        Ok(RawArg::Pointer(self.scratch[buffer].pointer()))
    }

    fn primitive_array(&mut self, index: usize, array: &ArrayValue) -> Result<RawArg> {
        let platform = &self.options().platform;
        let items = array.to_vec();
        let Some(element) = items.first().and_then(Value::primitive_type) else {
            if items.is_empty() {
                return Ok(RawArg::Pointer(Pointer::NULL));
            }
            return Err(config_error!("array argument {index} must hold primitives"));
        };
        let stride = marshal::primitive_size(&element, platform)
            .ok_or_else(|| config_error!("array argument {index} must hold primitives"))?;
        let buffer = self.scratch(stride * items.len())?;
        for (i, item) in items.iter().enumerate() {
            if item.primitive_type().as_ref() != Some(&element) {
                return Err(config_error!(
                    "array argument {index} mixes {element} with {} at element {i}",
                    item.kind_name()
                ));
            }
            marshal::write_primitive(&element, self.scratch[buffer].region(), i * stride, item, platform)?;
        }
        self.restores.push(Restore::Array { array: array.clone(), element, stride, buffer });
        Ok(RawArg::Pointer(self.scratch[buffer].pointer()))
    }

    /// Refresh caller handles from native memory
    fn restore(&mut self) -> Result<()> {
        for structure in &self.structures {
            structure.read()?;
        }
        let options = self.options();
        for restore in &self.restores {
            match restore {
                Restore::Cell { cell, buffer } => {
                    let region = self.scratch[*buffer].region();
                    cell.set_value(marshal::read_primitive(cell.ty(), region, 0, &options.platform)?);
                }
                Restore::Text { target, buffer } => {
                    let bytes = self.scratch[*buffer].region().read_c_bytes(0)?;
                    target.set(options.encoding.decode(&bytes));
                }
                Restore::Array { array, element, stride, buffer } => {
                    let region = self.scratch[*buffer].region();
                    for i in 0..array.len() {
                        array.set(i, marshal::read_primitive(element, region, i * stride, &options.platform)?)?;
                    }
                }
                Restore::Strings { array, wide, buffer } => {
                    let region = self.scratch[*buffer].region();
                    for (i, wide) in wide.iter().enumerate() {
                        let raw = RawValue::Pointer(region.get_pointer(i * options.platform.pointer_size)?);
                        let ty = if *wide {
                            SemanticType::WideString
                        } else {
                            SemanticType::NarrowString
                        };
                        array.set(i, marshal::value_from_raw(&ty, raw, &options.platform, &*options.encoding)?)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        for buffer in self.scratch.drain(..) {
            pool::release(buffer);
        }
    }
}

/// Base address of contiguous structure array elements, each written
///
/// Elements without memory are given one shared block first.
fn structure_array(elements: &[StructRef], structures: &mut Vec<StructRef>) -> Result<RawArg> {
    let Some(first) = elements.first() else {
        return Ok(RawArg::Pointer(Pointer::NULL));
    };
    let size = first.size()?;
    if elements.iter().all(|e| e.cached_address().is_null()) {
        first.to_array_view(elements.len())?;
        let block = first.region()?;
        for (i, element) in elements.iter().enumerate().skip(1) {
            element.attach(block.share(i * size, size)?)?;
        }
    }

    let base = first.pointer()?;
    for (i, element) in elements.iter().enumerate().skip(1) {
        if !element.def().ptr_eq(first.def()) || element.pointer()? != base.offset(i * size) {
            return Err(config_error!(
                "structure array elements must use contiguous memory: element {i} is not at base + {i} * {size}"
            ));
        }
    }
    for element in elements {
        element.write()?;
        structures.push(element.clone());
    }
    Ok(RawArg::Pointer(base))
}
