//! libffi closures and the conversion layer around them

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use libffi::middle::Closure;
use libffi::raw::{ffi_arg, ffi_cif};

use super::{identity_of, Callback, CallbackRegistry, CallbackSignature};
use crate::abi::CallingConvention;
use crate::codec::{default_encoding, Codec, CodecContext, CodecRegistry, StringEncoding};
use crate::error::{config_error, Error, Result};
use crate::invoke::{build_cif, RawValue, ReturnCategory, MAX_NARGS};
use crate::layout::{Platform, SemanticType};
use crate::logging::{
    log_callback_created, log_callback_error, log_callback_orphaned, log_callback_released,
};
use crate::marshal;
use crate::memory::{NativeString, Pointer};
use crate::structure::StructRef;
use crate::value::Value;

/// Memory behind a pointer a callback handed back to native code
#[allow(dead_code)]
enum Retained {
    String(NativeString),
    Structure(StructRef),
}

thread_local! {
    /// Last result per trampoline on this thread, alive until the same
    /// trampoline returns again here
    static RETAINED: RefCell<HashMap<usize, Retained>> = RefCell::new(HashMap::new());
}

fn retain(trampoline: usize, value: Retained) {
    let previous = RETAINED.with(|slots| slots.borrow_mut().insert(trampoline, value));
    drop(previous);
}

fn forget_retained(trampoline: usize) {
    let previous = RETAINED
        .try_with(|slots| slots.try_borrow_mut().ok().and_then(|mut slots| slots.remove(&trampoline)))
        .ok()
        .flatten();
    drop(previous);
}

/// How one parameter (or the result) crosses the trampoline
struct Slot {
    declared: SemanticType,
    /// Codec output type, or the declared type
    native: SemanticType,
    category: ReturnCategory,
    codec: Option<Arc<dyn Codec>>,
}

impl Slot {
    fn plan(declared: &SemanticType, codecs: &CodecRegistry, platform: &Platform, result: bool) -> Result<Self> {
        let codec = codecs.lookup_type(declared);
        let native = codec.as_ref().map_or_else(|| declared.clone(), |c| c.native_type());
        let category = match &native {
            SemanticType::Void if result => ReturnCategory::Void,
            SemanticType::Void => {
                return Err(Error::Callback("void is not a parameter type".to_string()))
            }
            SemanticType::Array(..) | SemanticType::Custom(_) => {
                return Err(Error::Callback(format!(
                    "callback type {declared} has no native representation"
                )))
            }
            other => marshal::return_category(other, platform)?,
        };
        Ok(Self {
            declared: declared.clone(),
            native,
            category,
            codec,
        })
    }

    /// Whether values need more than a bit-for-bit copy
    fn converts(&self) -> bool {
        self.codec.is_some() || !self.native.is_primitive() || matches!(self.native, SemanticType::Bool)
    }
}

/// Per-signature conversion plan
struct ConversionPlan {
    params: Vec<Slot>,
    ret: Slot,
}

impl ConversionPlan {
    fn new(signature: &CallbackSignature, codecs: &CodecRegistry, platform: &Platform) -> Result<Self> {
        if signature.params().len() > MAX_NARGS {
            return Err(config_error!(
                "callbacks take at most {MAX_NARGS} parameters, this one declares {}",
                signature.params().len()
            ));
        }
        let params = signature
            .params()
            .iter()
            .map(|ty| Slot::plan(ty, codecs, platform, false))
            .collect::<Result<Vec<_>>>()?;
        let ret = Slot::plan(signature.ret(), codecs, platform, true)?;
        Ok(Self { params, ret })
    }

    fn converts(&self) -> bool {
        self.ret.converts() || self.params.iter().any(Slot::converts)
    }
}

/// Everything the closure needs; lives at a fixed address until the binding drops
struct TrampolineState {
    callback: Weak<dyn Callback>,
    plan: ConversionPlan,
    convention: CallingConvention,
    platform: Platform,
    encoding: Arc<dyn StringEncoding>,
    address: AtomicUsize,
}

impl TrampolineState {
    fn address(&self) -> usize {
        self.address.load(Ordering::Relaxed)
    }

    /// # Safety
    /// `args` must hold one valid slot pointer per planned parameter.
    unsafe fn dispatch(&self, args: *const *const c_void) -> Result<RawValue> {
        let Some(callback) = self.callback.upgrade() else {
            log_callback_orphaned(self.address());
            return Ok(RawValue::zero(self.plan.ret.category));
        };
        let mut values = Vec::with_capacity(self.plan.params.len());
        for (index, slot) in self.plan.params.iter().enumerate() {
            let raw = read_arg(*args.add(index), slot.category);
            values.push(self.inbound(slot, raw, index)?);
        }
        let result = callback.invoke(&values)?;
        self.outbound(result)
    }

    fn inbound(&self, slot: &Slot, raw: RawValue, index: usize) -> Result<Value> {
        let value = marshal::value_from_raw(&slot.native, raw, &self.platform, &*self.encoding)?;
        match &slot.codec {
            Some(codec) => codec.from_native(value, CodecContext::CallbackParameter { index }),
            None => Ok(value),
        }
    }

    fn outbound(&self, result: Value) -> Result<RawValue> {
        let slot = &self.plan.ret;
        if slot.category == ReturnCategory::Void {
            return Ok(RawValue::Void);
        }
        let value = match &slot.codec {
            Some(codec) => codec.to_native(&result, CodecContext::CallbackResult)?,
            None => result,
        };
        match &slot.native {
            primitive if primitive.is_primitive() => marshal::raw_for_type(primitive, &value, &self.platform),
            SemanticType::NarrowString | SemanticType::WideString => {
                let address = match &value {
                    Value::Null => Pointer::NULL,
                    Value::Pointer(p) => *p,
                    Value::String(text) | Value::WideString(text) => {
                        let native = if matches!(slot.native, SemanticType::WideString) {
                            NativeString::wide(text)?
                        } else {
                            NativeString::narrow(text, &*self.encoding)?
                        };
                        let address = native.pointer();
                        retain(self.address(), Retained::String(native));
                        address
                    }
                    other => return Err(mismatch(&slot.declared, other)),
                };
                Ok(RawValue::Pointer(address))
            }
            SemanticType::Composite(..) => match &value {
                Value::Null => Ok(RawValue::Pointer(Pointer::NULL)),
                Value::Pointer(p) => Ok(RawValue::Pointer(*p)),
                Value::Structure(s) => {
                    s.write()?;
                    let address = s.pointer()?;
                    retain(self.address(), Retained::Structure(s.clone()));
                    Ok(RawValue::Pointer(address))
                }
                other => Err(mismatch(&slot.declared, other)),
            },
            SemanticType::CallbackRef(_) => match &value {
                Value::Null => Ok(RawValue::Pointer(Pointer::NULL)),
                Value::Pointer(p) => Ok(RawValue::Pointer(*p)),
                Value::Callback(cb) => Ok(RawValue::Pointer(
                    CallbackRegistry::global().trampoline(cb, self.convention)?,
                )),
                other => Err(mismatch(&slot.declared, other)),
            },
            other => Err(Error::Callback(format!("cannot return {other} to native code"))),
        }
    }
}

fn mismatch(ty: &SemanticType, value: &Value) -> Error {
    Error::Callback(format!("callback returned {} for {ty}", value.kind_name()))
}

/// # Safety
/// `slot` must point at a value of the width `category` names.
unsafe fn read_arg(slot: *const c_void, category: ReturnCategory) -> RawValue {
    match category {
        ReturnCategory::Void => RawValue::Void,
        ReturnCategory::Int8 => RawValue::I8(*(slot as *const i8)),
        ReturnCategory::Int16 => RawValue::I16(*(slot as *const i16)),
        ReturnCategory::Int32 => RawValue::I32(*(slot as *const i32)),
        ReturnCategory::Int64 => RawValue::I64(*(slot as *const i64)),
        ReturnCategory::Float => RawValue::F32(*(slot as *const f32)),
        ReturnCategory::Double => RawValue::F64(*(slot as *const f64)),
        ReturnCategory::Pointer => RawValue::Pointer(Pointer::new(*(slot as *const usize))),
    }
}

/// # Safety
/// `result` must be libffi's result buffer for a return of `raw`'s shape.
unsafe fn write_result(result: *mut ffi_arg, raw: RawValue) {
    // Integer results narrower than a register are widened to `ffi_arg`
    match raw {
        RawValue::Void => {}
        RawValue::I8(v) => result.write(v as ffi_arg),
        RawValue::I16(v) => result.write(v as ffi_arg),
        RawValue::I32(v) => result.write(v as ffi_arg),
        RawValue::I64(v) => (result as *mut i64).write(v),
        RawValue::F32(v) => (result as *mut f32).write(v),
        RawValue::F64(v) => (result as *mut f64).write(v),
        RawValue::Pointer(p) => (result as *mut usize).write(p.address()),
    }
}

unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut ffi_arg,
    args: *const *const c_void,
    state: &TrampolineState,
) {
    let zero = RawValue::zero(state.plan.ret.category);
    let raw = match panic::catch_unwind(AssertUnwindSafe(|| state.dispatch(args))) {
        Ok(Ok(raw)) => raw,
        Ok(Err(err)) => {
            log_callback_error(state.address(), &err.to_string());
            zero
        }
        Err(_) => {
            log_callback_error(state.address(), "callback panicked");
            zero
        }
    };
    write_result(result, raw);
}

/// A live trampoline for one callback and calling convention
///
/// Dropping the binding frees the closure; native code must not call the
/// trampoline afterwards.
pub struct CallbackBinding {
    identity: usize,
    convention: CallingConvention,
    signature: CallbackSignature,
    trampoline: Pointer,
    converting: bool,
    closure: ManuallyDrop<Closure<'static>>,
    state: NonNull<TrampolineState>,
}

// SAFETY: the closure and its state are immutable after creation apart from
// an atomic; libffi closures may be called from any thread.
unsafe impl Send for CallbackBinding {}
unsafe impl Sync for CallbackBinding {}

impl CallbackBinding {
    pub(crate) fn new(
        callback: &Arc<dyn Callback>,
        convention: CallingConvention,
        codecs: &CodecRegistry,
    ) -> Result<Self> {
        let platform = Platform::current();
        let signature = callback.signature().clone();
        let plan = ConversionPlan::new(&signature, codecs, &platform)?;
        let converting = plan.converts();
        let cif = build_cif(
            convention,
            plan.params.iter().map(|slot| slot.category),
            plan.ret.category,
        );

        let state: &'static TrampolineState = Box::leak(Box::new(TrampolineState {
            callback: Arc::downgrade(callback),
            plan,
            convention,
            platform,
            encoding: default_encoding(),
            address: AtomicUsize::new(0),
        }));
        let closure = Closure::new(cif, trampoline_entry, state);
        let trampoline = Pointer::new(*closure.code_ptr() as usize);
        state.address.store(trampoline.address(), Ordering::Relaxed);

        let identity = identity_of(callback);
        log_callback_created(identity, trampoline.address(), convention.name(), converting);
        Ok(Self {
            identity,
            convention,
            signature,
            trampoline,
            converting,
            closure: ManuallyDrop::new(closure),
            state: NonNull::from(state),
        })
    }

    /// Code pointer native code calls
    #[inline]
    pub fn trampoline(&self) -> Pointer {
        self.trampoline
    }

    #[inline]
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    #[inline]
    pub fn signature(&self) -> &CallbackSignature {
        &self.signature
    }

    /// Whether arguments or the result go through the conversion layer
    #[inline]
    pub fn is_converting(&self) -> bool {
        self.converting
    }

    /// Whether the callback is still alive
    pub fn is_alive(&self) -> bool {
        // SAFETY: the state outlives `self`
        unsafe { self.state.as_ref() }.callback.strong_count() > 0
    }
}

impl std::fmt::Debug for CallbackBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBinding")
            .field("trampoline", &self.trampoline)
            .field("convention", &self.convention)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Drop for CallbackBinding {
    fn drop(&mut self) {
        log_callback_released(self.identity, self.trampoline.address());
        // Results retained by other threads go when those threads exit
        forget_retained(self.trampoline.address());
        // SAFETY: the closure borrows the state, so it goes first; the state
        // was leaked from a `Box` in `new` and nothing else frees it.
        unsafe {
            ManuallyDrop::drop(&mut self.closure);
            drop(Box::from_raw(self.state.as_ptr()));
        }
    }
}
