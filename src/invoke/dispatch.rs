//! Raw dispatch - ABI-primitive argument slots through libffi
//!
//! Everything above this layer speaks `Value`; everything below speaks
//! fixed-width slots. CIFs are cached per thread keyed by convention and
//! slot shape.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use libffi::middle::{Arg, Cif, CodePtr, Type};
use libffi::raw::ffi_arg;
use smallvec::SmallVec;

use crate::abi::CallingConvention;
use crate::error::{Error, Result};
use crate::memory::Pointer;

/// One argument slot as it crosses the ABI
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawArg {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(Pointer),
}

impl RawArg {
    #[inline]
    pub fn category(&self) -> ReturnCategory {
        match self {
            RawArg::I8(_) => ReturnCategory::Int8,
            RawArg::I16(_) => ReturnCategory::Int16,
            RawArg::I32(_) => ReturnCategory::Int32,
            RawArg::I64(_) => ReturnCategory::Int64,
            RawArg::F32(_) => ReturnCategory::Float,
            RawArg::F64(_) => ReturnCategory::Double,
            RawArg::Pointer(_) => ReturnCategory::Pointer,
        }
    }

    fn as_arg(&self) -> Arg {
        match self {
            RawArg::I8(v) => Arg::new(v),
            RawArg::I16(v) => Arg::new(v),
            RawArg::I32(v) => Arg::new(v),
            RawArg::I64(v) => Arg::new(v),
            RawArg::F32(v) => Arg::new(v),
            RawArg::F64(v) => Arg::new(v),
            RawArg::Pointer(p) => Arg::new(p.as_slot()),
        }
    }
}

/// Shape of a result (and of an argument slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCategory {
    Void,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Pointer,
}

impl ReturnCategory {
    fn ffi_type(self) -> Type {
        match self {
            ReturnCategory::Void => Type::void(),
            ReturnCategory::Int8 => Type::i8(),
            ReturnCategory::Int16 => Type::i16(),
            ReturnCategory::Int32 => Type::i32(),
            ReturnCategory::Int64 => Type::i64(),
            ReturnCategory::Float => Type::f32(),
            ReturnCategory::Double => Type::f64(),
            ReturnCategory::Pointer => Type::pointer(),
        }
    }
}

/// A result as it comes back across the ABI
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Void,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(Pointer),
}

impl RawValue {
    /// Zero of the given shape
    pub fn zero(category: ReturnCategory) -> Self {
        match category {
            ReturnCategory::Void => RawValue::Void,
            ReturnCategory::Int8 => RawValue::I8(0),
            ReturnCategory::Int16 => RawValue::I16(0),
            ReturnCategory::Int32 => RawValue::I32(0),
            ReturnCategory::Int64 => RawValue::I64(0),
            ReturnCategory::Float => RawValue::F32(0.0),
            ReturnCategory::Double => RawValue::F64(0.0),
            ReturnCategory::Pointer => RawValue::Pointer(Pointer::NULL),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            RawValue::I8(v) => Some(i64::from(v)),
            RawValue::I16(v) => Some(i64::from(v)),
            RawValue::I32(v) => Some(i64::from(v)),
            RawValue::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            RawValue::F32(v) => Some(f64::from(v)),
            RawValue::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        match *self {
            RawValue::Pointer(p) => Some(p),
            _ => None,
        }
    }
}

/// The "call this address with these slots" primitive
pub trait RawInvoker: Send + Sync {
    /// Invoke the function at `address`
    ///
    /// # Safety
    /// `address` must be a function taking exactly `args` (by width and
    /// order) and returning `ret` under `convention`. Pointer slots must be
    /// valid for whatever the callee does with them.
    unsafe fn invoke_raw(
        &self,
        address: Pointer,
        convention: CallingConvention,
        args: &[RawArg],
        ret: ReturnCategory,
    ) -> Result<RawValue>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CifKey {
    convention: CallingConvention,
    args: SmallVec<[ReturnCategory; 8]>,
    ret: ReturnCategory,
}

thread_local! {
    static CIF_CACHE: RefCell<HashMap<CifKey, Rc<Cif>>> = RefCell::new(HashMap::new());
}

/// Build (or reuse) the CIF for a slot shape
///
/// The `Rc` is cloned out of the cache so a callback re-entering this thread
/// can populate the cache during the call.
pub(crate) fn cached_cif(
    convention: CallingConvention,
    args: impl ExactSizeIterator<Item = ReturnCategory> + Clone,
    ret: ReturnCategory,
) -> Rc<Cif> {
    let key = CifKey {
        convention,
        args: args.clone().collect(),
        ret,
    };
    CIF_CACHE.with(|cache| {
        cache
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| Rc::new(build_cif(convention, args, ret)))
            .clone()
    })
}

pub(crate) fn build_cif(
    convention: CallingConvention,
    args: impl ExactSizeIterator<Item = ReturnCategory>,
    ret: ReturnCategory,
) -> Cif {
    let mut cif = Cif::new(args.map(ReturnCategory::ffi_type), ret.ffi_type());
    if convention.is_alternate() {
        cif.set_abi(convention.ffi_abi());
    }
    cif
}

/// [`RawInvoker`] backed by libffi
#[derive(Debug, Default, Clone, Copy)]
pub struct FfiInvoker;

impl RawInvoker for FfiInvoker {
    unsafe fn invoke_raw(
        &self,
        address: Pointer,
        convention: CallingConvention,
        args: &[RawArg],
        ret: ReturnCategory,
    ) -> Result<RawValue> {
        if address.is_null() {
            return Err(Error::NullPointer);
        }
        let cif = cached_cif(convention, args.iter().map(RawArg::category), ret);
        let slots: SmallVec<[Arg; 8]> = args.iter().map(RawArg::as_arg).collect();
        let code = CodePtr::from_ptr(address.as_void());

        // Integer results narrower than a register come back widened to `ffi_arg`
        Ok(match ret {
            ReturnCategory::Void => {
                cif.call::<ffi_arg>(code, &slots);
                RawValue::Void
            }
            ReturnCategory::Int8 => RawValue::I8(cif.call::<ffi_arg>(code, &slots) as i8),
            ReturnCategory::Int16 => RawValue::I16(cif.call::<ffi_arg>(code, &slots) as i16),
            ReturnCategory::Int32 => RawValue::I32(cif.call::<ffi_arg>(code, &slots) as i32),
            ReturnCategory::Int64 => RawValue::I64(cif.call::<i64>(code, &slots)),
            ReturnCategory::Float => RawValue::F32(cif.call::<f32>(code, &slots)),
            ReturnCategory::Double => RawValue::F64(cif.call::<f64>(code, &slots)),
            ReturnCategory::Pointer => RawValue::Pointer(Pointer::new(cif.call::<usize>(code, &slots))),
        })
    }
}
