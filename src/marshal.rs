//! Type marshaling - primitive conversions between values, memory and ABI slots
//!
//! Shared by the structure engine (fields), the invocation marshaler
//! (scratch buffers and results) and trampolines (parameters and results).

use crate::codec::StringEncoding;
use crate::error::{config_error, Error, Result};
use crate::invoke::{RawValue, ReturnCategory};
use crate::layout::{Platform, SemanticType};
use crate::memory::MemoryRegion;
use crate::structure::StructRef;
use crate::value::Value;

fn mismatch(ty: &SemanticType, value: &Value) -> Error {
    config_error!("expected {ty} value, found {}", value.kind_name())
}

fn integer(ty: &SemanticType, value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| mismatch(ty, value))
}

/// Integer conversion that refuses to truncate
fn narrow<T: TryFrom<i64>>(ty: &SemanticType, value: &Value) -> Result<T> {
    let n = integer(ty, value)?;
    T::try_from(n).map_err(|_| config_error!("{n} does not fit {ty}"))
}

/// Byte size of a primitive type
pub(crate) fn primitive_size(ty: &SemanticType, platform: &Platform) -> Option<usize> {
    Some(match ty {
        SemanticType::Int8 => 1,
        SemanticType::Int16 => 2,
        SemanticType::Bool | SemanticType::Int32 | SemanticType::Float32 => 4,
        SemanticType::Int64 | SemanticType::Float64 => 8,
        SemanticType::NativeLong => platform.long_size,
        SemanticType::RawPointer => platform.pointer_size,
        _ => return None,
    })
}

/// Read a primitive stored at `offset`
pub fn read_primitive(
    ty: &SemanticType,
    region: &MemoryRegion,
    offset: usize,
    platform: &Platform,
) -> Result<Value> {
    Ok(match ty {
        SemanticType::Bool => Value::Bool(region.get_i32(offset)? != 0),
        SemanticType::Int8 => Value::Int8(region.get_i8(offset)?),
        SemanticType::Int16 => Value::Int16(region.get_i16(offset)?),
        SemanticType::Int32 => Value::Int32(region.get_i32(offset)?),
        SemanticType::Int64 => Value::Int64(region.get_i64(offset)?),
        SemanticType::NativeLong => {
            Value::NativeLong(region.get_native_long(offset, platform.long_size)?)
        }
        SemanticType::Float32 => Value::Float32(region.get_f32(offset)?),
        SemanticType::Float64 => Value::Float64(region.get_f64(offset)?),
        SemanticType::RawPointer => Value::from_pointer(region.get_pointer(offset)?),
        other => return Err(config_error!("{other} is not a primitive type")),
    })
}

/// Write a primitive at `offset`; booleans become `0` / `-1`
pub fn write_primitive(
    ty: &SemanticType,
    region: &MemoryRegion,
    offset: usize,
    value: &Value,
    platform: &Platform,
) -> Result<()> {
    match ty {
        SemanticType::Bool => {
            let b = value.as_bool().ok_or_else(|| mismatch(ty, value))?;
            region.set_i32(offset, if b { -1 } else { 0 })
        }
        SemanticType::Int8 => region.set_i8(offset, narrow(ty, value)?),
        SemanticType::Int16 => region.set_i16(offset, narrow(ty, value)?),
        SemanticType::Int32 => region.set_i32(offset, narrow(ty, value)?),
        SemanticType::Int64 => region.set_i64(offset, integer(ty, value)?),
        SemanticType::NativeLong => {
            region.set_native_long(offset, platform.long_size, integer(ty, value)?)
        }
        SemanticType::Float32 => match value {
            Value::Float32(v) => region.set_f32(offset, *v),
            other => Err(mismatch(ty, other)),
        },
        SemanticType::Float64 => match value {
            Value::Float64(v) => region.set_f64(offset, *v),
            Value::Float32(v) => region.set_f64(offset, f64::from(*v)),
            other => Err(mismatch(ty, other)),
        },
        SemanticType::RawPointer => {
            let p = value.as_pointer().ok_or_else(|| mismatch(ty, value))?;
            region.set_pointer(offset, p)
        }
        other => Err(config_error!("{other} is not a primitive type")),
    }
}

/// Category used to dispatch a native type as a return value
pub(crate) fn return_category(native: &SemanticType, platform: &Platform) -> Result<ReturnCategory> {
    Ok(match native {
        SemanticType::Void => ReturnCategory::Void,
        SemanticType::Bool | SemanticType::Int32 => ReturnCategory::Int32,
        SemanticType::Int8 => ReturnCategory::Int8,
        SemanticType::Int16 => ReturnCategory::Int16,
        SemanticType::Int64 => ReturnCategory::Int64,
        SemanticType::NativeLong if platform.long_size == 4 => ReturnCategory::Int32,
        SemanticType::NativeLong => ReturnCategory::Int64,
        SemanticType::Float32 => ReturnCategory::Float,
        SemanticType::Float64 => ReturnCategory::Double,
        SemanticType::RawPointer
        | SemanticType::NarrowString
        | SemanticType::WideString
        | SemanticType::Composite(..)
        | SemanticType::CallbackRef(_) => ReturnCategory::Pointer,
        other @ (SemanticType::Array(..) | SemanticType::Custom(_)) => {
            return Err(config_error!("{other} cannot cross the ABI directly"))
        }
    })
}

/// Raw ABI value for `value` declared as the primitive `native`
pub(crate) fn raw_for_type(native: &SemanticType, value: &Value, platform: &Platform) -> Result<RawValue> {
    Ok(match native {
        SemanticType::Void => RawValue::Void,
        SemanticType::Bool => {
            let b = value.as_bool().ok_or_else(|| mismatch(native, value))?;
            RawValue::I32(if b { -1 } else { 0 })
        }
        SemanticType::Int8 => RawValue::I8(narrow(native, value)?),
        SemanticType::Int16 => RawValue::I16(narrow(native, value)?),
        SemanticType::Int32 => RawValue::I32(narrow(native, value)?),
        SemanticType::Int64 => RawValue::I64(integer(native, value)?),
        SemanticType::NativeLong if platform.long_size == 4 => RawValue::I32(narrow(native, value)?),
        SemanticType::NativeLong => RawValue::I64(integer(native, value)?),
        SemanticType::Float32 => match value {
            Value::Float32(v) => RawValue::F32(*v),
            other => return Err(mismatch(native, other)),
        },
        SemanticType::Float64 => match value {
            Value::Float64(v) => RawValue::F64(*v),
            Value::Float32(v) => RawValue::F64(f64::from(*v)),
            other => return Err(mismatch(native, other)),
        },
        SemanticType::RawPointer => {
            RawValue::Pointer(value.as_pointer().ok_or_else(|| mismatch(native, value))?)
        }
        other => return Err(config_error!("{other} is not a primitive type")),
    })
}

/// Managed value of a raw ABI value declared as `ty`
///
/// Strings are decoded and composites are read from the returned address.
pub(crate) fn value_from_raw(
    ty: &SemanticType,
    raw: RawValue,
    platform: &Platform,
    encoding: &dyn StringEncoding,
) -> Result<Value> {
    let int = || raw.as_i64().ok_or_else(|| config_error!("expected integer result for {ty}, found {raw:?}"));
    let address = || raw.as_pointer().ok_or_else(|| config_error!("expected pointer result for {ty}, found {raw:?}"));

    Ok(match ty {
        SemanticType::Void => Value::Void,
        SemanticType::Bool => Value::Bool(int()? != 0),
        SemanticType::Int8 => Value::Int8(int()? as i8),
        SemanticType::Int16 => Value::Int16(int()? as i16),
        SemanticType::Int32 => Value::Int32(int()? as i32),
        SemanticType::Int64 => Value::Int64(int()?),
        SemanticType::NativeLong if platform.long_size == 4 => Value::NativeLong(i64::from(int()? as i32)),
        SemanticType::NativeLong => Value::NativeLong(int()?),
        SemanticType::Float32 => match raw {
            RawValue::F32(v) => Value::Float32(v),
            other => return Err(config_error!("expected float result, found {other:?}")),
        },
        SemanticType::Float64 => match raw {
            RawValue::F64(v) => Value::Float64(v),
            other => return Err(config_error!("expected double result, found {other:?}")),
        },
        SemanticType::RawPointer | SemanticType::CallbackRef(_) => Value::from_pointer(address()?),
        SemanticType::NarrowString => {
            let p = address()?;
            if p.is_null() {
                Value::Null
            } else {
                // SAFETY: native code declared this value a NUL-terminated string
                Value::String(encoding.decode(&unsafe { p.read_c_bytes() }))
            }
        }
        SemanticType::WideString => {
            let p = address()?;
            if p.is_null() {
                Value::Null
            } else {
                // SAFETY: native code declared this value a NUL-terminated wide string
                Value::WideString(unsafe { p.read_wide_string() })
            }
        }
        SemanticType::Composite(def, _) => {
            let p = address()?;
            if p.is_null() {
                Value::Null
            } else {
                let instance = StructRef::new(def);
                // SAFETY: native code declared this address an instance of `def`
                unsafe { instance.bind_address(p)? };
                instance.read()?;
                Value::Structure(instance)
            }
        }
        other @ (SemanticType::Array(..) | SemanticType::Custom(_)) => {
            return Err(config_error!("{other} cannot cross the ABI directly"))
        }
    })
}
