//! Tests for the invocation marshaler

use std::ffi::{c_char, CStr};

use parking_lot::Mutex;

use super::*;
use crate::callback::{callback_fn, CallbackSignature};
use crate::codec::TypeKey;
use crate::error::Error;
use crate::layout::SemanticType;
use crate::structure::StructDef;
use crate::value::CustomValue;

/// Records the slots it is given and returns zero
#[derive(Default)]
struct RecordingInvoker {
    calls: Mutex<Vec<Vec<RawArg>>>,
}

impl RawInvoker for RecordingInvoker {
    unsafe fn invoke_raw(
        &self,
        _address: Pointer,
        _convention: CallingConvention,
        args: &[RawArg],
        ret: ReturnCategory,
    ) -> Result<RawValue> {
        self.calls.lock().push(args.to_vec());
        Ok(RawValue::zero(ret))
    }
}

fn recording() -> (Function, Arc<RecordingInvoker>) {
    let invoker = Arc::new(RecordingInvoker::default());
    let options = InvokeOptions {
        invoker: invoker.clone(),
        ..InvokeOptions::default()
    };
    let function = unsafe { Function::from_address("recorded", Pointer::new(0x1000), CallingConvention::C) }
        .with_options(options);
    (function, invoker)
}

fn native(name: &str, address: usize) -> Function {
    unsafe { Function::from_address(name, Pointer::new(address), CallingConvention::C) }
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn mix(a: i8, b: i16, c: i64, d: f32, e: f64) -> f64 {
    f64::from(a) + f64::from(b) + c as f64 + f64::from(d) + e
}

extern "C" fn is_true(flag: i32) -> i32 {
    i32::from(flag == -1)
}

extern "C" fn c_strlen(s: *const c_char) -> i32 {
    unsafe { CStr::from_ptr(s) }.to_bytes().len() as i32
}

extern "C" fn greeting() -> *const c_char {
    b"hello\0".as_ptr().cast()
}

extern "C" fn store_answer(out: *mut i32) {
    unsafe { *out = 42 }
}

extern "C" fn double_all(values: *mut i32, count: i32) {
    for i in 0..count as usize {
        unsafe { *values.add(i) *= 2 }
    }
}

extern "C" fn shout(buffer: *mut c_char) {
    let mut p = buffer;
    unsafe {
        while *p != 0 {
            *p = (*p as u8).to_ascii_uppercase() as c_char;
            p = p.add(1);
        }
    }
}

extern "C" fn count_strings(items: *const *const c_char) -> i32 {
    let mut n = 0;
    unsafe {
        while !(*items.add(n)).is_null() {
            n += 1;
        }
    }
    n as i32
}

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

extern "C" fn swap_point(p: *mut Point) -> i32 {
    let p = unsafe { &mut *p };
    std::mem::swap(&mut p.x, &mut p.y);
    p.x + p.y
}

extern "C" fn sum_points(points: *const Point, count: i32) -> i32 {
    (0..count as usize)
        .map(|i| unsafe { &*points.add(i) })
        .map(|p| p.x + p.y)
        .sum()
}

extern "C" fn apply(f: extern "C" fn(i32) -> i32, value: i32) -> i32 {
    f(value)
}

fn point_def() -> StructDef {
    StructDef::builder("Point")
        .field("x", SemanticType::Int32)
        .field("y", SemanticType::Int32)
        .build()
        .unwrap()
}

#[test]
fn primitive_arguments_and_results() {
    let f = native("add", add as usize);
    assert_eq!(f.invoke_int(&[Value::Int32(40), Value::Int32(2)]).unwrap(), 42);

    let f = native("mix", mix as usize);
    let sum = f
        .invoke_double(&[
            Value::Int8(1),
            Value::Int16(2),
            Value::Int64(3),
            Value::Float32(0.5),
            Value::Float64(0.25),
        ])
        .unwrap();
    assert_eq!(sum, 6.75);
}

#[test]
fn booleans_pass_as_minus_one() {
    let f = native("is_true", is_true as usize);
    assert_eq!(f.invoke_int(&[Value::Bool(true)]).unwrap(), 1);
    assert_eq!(f.invoke(&SemanticType::Bool, &[Value::Bool(false)]).unwrap(), Value::Bool(false));
}

#[test]
fn strings_in_and_out() {
    let f = native("c_strlen", c_strlen as usize);
    assert_eq!(f.invoke_int(&[Value::String("marshal".into())]).unwrap(), 7);

    let f = native("greeting", greeting as usize);
    assert_eq!(f.invoke_string(&[], false).unwrap().as_deref(), Some("hello"));
}

#[test]
fn by_reference_cell_is_updated() {
    let cell = ByReference::int32(0);
    native("store_answer", store_answer as usize)
        .invoke_void(&[Value::ByReference(cell.clone())])
        .unwrap();
    assert_eq!(cell.value(), Value::Int32(42));
}

#[test]
fn primitive_array_is_copied_back() {
    let array = ArrayValue::new(vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
    native("double_all", double_all as usize)
        .invoke_void(&[Value::Array(array.clone()), Value::Int32(3)])
        .unwrap();
    assert_eq!(array.to_vec(), vec![Value::Int32(2), Value::Int32(4), Value::Int32(6)]);
}

#[test]
fn string_buffer_sees_native_writes() {
    let buffer = StringBuffer::with_content("quiet", 16).unwrap();
    native("shout", shout as usize)
        .invoke_void(&[Value::StringBuffer(buffer.clone())])
        .unwrap();
    assert_eq!(buffer.value(), "QUIET");
}

#[test]
fn string_array_is_null_terminated() {
    let items = ArrayValue::new(vec![Value::String("a".into()), Value::String("bc".into())]);
    let f = native("count_strings", count_strings as usize);
    assert_eq!(f.invoke_int(&[Value::StringArray(items.clone())]).unwrap(), 2);
    assert_eq!(items.get(1), Some(Value::String("bc".into())));
}

#[test]
fn structures_are_written_and_reread() {
    let point = StructRef::new(&point_def());
    point.set("x", Value::Int32(3)).unwrap();
    point.set("y", Value::Int32(9)).unwrap();

    let f = native("swap_point", swap_point as usize);
    assert_eq!(f.invoke_int(&[Value::Structure(point.clone())]).unwrap(), 12);
    assert_eq!(point.get("x").unwrap(), Value::Int32(9));
    assert_eq!(point.get("y").unwrap(), Value::Int32(3));
}

#[test]
fn structure_array_without_memory_gets_one_block() {
    let def = point_def();
    let points: Vec<StructRef> = (0..3).map(|_| StructRef::new(&def)).collect();
    for (i, p) in points.iter().enumerate() {
        p.set("x", Value::Int32(i as i32)).unwrap();
        p.set("y", Value::Int32(10)).unwrap();
    }
    let f = native("sum_points", sum_points as usize);
    let total = f
        .invoke_int(&[Value::StructureArray(points.clone()), Value::Int32(3)])
        .unwrap();
    assert_eq!(total, 33);
    let base = points[0].pointer().unwrap();
    assert_eq!(points[2].pointer().unwrap(), base.offset(16));
}

#[test]
fn non_contiguous_structure_array_names_index() {
    let def = point_def();
    let first = StructRef::new(&def);
    let second = StructRef::new(&def);
    first.pointer().unwrap();
    second.pointer().unwrap();

    let (f, invoker) = recording();
    let err = f
        .invoke_void(&[Value::StructureArray(vec![first, second])])
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("element 1"), "{err}");
    assert!(invoker.calls.lock().is_empty());
}

#[test]
fn empty_structure_array_is_null() {
    let (f, invoker) = recording();
    f.invoke_void(&[Value::StructureArray(Vec::new())]).unwrap();
    assert_eq!(invoker.calls.lock()[0], vec![RawArg::Pointer(Pointer::NULL)]);
}

#[test]
fn spread_matches_manual_sequence() {
    let (f, invoker) = recording();
    f.invoke_void(&[
        Value::Int32(1),
        Value::Spread(vec![Value::Float64(2.0), Value::Int64(3)]),
    ])
    .unwrap();
    f.invoke_void(&[Value::Int32(1), Value::Float64(2.0), Value::Int64(3), Value::Null])
        .unwrap();

    let calls = invoker.calls.lock();
    assert_eq!(calls[0], calls[1]);
    assert_eq!(calls[0].last(), Some(&RawArg::Pointer(Pointer::NULL)));
}

#[test]
fn spread_must_be_last() {
    let (f, invoker) = recording();
    let err = f
        .invoke_void(&[Value::Spread(vec![Value::Int32(1)]), Value::Int32(2)])
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(invoker.calls.lock().is_empty());
}

#[test]
fn argument_limit_checked_before_call() {
    let (f, invoker) = recording();
    let args = vec![Value::Int32(0); MAX_NARGS];
    f.invoke_void(&args).unwrap();

    let mut spread = vec![Value::Int32(0); MAX_NARGS - 1];
    spread.push(Value::Spread(vec![Value::Int32(1)]));
    let err = f.invoke_void(&spread).unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(invoker.calls.lock().len(), 1);
}

#[test]
fn callback_arguments_pass_trampolines() {
    let triple = callback_fn(
        CallbackSignature::new(vec![SemanticType::Int32], SemanticType::Int32),
        |args| Ok(Value::Int32(args[0].as_i32().unwrap_or(0) * 3)),
    );
    let f = native("apply", apply as usize);
    assert_eq!(f.invoke_int(&[Value::Callback(triple.clone()), Value::Int32(5)]).unwrap(), 15);
    assert!(CallbackRegistry::global()
        .lookup(&triple, CallingConvention::C)
        .is_some());
}

#[test]
fn custom_value_needs_a_codec() {
    let (f, invoker) = recording();
    let opaque = CustomValue::new(TypeKey::new("opaque"), 1u8);
    let err = f.invoke_void(&[Value::Custom(opaque)]).unwrap_err();
    assert!(err.is_configuration());
    assert!(invoker.calls.lock().is_empty());
}

#[test]
fn null_address_is_an_error() {
    let f = native("missing", 0);
    assert!(matches!(f.invoke_void(&[]), Err(Error::NullPointer)));
}
