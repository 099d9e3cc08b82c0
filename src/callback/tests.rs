//! Tests for callback trampolines

use std::ffi::{c_char, CStr};
use std::mem::transmute;
use std::sync::{Barrier, Mutex};
use std::thread;

use super::*;
use crate::abi::CallingConvention;
use crate::codec::CodecRegistry;
use crate::error::Error;
use crate::memory::MemoryRegion;
use crate::structure::StructDef;

fn registry() -> CallbackRegistry {
    CallbackRegistry::new(CodecRegistry::new())
}

fn adder() -> Arc<dyn Callback> {
    callback_fn(
        CallbackSignature::new(vec![SemanticType::Int32, SemanticType::Int32], SemanticType::Int32),
        |args| {
            let a = args[0].as_i32().unwrap_or(0);
            let b = args[1].as_i32().unwrap_or(0);
            Ok(Value::Int32(a + b))
        },
    )
}

#[test]
fn same_callback_reuses_trampoline() {
    let registry = registry();
    let callback = adder();

    let first = registry.trampoline(&callback, CallingConvention::C).unwrap();
    let second = registry.trampoline(&callback, CallingConvention::C).unwrap();
    assert_eq!(first, second);
    assert!(!first.is_null());
    assert_eq!(registry.len(), 1);

    let other = adder();
    let third = registry.trampoline(&other, CallingConvention::C).unwrap();
    assert_ne!(first, third);
    assert_eq!(registry.len(), 2);
}

#[test]
fn conventions_are_cached_separately() {
    let registry = registry();
    let callback = adder();
    registry.get_or_create(&callback, CallingConvention::C).unwrap();
    registry.get_or_create(&callback, CallingConvention::StdCall).unwrap();
    assert_eq!(registry.len(), 2);
    assert!(registry.lookup(&callback, CallingConvention::StdCall).is_some());
}

#[test]
fn native_code_calls_through_trampoline() {
    let registry = registry();
    let callback = adder();
    let binding = registry.get_or_create(&callback, CallingConvention::C).unwrap();
    assert!(!binding.is_converting());

    let f: extern "C" fn(i32, i32) -> i32 = unsafe { transmute(binding.trampoline().address()) };
    assert_eq!(f(2, 40), 42);
    assert_eq!(f(-5, 3), -2);
}

#[test]
fn strings_and_bools_are_converted() {
    let registry = registry();
    let length = callback_fn(
        CallbackSignature::new(vec![SemanticType::NarrowString], SemanticType::Int64),
        |args| Ok(Value::Int64(args[0].as_str().map_or(-1, |s| s.len() as i64))),
    );
    let binding = registry.get_or_create(&length, CallingConvention::C).unwrap();
    assert!(binding.is_converting());
    let f: extern "C" fn(*const c_char) -> i64 = unsafe { transmute(binding.trampoline().address()) };
    assert_eq!(f(b"hello\0".as_ptr().cast()), 5);
    assert_eq!(f(std::ptr::null()), -1);

    let not = callback_fn(
        CallbackSignature::new(vec![SemanticType::Bool], SemanticType::Bool),
        |args| Ok(Value::Bool(!args[0].as_bool().unwrap_or(false))),
    );
    let binding = registry.get_or_create(&not, CallingConvention::C).unwrap();
    let f: extern "C" fn(i32) -> i32 = unsafe { transmute(binding.trampoline().address()) };
    assert_eq!(f(0), -1);
    assert_eq!(f(-1), 0);
}

#[test]
fn floating_point_round_trip() {
    let registry = registry();
    let halve = callback_fn(
        CallbackSignature::new(vec![SemanticType::Float64], SemanticType::Float32),
        |args| Ok(Value::Float32((args[0].as_f64().unwrap_or(0.0) / 2.0) as f32)),
    );
    let binding = registry.get_or_create(&halve, CallingConvention::C).unwrap();
    let f: extern "C" fn(f64) -> f32 = unsafe { transmute(binding.trampoline().address()) };
    assert_eq!(f(5.0), 2.5);
}

#[test]
fn failing_callback_returns_zero() {
    let registry = registry();
    let failing = callback_fn(
        CallbackSignature::new(vec![SemanticType::Int32], SemanticType::Int32),
        |_| Err(Error::Callback("boom".to_string())),
    );
    let binding = registry.get_or_create(&failing, CallingConvention::C).unwrap();
    let f: extern "C" fn(i32) -> i32 = unsafe { transmute(binding.trampoline().address()) };
    assert_eq!(f(7), 0);
}

#[test]
fn orphaned_trampoline_returns_zero() {
    let registry = registry();
    let callback = adder();
    let binding = registry.get_or_create(&callback, CallingConvention::C).unwrap();
    drop(callback);

    assert!(!binding.is_alive());
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { transmute(binding.trampoline().address()) };
    assert_eq!(f(1, 2), 0);
    assert_eq!(registry.purge(), 1);
    assert!(registry.is_empty());
}

#[test]
fn release_drops_all_conventions() {
    let registry = registry();
    let callback = adder();
    registry.get_or_create(&callback, CallingConvention::C).unwrap();
    registry.get_or_create(&callback, CallingConvention::StdCall).unwrap();

    assert!(registry.release(&callback));
    assert!(registry.is_empty());
    assert!(!registry.release(&callback));
    assert!(registry.lookup(&callback, CallingConvention::C).is_none());
}

#[test]
fn too_many_parameters_rejected() {
    let registry = registry();
    let wide = callback_fn(
        CallbackSignature::new(vec![SemanticType::Int32; 33], SemanticType::Void),
        |_| Ok(Value::Void),
    );
    let err = registry.get_or_create(&wide, CallingConvention::C).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn array_parameters_rejected() {
    let registry = registry();
    let bad = callback_fn(
        CallbackSignature::new(vec![SemanticType::array(SemanticType::Int8, 4)], SemanticType::Void),
        |_| Ok(Value::Void),
    );
    assert!(matches!(
        registry.get_or_create(&bad, CallingConvention::C),
        Err(Error::Callback(_))
    ));
}

#[test]
fn returned_structure_outlives_the_callback() {
    let registry = registry();
    let point = StructDef::builder("Point")
        .field("x", SemanticType::Int32)
        .field("y", SemanticType::Int32)
        .build()
        .unwrap();
    let produced: Arc<Mutex<Option<MemoryRegion>>> = Arc::default();
    let sink = produced.clone();
    let make = callback_fn(
        CallbackSignature::new(vec![], SemanticType::by_reference(&point)),
        move |_| {
            let s = point.instantiate();
            s.set("x", 3i32)?;
            s.set("y", -8i32)?;
            s.write()?;
            *sink.lock().unwrap() = Some(s.region()?);
            Ok(Value::Structure(s))
        },
    );
    let binding = registry.get_or_create(&make, CallingConvention::C).unwrap();
    let f: extern "C" fn() -> *const [i32; 2] = unsafe { transmute(binding.trampoline().address()) };

    let returned = f();
    let view = produced.lock().unwrap().take().unwrap();
    assert!(!view.is_released());
    assert_eq!(returned as usize, view.address().unwrap().address());
    assert_eq!(unsafe { *returned }, [3, -8]);

    // The next result replaces the retained one
    let again = f();
    assert!(view.is_released());
    assert_eq!(unsafe { *again }, [3, -8]);
}

#[test]
fn returned_strings_are_kept_per_thread() {
    let registry = registry();
    let label = callback_fn(
        CallbackSignature::new(vec![SemanticType::Int32], SemanticType::NarrowString),
        |args| Ok(Value::String(format!("label {}", args[0].as_i32().unwrap_or(-1)))),
    );
    let binding = registry.get_or_create(&label, CallingConvention::C).unwrap();
    let address = binding.trampoline().address();
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        scope.spawn(|| {
            let f: extern "C" fn(i32) -> *const c_char = unsafe { transmute(address) };
            let text = f(1);
            barrier.wait();
            barrier.wait();
            assert_eq!(unsafe { CStr::from_ptr(text) }.to_str().unwrap(), "label 1");
        });
        scope.spawn(|| {
            let f: extern "C" fn(i32) -> *const c_char = unsafe { transmute(address) };
            barrier.wait();
            for n in 2..6 {
                let text = f(n);
                assert_eq!(unsafe { CStr::from_ptr(text) }.to_str().unwrap(), format!("label {n}"));
            }
            barrier.wait();
        });
    });
}

#[test]
fn concurrent_registration_shares_trampolines() {
    let registry = registry();
    let shared = adder();
    let own: Vec<Arc<dyn Callback>> = (0..4).map(|_| adder()).collect();

    let results: Vec<(usize, usize)> = thread::scope(|scope| {
        let handles: Vec<_> = own
            .iter()
            .map(|callback| {
                let registry = &registry;
                let shared = &shared;
                scope.spawn(move || {
                    let mut common = 0;
                    for _ in 0..50 {
                        common = registry.trampoline(shared, CallingConvention::C).unwrap().address();
                    }
                    let mine = registry.trampoline(callback, CallingConvention::C).unwrap().address();
                    let f: extern "C" fn(i32, i32) -> i32 = unsafe { transmute(common) };
                    assert_eq!(f(20, 22), 42);
                    (common, mine)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let expected = registry.trampoline(&shared, CallingConvention::C).unwrap().address();
    assert!(results.iter().all(|(common, _)| *common == expected));
    let mut distinct: Vec<usize> = results.iter().map(|(_, mine)| *mine).collect();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), own.len());
    assert!(!distinct.contains(&expected));
    assert_eq!(registry.len(), own.len() + 1);
}
