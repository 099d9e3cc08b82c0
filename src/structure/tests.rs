//! Tests for structure and union instances

use std::sync::Arc;
use std::thread;

use super::*;
use crate::abi::CallingConvention;
use crate::callback::{callback_fn, CallbackRegistry, CallbackSignature};
use crate::codec::{IntegerCodec, UINT16};
use crate::layout::{AlignmentMode, CompositeKind, FieldDecl, SemanticType};
use crate::memory::{MemoryRegion, Pointer};
use crate::value::{ArrayValue, Value};

fn point_def() -> StructDef {
    StructDef::builder("Point")
        .field("x", SemanticType::Int32)
        .field("y", SemanticType::Int32)
        .build()
        .unwrap()
}

/// A second instance over the same memory, freshly read
fn mirror(s: &StructRef) -> StructRef {
    let copy = StructRef::new(s.def());
    copy.bind_memory(&s.region().unwrap(), 0).unwrap();
    copy.read().unwrap();
    copy
}

fn node_def() -> StructDef {
    let def = StructDef::declare("Node", CompositeKind::Struct, AlignmentMode::PlatformDefault);
    def.define(vec![
        FieldDecl::new("value", SemanticType::Int32),
        FieldDecl::new("next", SemanticType::by_reference(&def)),
    ])
    .unwrap();
    def
}

#[test]
fn primitives_round_trip() {
    let def = StructDef::builder("Mixed")
        .field("a", SemanticType::Int8)
        .field("b", SemanticType::Int16)
        .field("c", SemanticType::Int32)
        .field("d", SemanticType::Int64)
        .field("e", SemanticType::Float32)
        .field("f", SemanticType::Float64)
        .field("g", SemanticType::Bool)
        .field("h", SemanticType::NativeLong)
        .build()
        .unwrap();
    let s = StructRef::new(&def);
    s.set("a", -7i8).unwrap();
    s.set("b", 300i16).unwrap();
    s.set("c", -70_000i32).unwrap();
    s.set("d", 1i64 << 40).unwrap();
    s.set("e", 1.5f32).unwrap();
    s.set("f", -2.25f64).unwrap();
    s.set("g", true).unwrap();
    s.set("h", Value::NativeLong(12)).unwrap();
    s.write().unwrap();

    let copy = mirror(&s);
    assert_eq!(copy.get("a").unwrap(), Value::Int8(-7));
    assert_eq!(copy.get("b").unwrap(), Value::Int16(300));
    assert_eq!(copy.get("c").unwrap(), Value::Int32(-70_000));
    assert_eq!(copy.get("d").unwrap(), Value::Int64(1 << 40));
    assert_eq!(copy.get("e").unwrap(), Value::Float32(1.5));
    assert_eq!(copy.get("f").unwrap(), Value::Float64(-2.25));
    assert_eq!(copy.get("g").unwrap(), Value::Bool(true));
    assert_eq!(copy.get("h").unwrap(), Value::NativeLong(12));
    assert!(copy.content_eq(&s).unwrap());
}

#[test]
fn booleans_are_written_as_minus_one() {
    let def = StructDef::builder("Flag").field("on", SemanticType::Bool).build().unwrap();
    let s = StructRef::new(&def);
    s.set("on", true).unwrap();
    s.write().unwrap();
    assert_eq!(s.region().unwrap().get_i32(0).unwrap(), -1);
    assert_eq!(s.size().unwrap(), 4);
}

#[test]
fn nested_structures_and_arrays_round_trip() {
    let inner = StructDef::builder("Inner")
        .field("x", SemanticType::Int32)
        .field("y", SemanticType::Int16)
        .build()
        .unwrap();
    let outer = StructDef::builder("Outer")
        .field("tag", SemanticType::Int8)
        .field("inner", SemanticType::by_value(&inner))
        .field("values", SemanticType::array(SemanticType::Int32, 3))
        .build()
        .unwrap();

    let s = StructRef::new(&outer);
    let Value::Structure(child) = s.get("inner").unwrap() else {
        panic!("by-value member should be materialized");
    };
    child.set("x", 11i32).unwrap();
    child.set("y", 22i16).unwrap();
    s.set("tag", 1i8).unwrap();
    s.set("values", Value::Array(ArrayValue::new(vec![1i32.into(), 2i32.into(), 3i32.into()])))
        .unwrap();
    s.write().unwrap();

    // The nested instance shares its parent's memory
    assert_eq!(child.pointer().unwrap(), s.pointer().unwrap().offset(4));

    let copy = mirror(&s);
    let Value::Structure(copied) = copy.get("inner").unwrap() else {
        panic!("expected nested structure");
    };
    assert_eq!(copied.get("x").unwrap(), Value::Int32(11));
    assert_eq!(copied.get("y").unwrap(), Value::Int16(22));
    let values = copy.get("values").unwrap();
    assert_eq!(
        values.as_array().unwrap().to_vec(),
        vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]
    );
}

#[test]
fn by_reference_identity_is_preserved() {
    let def = node_def();
    let a = StructRef::new(&def);
    let b = StructRef::new(&def);
    b.set("value", 7i32).unwrap();
    b.write().unwrap();
    a.set("next", b.clone()).unwrap();
    a.write().unwrap();

    a.read().unwrap();
    let Value::Structure(next) = a.get("next").unwrap() else {
        panic!("expected a referenced node");
    };
    assert!(next.ptr_eq(&b));
    assert_eq!(next.get("value").unwrap(), Value::Int32(7));
}

#[test]
fn by_reference_is_regenerated_when_pointer_changes() {
    let def = node_def();
    let a = StructRef::new(&def);
    let b = StructRef::new(&def);
    let c = StructRef::new(&def);
    c.set("value", 99i32).unwrap();
    c.write().unwrap();
    a.set("next", b.clone()).unwrap();
    a.write().unwrap();

    let offset = a.layout().unwrap().field("next").unwrap().offset;
    a.region().unwrap().set_pointer(offset, c.pointer().unwrap()).unwrap();
    a.read().unwrap();
    let Value::Structure(next) = a.get("next").unwrap() else {
        panic!("expected a referenced node");
    };
    assert!(!next.ptr_eq(&b));
    assert_eq!(next.pointer().unwrap(), c.pointer().unwrap());
    assert_eq!(next.get("value").unwrap(), Value::Int32(99));

    a.region().unwrap().set_pointer(offset, Pointer::NULL).unwrap();
    a.read().unwrap();
    assert_eq!(a.get("next").unwrap(), Value::Null);
}

#[test]
fn self_reference_read_terminates() {
    let def = node_def();
    let a = StructRef::new(&def);
    a.set("value", 5i32).unwrap();
    a.set("next", a.clone()).unwrap();
    a.write().unwrap();
    a.read().unwrap();
    assert_eq!(a.get("next").unwrap(), Value::Structure(a.clone()));
}

#[test]
fn union_reinterprets_bits() {
    let def = StructDef::builder("Word")
        .field("value", SemanticType::Int32)
        .field("bytes", SemanticType::array(SemanticType::Int8, 4))
        .build_union()
        .unwrap();
    let u = StructRef::new(&def);
    assert_eq!(u.size().unwrap(), 4);
    u.set("value", 0x1234_5678i32).unwrap();
    u.write_field("value").unwrap();
    assert_eq!(u.selected_field().as_deref(), Some("value"));

    u.read().unwrap();
    let expected: Vec<Value> = 0x1234_5678i32
        .to_ne_bytes()
        .iter()
        .map(|b| Value::Int8(*b as i8))
        .collect();
    assert_eq!(u.get("bytes").unwrap().as_array().unwrap().to_vec(), expected);
}

#[test]
fn union_write_only_touches_selected_member() {
    let def = StructDef::builder("Either")
        .field("small", SemanticType::Int8)
        .field("large", SemanticType::Int64)
        .build_union()
        .unwrap();
    let u = StructRef::new(&def);
    u.set("large", -1i64).unwrap();
    u.write().unwrap();
    assert_eq!(u.native_bytes().unwrap(), vec![0; 8]);

    u.set_type("large").unwrap();
    u.write().unwrap();
    assert_eq!(u.native_bytes().unwrap(), vec![0xff; 8]);
    assert!(u.set_type("missing").is_err());
}

#[test]
fn union_skips_unselected_pointers() {
    let def = StructDef::builder("Tagged")
        .field("text", SemanticType::NarrowString)
        .field("number", SemanticType::Int64)
        .build_union()
        .unwrap();
    let u = StructRef::new(&def);
    u.set("number", 12345i64).unwrap();
    u.write_field("number").unwrap();
    u.read().unwrap();
    assert_eq!(u.get("text").unwrap(), Value::Null);
    assert_eq!(u.get("number").unwrap(), Value::Int64(12345));
}

#[test]
fn typed_value_reads_union_as_structure() {
    let point = point_def();
    let def = StructDef::builder("Shape")
        .field("point", SemanticType::by_value(&point))
        .field("raw", SemanticType::Int64)
        .build_union()
        .unwrap();
    let u = StructRef::new(&def);
    u.set("raw", 0i64).unwrap();
    u.write_field("raw").unwrap();
    u.region().unwrap().set_i32(4, 8).unwrap();

    let typed = u.typed_value(&point).unwrap();
    assert_eq!(typed.get("y").unwrap(), Value::Int32(8));
    assert_eq!(u.selected_field().as_deref(), Some("point"));
    assert!(StructRef::new(&point).typed_value(&point).is_err());
}

#[test]
fn array_view_is_contiguous() {
    let def = point_def();
    let first = StructRef::new(&def);
    first.set("x", 1i32).unwrap();
    first.write().unwrap();

    let views = first.to_array_view(3).unwrap();
    assert_eq!(views.len(), 3);
    assert!(views[0].ptr_eq(&first));
    let base = first.pointer().unwrap();
    assert_eq!(views[2].pointer().unwrap(), base.offset(16));

    views[2].set("y", 42i32).unwrap();
    views[2].write().unwrap();
    assert_eq!(first.get("x").unwrap(), Value::Int32(1));
    assert_eq!(first.region().unwrap().get_i32(0).unwrap(), 1);

    let again = first.to_array_view(3).unwrap();
    assert_eq!(again[2].get("y").unwrap(), Value::Int32(42));
    assert!(first.to_array_view(0).is_err());
}

#[test]
fn strings_round_trip() {
    let def = StructDef::builder("Named")
        .field("name", SemanticType::NarrowString)
        .field("title", SemanticType::WideString)
        .build()
        .unwrap();
    let s = StructRef::new(&def);
    s.set("name", "narrow").unwrap();
    s.set("title", Value::WideString("wide".into())).unwrap();
    s.write().unwrap();

    let copy = mirror(&s);
    assert_eq!(copy.get("name").unwrap(), Value::String("narrow".into()));
    assert_eq!(copy.get("title").unwrap(), Value::WideString("wide".into()));

    s.set("name", Value::Null).unwrap();
    s.write().unwrap();
    assert_eq!(s.region().unwrap().get_pointer(0).unwrap(), Pointer::NULL);
}

#[test]
fn deferred_array_sizes_from_value() {
    let def = StructDef::builder("Packet")
        .field("count", SemanticType::Int32)
        .field("data", SemanticType::deferred_array(SemanticType::Int16))
        .build()
        .unwrap();
    let s = StructRef::new(&def);
    assert!(s.size().unwrap_err().is_configuration());

    s.set("data", Value::Array(ArrayValue::new(vec![Value::Int16(1); 3]))).unwrap();
    assert_eq!(s.size().unwrap(), 12);
    let err = s
        .set("data", Value::Array(ArrayValue::new(vec![Value::Int16(1); 4])))
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn volatile_fields_need_explicit_writes() {
    let def = StructDef::builder("Status")
        .field("id", SemanticType::Int32)
        .volatile_field("state", SemanticType::Int32)
        .build()
        .unwrap();
    let s = StructRef::new(&def);
    s.set("id", 1i32).unwrap();
    s.set("state", 2i32).unwrap();
    s.write().unwrap();
    assert_eq!(s.region().unwrap().get_i32(4).unwrap(), 0);

    s.write_field("state").unwrap();
    assert_eq!(s.region().unwrap().get_i32(4).unwrap(), 2);
}

#[test]
fn set_checks_names_and_types() {
    let s = StructRef::new(&point_def());
    assert!(s.set("z", 1i32).unwrap_err().is_configuration());
    assert!(s.set("x", "text").unwrap_err().is_configuration());
    assert!(s.get("nope").is_err());
}

#[test]
fn clear_keeps_mirrored_values() {
    let s = StructRef::new(&point_def());
    s.set("x", 3i32).unwrap();
    s.write().unwrap();
    s.clear().unwrap();
    assert_eq!(s.native_bytes().unwrap(), vec![0; 8]);
    assert_eq!(s.get("x").unwrap(), Value::Int32(3));
}

#[test]
fn dump_lists_fields_and_memory() {
    let s = StructRef::new(&point_def());
    s.set("x", 0x0102_0304i32).unwrap();
    s.write().unwrap();
    let dump = s.dump().unwrap();
    assert!(dump.starts_with("struct Point("), "{dump}");
    assert!(dump.contains("(8 bytes)"));
    assert!(dump.contains(" x@0x0="));
    assert!(dump.contains("memory dump"));
}

#[test]
fn codec_fields_convert_both_ways() {
    let codec = Arc::new(IntegerCodec::uint16());
    let def = StructDef::builder("Flags")
        .field_with_codec("mask", SemanticType::Custom(UINT16), codec.clone())
        .build()
        .unwrap();
    let s = StructRef::new(&def);
    assert_eq!(s.size().unwrap(), 2);
    s.set("mask", codec.value(65535).unwrap()).unwrap();
    s.write().unwrap();
    assert_eq!(s.region().unwrap().get_i16(0).unwrap(), -1);

    let Value::Custom(read) = s.read_field("mask").unwrap() else {
        panic!("expected a codec value");
    };
    assert_eq!(read.downcast_ref::<u64>(), Some(&65535));
}

#[test]
fn callback_fields_keep_their_callback() {
    let sig = CallbackSignature::new(vec![SemanticType::Int32], SemanticType::Int32);
    let def = StructDef::builder("Handler")
        .field("on_event", SemanticType::callback(sig.clone()))
        .build()
        .unwrap();
    let callback = callback_fn(sig, |args| Ok(args[0].clone()));
    let s = StructRef::new(&def);
    s.set("on_event", callback.clone()).unwrap();
    s.write().unwrap();
    assert!(!s.region().unwrap().get_pointer(0).unwrap().is_null());

    s.read().unwrap();
    assert_eq!(s.get("on_event").unwrap(), Value::Callback(callback));
}

#[test]
fn by_value_self_containment_is_rejected() {
    let def = StructDef::declare("Loop", CompositeKind::Struct, AlignmentMode::GnuLike);
    def.define(vec![FieldDecl::new("inner", SemanticType::by_value(&def))]).unwrap();
    let err = def.size().unwrap_err();
    assert!(err.to_string().contains("contains itself"), "{err}");
}

#[test]
fn callback_fields_use_the_definition_convention() {
    let sig = CallbackSignature::new(vec![SemanticType::Int32], SemanticType::Int32);
    let def = StructDef::builder("StdHandler")
        .convention(CallingConvention::StdCall)
        .field("on_event", SemanticType::callback(sig.clone()))
        .build()
        .unwrap();
    assert_eq!(def.convention(), CallingConvention::StdCall);
    assert_eq!(point_def().convention(), CallingConvention::C);

    let callback = callback_fn(sig, |args| Ok(args[0].clone()));
    let s = StructRef::new(&def);
    s.set("on_event", callback.clone()).unwrap();
    s.write().unwrap();

    let binding = CallbackRegistry::global()
        .lookup(&callback, CallingConvention::StdCall)
        .unwrap();
    assert_eq!(s.region().unwrap().get_pointer(0).unwrap(), binding.trampoline());
    assert!(CallbackRegistry::global().lookup(&callback, CallingConvention::C).is_none());

    s.read().unwrap();
    assert_eq!(s.get("on_event").unwrap(), Value::Callback(callback));
}

#[test]
fn foreign_memory_is_viewed_as_an_array() {
    let native: Vec<i32> = vec![1, 2, 3, 4, 5, 6];
    let first = StructRef::new(&point_def());
    unsafe { first.bind_address(Pointer::new(native.as_ptr() as usize)) }.unwrap();
    first.read().unwrap();
    assert_eq!(first.region().unwrap().len(), Some(8));

    let points = first.to_array_view(3).unwrap();
    assert_eq!(points[2].get("x").unwrap(), Value::Int32(5));
    assert_eq!(points[2].get("y").unwrap(), Value::Int32(6));
    assert_eq!(
        points[1].pointer().unwrap().address(),
        native.as_ptr() as usize + 8
    );
    // The first element keeps its own bounds
    assert_eq!(first.region().unwrap().len(), Some(8));
}

#[test]
fn shared_views_are_not_extended() {
    let owner = StructRef::new(&point_def());
    let region = owner.region().unwrap();
    let borrowed = StructRef::new(&point_def());
    borrowed.bind_memory(&region, 0).unwrap();
    assert!(borrowed.to_array_view(2).is_err());
    assert!(MemoryRegion::allocate(8).unwrap().share(0, 16).is_err());
}

#[test]
fn unrelated_graphs_read_in_parallel() {
    let def = node_def();
    thread::scope(|scope| {
        for id in 0..4i32 {
            let def = &def;
            scope.spawn(move || {
                let a = StructRef::new(def);
                let b = StructRef::new(def);
                a.set("value", id).unwrap();
                b.set("value", id + 100).unwrap();
                a.set("next", b.clone()).unwrap();
                b.set("next", a.clone()).unwrap();
                a.write().unwrap();
                b.write().unwrap();
                for _ in 0..200 {
                    a.read().unwrap();
                    let Value::Structure(next) = a.get("next").unwrap() else {
                        panic!("expected a referenced node");
                    };
                    assert!(next.ptr_eq(&b));
                    assert_eq!(next.get("value").unwrap(), Value::Int32(id + 100));
                    assert_eq!(a.get("value").unwrap(), Value::Int32(id));
                }
            });
        }
    });
}
