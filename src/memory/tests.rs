//! Tests for native memory regions

use super::*;
use crate::codec::{Latin1, Utf8};
use crate::Error;

// ============================================================================
// Owned regions
// ============================================================================

#[test]
fn owned_region_starts_zeroed() {
    let region = MemoryRegion::allocate(16).unwrap();
    assert!(region.is_owned());
    assert_eq!(region.len(), Some(16));
    assert_eq!(region.read_bytes(0, 16).unwrap(), vec![0u8; 16]);
}

#[test]
fn scalar_round_trip() {
    let region = MemoryRegion::allocate(32).unwrap();
    region.set_i8(0, -5).unwrap();
    region.set_i16(2, 0x1234).unwrap();
    region.set_i32(4, -70000).unwrap();
    region.set_i64(8, 1 << 40).unwrap();
    region.set_f32(16, 1.5).unwrap();
    region.set_f64(24, -2.25).unwrap();

    assert_eq!(region.get_i8(0).unwrap(), -5);
    assert_eq!(region.get_i16(2).unwrap(), 0x1234);
    assert_eq!(region.get_i32(4).unwrap(), -70000);
    assert_eq!(region.get_i64(8).unwrap(), 1 << 40);
    assert_eq!(region.get_f32(16).unwrap(), 1.5);
    assert_eq!(region.get_f64(24).unwrap(), -2.25);
}

#[test]
fn out_of_bounds_access_rejected() {
    let region = MemoryRegion::allocate(8).unwrap();
    let err = region.get_i64(4).unwrap_err();
    assert!(matches!(err, Error::OutOfBounds { offset: 4, size: 8, len: 8 }));
    assert!(region.set_i8(8, 1).is_err());
}

#[test]
fn zero_sized_allocation_is_configuration_error() {
    assert!(MemoryRegion::allocate(0).unwrap_err().is_configuration());
}

#[test]
fn native_long_respects_width() {
    let region = MemoryRegion::allocate(8).unwrap();
    region.set_native_long(0, 4, -3).unwrap();
    assert_eq!(region.get_i32(0).unwrap(), -3);
    assert_eq!(region.get_native_long(0, 4).unwrap(), -3);
    assert!(region.set_native_long(0, 4, i64::MAX).is_err());

    region.set_native_long(0, 8, i64::MAX).unwrap();
    assert_eq!(region.get_native_long(0, 8).unwrap(), i64::MAX);
}

// ============================================================================
// Shared views
// ============================================================================

#[test]
fn shared_view_aliases_owner() {
    let owner = MemoryRegion::allocate(16).unwrap();
    let view = owner.share(8, 8).unwrap();
    assert!(view.is_shared());
    assert_eq!(view.address().unwrap(), owner.address().unwrap().offset(8));

    view.set_i32(0, 99).unwrap();
    assert_eq!(owner.get_i32(8).unwrap(), 99);
}

#[test]
fn shared_view_reports_release() {
    let owner = MemoryRegion::allocate(16).unwrap();
    let view = owner.share(0, 4).unwrap();
    drop(owner);

    assert!(view.is_released());
    assert!(matches!(view.get_i32(0), Err(Error::RegionReleased)));
    assert!(matches!(view.address(), Err(Error::RegionReleased)));
}

#[test]
fn share_checks_bounds() {
    let owner = MemoryRegion::allocate(16).unwrap();
    assert!(owner.share(12, 8).is_err());
    let view = owner.share(4, 8).unwrap();
    assert!(view.share(4, 8).is_err());
    assert!(view.share(4, 4).is_ok());
}

#[test]
fn grow_preserves_content_and_releases_views() {
    let mut owner = MemoryRegion::allocate(8).unwrap();
    owner.set_i64(0, 0x0102_0304_0506_0708).unwrap();
    let view = owner.share(0, 8).unwrap();

    owner.grow_preserving(24).unwrap();
    assert_eq!(owner.len(), Some(24));
    assert_eq!(owner.get_i64(0).unwrap(), 0x0102_0304_0506_0708);
    assert_eq!(owner.get_i64(16).unwrap(), 0);
    assert!(view.is_released());
}

#[test]
fn shared_regions_cannot_grow() {
    let owner = MemoryRegion::allocate(8).unwrap();
    let mut view = owner.share(0, 8).unwrap();
    assert!(view.grow_preserving(16).is_err());
}

// ============================================================================
// Foreign memory and strings
// ============================================================================

#[test]
fn foreign_null_rejected() {
    let err = unsafe { MemoryRegion::foreign(Pointer::NULL, Some(4)) }.unwrap_err();
    assert!(matches!(err, Error::NullPointer));
}

#[test]
fn foreign_region_reads_native_memory() {
    let mut backing = [0u8; 8];
    backing[..4].copy_from_slice(&42i32.to_ne_bytes());
    let region = unsafe { MemoryRegion::foreign(Pointer::from_raw(backing.as_mut_ptr()), Some(8)) }.unwrap();
    assert!(region.is_foreign());
    assert_eq!(region.get_i32(0).unwrap(), 42);
}

#[test]
fn narrow_string_is_nul_terminated() {
    let s = NativeString::narrow("hello", &Utf8).unwrap();
    assert_eq!(s.byte_len(), 6);
    assert_eq!(unsafe { s.pointer().read_c_bytes() }, b"hello");
}

#[test]
fn latin1_string_uses_single_bytes() {
    let s = NativeString::narrow("caf\u{e9}", &Latin1).unwrap();
    assert_eq!(unsafe { s.pointer().read_c_bytes() }, vec![b'c', b'a', b'f', 0xe9]);
}

#[test]
fn interior_nul_rejected() {
    assert!(matches!(NativeString::narrow("a\0b", &Utf8), Err(Error::Encoding(_))));
    assert!(matches!(NativeString::wide("a\0b"), Err(Error::Encoding(_))));
}

#[test]
fn wide_string_round_trip() {
    let s = NativeString::wide("h\u{e9}llo").unwrap();
    assert!(s.is_wide());
    assert_eq!(unsafe { s.pointer().read_wide_string() }, "h\u{e9}llo");
}

#[test]
fn inline_c_bytes_stop_at_region_end() {
    let region = MemoryRegion::allocate(4).unwrap();
    region.write_bytes(0, b"abcd").unwrap();
    assert_eq!(region.read_c_bytes(0).unwrap(), b"abcd");
    region.set_i8(2, 0).unwrap();
    assert_eq!(region.read_c_bytes(0).unwrap(), b"ab");
}

#[test]
fn align_up_rounds_to_power_of_two() {
    assert_eq!(align_up(0, 8), 0);
    assert_eq!(align_up(1, 8), 8);
    assert_eq!(align_up(9, 4), 12);
    assert_eq!(align_up(7, 1), 7);
}
