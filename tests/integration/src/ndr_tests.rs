//! NDR codec properties exercised through the public facade: round-trips
//! for every value category, the two-phase deferred layout, and the aliasing
//! rules for full pointers.

mod common;

use msrpc_ndr::{
    NdrError, NdrReader, NdrUnion, NdrWriter, Shared, Uuid, WString,
};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Setting {
    Level(u32),
    Label(WString),
    Disabled,
}

impl NdrUnion for Setting {
    type Discriminant = u16;

    fn discriminant(&self) -> u16 {
        match self {
            Setting::Level(_) => 1,
            Setting::Label(_) => 2,
            Setting::Disabled => 3,
        }
    }

    fn encode_arm(&self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        match self {
            Setting::Level(level) => w.write_data(level),
            Setting::Label(label) => w.write_data(label),
            Setting::Disabled => Ok(()),
        }
    }

    fn decode_arm(r: &mut NdrReader, tag: u16) -> msrpc_ndr::Result<Self> {
        match tag {
            1 => Ok(Setting::Level(r.read_data()?)),
            2 => Ok(Setting::Label(r.read_data()?)),
            3 => Ok(Setting::Disabled),
            other => Err(NdrError::InvalidDiscriminant(other as i64)),
        }
    }
}

#[test]
fn test_mixed_struct_roundtrip() {
    // A struct-shaped message: scalars, a string, an array, a union, and a
    // pointer, marshaled in the flat-fields-then-deferred order every
    // generated stub uses.
    let name = WString::new("domain\\operator");
    let values: Vec<u32> = vec![3, 1, 4, 1, 5, 9, 2, 6];
    let setting = Setting::Label(WString::new("verbose"));
    let uuid = Uuid::parse("8a885d04-1ceb-11c9-9fe8-08002b104860").unwrap();

    let mut w = NdrWriter::new();
    w.write_u16(0x0101);
    w.write_data(&uuid).unwrap();
    w.write_data(&name).unwrap();
    w.write_conformant_varying_array(&values).unwrap();
    w.write_union(&setting).unwrap();
    w.write_unique_data(Some(&0xDEAD_BEEFu32)).unwrap();
    w.write_deferred().unwrap();
    let data = w.finish().unwrap();

    let mut r = NdrReader::new(data);
    assert_eq!(r.read_u16().unwrap(), 0x0101);
    assert_eq!(r.read_data::<Uuid>().unwrap(), uuid);
    assert_eq!(r.read_data::<WString>().unwrap(), name);
    assert_eq!(r.read_conformant_varying_array::<u32>().unwrap(), values);
    assert_eq!(r.read_union::<Setting>().unwrap(), setting);
    let pointer = r.read_unique_pointer::<u32>().unwrap().unwrap();
    r.read_deferred().unwrap();
    assert_eq!(*pointer.value().unwrap(), 0xDEAD_BEEF);
    assert_eq!(r.remaining(), 0);
}

#[test]
fn test_union_unknown_tag_rejected() {
    let mut w = NdrWriter::new();
    w.write_u16(42);
    let data = w.finish().unwrap();

    let mut r = NdrReader::new(data);
    assert!(matches!(
        r.read_union::<Setting>(),
        Err(NdrError::InvalidDiscriminant(42))
    ));
}

#[test]
fn test_aliased_pointers_single_payload_on_wire() {
    let target = Arc::new(0x0102_0304u32);

    // Aliased: one payload transmitted.
    let mut w = NdrWriter::new();
    w.write_full_pointer(Some(&target)).unwrap();
    w.write_full_pointer(Some(&target)).unwrap();
    w.write_deferred().unwrap();
    let aliased = w.finish().unwrap();

    // Independent targets with equal values: two payloads.
    let other = Arc::new(0x0102_0304u32);
    let mut w = NdrWriter::new();
    w.write_full_pointer(Some(&target)).unwrap();
    w.write_full_pointer(Some(&other)).unwrap();
    w.write_deferred().unwrap();
    let independent = w.finish().unwrap();

    assert_eq!(aliased.len() + 4, independent.len());
    // Both referent ID fields in the aliased form carry the same ID.
    assert_eq!(&aliased[0..4], &aliased[4..8]);
}

#[test]
fn test_aliased_pointers_decode_to_shared_value() {
    let target = Arc::new(7u32);
    let mut w = NdrWriter::new();
    w.write_full_pointer(Some(&target)).unwrap();
    w.write_full_pointer(Some(&target)).unwrap();
    w.write_deferred().unwrap();
    let data = w.finish().unwrap();

    let mut r = NdrReader::new(data);
    let first = r.read_full_pointer::<u32>().unwrap().unwrap();
    let second = r.read_full_pointer::<u32>().unwrap().unwrap();
    r.read_deferred().unwrap();

    assert!(Shared::ptr_eq(&first, &second));
    assert_eq!(first.referent(), second.referent());
    assert_eq!(*second.value().unwrap(), 7);
}

#[test]
fn test_deferred_payloads_follow_all_flat_fields() {
    // Two pointers, then a trailing scalar: both payloads must land after
    // the scalar, in pointer encounter order.
    let mut w = NdrWriter::new();
    w.write_unique_data(Some(&0x11u8)).unwrap();
    w.write_unique_data(Some(&0x22u8)).unwrap();
    w.write_u8(0x33);
    w.write_deferred().unwrap();
    let data = w.finish().unwrap();

    // referent(4) + referent(4) + scalar(1) + payloads(1+1)
    assert_eq!(data.len(), 11);
    assert_eq!(data[8], 0x33);
    assert_eq!(data[9], 0x11);
    assert_eq!(data[10], 0x22);
}

#[test]
fn test_string_and_array_edge_cases() {
    let mut w = NdrWriter::new();
    w.write_data(&WString::new("")).unwrap();
    w.write_conformant_array::<u64>(&[]).unwrap();
    w.write_varying_array(&[1u16, 2, 3]).unwrap();
    let data = w.finish().unwrap();

    let mut r = NdrReader::new(data);
    assert_eq!(r.read_data::<WString>().unwrap().as_str(), "");
    assert!(r.read_conformant_array::<u64>().unwrap().is_empty());
    assert_eq!(r.read_varying_array::<u16>().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_truncated_deferred_payload_is_eof() {
    let mut w = NdrWriter::new();
    w.write_unique_data(Some(&0x1122_3344_5566_7788u64)).unwrap();
    w.write_deferred().unwrap();
    let data = w.finish().unwrap();

    // Drop the deferred payload's tail.
    let mut r = NdrReader::new(data.slice(0..data.len() - 2));
    let _pointer = r.read_unique_pointer::<u64>().unwrap();
    assert!(matches!(
        r.read_deferred(),
        Err(NdrError::UnexpectedEof { .. })
    ));
}
