//! Fuzz target for the data-space table decoders.
//!
//! Tests that the map, data-space definition and transform definition
//! decoders never panic on arbitrary input, and that anything they accept
//! re-encodes to bytes that decode to the same value.

#![no_main]

use libfuzzer_sys::fuzz_target;

use dataspace_store::dataspace::{
    DataSpaceDefinitionRecord, DataSpaceMapTable, TransformDefinitionRecord,
};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let selector = data[0] % 3;
    let payload = &data[1..];

    match selector {
        0 => fuzz_map(payload),
        1 => fuzz_definition(payload),
        _ => fuzz_transform(payload),
    }
});

fn fuzz_map(data: &[u8]) {
    if let Ok(table) = DataSpaceMapTable::from_bytes(data) {
        let bytes = table.to_bytes().expect("decoded map must re-encode");
        let roundtrip = DataSpaceMapTable::from_bytes(&bytes).expect("re-encoded map must decode");
        assert_eq!(roundtrip, table, "map roundtrip mismatch");
    }
}

fn fuzz_definition(data: &[u8]) {
    if let Ok(record) = DataSpaceDefinitionRecord::from_bytes(data) {
        assert!(!record.transforms.is_empty(), "empty stacks must be rejected");
        let bytes = record.to_bytes().expect("decoded definition must re-encode");
        let roundtrip =
            DataSpaceDefinitionRecord::from_bytes(&bytes).expect("re-encoded definition must decode");
        assert_eq!(roundtrip, record, "definition roundtrip mismatch");
    }
}

fn fuzz_transform(data: &[u8]) {
    if let Ok(record) = TransformDefinitionRecord::from_bytes(data) {
        let bytes = record.to_bytes().expect("decoded transform must re-encode");
        let roundtrip =
            TransformDefinitionRecord::from_bytes(&bytes).expect("re-encoded transform must decode");
        assert_eq!(roundtrip, record, "transform roundtrip mismatch");
    }
}
