//! Fuzz target for `FormatVersion` parsing.
//!
//! Decoding arbitrary bytes must never panic; accepted records must
//! re-encode to bytes that decode to the same record.

#![no_main]

use libfuzzer_sys::fuzz_target;

use dataspace_store::{FormatVersion, codec::ByteReader};

fuzz_target!(|data: &[u8]| {
    let mut reader = ByteReader::new(data);
    if let Ok(version) = FormatVersion::load(&mut reader) {
        assert!(reader.position() <= data.len());
        let bytes = version.to_bytes().expect("decoded version must re-encode");
        assert_eq!(bytes.len(), version.encoded_len(), "encoded length mismatch");
        let roundtrip = FormatVersion::from_bytes(&bytes).expect("re-encoded version must decode");
        assert_eq!(roundtrip, version, "version roundtrip mismatch");
    }
});
