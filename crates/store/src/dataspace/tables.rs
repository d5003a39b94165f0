//! Binary layout of the data-space tables.
//!
//! All integers are little-endian `int32`; strings are byte-length-prefixed
//! UTF-16LE padded to a 4-byte boundary. Every header starts with its own
//! length so that readers can skip fields appended by newer writers; up to
//! [`MAX_EXTRA_DATA_SIZE`] such bytes are preserved and written back.
//!
//! ```text
//! DataSpaceMap        headerLength(=8+extra) entryCount extra
//!                     entry* = entryLength reference label
//! DataSpaceInfo/<l>   headerLength(=8+extra) transformCount extra label*
//! TransformInfo/<l>/  headerLength classType(=1) typeName extra instanceData
//!   \x06Primary
//! ```

use crate::{
    codec::{self, ByteReader, INT32_SIZE, MAX_EXTRA_DATA_SIZE},
    error::{Error, Result},
    reference::ContainerReference,
};

/// Class type tag of a transform implemented by a class identifier.
pub const TRANSFORM_CLASS_TYPE: i32 = 1;

/// Fixed part of the map and data-space headers.
const COUNTED_HEADER_LEN: usize = 2 * INT32_SIZE;

/// Decoded `DataSpaceMap` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSpaceMapTable {
    /// Element references and the data-space label each maps to, in stored
    /// order.
    pub entries: Vec<(ContainerReference, String)>,
    /// Header bytes not understood by this version.
    pub extra: Vec<u8>,
}

/// Decoded `DataSpaceInfo/<label>` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSpaceDefinitionRecord {
    /// Transform labels, index 0 closest to the stored bytes.
    pub transforms: Vec<String>,
    /// Header bytes not understood by this version.
    pub extra: Vec<u8>,
}

/// Decoded `TransformInfo/<label>/\x06Primary` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformDefinitionRecord {
    /// Class identifier of the transform.
    pub type_name: String,
    /// Header bytes not understood by this version.
    pub extra: Vec<u8>,
    /// Transform-specific bytes following the header.
    pub instance_data: Vec<u8>,
}

fn check_extra(extra: &[u8], what: &str) -> Result<()> {
    if extra.len() > MAX_EXTRA_DATA_SIZE {
        return Err(Error::InvalidArgument {
            reason: format!(
                "{what}: {} extra header bytes exceed the {MAX_EXTRA_DATA_SIZE} byte limit",
                extra.len()
            ),
        });
    }
    Ok(())
}

fn ensure_consumed(reader: &ByteReader<'_>, what: &str) -> Result<()> {
    if reader.remaining() != 0 {
        return Err(Error::Corrupted {
            reason: format!("{what}: {} unexpected trailing bytes", reader.remaining()),
        });
    }
    Ok(())
}

impl DataSpaceMapTable {
    /// Encodes the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the extra bytes exceed the cap
    /// or a length does not fit in an `int32`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_extra(&self.extra, "data space map")?;
        let mut buf = Vec::new();
        codec::write_length(&mut buf, COUNTED_HEADER_LEN + self.extra.len())?;
        codec::write_length(&mut buf, self.entries.len())?;
        buf.extend_from_slice(&self.extra);

        let mut entry = Vec::new();
        for (reference, label) in &self.entries {
            entry.clear();
            reference.save(&mut entry)?;
            codec::write_unicode_string(&mut entry, label)?;
            codec::write_length(&mut buf, INT32_SIZE + entry.len())?;
            buf.extend_from_slice(&entry);
        }
        Ok(buf)
    }

    /// Decodes the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a length or count is negative, the
    /// extra bytes exceed the cap, an entry's length disagrees with its
    /// contents, or the stream is truncated or has trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let header_len = reader.read_length("data space map header length")?;
        let extra_len =
            codec::extra_data_len(header_len, COUNTED_HEADER_LEN, "data space map header")?;
        let count = reader.read_length("data space map entry count")?;
        let extra = reader.read_bytes(extra_len, "data space map header")?.to_vec();

        let mut entries = Vec::new();
        for index in 0..count {
            let start = reader.position();
            let entry_len = reader.read_length("data space map entry length")?;
            let reference = ContainerReference::load(&mut reader)?;
            let label = reader.read_unicode_string("data space map entry label")?;
            let consumed = reader.position() - start;
            if consumed != entry_len {
                return Err(Error::Corrupted {
                    reason: format!(
                        "data space map entry {index}: length field says {entry_len}, \
                         entry occupies {consumed}"
                    ),
                });
            }
            entries.push((reference, label));
        }
        ensure_consumed(&reader, "data space map")?;
        Ok(Self { entries, extra })
    }
}

impl DataSpaceDefinitionRecord {
    /// Encodes the definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the extra bytes exceed the cap
    /// or a length does not fit in an `int32`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_extra(&self.extra, "data space definition")?;
        let mut buf = Vec::new();
        codec::write_length(&mut buf, COUNTED_HEADER_LEN + self.extra.len())?;
        codec::write_length(&mut buf, self.transforms.len())?;
        buf.extend_from_slice(&self.extra);
        for label in &self.transforms {
            codec::write_unicode_string(&mut buf, label)?;
        }
        Ok(buf)
    }

    /// Decodes the definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a length or count is negative, the
    /// extra bytes exceed the cap, the transform list is empty, or the
    /// stream is truncated or has trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let header_len = reader.read_length("data space definition header length")?;
        let extra_len =
            codec::extra_data_len(header_len, COUNTED_HEADER_LEN, "data space definition header")?;
        let count = reader.read_length("data space definition transform count")?;
        let extra = reader.read_bytes(extra_len, "data space definition header")?.to_vec();
        if count == 0 {
            return Err(Error::Corrupted {
                reason: "data space definition has no transforms".to_string(),
            });
        }

        let mut transforms = Vec::new();
        for _ in 0..count {
            transforms.push(reader.read_unicode_string("data space definition transform")?);
        }
        ensure_consumed(&reader, "data space definition")?;
        Ok(Self { transforms, extra })
    }
}

impl TransformDefinitionRecord {
    /// Encodes the definition header followed by the instance data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the extra bytes exceed the cap
    /// or a length does not fit in an `int32`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_extra(&self.extra, "transform definition")?;
        let fixed = COUNTED_HEADER_LEN + codec::unicode_string_size(&self.type_name);
        let mut buf = Vec::new();
        codec::write_length(&mut buf, fixed + self.extra.len())?;
        codec::write_i32(&mut buf, TRANSFORM_CLASS_TYPE);
        codec::write_unicode_string(&mut buf, &self.type_name)?;
        buf.extend_from_slice(&self.extra);
        buf.extend_from_slice(&self.instance_data);
        Ok(buf)
    }

    /// Decodes a definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the header length is negative or
    /// smaller than its fixed fields, the extra bytes exceed the cap, the
    /// class type is not 1, or the stream is truncated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let header_len = reader.read_length("transform header length")?;
        let class_type = reader.read_i32("transform class type")?;
        if class_type != TRANSFORM_CLASS_TYPE {
            return Err(Error::Corrupted {
                reason: format!("unsupported transform class type {class_type}"),
            });
        }
        let type_name = reader.read_unicode_string("transform type name")?;
        let extra_len = codec::extra_data_len(header_len, reader.position(), "transform header")?;
        let extra = reader.read_bytes(extra_len, "transform header")?.to_vec();
        let instance_data = reader.take_rest().to_vec();
        Ok(Self { type_name, extra, instance_data })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_map() -> DataSpaceMapTable {
        DataSpaceMapTable {
            entries: vec![
                (
                    ContainerReference::stream(["Docs"], "Body"),
                    "NoEncryptionNormalCompression".into(),
                ),
                (ContainerReference::stream(Vec::<String>::new(), "Top"), "Custom".into()),
            ],
            extra: Vec::new(),
        }
    }

    #[test]
    fn test_map_preserves_entry_order() {
        let table = sample_map();
        let decoded = DataSpaceMapTable::from_bytes(&table.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_map_header_layout() {
        let bytes = DataSpaceMapTable::default().to_bytes().unwrap();
        assert_eq!(bytes, [8, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_map_extra_bytes_preserved() {
        let table = DataSpaceMapTable { extra: vec![1, 2, 3, 4, 5], ..sample_map() };
        let bytes = table.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &13i32.to_le_bytes());
        assert_eq!(DataSpaceMapTable::from_bytes(&bytes).unwrap().extra, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_map_rejects_negative_count() {
        let mut bytes = sample_map().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(DataSpaceMapTable::from_bytes(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_map_rejects_negative_header_length() {
        let mut bytes = sample_map().to_bytes().unwrap();
        bytes[..4].copy_from_slice(&(-8i32).to_le_bytes());
        assert!(matches!(DataSpaceMapTable::from_bytes(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_map_rejects_oversized_extra() {
        let mut bytes = sample_map().to_bytes().unwrap();
        let oversized = (8 + MAX_EXTRA_DATA_SIZE + 1) as i32;
        bytes[..4].copy_from_slice(&oversized.to_le_bytes());
        assert!(matches!(DataSpaceMapTable::from_bytes(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_map_rejects_entry_length_mismatch() {
        let mut bytes = sample_map().to_bytes().unwrap();
        let entry_len = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        bytes[8..12].copy_from_slice(&(entry_len + 4).to_le_bytes());
        assert!(matches!(DataSpaceMapTable::from_bytes(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_map_rejects_trailing_bytes() {
        let mut bytes = sample_map().to_bytes().unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(DataSpaceMapTable::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_extra() {
        let table = DataSpaceMapTable { extra: vec![0; MAX_EXTRA_DATA_SIZE + 1], ..sample_map() };
        assert!(matches!(table.to_bytes(), Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_definition_layout() {
        let record = DataSpaceDefinitionRecord {
            transforms: vec!["EncryptionTransform".into(), "CompressionTransform".into()],
            extra: Vec::new(),
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[..8], &[8, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(DataSpaceDefinitionRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_definition_rejects_empty_stack() {
        let bytes = DataSpaceDefinitionRecord::default().to_bytes().unwrap();
        assert!(matches!(
            DataSpaceDefinitionRecord::from_bytes(&bytes),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_definition_rejects_oversized_header() {
        let mut bytes = DataSpaceDefinitionRecord {
            transforms: vec!["T".into()],
            extra: Vec::new(),
        }
        .to_bytes()
        .unwrap();
        bytes[..4].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(
            DataSpaceDefinitionRecord::from_bytes(&bytes),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_transform_definition_keeps_instance_data() {
        let record = TransformDefinitionRecord {
            type_name: "{86DE7F2B-DDCE-486d-B016-405BBE82B8BC}".into(),
            extra: vec![0xAA; 4],
            instance_data: vec![1, 2, 3],
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(TransformDefinitionRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_transform_definition_rejects_class_type() {
        let record = TransformDefinitionRecord { type_name: "X".into(), ..Default::default() };
        let mut bytes = record.to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&2i32.to_le_bytes());
        assert!(matches!(
            TransformDefinitionRecord::from_bytes(&bytes),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_transform_definition_rejects_short_header() {
        let record = TransformDefinitionRecord { type_name: "X".into(), ..Default::default() };
        let mut bytes = record.to_bytes().unwrap();
        bytes[..4].copy_from_slice(&4i32.to_le_bytes());
        assert!(matches!(
            TransformDefinitionRecord::from_bytes(&bytes),
            Err(Error::Corrupted { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_definition_keeps_stack_and_extra(
            transforms in dataspace_test_utils::strategies::arb_distinct_labels(),
            extra in dataspace_test_utils::strategies::arb_extra_data(),
        ) {
            let record = DataSpaceDefinitionRecord { transforms, extra };
            let bytes = record.to_bytes().unwrap();
            let loaded = DataSpaceDefinitionRecord::from_bytes(&bytes).unwrap();
            proptest::prop_assert_eq!(loaded, record);
        }

        #[test]
        fn prop_map_reads_back_sorted(
            paths in proptest::collection::vec(
                dataspace_test_utils::strategies::arb_storage_path(),
                1..6,
            ),
        ) {
            let sorted: std::collections::BTreeMap<_, _> = paths
                .into_iter()
                .enumerate()
                .map(|(i, path)| {
                    (ContainerReference::stream(path, format!("s{i}")), format!("space{i}"))
                })
                .collect();
            let table =
                DataSpaceMapTable { entries: sorted.into_iter().collect(), extra: Vec::new() };
            let loaded = DataSpaceMapTable::from_bytes(&table.to_bytes().unwrap()).unwrap();
            proptest::prop_assert!(loaded.entries.windows(2).all(|w| w[0].0 < w[1].0));
            proptest::prop_assert_eq!(loaded, table);
        }
    }
}
