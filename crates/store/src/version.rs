//! Format versioning for persisted features.
//!
//! Every persisted table set carries a [`FormatVersion`] record naming the
//! feature and the writer, reader and updater versions that produced it.
//! Software must check [`FormatVersion::is_readable_by`] before reading and
//! [`FormatVersion::is_updatable_by`] before rewriting.

use std::fmt;

use crate::{
    codec::{self, ByteReader},
    error::{Error, Result},
};

/// An immutable `(major, minor)` version, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionPair {
    major: u16,
    minor: u16,
}

impl VersionPair {
    /// Size of a version pair on disk (two `int16` fields).
    pub const SIZE: usize = 4;

    /// Creates a version pair.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Major component.
    pub const fn major(self) -> u16 {
        self.major
    }

    /// Minor component.
    pub const fn minor(self) -> u16 {
        self.minor
    }

    /// Builds a pair from persisted signed fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if either component is negative.
    pub fn from_persisted(major: i16, minor: i16) -> Result<Self> {
        match (u16::try_from(major), u16::try_from(minor)) {
            (Ok(major), Ok(minor)) => Ok(Self { major, minor }),
            _ => Err(Error::Corrupted {
                reason: format!("negative version component {major}.{minor}"),
            }),
        }
    }

    fn read(reader: &mut ByteReader<'_>, what: &str) -> Result<Self> {
        let major = reader.read_i16(what)?;
        let minor = reader.read_i16(what)?;
        Self::from_persisted(major, minor)
    }

    fn write(self, buf: &mut Vec<u8>) -> Result<()> {
        for component in [self.major, self.minor] {
            let value = i16::try_from(component).map_err(|_| Error::InvalidArgument {
                reason: format!("version component {component} exceeds the int16 range"),
            })?;
            codec::write_i16(buf, value);
        }
        Ok(())
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Versioning record for one persisted feature format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatVersion {
    feature_identifier: String,
    writer_version: VersionPair,
    reader_version: VersionPair,
    updater_version: VersionPair,
}

impl FormatVersion {
    /// Creates a record with distinct writer, reader and updater versions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `feature_identifier` is empty.
    pub fn new(
        feature_identifier: impl Into<String>,
        writer_version: VersionPair,
        reader_version: VersionPair,
        updater_version: VersionPair,
    ) -> Result<Self> {
        let feature_identifier = feature_identifier.into();
        if feature_identifier.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "feature identifier must not be empty".to_string(),
            });
        }
        Ok(Self { feature_identifier, writer_version, reader_version, updater_version })
    }

    /// Creates a record where all three versions are `version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `feature_identifier` is empty.
    pub fn uniform(feature_identifier: impl Into<String>, version: VersionPair) -> Result<Self> {
        Self::new(feature_identifier, version, version, version)
    }

    /// Name of the versioned feature.
    pub fn feature_identifier(&self) -> &str {
        &self.feature_identifier
    }

    /// Version of the software that wrote the data.
    pub fn writer_version(&self) -> VersionPair {
        self.writer_version
    }

    /// Oldest software version able to read the data.
    pub fn reader_version(&self) -> VersionPair {
        self.reader_version
    }

    /// Oldest software version able to rewrite the data.
    pub fn updater_version(&self) -> VersionPair {
        self.updater_version
    }

    /// Whether `version` may read data carrying this record.
    pub fn is_readable_by(&self, version: VersionPair) -> bool {
        self.reader_version <= version
    }

    /// Whether `version` may rewrite data carrying this record.
    pub fn is_updatable_by(&self, version: VersionPair) -> bool {
        self.updater_version <= version
    }

    /// Fails unless [`is_readable_by`](Self::is_readable_by) holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongFormatVersion`] carrying both versions.
    pub fn ensure_readable_by(&self, version: VersionPair) -> Result<()> {
        if self.is_readable_by(version) {
            Ok(())
        } else {
            Err(Error::WrongFormatVersion {
                feature: self.feature_identifier.clone(),
                stored: self.reader_version,
                required: version,
            })
        }
    }

    /// Fails unless [`is_updatable_by`](Self::is_updatable_by) holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongFormatVersion`] carrying both versions.
    pub fn ensure_updatable_by(&self, version: VersionPair) -> Result<()> {
        if self.is_updatable_by(version) {
            Ok(())
        } else {
            Err(Error::WrongFormatVersion {
                feature: self.feature_identifier.clone(),
                stored: self.updater_version,
                required: version,
            })
        }
    }

    /// Whether `other` names the same feature (case-insensitive).
    pub fn same_feature(&self, other: &str) -> bool {
        self.feature_identifier.to_lowercase() == other.to_lowercase()
    }

    /// Serializes the record, returning the number of bytes appended.
    ///
    /// Layout: feature id string, then reader, updater and writer pairs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a component does not fit in `int16`.
    pub fn save(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let start = buf.len();
        codec::write_unicode_string(buf, &self.feature_identifier)?;
        self.reader_version.write(buf)?;
        self.updater_version.write(buf)?;
        self.writer_version.write(buf)?;
        Ok(buf.len() - start)
    }

    /// Serializes the record into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`save`](Self::save).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.save(&mut buf)?;
        Ok(buf)
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        codec::unicode_string_size(&self.feature_identifier) + 3 * VersionPair::SIZE
    }

    /// Reads a record from the reader's current position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the record is truncated, the identifier
    /// is empty, or a version component is negative.
    pub fn load(reader: &mut ByteReader<'_>) -> Result<Self> {
        let feature_identifier = reader.read_unicode_string("format version feature id")?;
        if feature_identifier.is_empty() {
            return Err(Error::Corrupted {
                reason: "format version has an empty feature identifier".to_string(),
            });
        }
        let reader_version = VersionPair::read(reader, "reader version")?;
        let updater_version = VersionPair::read(reader, "updater version")?;
        let writer_version = VersionPair::read(reader, "writer version")?;
        Ok(Self { feature_identifier, writer_version, reader_version, updater_version })
    }

    /// Reads a record from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::load(&mut ByteReader::new(bytes))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use proptest::prelude::*;

    use super::*;

    fn hash_of(pair: VersionPair) -> u64 {
        let mut hasher = DefaultHasher::new();
        pair.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_version_pair_display() {
        assert_eq!(VersionPair::new(1, 0).to_string(), "1.0");
        assert_eq!(VersionPair::new(12, 7).to_string(), "12.7");
    }

    #[test]
    fn test_from_persisted_rejects_negative() {
        assert!(VersionPair::from_persisted(-1, 0).is_err());
        assert!(VersionPair::from_persisted(0, -3).is_err());
        assert_eq!(VersionPair::from_persisted(2, 5).unwrap(), VersionPair::new(2, 5));
    }

    #[test]
    fn test_empty_feature_identifier_rejected() {
        let err = FormatVersion::uniform("", VersionPair::new(1, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_compatibility_checks() {
        let version = FormatVersion::new(
            "Feature",
            VersionPair::new(2, 0),
            VersionPair::new(1, 0),
            VersionPair::new(1, 5),
        )
        .unwrap();

        assert!(version.is_readable_by(VersionPair::new(1, 0)));
        assert!(!version.is_updatable_by(VersionPair::new(1, 0)));
        assert!(version.is_updatable_by(VersionPair::new(1, 5)));

        let err = version.ensure_updatable_by(VersionPair::new(1, 4)).unwrap_err();
        match err {
            Error::WrongFormatVersion { stored, required, .. } => {
                assert_eq!(stored, VersionPair::new(1, 5));
                assert_eq!(required, VersionPair::new(1, 4));
            },
            other => panic!("expected WrongFormatVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_layout_order() {
        let version = FormatVersion::new(
            "AB",
            VersionPair::new(3, 4),
            VersionPair::new(1, 2),
            VersionPair::new(5, 6),
        )
        .unwrap();
        let bytes = version.to_bytes().unwrap();

        // "AB" = 4 byte length + 4 bytes of UTF-16, no padding.
        assert_eq!(bytes.len(), 8 + 12);
        assert_eq!(version.encoded_len(), bytes.len());
        let pairs: Vec<i16> =
            bytes[8..].chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
        // reader, updater, writer
        assert_eq!(pairs, vec![1, 2, 5, 6, 3, 4]);
    }

    #[test]
    fn test_same_feature_is_case_insensitive() {
        let version =
            FormatVersion::uniform("Microsoft.Container.DataSpaces", VersionPair::new(1, 0))
                .unwrap();
        assert!(version.same_feature("microsoft.container.dataspaces"));
        assert!(!version.same_feature("Microsoft.Container.Other"));
    }

    #[test]
    fn test_load_truncated_record() {
        let version = FormatVersion::uniform("Feature", VersionPair::new(1, 0)).unwrap();
        let bytes = version.to_bytes().unwrap();
        let err = FormatVersion::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    fn arb_pair() -> impl Strategy<Value = VersionPair> {
        (0u16..=i16::MAX as u16, 0u16..=i16::MAX as u16).prop_map(|(a, b)| VersionPair::new(a, b))
    }

    proptest! {
        #[test]
        fn prop_from_persisted_rejects_only_negatives(
            (major, minor) in dataspace_test_utils::strategies::arb_version_components(),
        ) {
            let result = VersionPair::from_persisted(major, minor);
            prop_assert_eq!(result.is_ok(), major >= 0 && minor >= 0);
        }

        #[test]
        fn prop_ordering_matches_fields(a in arb_pair(), b in arb_pair()) {
            let expected = (a.major(), a.minor()).cmp(&(b.major(), b.minor()));
            prop_assert_eq!(a.cmp(&b), expected);
            prop_assert_eq!(a == b, expected.is_eq());
            if a == b {
                prop_assert_eq!(hash_of(a), hash_of(b));
            }
        }

        #[test]
        fn prop_format_version_round_trip(
            feature in "[A-Za-z][A-Za-z0-9.]{0,40}",
            writer in arb_pair(),
            reader in arb_pair(),
            updater in arb_pair(),
        ) {
            let version = FormatVersion::new(feature, writer, reader, updater).unwrap();
            let bytes = version.to_bytes().unwrap();
            let loaded = FormatVersion::from_bytes(&bytes).unwrap();
            prop_assert_eq!(loaded, version);
        }
    }
}
