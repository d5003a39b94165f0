//! References to storages and streams inside a container.
//!
//! A [`ContainerReference`] is the key of the data-space map. It names an
//! element by its storage path plus an optional trailing stream name.

use std::fmt;

use crate::{
    codec::{self, ByteReader},
    error::{Error, Result},
    names::NameKey,
};

/// Component type tag for a stream.
const COMPONENT_STREAM: i32 = 0;
/// Component type tag for a storage.
const COMPONENT_STORAGE: i32 = 1;

/// Opaque reference to a storage or stream element.
///
/// Ordered component-wise with case-insensitive names; storages sort
/// before streams that share their path prefix.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerReference {
    storages: Vec<NameKey>,
    stream: Option<NameKey>,
}

impl ContainerReference {
    /// Reference to the root storage.
    pub fn root() -> Self {
        Self { storages: Vec::new(), stream: None }
    }

    /// Reference to a storage at `path`.
    pub fn storage<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { storages: path.into_iter().map(|s| NameKey::new(s)).collect(), stream: None }
    }

    /// Reference to stream `name` inside the storage at `path`.
    pub fn stream<I, S>(path: I, name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            storages: path.into_iter().map(|s| NameKey::new(s)).collect(),
            stream: Some(NameKey::new(name)),
        }
    }

    /// Storage path components.
    pub fn storage_path(&self) -> impl Iterator<Item = &str> {
        self.storages.iter().map(NameKey::as_str)
    }

    /// Stream name, if this references a stream.
    pub fn stream_name(&self) -> Option<&str> {
        self.stream.as_ref().map(NameKey::as_str)
    }

    /// Whether this references a stream.
    pub fn is_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether this element is `storage` itself or lies beneath it.
    pub fn is_within(&self, storage: &ContainerReference) -> bool {
        storage.stream.is_none()
            && self.storages.len() >= storage.storages.len()
            && self.storages.iter().zip(&storage.storages).all(|(a, b)| a == b)
    }

    /// Appends the persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a name is too long to encode.
    pub fn save(&self, buf: &mut Vec<u8>) -> Result<()> {
        let count = self.storages.len() + usize::from(self.stream.is_some());
        codec::write_length(buf, count)?;
        for storage in &self.storages {
            codec::write_i32(buf, COMPONENT_STORAGE);
            codec::write_unicode_string(buf, storage.as_str())?;
        }
        if let Some(stream) = &self.stream {
            codec::write_i32(buf, COMPONENT_STREAM);
            codec::write_unicode_string(buf, stream.as_str())?;
        }
        Ok(())
    }

    /// Reads the persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for unknown component types, a stream
    /// component that is not last, or truncated data.
    pub fn load(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.read_length("reference component count")?;
        let mut storages = Vec::new();
        let mut stream = None;
        for index in 0..count {
            let kind = reader.read_i32("reference component type")?;
            let name = reader.read_unicode_string("reference component name")?;
            match kind {
                COMPONENT_STORAGE if stream.is_none() => storages.push(NameKey::new(name)),
                COMPONENT_STREAM if index + 1 == count => stream = Some(NameKey::new(name)),
                COMPONENT_STREAM => {
                    return Err(Error::Corrupted {
                        reason: format!("stream component {name:?} is not the last component"),
                    });
                },
                other => {
                    return Err(Error::Corrupted {
                        reason: format!("unknown reference component type {other}"),
                    });
                },
            }
        }
        Ok(Self { storages, stream })
    }
}

impl fmt::Display for ContainerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.storages.iter().chain(self.stream.iter()) {
            if !first {
                f.write_str("\\")?;
            }
            first = false;
            f.write_str(name.as_str())?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContainerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerReference({self})")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn round_trip(reference: &ContainerReference) -> ContainerReference {
        let mut buf = Vec::new();
        reference.save(&mut buf).unwrap();
        let mut reader = ByteReader::new(&buf);
        let loaded = ContainerReference::load(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        loaded
    }

    #[test]
    fn test_stream_reference_round_trip() {
        let reference = ContainerReference::stream(["Docs", "Drafts"], "Body");
        let loaded = round_trip(&reference);
        assert_eq!(loaded, reference);
        assert_eq!(loaded.stream_name(), Some("Body"));
        assert_eq!(loaded.storage_path().collect::<Vec<_>>(), vec!["Docs", "Drafts"]);
    }

    #[test]
    fn test_root_reference_round_trip() {
        assert_eq!(round_trip(&ContainerReference::root()), ContainerReference::root());
    }

    #[test]
    fn test_display_uses_backslash() {
        let reference = ContainerReference::stream(["A", "B"], "c");
        assert_eq!(reference.to_string(), "A\\B\\c");
    }

    #[test]
    fn test_case_insensitive_equality() {
        assert_eq!(
            ContainerReference::stream(["Docs"], "Body"),
            ContainerReference::stream(["DOCS"], "body")
        );
    }

    #[test]
    fn test_is_within() {
        let storage = ContainerReference::storage(["Docs"]);
        assert!(ContainerReference::stream(["Docs"], "a").is_within(&storage));
        assert!(ContainerReference::stream(["docs", "Sub"], "a").is_within(&storage));
        assert!(storage.is_within(&storage));
        assert!(!ContainerReference::stream(["Other"], "a").is_within(&storage));
        assert!(!ContainerReference::stream(Vec::<String>::new(), "Docs").is_within(&storage));
        assert!(ContainerReference::stream(["x"], "a").is_within(&ContainerReference::root()));
    }

    #[test]
    fn test_load_rejects_stream_in_middle() {
        let mut buf = Vec::new();
        codec::write_i32(&mut buf, 2);
        codec::write_i32(&mut buf, COMPONENT_STREAM);
        codec::write_unicode_string(&mut buf, "s").unwrap();
        codec::write_i32(&mut buf, COMPONENT_STORAGE);
        codec::write_unicode_string(&mut buf, "t").unwrap();
        let err = ContainerReference::load(&mut ByteReader::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_load_rejects_unknown_component_type() {
        let mut buf = Vec::new();
        codec::write_i32(&mut buf, 1);
        codec::write_i32(&mut buf, 7);
        codec::write_unicode_string(&mut buf, "s").unwrap();
        let err = ContainerReference::load(&mut ByteReader::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let mut refs = vec![
            ContainerReference::stream(["b"], "x"),
            ContainerReference::stream(["a"], "y"),
            ContainerReference::stream(Vec::<String>::new(), "z"),
        ];
        refs.sort();
        assert_eq!(refs[0].to_string(), "z");
        assert_eq!(refs[1].to_string(), "a\\y");
        assert_eq!(refs[2].to_string(), "b\\x");
    }
}
