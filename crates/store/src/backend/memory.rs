//! In-memory storage backend.

use std::{collections::BTreeMap, io};

use parking_lot::RwLock;

use super::{ElementEntry, ElementKind, StorageBackend, not_found, read_only};
use crate::names::{NameKey, fold};

/// A node of the in-memory element tree.
#[derive(Debug, Clone)]
pub(crate) enum Element {
    Storage(Directory),
    Stream(Vec<u8>),
}

impl Element {
    fn kind(&self) -> ElementKind {
        match self {
            Element::Storage(_) => ElementKind::Storage,
            Element::Stream(_) => ElementKind::Stream,
        }
    }
}

/// Children of one storage, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub(crate) struct Directory {
    pub(crate) children: BTreeMap<NameKey, Element>,
}

impl Directory {
    fn storage(&self, path: &[String]) -> io::Result<&Directory> {
        let mut dir = self;
        for (depth, name) in path.iter().enumerate() {
            match dir.children.get(fold(name).as_str()) {
                Some(Element::Storage(child)) => dir = child,
                _ => return Err(not_found(&path[..=depth])),
            }
        }
        Ok(dir)
    }

    fn storage_mut(&mut self, path: &[String]) -> io::Result<&mut Directory> {
        let mut dir = self;
        for (depth, name) in path.iter().enumerate() {
            match dir.children.get_mut(fold(name).as_str()) {
                Some(Element::Storage(child)) => dir = child,
                _ => return Err(not_found(&path[..=depth])),
            }
        }
        Ok(dir)
    }

    fn element(&self, path: &[String]) -> io::Result<&Element> {
        let (name, parent) = split_last(path)?;
        self.storage(parent)?.children.get(fold(name).as_str()).ok_or_else(|| not_found(path))
    }

    fn element_mut(&mut self, path: &[String]) -> io::Result<&mut Element> {
        let (name, parent) = split_last(path)?;
        self.storage_mut(parent)?
            .children
            .get_mut(fold(name).as_str())
            .ok_or_else(|| not_found(path))
    }
}

fn split_last(path: &[String]) -> io::Result<(&String, &[String])> {
    path.split_last().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "the root storage is not a child element")
    })
}

/// In-memory storage backend.
///
/// All data is kept in memory and lost when the backend is dropped, which
/// makes it the backend of choice for tests. [`commit`](StorageBackend::commit)
/// is a no-op.
pub struct InMemoryBackend {
    /// Root of the element tree.
    root: RwLock<Directory>,
    /// Whether modifications are accepted.
    writable: bool,
}

impl InMemoryBackend {
    /// Creates an empty, writable backend.
    pub fn new() -> Self {
        Self { root: RwLock::new(Directory::default()), writable: true }
    }

    /// Returns a backend that rejects every modification.
    #[must_use]
    pub fn into_read_only(self) -> Self {
        Self { writable: false, ..self }
    }

    /// Returns an independent deep copy of the current tree.
    pub fn snapshot(&self) -> Self {
        Self { root: RwLock::new(self.root.read().clone()), writable: self.writable }
    }

    pub(crate) fn from_directory(root: Directory, writable: bool) -> Self {
        Self { root: RwLock::new(root), writable }
    }

    pub(crate) fn with_root<R>(&self, f: impl FnOnce(&Directory) -> R) -> R {
        f(&self.root.read())
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.writable { Ok(()) } else { Err(read_only()) }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn open_element(&self, path: &[String], kind: ElementKind) -> io::Result<()> {
        let root = self.root.read();
        if path.is_empty() && kind == ElementKind::Storage {
            return Ok(());
        }
        match root.element(path) {
            Ok(element) if element.kind() == kind => Ok(()),
            Ok(_) => Err(not_found(path)),
            Err(err) => Err(err),
        }
    }

    fn create_element(&self, path: &[String], kind: ElementKind) -> io::Result<()> {
        self.ensure_writable()?;
        let (name, parent) = split_last(path)?;
        let mut root = self.root.write();
        let dir = root.storage_mut(parent)?;
        let key = NameKey::new(name.as_str());
        if dir.children.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("element already exists: {}", super::display_path(path)),
            ));
        }
        let element = match kind {
            ElementKind::Storage => Element::Storage(Directory::default()),
            ElementKind::Stream => Element::Stream(Vec::new()),
        };
        dir.children.insert(key, element);
        Ok(())
    }

    fn destroy_element(&self, path: &[String]) -> io::Result<()> {
        self.ensure_writable()?;
        let (name, parent) = split_last(path)?;
        let mut root = self.root.write();
        root.storage_mut(parent)?
            .children
            .remove(fold(name).as_str())
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn list_elements(&self, path: &[String]) -> io::Result<Vec<ElementEntry>> {
        let root = self.root.read();
        let dir = root.storage(path)?;
        Ok(dir
            .children
            .iter()
            .map(|(name, element)| ElementEntry {
                name: name.as_str().to_string(),
                kind: element.kind(),
            })
            .collect())
    }

    fn read_stream(&self, path: &[String]) -> io::Result<Vec<u8>> {
        match self.root.read().element(path)? {
            Element::Stream(data) => Ok(data.clone()),
            Element::Storage(_) => Err(not_found(path)),
        }
    }

    fn write_stream(&self, path: &[String], data: &[u8]) -> io::Result<()> {
        self.ensure_writable()?;
        match self.root.write().element_mut(path)? {
            Element::Stream(contents) => {
                contents.clear();
                contents.extend_from_slice(data);
                Ok(())
            },
            Element::Storage(_) => Err(not_found(path)),
        }
    }

    fn commit(&self) -> io::Result<()> {
        // No-op for in-memory backend
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn p(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_in_memory_basic() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["Docs"]), ElementKind::Storage).unwrap();
        backend.create_element(&p(&["Docs", "Body"]), ElementKind::Stream).unwrap();
        backend.write_stream(&p(&["Docs", "Body"]), b"hello").unwrap();

        assert_eq!(backend.read_stream(&p(&["docs", "BODY"])).unwrap(), b"hello");
        backend.open_element(&p(&["Docs"]), ElementKind::Storage).unwrap();
        backend.open_element(&[], ElementKind::Storage).unwrap();
    }

    #[test]
    fn test_open_wrong_kind_is_not_found() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["s"]), ElementKind::Stream).unwrap();
        let err = backend.open_element(&p(&["s"]), ElementKind::Storage).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_create_duplicate_case_insensitive() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["Name"]), ElementKind::Stream).unwrap();
        let err = backend.create_element(&p(&["NAME"]), ElementKind::Storage).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_create_requires_parent() {
        let backend = InMemoryBackend::new();
        let err = backend.create_element(&p(&["a", "b"]), ElementKind::Stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_destroy_is_recursive() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["a"]), ElementKind::Storage).unwrap();
        backend.create_element(&p(&["a", "b"]), ElementKind::Storage).unwrap();
        backend.create_element(&p(&["a", "b", "c"]), ElementKind::Stream).unwrap();
        backend.destroy_element(&p(&["a"])).unwrap();
        assert!(backend.list_elements(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_list_preserves_casing_in_order() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["beta"]), ElementKind::Stream).unwrap();
        backend.create_element(&p(&["Alpha"]), ElementKind::Storage).unwrap();
        let entries = backend.list_elements(&[]).unwrap();
        assert_eq!(
            entries,
            vec![
                ElementEntry { name: "Alpha".into(), kind: ElementKind::Storage },
                ElementEntry { name: "beta".into(), kind: ElementKind::Stream },
            ]
        );
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["s"]), ElementKind::Stream).unwrap();
        let backend = backend.into_read_only();
        assert!(!backend.is_writable());
        let err = backend.write_stream(&p(&["s"]), b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = backend.create_element(&p(&["t"]), ElementKind::Stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(backend.read_stream(&p(&["s"])).unwrap(), b"");
    }

    #[test]
    fn test_snapshot_is_independent() {
        let backend = InMemoryBackend::new();
        backend.create_element(&p(&["s"]), ElementKind::Stream).unwrap();
        let copy = backend.snapshot();
        backend.write_stream(&p(&["s"]), b"changed").unwrap();
        assert_eq!(copy.read_stream(&p(&["s"])).unwrap(), b"");
    }
}
