//! Storage backend abstraction for the container.
//!
//! The backend is the structured-storage primitive the data-space layer is
//! built on: a tree of named storages (directories) and streams (byte
//! blobs). Names compare case-insensitively and keep their casing.
//!
//! Backends report failures as [`std::io::Error`] the way a native storage
//! API reports status codes. The namespace layer maps them onto
//! [`Error`](crate::Error): `NotFound` becomes a negative existence result,
//! `PermissionDenied` becomes `AccessDenied`, anything else is carried as a
//! native I/O error.
//!
//! A path is the list of element names from the root storage down to the
//! element; the root storage itself is the empty path.

mod file;
mod memory;

use std::io;

pub use file::{FileBackend, IMAGE_FORMAT_VERSION, IMAGE_HEADER_SIZE, IMAGE_MAGIC, ImageHeader};
pub use memory::InMemoryBackend;

/// The two kinds of element in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Directory-like element holding other elements.
    Storage,
    /// File-like element holding bytes.
    Stream,
}

/// One child returned by [`StorageBackend::list_elements`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementEntry {
    /// Name with its stored casing.
    pub name: String,
    /// Element kind.
    pub kind: ElementKind,
}

/// Structured-storage operations required by the container.
pub trait StorageBackend: Send + Sync + 'static {
    /// Opens the element at `path`, verifying it exists with the given kind.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no element of that kind exists at `path`.
    fn open_element(&self, path: &[String], kind: ElementKind) -> io::Result<()>;

    /// Creates an empty element at `path`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the parent storage is missing, `AlreadyExists`
    /// if the name is taken, `PermissionDenied` if the backend is read-only.
    fn create_element(&self, path: &[String], kind: ElementKind) -> io::Result<()>;

    /// Destroys the element at `path`, including everything beneath it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the element is missing, `PermissionDenied` if
    /// the backend is read-only.
    fn destroy_element(&self, path: &[String]) -> io::Result<()>;

    /// Lists the children of the storage at `path` in name order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no storage at `path`.
    fn list_elements(&self, path: &[String]) -> io::Result<Vec<ElementEntry>>;

    /// Reads the full contents of the stream at `path`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no stream at `path`.
    fn read_stream(&self, path: &[String]) -> io::Result<Vec<u8>>;

    /// Replaces the contents of the stream at `path`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no stream at `path`, `PermissionDenied`
    /// if the backend is read-only.
    fn write_stream(&self, path: &[String], data: &[u8]) -> io::Result<()>;

    /// Makes all changes durable.
    ///
    /// # Errors
    ///
    /// Returns the underlying failure if the changes cannot be persisted.
    fn commit(&self) -> io::Result<()>;

    /// Whether the backend accepts modifications.
    fn is_writable(&self) -> bool;
}

/// Joins a path for diagnostics, e.g. `Docs\Drafts\Body`.
pub fn display_path(path: &[String]) -> String {
    if path.is_empty() { "<root>".to_string() } else { path.join("\\") }
}

pub(crate) fn not_found(path: &[String]) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("element not found: {}", display_path(path)))
}

pub(crate) fn read_only() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "storage is opened read-only")
}
