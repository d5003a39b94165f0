//! Single-file storage backend.
//!
//! The whole element tree is loaded into memory on open and serialized back
//! on [`commit`](StorageBackend::commit). Commit writes a sibling temporary
//! file, syncs it and renames it over the container, so a crash leaves
//! either the previous or the new image on disk.
//!
//! # Image layout
//!
//! ```text
//! ┌──────────────────────── header (32 bytes) ───────────────────────┐
//! │ magic "DSPACE01" │ version u16 │ reserved [6] │ body_len u64 │ xxh3 u64 │
//! └──────────────────────────────────────────────────────────────────┘
//! body := directory
//! directory := child_count u32, child*
//! child := kind u8 (1 = storage, 2 = stream), name_len u16, name (UTF-8),
//!          directory | (data_len u64, data)
//! ```

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};

use super::{
    ElementEntry, ElementKind, StorageBackend,
    memory::{Directory, Element, InMemoryBackend},
};
use crate::{
    error::{Error, Result},
    names::NameKey,
};

/// Magic bytes at the start of every container image.
pub const IMAGE_MAGIC: &[u8; 8] = b"DSPACE01";

/// Current image format version.
pub const IMAGE_FORMAT_VERSION: u16 = 1;

/// Size of the fixed image header.
pub const IMAGE_HEADER_SIZE: usize = 32;

const KIND_STORAGE: u8 = 1;
const KIND_STREAM: u8 = 2;

/// Nesting limit for storages inside an image.
const MAX_DEPTH: usize = 256;

/// Fixed header of a container image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Image format version.
    pub version: u16,
    /// Length of the body in bytes.
    pub body_len: u64,
    /// XXH3-64 checksum of the body.
    pub checksum: u64,
}

impl ImageHeader {
    /// Builds the header describing `body`.
    pub fn for_body(body: &[u8]) -> Self {
        Self {
            version: IMAGE_FORMAT_VERSION,
            body_len: body.len() as u64,
            checksum: xxhash_rust::xxh3::xxh3_64(body),
        }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        buf[0..8].copy_from_slice(IMAGE_MAGIC);
        LittleEndian::write_u16(&mut buf[8..10], self.version);
        // Bytes 10-15 are reserved
        LittleEndian::write_u64(&mut buf[16..24], self.body_len);
        LittleEndian::write_u64(&mut buf[24..32], self.checksum);
        buf
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the buffer is short or the magic is wrong.
    /// Returns `Error::WrongFormatVersion` if the image is from a newer format.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < IMAGE_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "image header too short".to_string() });
        }
        if &buf[0..8] != IMAGE_MAGIC {
            return Err(Error::Corrupted { reason: "invalid image magic".to_string() });
        }
        let version = LittleEndian::read_u16(&buf[8..10]);
        if version > IMAGE_FORMAT_VERSION {
            return Err(Error::WrongFormatVersion {
                feature: "container image".to_string(),
                stored: crate::VersionPair::new(version, 0),
                required: crate::VersionPair::new(IMAGE_FORMAT_VERSION, 0),
            });
        }
        Ok(Self {
            version,
            body_len: LittleEndian::read_u64(&buf[16..24]),
            checksum: LittleEndian::read_u64(&buf[24..32]),
        })
    }
}

/// File-based storage backend.
///
/// Reads and writes are served from the in-memory tree; nothing reaches the
/// file until [`commit`](StorageBackend::commit).
pub struct FileBackend {
    /// Element tree.
    tree: InMemoryBackend,
    /// Location of the container image.
    path: PathBuf,
}

impl FileBackend {
    /// Creates a new, empty container file, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or written.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backend = Self { tree: InMemoryBackend::new(), path };
        backend.commit()?;
        Ok(backend)
    }

    /// Opens an existing container file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Corrupted`] if the image is malformed or fails its checksum.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    /// Opens an existing container file; every modification is refused.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), false)
    }

    /// Location of the container image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let root = decode_image(&image)?;
        Ok(Self {
            tree: InMemoryBackend::from_directory(root, writable),
            path: path.to_path_buf(),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileBackend {
    fn open_element(&self, path: &[String], kind: ElementKind) -> io::Result<()> {
        self.tree.open_element(path, kind)
    }

    fn create_element(&self, path: &[String], kind: ElementKind) -> io::Result<()> {
        self.tree.create_element(path, kind)
    }

    fn destroy_element(&self, path: &[String]) -> io::Result<()> {
        self.tree.destroy_element(path)
    }

    fn list_elements(&self, path: &[String]) -> io::Result<Vec<ElementEntry>> {
        self.tree.list_elements(path)
    }

    fn read_stream(&self, path: &[String]) -> io::Result<Vec<u8>> {
        self.tree.read_stream(path)
    }

    fn write_stream(&self, path: &[String], data: &[u8]) -> io::Result<()> {
        self.tree.write_stream(path, data)
    }

    fn commit(&self) -> io::Result<()> {
        if !self.tree.is_writable() {
            return Err(super::read_only());
        }
        let body = self.tree.with_root(encode_directory).map_err(Error::into_io)?;
        let header = ImageHeader::for_body(&body);

        let temp = self.temp_path();
        {
            let mut file =
                OpenOptions::new().write(true).create(true).truncate(true).open(&temp)?;
            file.write_all(&header.to_bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Persist the rename itself; not supported on every platform.
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.tree.is_writable()
    }
}

fn encode_directory(dir: &Directory) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(dir, &mut buf)?;
    Ok(buf)
}

fn encode_into(dir: &Directory, buf: &mut Vec<u8>) -> Result<()> {
    let mut raw = [0u8; 8];
    let count = u32::try_from(dir.children.len()).map_err(|_| Error::InvalidArgument {
        reason: format!("storage has too many children to encode: {}", dir.children.len()),
    })?;
    LittleEndian::write_u32(&mut raw[..4], count);
    buf.extend_from_slice(&raw[..4]);
    for (name, element) in &dir.children {
        let name_bytes = name.as_str().as_bytes();
        match element {
            Element::Storage(_) => buf.push(KIND_STORAGE),
            Element::Stream(_) => buf.push(KIND_STREAM),
        }
        let name_len = u16::try_from(name_bytes.len()).map_err(|_| Error::InvalidArgument {
            reason: format!("element name of {} bytes is too long to encode", name_bytes.len()),
        })?;
        LittleEndian::write_u16(&mut raw[..2], name_len);
        buf.extend_from_slice(&raw[..2]);
        buf.extend_from_slice(name_bytes);
        match element {
            Element::Storage(child) => encode_into(child, buf)?,
            Element::Stream(data) => {
                LittleEndian::write_u64(&mut raw, data.len() as u64);
                buf.extend_from_slice(&raw);
                buf.extend_from_slice(data);
            },
        }
    }
    Ok(())
}

/// Decodes and verifies a full container image.
pub(crate) fn decode_image(image: &[u8]) -> Result<Directory> {
    let header = ImageHeader::from_bytes(image)?;
    let body = &image[IMAGE_HEADER_SIZE..];
    if header.body_len != body.len() as u64 {
        return Err(Error::Corrupted {
            reason: format!(
                "image body length {} does not match header ({})",
                body.len(),
                header.body_len
            ),
        });
    }
    if xxhash_rust::xxh3::xxh3_64(body) != header.checksum {
        return Err(Error::Corrupted { reason: "image checksum mismatch".to_string() });
    }
    let mut cursor = body;
    let root = decode_directory(&mut cursor, 0)?;
    if !cursor.is_empty() {
        return Err(Error::Corrupted { reason: "trailing bytes after image body".to_string() });
    }
    Ok(root)
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cursor.len() < len {
        return Err(Error::Corrupted { reason: "image body truncated".to_string() });
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn decode_directory(cursor: &mut &[u8], depth: usize) -> Result<Directory> {
    if depth > MAX_DEPTH {
        return Err(Error::Corrupted { reason: "storage nesting too deep".to_string() });
    }
    let count = LittleEndian::read_u32(take(cursor, 4)?);
    let mut children = BTreeMap::new();
    for _ in 0..count {
        let kind = take(cursor, 1)?[0];
        let name_len = LittleEndian::read_u16(take(cursor, 2)?) as usize;
        let name = std::str::from_utf8(take(cursor, name_len)?)
            .map_err(|_| Error::Corrupted { reason: "element name is not UTF-8".to_string() })?;
        let element = match kind {
            KIND_STORAGE => Element::Storage(decode_directory(cursor, depth + 1)?),
            KIND_STREAM => {
                let len = LittleEndian::read_u64(take(cursor, 8)?);
                let len = usize::try_from(len).map_err(|_| Error::Corrupted {
                    reason: format!("stream length {len} does not fit in memory"),
                })?;
                Element::Stream(take(cursor, len)?.to_vec())
            },
            other => {
                return Err(Error::Corrupted { reason: format!("unknown element kind {other}") });
            },
        };
        if children.insert(NameKey::new(name), element).is_some() {
            return Err(Error::Corrupted { reason: format!("duplicate element name {name:?}") });
        }
    }
    Ok(Directory { children })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn p(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_oversized_name_is_not_truncated() {
        let mut root = Directory { children: BTreeMap::new() };
        let name = "n".repeat(usize::from(u16::MAX) + 1);
        root.children.insert(NameKey::new(name), Element::Stream(Vec::new()));
        let err = encode_directory(&root).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let mut root = Directory { children: BTreeMap::new() };
        root.children.insert(NameKey::new("ok"), Element::Stream(vec![1, 2, 3]));
        let body = encode_directory(&root).unwrap();
        let mut cursor = body.as_slice();
        let decoded = decode_directory(&mut cursor, 0).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(decoded.children.len(), 1);
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dsc");

        {
            let backend = FileBackend::create(&path).unwrap();
            backend.create_element(&p(&["Docs"]), ElementKind::Storage).unwrap();
            backend.create_element(&p(&["Docs", "Body"]), ElementKind::Stream).unwrap();
            backend.write_stream(&p(&["Docs", "Body"]), b"persisted").unwrap();
            backend.commit().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_stream(&p(&["Docs", "Body"])).unwrap(), b"persisted");
        assert!(!backend.temp_path().exists());
    }

    #[test]
    fn test_uncommitted_changes_are_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dsc");
        {
            let backend = FileBackend::create(&path).unwrap();
            backend.create_element(&p(&["lost"]), ElementKind::Stream).unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        assert!(backend.list_elements(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_refuses_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dsc");
        FileBackend::create(&path).unwrap();

        let backend = FileBackend::open_read_only(&path).unwrap();
        assert!(!backend.is_writable());
        let err = backend.commit().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dsc");
        {
            let backend = FileBackend::create(&path).unwrap();
            backend.create_element(&p(&["s"]), ElementKind::Stream).unwrap();
            backend.write_stream(&p(&["s"]), b"payload").unwrap();
            backend.commit().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = FileBackend::open(&path).err().unwrap();
        assert!(matches!(err, Error::Corrupted { .. }), "got {err:?}");
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = ImageHeader::for_body(&[0, 0, 0, 0]).to_bytes().to_vec();
        bytes[0] = b'X';
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(decode_image(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut header = ImageHeader::for_body(&[0, 0, 0, 0]);
        header.version = IMAGE_FORMAT_VERSION + 1;
        let err = ImageHeader::from_bytes(&header.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::WrongFormatVersion { .. }));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(KIND_STREAM);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(b's');
        body.extend_from_slice(&100u64.to_le_bytes());
        let mut image = ImageHeader::for_body(&body).to_bytes().to_vec();
        image.extend_from_slice(&body);
        assert!(matches!(decode_image(&image), Err(Error::Corrupted { .. })));
    }
}
