//! Byte streams exposed by the container.
//!
//! Three layers cooperate:
//!
//! - [`ElementStream`] holds the raw bytes of one backend stream and writes
//!   them back on flush.
//! - Transform layers (see [`crate::transform`]) decode the layer beneath
//!   them on open and re-encode on flush.
//! - [`ContainerStream`] is the handle given to callers. Its core is shared
//!   with the container so that closing the container can flush and close
//!   every stream still held by a caller.

use std::{
    collections::BTreeMap,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    backend::{StorageBackend, display_path},
    error::{Error, Result},
};

/// A seekable, resizable byte stream.
pub trait DataStream: Read + Write + Seek + Send {
    /// Truncates or zero-extends the stream to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be resized.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Current length in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn len(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }
}

impl DataStream for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds memory"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Raw bytes of one backend stream.
///
/// The contents are read when the stream is opened and written back to the
/// backend on [`flush`](Write::flush) if anything changed.
pub struct ElementStream<B: StorageBackend> {
    backend: Arc<B>,
    path: Vec<String>,
    buffer: Cursor<Vec<u8>>,
    dirty: bool,
}

impl<B: StorageBackend> ElementStream<B> {
    /// Opens the backend stream at `path`.
    ///
    /// # Errors
    ///
    /// Returns the mapped backend error if the stream cannot be read.
    pub fn open(backend: Arc<B>, path: Vec<String>) -> Result<Self> {
        let data =
            backend.read_stream(&path).map_err(|e| Error::native(display_path(&path), e))?;
        Ok(Self { backend, path, buffer: Cursor::new(data), dirty: false })
    }

    /// Whether there are unflushed modifications.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<B: StorageBackend> Read for ElementStream<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buffer.read(buf)
    }
}

impl<B: StorageBackend> Write for ElementStream<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            self.dirty = true;
        }
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            self.backend.write_stream(&self.path, self.buffer.get_ref())?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl<B: StorageBackend> Seek for ElementStream<B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buffer.seek(pos)
    }
}

impl<B: StorageBackend> DataStream for ElementStream<B> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if len != self.buffer.get_ref().len() as u64 {
            self.dirty = true;
        }
        self.buffer.set_len(len)
    }
}

/// Side-channel values shared by the transforms of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamContext {
    entries: BTreeMap<String, String>,
}

impl StreamContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// Looks up `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// State shared between a [`ContainerStream`] and its container.
pub(crate) struct StreamCore {
    inner: Box<dyn DataStream>,
    context: StreamContext,
    name: String,
    closed: bool,
}

pub(crate) type SharedStream = Arc<Mutex<StreamCore>>;

impl StreamCore {
    pub(crate) fn new(inner: Box<dyn DataStream>, context: StreamContext, name: String) -> Self {
        Self { inner, context, name, closed: false }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed { Err(io::Error::other("stream is closed")) } else { Ok(()) }
    }

    /// Flushes every layer down to the backend. Closed streams are skipped.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.inner.flush()
    }

    /// Marks the stream closed without flushing.
    pub(crate) fn abandon(&mut self) {
        self.closed = true;
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.inner.flush() {
                tracing::warn!(stream = %self.name, error = %err, "Failed to flush stream on drop");
            }
        }
    }
}

/// An open stream of a container element.
///
/// When the element belongs to a data space the bytes seen here are the
/// cleartext produced by its transform stack. Changes reach the container
/// on [`flush`](Write::flush), [`close`](Self::close), when the last handle
/// is dropped, or when the container closes. After the container closes,
/// every operation fails with "stream is closed".
#[derive(Clone)]
pub struct ContainerStream {
    core: SharedStream,
}

impl ContainerStream {
    pub(crate) fn new(core: StreamCore) -> Self {
        Self { core: Arc::new(Mutex::new(core)) }
    }

    pub(crate) fn shared(&self) -> &SharedStream {
        &self.core
    }

    /// Element name the stream was opened for.
    pub fn name(&self) -> String {
        self.core.lock().name.clone()
    }

    /// Side-channel values recorded by the transforms of this stream.
    pub fn context(&self) -> StreamContext {
        self.core.lock().context.clone()
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.lock().closed
    }

    /// Truncates or zero-extends the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed or cannot be resized.
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        let mut core = self.core.lock();
        core.check_open()?;
        core.inner.set_len(len)
    }

    /// Current length of the cleartext.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    pub fn len(&self) -> io::Result<u64> {
        let mut core = self.core.lock();
        core.check_open()?;
        core.inner.len()
    }

    /// Whether the stream is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flushes and closes the stream for every handle sharing it.
    ///
    /// # Errors
    ///
    /// Returns the flush failure; the stream is closed regardless.
    pub fn close(&self) -> io::Result<()> {
        let mut core = self.core.lock();
        let result = core.flush();
        core.closed = true;
        result
    }
}

impl Read for ContainerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut core = self.core.lock();
        core.check_open()?;
        core.inner.read(buf)
    }
}

impl Write for ContainerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut core = self.core.lock();
        core.check_open()?;
        core.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut core = self.core.lock();
        core.check_open()?;
        core.inner.flush()
    }
}

impl Seek for ContainerStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut core = self.core.lock();
        core.check_open()?;
        core.inner.seek(pos)
    }
}

impl DataStream for ContainerStream {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        ContainerStream::set_len(self, len)
    }
}

impl std::fmt::Debug for ContainerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("ContainerStream")
            .field("name", &core.name)
            .field("closed", &core.closed)
            .finish()
    }
}
