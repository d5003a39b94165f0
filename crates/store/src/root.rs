//! Container lifecycle.

use std::{path::Path, sync::Arc};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::{
    backend::{FileBackend, InMemoryBackend, StorageBackend},
    config::ContainerConfig,
    dataspace::DataSpaceManager,
    error::{Error, Result},
    namespace::{Namespace, ROOT},
    storage::StorageInfo,
};

/// Mutable state of an open container.
pub(crate) struct ContainerState<B: StorageBackend> {
    pub(crate) namespace: Namespace,
    pub(crate) data_spaces: Option<DataSpaceManager<B>>,
    pub(crate) closed: bool,
}

/// State shared by the root and every handle into the container.
pub(crate) struct Container<B: StorageBackend> {
    pub(crate) backend: Arc<B>,
    state: Mutex<ContainerState<B>>,
}

impl<B: StorageBackend> Container<B> {
    /// Locks the container state, failing once the container is closed.
    pub(crate) fn lock_open(
        &self,
        object: &'static str,
    ) -> Result<MutexGuard<'_, ContainerState<B>>> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::Disposed { object });
        }
        Ok(state)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let mut first_error: Option<Error> = None;

        if let Some(manager) = state.data_spaces.as_mut() {
            if let Err(err) = manager.dispose() {
                first_error.get_or_insert(err);
            }
        }

        for core in state.namespace.open_streams() {
            if let Err(err) = core.lock().flush() {
                tracing::warn!(error = %err, "Failed to flush stream on close");
                first_error.get_or_insert(Error::from(err));
            }
        }

        if self.backend.is_writable() {
            if let Err(err) = self.backend.commit() {
                tracing::warn!(error = %err, "Failed to commit container");
                first_error.get_or_insert(Error::from(err));
            }
        }

        state.namespace.dispose_all();
        state.data_spaces = None;
        tracing::info!(clean = first_error.is_none(), "Closed container");
        first_error.map_or(Ok(()), Err)
    }
}

/// An open compound-file container.
///
/// The root owns the container: closing or dropping it disposes every
/// [`StorageInfo`], [`StreamInfo`](crate::StreamInfo) and
/// [`ContainerStream`](crate::ContainerStream) obtained from it.
///
/// # Example
///
/// ```
/// use std::io::{Read, Seek, SeekFrom, Write};
///
/// use dataspace_store::{CompressionOption, EncryptionOption, StorageRoot};
///
/// let root = StorageRoot::open_in_memory()?;
/// let docs = root.root_storage()?.create_sub_storage("Docs")?;
/// let body = docs.create_stream("Body", CompressionOption::Normal, EncryptionOption::None)?;
///
/// let mut stream = body.open()?;
/// stream.write_all(b"hello")?;
/// stream.seek(SeekFrom::Start(0))?;
/// let mut text = String::new();
/// stream.read_to_string(&mut text)?;
/// assert_eq!(text, "hello");
///
/// root.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct StorageRoot<B: StorageBackend> {
    container: Arc<Container<B>>,
    config: ContainerConfig,
}

impl StorageRoot<FileBackend> {
    /// Opens an existing container file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::AccessDenied`] if the file
    /// cannot be opened, [`Error::Corrupted`] if the image or the
    /// data-space tables are malformed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, ContainerConfig::default())
    }

    /// Opens an existing container file with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open); also [`Error::Config`] for an invalid
    /// configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        Self::from_backend(FileBackend::open(path)?, config)
    }

    /// Opens an existing container file without write access.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_backend(FileBackend::open_read_only(path)?, ContainerConfig::default())
    }

    /// Creates a new container file, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_config(path, ContainerConfig::default())
    }

    /// Creates a new container file with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration, or an error
    /// if the file cannot be written.
    pub fn create_with_config<P: AsRef<Path>>(path: P, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        Self::from_backend(FileBackend::create(path)?, config)
    }
}

impl StorageRoot<InMemoryBackend> {
    /// Creates an empty in-memory container.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(ContainerConfig::default())
    }

    /// Creates an empty in-memory container with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn open_in_memory_with_config(config: ContainerConfig) -> Result<Self> {
        Self::from_backend(InMemoryBackend::new(), config)
    }
}

impl<B: StorageBackend> StorageRoot<B> {
    /// Opens a container on an existing backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration, or any error
    /// raised while loading the data-space tables.
    pub fn from_backend(backend: B, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(backend);
        let data_spaces = if config.enable_data_spaces {
            Some(DataSpaceManager::open(Arc::clone(&backend), config.clone())?)
        } else {
            None
        };
        let state = ContainerState { namespace: Namespace::new(), data_spaces, closed: false };
        tracing::info!(writable = backend.is_writable(), "Opened container");
        Ok(Self { container: Arc::new(Container { backend, state: Mutex::new(state) }), config })
    }

    /// Configuration the container was opened with.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// The storage backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.container.backend
    }

    /// Whether the container has not been closed.
    pub fn is_open(&self) -> bool {
        !self.container.state.lock().closed
    }

    /// Whether the container accepts modifications.
    pub fn is_writable(&self) -> bool {
        self.container.backend.is_writable()
    }

    /// Handle to the root storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn root_storage(&self) -> Result<StorageInfo<B>> {
        self.container.lock_open("container")?;
        Ok(StorageInfo::new(Arc::clone(&self.container), ROOT))
    }

    /// Locks and returns the data-space manager.
    ///
    /// The container stays locked while the guard lives; drop it before
    /// using any other handle of this container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed, or
    /// [`Error::InvalidArgument`] if data spaces are disabled.
    pub fn data_space_manager(&self) -> Result<MappedMutexGuard<'_, DataSpaceManager<B>>> {
        let state = self.container.lock_open("container")?;
        MutexGuard::try_map(state, |state| state.data_spaces.as_mut()).map_err(|_| {
            Error::InvalidArgument {
                reason: "data spaces are disabled for this container".to_string(),
            }
        })
    }

    /// Flushes open streams, saves the data-space tables, commits the
    /// backend and disposes every handle.
    ///
    /// Cleanup always completes; the first failure is returned. Closing an
    /// already closed container does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first flush, save or commit failure.
    pub fn close(&self) -> Result<()> {
        self.container.close()
    }
}

impl<B: StorageBackend> Drop for StorageRoot<B> {
    fn drop(&mut self) {
        if let Err(err) = self.container.close() {
            tracing::warn!(error = %err, "Failed to close container on drop");
        }
    }
}

impl<B: StorageBackend> std::fmt::Debug for StorageRoot<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRoot")
            .field("open", &self.is_open())
            .field("writable", &self.is_writable())
            .field("config", &self.config)
            .finish()
    }
}
