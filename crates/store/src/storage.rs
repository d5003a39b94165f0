//! Storage and stream handles.
//!
//! Handles are cheap to clone and refer to nodes of the container's
//! namespace. Each call locks the container; once it closes, or once the
//! element is deleted through any handle, calls fail with
//! [`Error::Disposed`].

use std::{fmt, sync::Arc};

use crate::{
    backend::{self, ElementKind, StorageBackend, display_path},
    dataspace::{COMPRESSED_DATA_SPACE, ENCRYPTED_COMPRESSED_DATA_SPACE, ENCRYPTED_DATA_SPACE},
    error::{Error, Result},
    names::{PACKAGE_STREAM_NAME, names_equal, validate_user_name},
    namespace::{Namespace, NodeId},
    reference::ContainerReference,
    root::{Container, ContainerState},
    stream::{ContainerStream, ElementStream, StreamContext, StreamCore},
    transform::TransformKind,
};

/// Compression applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionOption {
    /// Stored as written.
    #[default]
    NotCompressed,
    /// Compressed with the container's compression level.
    Normal,
}

/// Encryption applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionOption {
    /// Stored in the clear.
    #[default]
    None,
    /// Encrypted under the rights-management content key.
    RightsManagement,
}

/// The standard data space for an option combination, `None` when the
/// stream needs no transforms.
pub fn standard_data_space(
    compression: CompressionOption,
    encryption: EncryptionOption,
) -> Option<&'static str> {
    match (compression, encryption) {
        (CompressionOption::NotCompressed, EncryptionOption::None) => None,
        (CompressionOption::Normal, EncryptionOption::None) => Some(COMPRESSED_DATA_SPACE),
        (CompressionOption::NotCompressed, EncryptionOption::RightsManagement) => {
            Some(ENCRYPTED_DATA_SPACE)
        },
        (CompressionOption::Normal, EncryptionOption::RightsManagement) => {
            Some(ENCRYPTED_COMPRESSED_DATA_SPACE)
        },
    }
}

fn already_exists(namespace: &Namespace, id: NodeId) -> Error {
    let path = namespace.path(id).map(|p| display_path(&p)).unwrap_or_default();
    Error::InvalidArgument { reason: format!("element already exists: {path}") }
}

fn not_found(namespace: &Namespace, id: NodeId) -> Error {
    let path = namespace.path(id).map(|p| display_path(&p)).unwrap_or_default();
    Error::NotFound { path }
}

fn missing_child(namespace: &Namespace, parent: NodeId, name: &str) -> Error {
    let mut path = namespace.path(parent).unwrap_or_default();
    path.push(name.to_string());
    Error::NotFound { path: display_path(&path) }
}

/// A storage (directory) inside a container.
pub struct StorageInfo<B: StorageBackend> {
    container: Arc<Container<B>>,
    node: NodeId,
}

impl<B: StorageBackend> Clone for StorageInfo<B> {
    fn clone(&self) -> Self {
        Self { container: Arc::clone(&self.container), node: self.node }
    }
}

impl<B: StorageBackend> StorageInfo<B> {
    pub(crate) fn new(container: Arc<Container<B>>, node: NodeId) -> Self {
        Self { container, node }
    }

    fn backend(&self) -> &B {
        &self.container.backend
    }

    fn stream_handle(&self, node: NodeId) -> StreamInfo<B> {
        StreamInfo { container: Arc::clone(&self.container), node }
    }

    fn storage_handle(&self, node: NodeId) -> StorageInfo<B> {
        StorageInfo { container: Arc::clone(&self.container), node }
    }

    /// Fails unless this storage exists in the backend.
    fn require_self(&self, state: &mut ContainerState<B>) -> Result<()> {
        if state.namespace.exists(self.node, self.backend())? {
            Ok(())
        } else {
            Err(not_found(&state.namespace, self.node))
        }
    }

    /// Fails before any table is touched if the backend refuses changes.
    fn require_writable(&self, path: &[String]) -> Result<()> {
        if self.backend().is_writable() {
            Ok(())
        } else {
            Err(Error::native(display_path(path), backend::read_only()))
        }
    }

    /// Fails if a storage or stream named `name` already exists here.
    fn require_free(&self, state: &mut ContainerState<B>, name: &str) -> Result<()> {
        for kind in [ElementKind::Storage, ElementKind::Stream] {
            if let Some(id) = state.namespace.find(self.node, name, kind, self.backend())? {
                return Err(already_exists(&state.namespace, id));
            }
        }
        Ok(())
    }

    /// Name of the storage; empty for the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the storage was deleted or the
    /// container closed.
    pub fn name(&self) -> Result<String> {
        self.container.lock_open("storage")?.namespace.name(self.node)
    }

    /// Element names from the root down to this storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the storage was deleted or the
    /// container closed.
    pub fn path(&self) -> Result<Vec<String>> {
        self.container.lock_open("storage")?.namespace.path(self.node)
    }

    /// Reference usable as a data-space map key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the storage was deleted or the
    /// container closed.
    pub fn reference(&self) -> Result<ContainerReference> {
        self.container.lock_open("storage")?.namespace.reference(self.node)
    }

    /// Whether the storage exists in the container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the storage was deleted or the
    /// container closed.
    pub fn exists(&self) -> Result<bool> {
        let mut state = self.container.lock_open("storage")?;
        state.namespace.exists(self.node, self.backend())
    }

    /// Creates stream `name` with the given options.
    ///
    /// Non-default options assign the stream to the matching standard data
    /// space, defining it and its transforms on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::ReservedName`] for reserved names, including
    ///   [`PACKAGE_STREAM_NAME`].
    /// - [`Error::InvalidArgument`] if the name is invalid or taken, or
    ///   options are requested while data spaces are disabled.
    /// - [`Error::NotFound`] if this storage does not exist.
    /// - [`Error::AccessDenied`] or [`Error::ReadOnly`] if the container is
    ///   read-only.
    pub fn create_stream(
        &self,
        name: &str,
        compression: CompressionOption,
        encryption: EncryptionOption,
    ) -> Result<StreamInfo<B>> {
        validate_user_name(name)?;
        if names_equal(name, PACKAGE_STREAM_NAME) {
            return Err(Error::ReservedName { name: name.to_string() });
        }
        let mut guard = self.container.lock_open("storage")?;
        let state = &mut *guard;
        self.require_self(state)?;
        self.require_free(state, name)?;

        let data_space = standard_data_space(compression, encryption);
        if let Some(label) = data_space {
            let manager = state.data_spaces.as_mut().ok_or_else(|| Error::InvalidArgument {
                reason: "compression and encryption need data spaces enabled".to_string(),
            })?;
            manager.ensure_standard_data_space(label)?;
        }

        let id = state.namespace.child(self.node, name, ElementKind::Stream)?;
        state.namespace.set_name(id, name)?;
        let path = state.namespace.path(id)?;
        self.backend()
            .create_element(&path, ElementKind::Stream)
            .map_err(|e| Error::native(display_path(&path), e))?;
        state.namespace.mark_exists(id)?;
        state.namespace.invalidate_snapshots(self.node)?;

        if let (Some(label), Some(manager)) = (data_space, state.data_spaces.as_mut()) {
            let reference = state.namespace.reference(id)?;
            manager.create_data_space_mapping(&reference, label)?;
        }
        tracing::debug!(stream = %display_path(&path), data_space = ?data_space, "Created stream");
        Ok(self.stream_handle(id))
    }

    /// Handle to existing stream `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the stream does not exist,
    /// [`Error::ReservedName`] for reserved names.
    pub fn get_stream_info(&self, name: &str) -> Result<StreamInfo<B>> {
        validate_user_name(name)?;
        let mut state = self.container.lock_open("storage")?;
        match state.namespace.find(self.node, name, ElementKind::Stream, self.backend())? {
            Some(id) => Ok(self.stream_handle(id)),
            None => Err(missing_child(&state.namespace, self.node, name)),
        }
    }

    /// Whether stream `name` exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedName`] for reserved names.
    pub fn stream_exists(&self, name: &str) -> Result<bool> {
        validate_user_name(name)?;
        let mut state = self.container.lock_open("storage")?;
        Ok(state.namespace.find(self.node, name, ElementKind::Stream, self.backend())?.is_some())
    }

    /// Deletes stream `name` and its data-space assignment.
    ///
    /// Open streams of the element are closed without flushing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the stream does not exist,
    /// [`Error::AccessDenied`] if the container is read-only.
    pub fn delete_stream(&self, name: &str) -> Result<()> {
        validate_user_name(name)?;
        let mut guard = self.container.lock_open("storage")?;
        let state = &mut *guard;
        let Some(id) = state.namespace.find(self.node, name, ElementKind::Stream, self.backend())?
        else {
            return Err(missing_child(&state.namespace, self.node, name));
        };
        let path = state.namespace.path(id)?;
        self.require_writable(&path)?;
        let reference = state.namespace.reference(id)?;
        if let Some(manager) = state.data_spaces.as_mut() {
            manager.remove_container_from_data_space_map(&reference)?;
        }
        self.backend().destroy_element(&path).map_err(|e| Error::native(display_path(&path), e))?;
        state.namespace.dispose_subtree(id)?;
        state.namespace.invalidate_snapshots(self.node)?;
        tracing::debug!(stream = %reference, "Deleted stream");
        Ok(())
    }

    /// Creates sub-storage `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is invalid or taken,
    /// [`Error::ReservedName`] for reserved names, [`Error::NotFound`] if
    /// this storage does not exist, [`Error::AccessDenied`] if the container
    /// is read-only.
    pub fn create_sub_storage(&self, name: &str) -> Result<StorageInfo<B>> {
        validate_user_name(name)?;
        let mut guard = self.container.lock_open("storage")?;
        let state = &mut *guard;
        self.require_self(state)?;
        self.require_free(state, name)?;

        let id = state.namespace.child(self.node, name, ElementKind::Storage)?;
        state.namespace.set_name(id, name)?;
        let path = state.namespace.path(id)?;
        self.backend()
            .create_element(&path, ElementKind::Storage)
            .map_err(|e| Error::native(display_path(&path), e))?;
        state.namespace.mark_exists(id)?;
        state.namespace.invalidate_snapshots(self.node)?;
        Ok(self.storage_handle(id))
    }

    /// Handle to existing sub-storage `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the storage does not exist,
    /// [`Error::ReservedName`] for reserved names.
    pub fn get_sub_storage_info(&self, name: &str) -> Result<StorageInfo<B>> {
        validate_user_name(name)?;
        let mut state = self.container.lock_open("storage")?;
        match state.namespace.find(self.node, name, ElementKind::Storage, self.backend())? {
            Some(id) => Ok(self.storage_handle(id)),
            None => Err(missing_child(&state.namespace, self.node, name)),
        }
    }

    /// Whether sub-storage `name` exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedName`] for reserved names.
    pub fn sub_storage_exists(&self, name: &str) -> Result<bool> {
        validate_user_name(name)?;
        let mut state = self.container.lock_open("storage")?;
        Ok(state.namespace.find(self.node, name, ElementKind::Storage, self.backend())?.is_some())
    }

    /// Deletes sub-storage `name`.
    ///
    /// A recursive delete removes everything beneath the storage along with
    /// the data-space assignments of those elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageNotEmpty`] for a non-recursive delete of a
    /// storage with children, [`Error::NotFound`] if it does not exist,
    /// [`Error::AccessDenied`] if the container is read-only.
    pub fn delete_sub_storage(&self, name: &str, recursive: bool) -> Result<()> {
        validate_user_name(name)?;
        let mut guard = self.container.lock_open("storage")?;
        let state = &mut *guard;
        let Some(id) = state.namespace.find(self.node, name, ElementKind::Storage, self.backend())?
        else {
            return Err(missing_child(&state.namespace, self.node, name));
        };
        let path = state.namespace.path(id)?;
        let children =
            self.backend().list_elements(&path).map_err(|e| Error::native(display_path(&path), e))?;
        if !recursive && !children.is_empty() {
            return Err(Error::StorageNotEmpty { name: display_path(&path) });
        }

        self.require_writable(&path)?;
        let reference = state.namespace.reference(id)?;
        if let Some(manager) = state.data_spaces.as_mut() {
            let removed = manager.remove_mappings_within(&reference)?;
            tracing::debug!(storage = %reference, mappings = removed, "Deleting storage");
        }
        self.backend().destroy_element(&path).map_err(|e| Error::native(display_path(&path), e))?;
        state.namespace.dispose_subtree(id)?;
        state.namespace.invalidate_snapshots(self.node)?;
        Ok(())
    }

    /// Streams of this storage at the time of the first call after the last
    /// create or delete here. Reserved names are not listed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if this storage does not exist.
    pub fn get_streams(&self) -> Result<Vec<StreamInfo<B>>> {
        let mut guard = self.container.lock_open("storage")?;
        let state = &mut *guard;
        self.require_self(state)?;
        let ids = state.namespace.snapshot(self.node, ElementKind::Stream, self.backend())?;
        Ok(ids.into_iter().map(|id| self.stream_handle(id)).collect())
    }

    /// Sub-storages of this storage, cached like
    /// [`get_streams`](Self::get_streams).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if this storage does not exist.
    pub fn get_sub_storages(&self) -> Result<Vec<StorageInfo<B>>> {
        let mut guard = self.container.lock_open("storage")?;
        let state = &mut *guard;
        self.require_self(state)?;
        let ids = state.namespace.snapshot(self.node, ElementKind::Storage, self.backend())?;
        Ok(ids.into_iter().map(|id| self.storage_handle(id)).collect())
    }
}

impl<B: StorageBackend> fmt::Debug for StorageInfo<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageInfo").field("node", &self.node).finish()
    }
}

/// A stream inside a container.
pub struct StreamInfo<B: StorageBackend> {
    container: Arc<Container<B>>,
    node: NodeId,
}

impl<B: StorageBackend> Clone for StreamInfo<B> {
    fn clone(&self) -> Self {
        Self { container: Arc::clone(&self.container), node: self.node }
    }
}

impl<B: StorageBackend> StreamInfo<B> {
    /// Name of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was deleted or the
    /// container closed.
    pub fn name(&self) -> Result<String> {
        self.container.lock_open("stream")?.namespace.name(self.node)
    }

    /// Reference usable as a data-space map key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was deleted or the
    /// container closed.
    pub fn reference(&self) -> Result<ContainerReference> {
        self.container.lock_open("stream")?.namespace.reference(self.node)
    }

    /// Whether the stream exists in the container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was deleted or the
    /// container closed.
    pub fn exists(&self) -> Result<bool> {
        let mut state = self.container.lock_open("stream")?;
        state.namespace.exists(self.node, &*self.container.backend)
    }

    /// Opens the stream.
    ///
    /// A stream assigned to a data space is returned decoded through its
    /// transforms; the initialization callback runs for any transform not
    /// yet ready.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the stream does not exist.
    /// - [`Error::TransformNotReady`] if a transform has no key.
    /// - [`Error::Transform`] if the stored bytes cannot be decoded.
    pub fn open(&self) -> Result<ContainerStream> {
        let backend = &self.container.backend;
        let mut guard = self.container.lock_open("stream")?;
        let state = &mut *guard;
        if !state.namespace.exists(self.node, &**backend)? {
            return Err(not_found(&state.namespace, self.node));
        }
        let path = state.namespace.path(self.node)?;
        let reference = state.namespace.reference(self.node)?;
        let raw = ElementStream::open(Arc::clone(backend), path)?;

        let stream = match state.data_spaces.as_mut() {
            Some(manager) if manager.data_space_of(&reference)?.is_some() => {
                manager.create_data_space_stream(&reference, Box::new(raw))?
            },
            _ => ContainerStream::new(StreamCore::new(
                Box::new(raw),
                StreamContext::new(),
                reference.to_string(),
            )),
        };
        state.namespace.track_stream(self.node, stream.shared())?;
        Ok(stream)
    }

    /// Data space the stream is assigned to, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was deleted or the
    /// container closed.
    pub fn data_space_label(&self) -> Result<Option<String>> {
        let state = self.container.lock_open("stream")?;
        let reference = state.namespace.reference(self.node)?;
        match state.data_spaces.as_ref() {
            Some(manager) => manager.data_space_of(&reference),
            None => Ok(None),
        }
    }

    fn transform_kinds(&self) -> Result<Vec<TransformKind>> {
        let state = self.container.lock_open("stream")?;
        let reference = state.namespace.reference(self.node)?;
        let Some(manager) = state.data_spaces.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(label) = manager.data_space_of(&reference)? else {
            return Ok(Vec::new());
        };
        let mut kinds = Vec::new();
        for transform in manager.transform_stack(&label)? {
            kinds.extend(manager.transform_kind(&transform)?);
        }
        Ok(kinds)
    }

    /// Compression derived from the stream's transforms.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was deleted or the
    /// container closed.
    pub fn compression_option(&self) -> Result<CompressionOption> {
        Ok(if self.transform_kinds()?.contains(&TransformKind::Compression) {
            CompressionOption::Normal
        } else {
            CompressionOption::NotCompressed
        })
    }

    /// Encryption derived from the stream's transforms.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] if the stream was deleted or the
    /// container closed.
    pub fn encryption_option(&self) -> Result<EncryptionOption> {
        Ok(if self.transform_kinds()?.contains(&TransformKind::RightsManagementEncryption) {
            EncryptionOption::RightsManagement
        } else {
            EncryptionOption::None
        })
    }
}

impl<B: StorageBackend> fmt::Debug for StreamInfo<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamInfo").field("node", &self.node).finish()
    }
}
