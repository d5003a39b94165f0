//! Data-space manager.
//!
//! A data space is a named, ordered stack of transforms. The manager keeps
//! three tables under the reserved `\x06DataSpaces` storage:
//!
//! - the data-space map, assigning element references to data spaces,
//! - one definition stream per data space listing its transform labels,
//! - one storage per transform holding its class identifier and instance
//!   data.
//!
//! Tables are loaded when the container opens and written back when the
//! manager is disposed, if anything changed and the container is writable.
//!
//! Definitions are append-only: there is no operation to undefine a
//! transform or data space.

mod tables;

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::{Mutex, MutexGuard};
pub use tables::{
    DataSpaceDefinitionRecord, DataSpaceMapTable, TRANSFORM_CLASS_TYPE, TransformDefinitionRecord,
};

use crate::{
    backend::{ElementEntry, ElementKind, StorageBackend, display_path},
    config::ContainerConfig,
    error::{Error, Result},
    names::{NameKey, fold, validate_user_name},
    reference::ContainerReference,
    stream::{ContainerStream, DataStream, StreamContext, StreamCore},
    transform::{
        InitializationHandler, Transform, TransformEnvironment, TransformInitialization,
        TransformKind,
    },
    version::{FormatVersion, VersionPair},
};

/// Storage holding the data-space tables.
pub const DATA_SPACES_STORAGE: &str = "\u{6}DataSpaces";
/// Stream holding the tables' format version.
pub const VERSION_STREAM: &str = "Version";
/// Stream holding the data-space map.
pub const DATA_SPACE_MAP_STREAM: &str = "DataSpaceMap";
/// Storage holding one stream per data-space definition.
pub const DATA_SPACE_INFO_STORAGE: &str = "DataSpaceInfo";
/// Storage holding one storage per transform definition.
pub const TRANSFORM_INFO_STORAGE: &str = "TransformInfo";
/// Stream inside a transform storage holding its definition.
pub const TRANSFORM_PRIMARY_STREAM: &str = "\u{6}Primary";

/// Feature identifier of the data-space tables.
pub const DATA_SPACE_FEATURE: &str = "Microsoft.Container.DataSpaces";
/// Version of the data-space tables written here.
pub const CURRENT_DATA_SPACE_VERSION: VersionPair = VersionPair::new(1, 0);

/// Label of the standard compression transform.
pub const COMPRESSION_TRANSFORM_LABEL: &str = "CompressionTransform";
/// Label of the standard encryption transform.
pub const ENCRYPTION_TRANSFORM_LABEL: &str = "EncryptionTransform";
/// Data space applying compression only.
pub const COMPRESSED_DATA_SPACE: &str = "NoEncryptionNormalCompression";
/// Data space applying encryption, then compression.
pub const ENCRYPTED_COMPRESSED_DATA_SPACE: &str = "RMEncryptionNormalCompression";
/// Data space applying encryption only.
pub const ENCRYPTED_DATA_SPACE: &str = "RMEncryptionNoCompression";

/// Transform stack of a standard data space, or `None` for other labels.
pub fn standard_transform_stack(data_space_label: &str) -> Option<&'static [&'static str]> {
    match data_space_label {
        COMPRESSED_DATA_SPACE => Some(&[COMPRESSION_TRANSFORM_LABEL]),
        ENCRYPTED_COMPRESSED_DATA_SPACE => {
            Some(&[ENCRYPTION_TRANSFORM_LABEL, COMPRESSION_TRANSFORM_LABEL])
        },
        ENCRYPTED_DATA_SPACE => Some(&[ENCRYPTION_TRANSFORM_LABEL]),
        _ => None,
    }
}

fn standard_transform_kind(transform_label: &str) -> Option<TransformKind> {
    match transform_label {
        COMPRESSION_TRANSFORM_LABEL => Some(TransformKind::Compression),
        ENCRYPTION_TRANSFORM_LABEL => Some(TransformKind::RightsManagementEncryption),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct DataSpaceDefinition {
    label: String,
    transforms: Vec<String>,
    extra: Vec<u8>,
}

struct TransformRecord {
    label: String,
    type_name: String,
    kind: Option<TransformKind>,
    extra: Vec<u8>,
    environment: TransformEnvironment,
    instance: Option<Arc<Mutex<Transform>>>,
}

impl TransformRecord {
    /// The shared instance, created on first use.
    fn instantiate(&mut self, config: &ContainerConfig) -> Result<&Arc<Mutex<Transform>>> {
        let instance = match self.instance.take() {
            Some(instance) => instance,
            None => {
                let kind = self.kind.ok_or_else(|| Error::InvalidArgument {
                    reason: format!(
                        "transform {} has unsupported class {}",
                        self.label, self.type_name
                    ),
                })?;
                Arc::new(Mutex::new(Transform::create(kind, self.environment.clone(), config)?))
            },
        };
        Ok(&*self.instance.insert(instance))
    }
}

#[derive(Default)]
struct ManagerState {
    stored_version: Option<FormatVersion>,
    map: BTreeMap<ContainerReference, String>,
    map_extra: Vec<u8>,
    data_spaces: BTreeMap<NameKey, DataSpaceDefinition>,
    transforms: BTreeMap<NameKey, TransformRecord>,
    dirty: bool,
    streams: Vec<Weak<Mutex<StreamCore>>>,
    handler: Option<InitializationHandler>,
}

impl ManagerState {
    fn is_dirty(&self) -> bool {
        self.dirty || self.transforms.values().any(|t| t.environment.is_dirty())
    }

    fn data_space(&self, label: &str) -> Result<&DataSpaceDefinition> {
        self.data_spaces.get(fold(label).as_str()).ok_or_else(|| Error::InvalidArgument {
            reason: format!("data space {label} is not defined"),
        })
    }

    fn transform(&self, label: &str) -> Result<&TransformRecord> {
        self.transforms.get(fold(label).as_str()).ok_or_else(|| Error::InvalidArgument {
            reason: format!("transform {label} is not defined"),
        })
    }

    /// Instantiates the transform if needed, raising the initialization
    /// event while it is not ready.
    fn prepare_transform(
        &mut self,
        transform_label: &str,
        config: &ContainerConfig,
        data_space_label: Option<&str>,
        reference: Option<&ContainerReference>,
    ) -> Result<&Arc<Mutex<Transform>>> {
        let ManagerState { transforms, handler, .. } = self;
        let record =
            transforms.get_mut(fold(transform_label).as_str()).ok_or_else(|| {
                Error::InvalidArgument {
                    reason: format!("transform {transform_label} is not defined"),
                }
            })?;
        let label = record.label.clone();
        let shared = record.instantiate(config)?;
        {
            let mut transform = shared.lock();
            if !transform.is_ready() {
                if let Some(handler) = handler.as_mut() {
                    handler(&mut TransformInitialization {
                        transform_label: &label,
                        data_space_label,
                        reference,
                        transform: &mut *transform,
                    });
                }
            }
        }
        Ok(shared)
    }
}

/// Manages transform and data-space definitions of a container.
///
/// Obtained from [`StorageRoot::data_space_manager`](crate::StorageRoot::data_space_manager).
/// Once the container closes, every operation fails with
/// [`Error::Disposed`].
pub struct DataSpaceManager<B: StorageBackend> {
    backend: Arc<B>,
    config: ContainerConfig,
    state: Option<ManagerState>,
}

impl<B: StorageBackend> DataSpaceManager<B> {
    /// Loads the data-space tables from `backend`.
    pub(crate) fn open(backend: Arc<B>, config: ContainerConfig) -> Result<Self> {
        let state = load_state(&*backend)?;
        tracing::debug!(
            data_spaces = state.data_spaces.len(),
            transforms = state.transforms.len(),
            mappings = state.map.len(),
            "Loaded data space tables"
        );
        Ok(Self { backend, config, state: Some(state) })
    }

    fn state(&self) -> Result<&ManagerState> {
        self.state.as_ref().ok_or(Error::Disposed { object: "data space manager" })
    }

    fn state_mut(&mut self) -> Result<&mut ManagerState> {
        self.state.as_mut().ok_or(Error::Disposed { object: "data space manager" })
    }

    fn writable_state(&mut self) -> Result<&mut ManagerState> {
        if !self.backend.is_writable() {
            self.state()?;
            return Err(Error::ReadOnly);
        }
        self.state_mut()
    }

    /// Whether the manager has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.state.is_none()
    }

    /// Whether there are changes not yet written to the container.
    pub fn is_dirty(&self) -> bool {
        self.state.as_ref().is_some_and(ManagerState::is_dirty)
    }

    /// Whether a transform with `label` is defined (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn transform_label_is_defined(&self, label: &str) -> Result<bool> {
        Ok(self.state()?.transforms.contains_key(fold(label).as_str()))
    }

    /// Whether a data space with `label` is defined (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn data_space_is_defined(&self, label: &str) -> Result<bool> {
        Ok(self.state()?.data_spaces.contains_key(fold(label).as_str()))
    }

    /// Defines a transform of class `class_identifier`.
    ///
    /// Without a label, a unique one is generated. Returns the label.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the class is not supported or the
    ///   label is not a valid element name.
    /// - [`Error::ReservedName`] if the label is reserved.
    /// - [`Error::LabelInUse`] if a transform already has the label.
    /// - [`Error::ReadOnly`] if the container is read-only.
    pub fn define_transform(
        &mut self,
        class_identifier: &str,
        label: Option<&str>,
    ) -> Result<String> {
        let config = self.config.clone();
        let state = self.writable_state()?;
        let kind = TransformKind::from_class_identifier(class_identifier).ok_or_else(|| {
            Error::InvalidArgument {
                reason: format!("unsupported transform class {class_identifier}"),
            }
        })?;
        let label = match label {
            Some(label) => {
                validate_user_name(label)?;
                if state.transforms.contains_key(fold(label).as_str()) {
                    return Err(Error::LabelInUse { label: label.to_string() });
                }
                label.to_string()
            },
            None => generate_label(|l| state.transforms.contains_key(fold(l).as_str())),
        };

        state.transforms.insert(
            NameKey::new(label.as_str()),
            TransformRecord {
                label: label.clone(),
                type_name: kind.class_identifier().to_string(),
                kind: Some(kind),
                extra: Vec::new(),
                environment: TransformEnvironment::new(label.as_str()),
                instance: None,
            },
        );
        let prepared = state.prepare_transform(&label, &config, None, None).map(|_| ());
        if let Err(err) = prepared {
            state.transforms.remove(fold(&label).as_str());
            return Err(err);
        }
        state.dirty = true;
        tracing::debug!(label = %label, class = class_identifier, "Defined transform");
        Ok(label)
    }

    /// Defines a data space stacking `transforms`, index 0 closest to the
    /// stored bytes.
    ///
    /// Without a label, a unique one is generated. Returns the label.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `transforms` is empty, names an
    ///   undefined transform, or the label is not a valid element name.
    /// - [`Error::ReservedName`] if the label is reserved.
    /// - [`Error::LabelInUse`] if a data space already has the label.
    /// - [`Error::ReadOnly`] if the container is read-only.
    pub fn define_data_space<S: AsRef<str>>(
        &mut self,
        transforms: &[S],
        label: Option<&str>,
    ) -> Result<String> {
        let state = self.writable_state()?;
        if transforms.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "a data space needs at least one transform".to_string(),
            });
        }
        let stack = transforms
            .iter()
            .map(|t| state.transform(t.as_ref()).map(|record| record.label.clone()))
            .collect::<Result<Vec<_>>>()?;
        let label = match label {
            Some(label) => {
                validate_user_name(label)?;
                if state.data_spaces.contains_key(fold(label).as_str()) {
                    return Err(Error::LabelInUse { label: label.to_string() });
                }
                label.to_string()
            },
            None => generate_label(|l| state.data_spaces.contains_key(fold(l).as_str())),
        };

        tracing::debug!(label = %label, transforms = ?stack, "Defined data space");
        state.data_spaces.insert(
            NameKey::new(label.as_str()),
            DataSpaceDefinition { label: label.clone(), transforms: stack, extra: Vec::new() },
        );
        state.dirty = true;
        Ok(label)
    }

    /// Assigns the element at `reference` to a data space, replacing any
    /// previous assignment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the data space is not defined,
    /// [`Error::ReadOnly`] if the container is read-only.
    pub fn create_data_space_mapping(
        &mut self,
        reference: &ContainerReference,
        data_space_label: &str,
    ) -> Result<()> {
        let state = self.writable_state()?;
        let label = state.data_space(data_space_label)?.label.clone();
        state.map.insert(reference.clone(), label);
        state.dirty = true;
        Ok(())
    }

    /// Removes the mapping for `reference`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn remove_container_from_data_space_map(
        &mut self,
        reference: &ContainerReference,
    ) -> Result<bool> {
        let state = self.state_mut()?;
        let removed = state.map.remove(reference).is_some();
        state.dirty |= removed;
        Ok(removed)
    }

    /// Removes every mapping for elements at or beneath `storage`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn remove_mappings_within(&mut self, storage: &ContainerReference) -> Result<usize> {
        let state = self.state_mut()?;
        let before = state.map.len();
        state.map.retain(|reference, _| !reference.is_within(storage));
        let removed = before - state.map.len();
        state.dirty |= removed > 0;
        Ok(removed)
    }

    /// Data space assigned to `reference`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn data_space_of(&self, reference: &ContainerReference) -> Result<Option<String>> {
        Ok(self.state()?.map.get(reference).cloned())
    }

    /// Transform labels of a data space, index 0 closest to the stored bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the data space is not defined.
    pub fn transform_stack(&self, data_space_label: &str) -> Result<Vec<String>> {
        Ok(self.state()?.data_space(data_space_label)?.transforms.clone())
    }

    /// Class identifier of a transform as stored in its definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the transform is not defined.
    pub fn transform_class(&self, transform_label: &str) -> Result<String> {
        Ok(self.state()?.transform(transform_label)?.type_name.clone())
    }

    /// Kind of a transform, `None` if its class is not supported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the transform is not defined.
    pub fn transform_kind(&self, transform_label: &str) -> Result<Option<TransformKind>> {
        Ok(self.state()?.transform(transform_label)?.kind)
    }

    /// Labels of all defined data spaces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn data_space_labels(&self) -> Result<Vec<String>> {
        Ok(self.state()?.data_spaces.values().map(|d| d.label.clone()).collect())
    }

    /// Labels of all defined transforms.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn transform_labels(&self) -> Result<Vec<String>> {
        Ok(self.state()?.transforms.values().map(|t| t.label.clone()).collect())
    }

    /// All mappings, ordered by reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn mappings(&self) -> Result<Vec<(ContainerReference, String)>> {
        Ok(self.state()?.map.iter().map(|(r, label)| (r.clone(), label.clone())).collect())
    }

    /// Registers the callback raised when a transform is instantiated or
    /// found not ready, replacing any previous one.
    ///
    /// The callback runs while the container is locked and must not call
    /// back into it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn set_initialization_handler<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(&mut TransformInitialization<'_>) + Send + 'static,
    {
        self.state_mut()?.handler = Some(Box::new(handler));
        Ok(())
    }

    /// Removes the initialization callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after the container closed.
    pub fn clear_initialization_handler(&mut self) -> Result<()> {
        self.state_mut()?.handler = None;
        Ok(())
    }

    /// The instantiated transform with `label`.
    ///
    /// Open streams of its data spaces share this instance; do not hold the
    /// guard while using them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the transform is not defined or
    /// its class is not supported.
    pub fn transform_mut(&mut self, label: &str) -> Result<MutexGuard<'_, Transform>> {
        let config = self.config.clone();
        Ok(self.state_mut()?.prepare_transform(label, &config, None, None)?.lock())
    }

    /// Wraps the raw stream of the element at `reference` in the transforms
    /// of its data space.
    ///
    /// The returned stream is tracked and flushed when the manager is
    /// disposed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `reference` is not mapped.
    /// - [`Error::TransformNotReady`] if a transform stays not ready after
    ///   the initialization callback.
    /// - [`Error::Transform`] if the stored bytes cannot be decoded.
    pub fn create_data_space_stream(
        &mut self,
        reference: &ContainerReference,
        raw: Box<dyn DataStream>,
    ) -> Result<ContainerStream> {
        let config = self.config.clone();
        let state = self.state_mut()?;
        let data_space_label =
            state.map.get(reference).cloned().ok_or_else(|| Error::InvalidArgument {
                reason: format!("{reference} is not assigned to a data space"),
            })?;
        let stack = state
            .data_spaces
            .get(fold(&data_space_label).as_str())
            .ok_or_else(|| Error::Corrupted {
                reason: format!("{reference} maps to undefined data space {data_space_label}"),
            })?
            .transforms
            .clone();

        let mut context = StreamContext::new();
        let mut stream = raw;
        for transform_label in &stack {
            let shared = state.prepare_transform(
                transform_label,
                &config,
                Some(&data_space_label),
                Some(reference),
            )?;
            if !shared.lock().is_ready() {
                return Err(Error::TransformNotReady { label: transform_label.clone() });
            }
            stream = Transform::transformed_stream(shared, stream, &mut context)?;
        }

        let stream =
            ContainerStream::new(StreamCore::new(stream, context, reference.to_string()));
        state.streams.retain(|weak| weak.strong_count() > 0);
        state.streams.push(Arc::downgrade(stream.shared()));
        Ok(stream)
    }

    /// Defines a standard data space and its transforms if missing.
    pub(crate) fn ensure_standard_data_space(&mut self, data_space_label: &str) -> Result<()> {
        let stack = standard_transform_stack(data_space_label).ok_or_else(|| {
            Error::InvalidArgument {
                reason: format!("{data_space_label} is not a standard data space"),
            }
        })?;
        for transform_label in stack {
            let Some(kind) = standard_transform_kind(transform_label) else { continue };
            if !self.transform_label_is_defined(transform_label)? {
                self.define_transform(kind.class_identifier(), Some(transform_label))?;
            } else if self.transform_kind(transform_label)? != Some(kind) {
                return Err(Error::InvalidArgument {
                    reason: format!("transform {transform_label} has an unexpected class"),
                });
            }
        }
        if !self.data_space_is_defined(data_space_label)? {
            self.define_data_space(stack, Some(data_space_label))?;
        } else {
            let existing = self.transform_stack(data_space_label)?;
            let matches = existing.len() == stack.len()
                && existing.iter().zip(stack.iter()).all(|(a, b)| fold(a) == fold(b));
            if !matches {
                return Err(Error::InvalidArgument {
                    reason: format!("data space {data_space_label} has an unexpected stack"),
                });
            }
        }
        Ok(())
    }

    /// Flushes tracked streams, disposes transforms and writes the tables.
    ///
    /// Later calls do nothing. The manager is disposed even on failure; the
    /// first error is returned.
    pub(crate) fn dispose(&mut self) -> Result<()> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };
        let mut first_error: Option<Error> = None;

        for weak in state.streams.drain(..) {
            if let Some(core) = weak.upgrade() {
                if let Err(err) = core.lock().flush() {
                    tracing::warn!(error = %err, "Failed to flush transformed stream");
                    first_error.get_or_insert(Error::from(err));
                }
            }
        }

        for record in state.transforms.values_mut() {
            if let Some(transform) = record.instance.as_ref() {
                transform.lock().dispose();
            }
        }

        if self.backend.is_writable() && state.is_dirty() {
            match save_state(&*self.backend, &state) {
                Ok(()) => tracing::info!(mappings = state.map.len(), "Saved data space tables"),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to save data space tables");
                    first_error.get_or_insert(err);
                },
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl<B: StorageBackend> std::fmt::Debug for DataSpaceManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("DataSpaceManager");
        match &self.state {
            Some(state) => debug
                .field("data_spaces", &state.data_spaces.len())
                .field("transforms", &state.transforms.len())
                .field("mappings", &state.map.len())
                .field("dirty", &state.is_dirty()),
            None => debug.field("disposed", &true),
        };
        debug.finish()
    }
}

/// Generates a label from the clock, bumping it until unused.
fn generate_label(taken: impl Fn(&str) -> bool) -> String {
    let mut ticks = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
    loop {
        let label = ticks.to_string();
        if !taken(&label) {
            return label;
        }
        ticks += 1;
    }
}

fn child(path: &[String], name: &str) -> Vec<String> {
    let mut path = path.to_vec();
    path.push(name.to_string());
    path
}

fn element_exists<B: StorageBackend>(
    backend: &B,
    path: &[String],
    kind: ElementKind,
) -> Result<bool> {
    match backend.open_element(path, kind) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::native(display_path(path), err)),
    }
}

fn read_optional<B: StorageBackend>(backend: &B, path: &[String]) -> Result<Option<Vec<u8>>> {
    if !element_exists(backend, path, ElementKind::Stream)? {
        return Ok(None);
    }
    backend.read_stream(path).map(Some).map_err(|e| Error::native(display_path(path), e))
}

fn list<B: StorageBackend>(backend: &B, path: &[String]) -> Result<Vec<ElementEntry>> {
    backend.list_elements(path).map_err(|e| Error::native(display_path(path), e))
}

fn load_state<B: StorageBackend>(backend: &B) -> Result<ManagerState> {
    let mut state = ManagerState::default();
    let root = vec![DATA_SPACES_STORAGE.to_string()];
    if !element_exists(backend, &root, ElementKind::Storage)? {
        return Ok(state);
    }

    let version_bytes = read_optional(backend, &child(&root, VERSION_STREAM))?.ok_or_else(|| {
        Error::Corrupted { reason: "data space storage has no version stream".to_string() }
    })?;
    let version = FormatVersion::from_bytes(&version_bytes)?;
    if !version.same_feature(DATA_SPACE_FEATURE) {
        return Err(Error::Corrupted {
            reason: format!("unexpected data space feature {}", version.feature_identifier()),
        });
    }
    version.ensure_readable_by(CURRENT_DATA_SPACE_VERSION)?;
    state.stored_version = Some(version);

    if let Some(bytes) = read_optional(backend, &child(&root, DATA_SPACE_MAP_STREAM))? {
        let table = DataSpaceMapTable::from_bytes(&bytes)?;
        for (reference, label) in table.entries {
            if state.map.contains_key(&reference) {
                return Err(Error::Corrupted {
                    reason: format!("{reference} is mapped more than once"),
                });
            }
            state.map.insert(reference, label);
        }
        state.map_extra = table.extra;
    }

    let info = child(&root, DATA_SPACE_INFO_STORAGE);
    if element_exists(backend, &info, ElementKind::Storage)? {
        for entry in list(backend, &info)? {
            if entry.kind != ElementKind::Stream {
                continue;
            }
            let path = child(&info, &entry.name);
            let bytes =
                backend.read_stream(&path).map_err(|e| Error::native(display_path(&path), e))?;
            let record = DataSpaceDefinitionRecord::from_bytes(&bytes)?;
            state.data_spaces.insert(
                NameKey::new(entry.name.as_str()),
                DataSpaceDefinition {
                    label: entry.name,
                    transforms: record.transforms,
                    extra: record.extra,
                },
            );
        }
    }

    let transform_info = child(&root, TRANSFORM_INFO_STORAGE);
    if element_exists(backend, &transform_info, ElementKind::Storage)? {
        for entry in list(backend, &transform_info)? {
            if entry.kind != ElementKind::Storage {
                continue;
            }
            let path = child(&transform_info, &entry.name);
            let record = load_transform(backend, &path, &entry.name)?;
            state.transforms.insert(NameKey::new(entry.name.as_str()), record);
        }
    }

    for definition in state.data_spaces.values() {
        for transform in &definition.transforms {
            if !state.transforms.contains_key(fold(transform).as_str()) {
                return Err(Error::Corrupted {
                    reason: format!(
                        "data space {} uses undefined transform {transform}",
                        definition.label
                    ),
                });
            }
        }
    }
    for (reference, label) in &state.map {
        if !state.data_spaces.contains_key(fold(label).as_str()) {
            return Err(Error::Corrupted {
                reason: format!("{reference} maps to undefined data space {label}"),
            });
        }
    }
    Ok(state)
}

fn load_transform<B: StorageBackend>(
    backend: &B,
    path: &[String],
    label: &str,
) -> Result<TransformRecord> {
    let mut primary = None;
    let mut streams = BTreeMap::new();
    for entry in list(backend, path)? {
        if entry.kind != ElementKind::Stream {
            continue;
        }
        let stream_path = child(path, &entry.name);
        let bytes = backend
            .read_stream(&stream_path)
            .map_err(|e| Error::native(display_path(&stream_path), e))?;
        if fold(&entry.name) == fold(TRANSFORM_PRIMARY_STREAM) {
            primary = Some(bytes);
        } else {
            streams.insert(NameKey::new(entry.name), bytes);
        }
    }
    let primary = primary.ok_or_else(|| Error::Corrupted {
        reason: format!("transform {label} has no primary stream"),
    })?;
    let record = TransformDefinitionRecord::from_bytes(&primary)?;
    let kind = TransformKind::from_class_identifier(&record.type_name);
    if kind.is_none() {
        tracing::warn!(label, class = %record.type_name, "Transform class is not supported");
    }
    Ok(TransformRecord {
        label: label.to_string(),
        kind,
        type_name: record.type_name,
        extra: record.extra,
        environment: TransformEnvironment::loaded(label, record.instance_data, streams),
        instance: None,
    })
}

fn ensure_element<B: StorageBackend>(
    backend: &B,
    path: &[String],
    kind: ElementKind,
) -> Result<()> {
    if !element_exists(backend, path, kind)? {
        backend.create_element(path, kind).map_err(|e| Error::native(display_path(path), e))?;
    }
    Ok(())
}

fn write_stream<B: StorageBackend>(backend: &B, path: &[String], bytes: &[u8]) -> Result<()> {
    ensure_element(backend, path, ElementKind::Stream)?;
    backend.write_stream(path, bytes).map_err(|e| Error::native(display_path(path), e))
}

fn save_state<B: StorageBackend>(backend: &B, state: &ManagerState) -> Result<()> {
    if let Some(version) = &state.stored_version {
        version.ensure_updatable_by(CURRENT_DATA_SPACE_VERSION)?;
    }
    let root = vec![DATA_SPACES_STORAGE.to_string()];
    ensure_element(backend, &root, ElementKind::Storage)?;

    let version = FormatVersion::uniform(DATA_SPACE_FEATURE, CURRENT_DATA_SPACE_VERSION)?;
    write_stream(backend, &child(&root, VERSION_STREAM), &version.to_bytes()?)?;

    let map = DataSpaceMapTable {
        entries: state.map.iter().map(|(r, label)| (r.clone(), label.clone())).collect(),
        extra: state.map_extra.clone(),
    };
    write_stream(backend, &child(&root, DATA_SPACE_MAP_STREAM), &map.to_bytes()?)?;

    let info = child(&root, DATA_SPACE_INFO_STORAGE);
    ensure_element(backend, &info, ElementKind::Storage)?;
    for definition in state.data_spaces.values() {
        let record = DataSpaceDefinitionRecord {
            transforms: definition.transforms.clone(),
            extra: definition.extra.clone(),
        };
        write_stream(backend, &child(&info, &definition.label), &record.to_bytes()?)?;
    }

    let transform_info = child(&root, TRANSFORM_INFO_STORAGE);
    ensure_element(backend, &transform_info, ElementKind::Storage)?;
    for transform in state.transforms.values() {
        let path = child(&transform_info, &transform.label);
        ensure_element(backend, &path, ElementKind::Storage)?;

        let (instance_data, streams) = transform.environment.persisted();
        let record = TransformDefinitionRecord {
            type_name: transform.type_name.clone(),
            extra: transform.extra.clone(),
            instance_data,
        };
        write_stream(backend, &child(&path, TRANSFORM_PRIMARY_STREAM), &record.to_bytes()?)?;

        for entry in list(backend, &path)? {
            let keep = fold(&entry.name) == fold(TRANSFORM_PRIMARY_STREAM)
                || streams.iter().any(|(name, _)| fold(name) == fold(&entry.name));
            if entry.kind == ElementKind::Stream && !keep {
                let stale = child(&path, &entry.name);
                backend
                    .destroy_element(&stale)
                    .map_err(|e| Error::native(display_path(&stale), e))?;
            }
        }
        for (name, bytes) in &streams {
            write_stream(backend, &child(&path, name), bytes)?;
        }
        transform.environment.mark_clean();
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        backend::InMemoryBackend,
        transform::{COMPRESSION_TRANSFORM_CLASS, CONTENT_KEY_SIZE, RM_ENCRYPTION_TRANSFORM_CLASS},
    };

    fn manager() -> DataSpaceManager<InMemoryBackend> {
        DataSpaceManager::open(Arc::new(InMemoryBackend::new()), ContainerConfig::default())
            .unwrap()
    }

    #[test]
    fn test_label_in_use_is_case_insensitive() {
        let mut manager = manager();
        manager.define_transform(COMPRESSION_TRANSFORM_CLASS, Some("Zip")).unwrap();
        let err = manager.define_transform(COMPRESSION_TRANSFORM_CLASS, Some("zip")).unwrap_err();
        assert!(matches!(err, Error::LabelInUse { .. }));
        assert!(manager.transform_label_is_defined("ZIP").unwrap());
    }

    #[test]
    fn test_generated_labels_are_unique() {
        let mut manager = manager();
        let a = manager.define_transform(COMPRESSION_TRANSFORM_CLASS, None).unwrap();
        let b = manager.define_transform(COMPRESSION_TRANSFORM_CLASS, None).unwrap();
        assert_ne!(a, b);
        let space = manager.define_data_space(&[a.as_str()], None).unwrap();
        assert!(manager.data_space_is_defined(&space).unwrap());
    }

    #[test]
    fn test_define_data_space_validation() {
        let mut manager = manager();
        let err = manager.define_data_space::<&str>(&[], Some("Empty")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        let err = manager.define_data_space(&["Missing"], Some("Space")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        manager.define_transform(COMPRESSION_TRANSFORM_CLASS, Some("Zip")).unwrap();
        let err = manager.define_data_space(&["Zip"], Some("\u{6}Hidden")).unwrap_err();
        assert!(matches!(err, Error::ReservedName { .. }));
    }

    #[test]
    fn test_unsupported_class_rejected() {
        let mut manager = manager();
        let err = manager.define_transform("{00000000-0000-0000-0000-000000000000}", None);
        assert!(matches!(err, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_mapping_requires_defined_data_space() {
        let mut manager = manager();
        let reference = ContainerReference::stream(["Docs"], "Body");
        let err = manager.create_data_space_mapping(&reference, "Nope").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_mappings_sorted_by_reference() {
        let mut manager = manager();
        manager.ensure_standard_data_space(COMPRESSED_DATA_SPACE).unwrap();
        manager.ensure_standard_data_space(ENCRYPTED_DATA_SPACE).unwrap();
        let a = ContainerReference::stream(Vec::<String>::new(), "a");
        let b = ContainerReference::stream(Vec::<String>::new(), "B");
        manager.create_data_space_mapping(&b, COMPRESSED_DATA_SPACE).unwrap();
        manager.create_data_space_mapping(&a, COMPRESSED_DATA_SPACE).unwrap();
        manager.create_data_space_mapping(&b, ENCRYPTED_DATA_SPACE).unwrap();
        let mappings = manager.mappings().unwrap();
        assert_eq!(
            mappings,
            vec![
                (a, COMPRESSED_DATA_SPACE.to_string()),
                (b, ENCRYPTED_DATA_SPACE.to_string()),
            ]
        );
    }

    #[test]
    fn test_failed_definition_leaves_no_record() {
        let mut manager = manager();
        manager.config.compression_level = 0;
        let err = manager.define_transform(COMPRESSION_TRANSFORM_CLASS, Some("Zip")).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(!manager.transform_label_is_defined("Zip").unwrap());
        assert!(!manager.is_dirty());
    }

    #[test]
    fn test_remove_mappings_within_storage() {
        let mut manager = manager();
        manager.ensure_standard_data_space(COMPRESSED_DATA_SPACE).unwrap();
        for reference in [
            ContainerReference::stream(["Docs"], "a"),
            ContainerReference::stream(["Docs", "Sub"], "b"),
            ContainerReference::stream(["Other"], "c"),
        ] {
            manager.create_data_space_mapping(&reference, COMPRESSED_DATA_SPACE).unwrap();
        }
        let removed = manager.remove_mappings_within(&ContainerReference::storage(["docs"]));
        assert_eq!(removed.unwrap(), 2);
        assert_eq!(manager.mappings().unwrap().len(), 1);
    }

    #[test]
    fn test_standard_stack_order() {
        let mut manager = manager();
        manager.ensure_standard_data_space(ENCRYPTED_COMPRESSED_DATA_SPACE).unwrap();
        assert_eq!(
            manager.transform_stack(ENCRYPTED_COMPRESSED_DATA_SPACE).unwrap(),
            vec![ENCRYPTION_TRANSFORM_LABEL.to_string(), COMPRESSION_TRANSFORM_LABEL.to_string()]
        );
        assert_eq!(
            manager.transform_class(ENCRYPTION_TRANSFORM_LABEL).unwrap(),
            RM_ENCRYPTION_TRANSFORM_CLASS
        );
    }

    #[test]
    fn test_standard_data_space_rejects_conflicting_class() {
        let mut manager = manager();
        manager
            .define_transform(COMPRESSION_TRANSFORM_CLASS, Some(ENCRYPTION_TRANSFORM_LABEL))
            .unwrap();
        let err = manager.ensure_standard_data_space(ENCRYPTED_DATA_SPACE).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_handler_supplies_key() {
        let mut manager = manager();
        manager
            .set_initialization_handler(|event| {
                if let Some(encryption) = event.transform.as_encryption_mut() {
                    encryption.set_content_key([4; CONTENT_KEY_SIZE]).unwrap();
                }
            })
            .unwrap();
        manager.ensure_standard_data_space(ENCRYPTED_DATA_SPACE).unwrap();
        assert!(manager.transform_mut(ENCRYPTION_TRANSFORM_LABEL).unwrap().is_ready());
    }

    #[test]
    fn test_stream_fails_without_key() {
        let mut manager = manager();
        manager.ensure_standard_data_space(ENCRYPTED_DATA_SPACE).unwrap();
        let reference = ContainerReference::stream(Vec::<String>::new(), "secret");
        manager.create_data_space_mapping(&reference, ENCRYPTED_DATA_SPACE).unwrap();
        let raw: Box<dyn DataStream> = Box::new(std::io::Cursor::new(Vec::new()));
        let err = manager.create_data_space_stream(&reference, raw).unwrap_err();
        assert!(matches!(err, Error::TransformNotReady { .. }));
    }

    #[test]
    fn test_disposed_manager_rejects_calls() {
        let mut manager = manager();
        manager.dispose().unwrap();
        assert!(manager.is_disposed());
        assert!(matches!(
            manager.data_space_is_defined("x"),
            Err(Error::Disposed { object: "data space manager" })
        ));
        assert!(matches!(
            manager.define_transform(COMPRESSION_TRANSFORM_CLASS, None),
            Err(Error::Disposed { .. })
        ));
        manager.dispose().unwrap();
    }

    #[test]
    fn test_tables_persist_across_reopen() {
        let backend = Arc::new(InMemoryBackend::new());
        let reference = ContainerReference::stream(["Docs"], "Body");
        {
            let mut manager =
                DataSpaceManager::open(Arc::clone(&backend), ContainerConfig::default()).unwrap();
            manager.ensure_standard_data_space(COMPRESSED_DATA_SPACE).unwrap();
            manager.create_data_space_mapping(&reference, COMPRESSED_DATA_SPACE).unwrap();
            assert!(manager.is_dirty());
            manager.dispose().unwrap();
        }
        let manager = DataSpaceManager::open(backend, ContainerConfig::default()).unwrap();
        assert!(!manager.is_dirty());
        assert_eq!(
            manager.data_space_of(&reference).unwrap().as_deref(),
            Some(COMPRESSED_DATA_SPACE)
        );
        assert_eq!(
            manager.transform_kind(COMPRESSION_TRANSFORM_LABEL).unwrap(),
            Some(TransformKind::Compression)
        );
    }

    #[test]
    fn test_clean_manager_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut manager =
            DataSpaceManager::open(Arc::clone(&backend), ContainerConfig::default()).unwrap();
        manager.dispose().unwrap();
        assert!(backend.list_elements(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_newer_reader_version_rejected() {
        let backend = Arc::new(InMemoryBackend::new());
        let root = vec![DATA_SPACES_STORAGE.to_string()];
        backend.create_element(&root, ElementKind::Storage).unwrap();
        let version = FormatVersion::uniform(DATA_SPACE_FEATURE, VersionPair::new(2, 0)).unwrap();
        write_stream(&*backend, &child(&root, VERSION_STREAM), &version.to_bytes().unwrap())
            .unwrap();
        let err = DataSpaceManager::open(backend, ContainerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::WrongFormatVersion { .. }));
    }

    proptest::proptest! {
        #[test]
        fn prop_mappings_sorted_regardless_of_insertion(
            names in proptest::collection::vec(
                dataspace_test_utils::strategies::arb_element_name(),
                1..8,
            ),
        ) {
            let backend = Arc::new(InMemoryBackend::new());
            let mut manager =
                DataSpaceManager::open(Arc::clone(&backend), ContainerConfig::default()).unwrap();
            manager.ensure_standard_data_space(COMPRESSED_DATA_SPACE).unwrap();
            for name in &names {
                let reference = ContainerReference::stream(Vec::<String>::new(), name.as_str());
                manager.create_data_space_mapping(&reference, COMPRESSED_DATA_SPACE).unwrap();
            }
            let before = manager.mappings().unwrap();
            proptest::prop_assert!(before.windows(2).all(|w| w[0].0 < w[1].0));
            manager.dispose().unwrap();

            let reopened = DataSpaceManager::open(backend, ContainerConfig::default()).unwrap();
            proptest::prop_assert_eq!(reopened.mappings().unwrap(), before);
        }
    }

    #[test]
    fn test_read_only_rejects_definitions() {
        let backend = Arc::new(InMemoryBackend::new().into_read_only());
        let mut manager = DataSpaceManager::open(backend, ContainerConfig::default()).unwrap();
        let err = manager.define_transform(COMPRESSION_TRANSFORM_CLASS, None).unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }
}
