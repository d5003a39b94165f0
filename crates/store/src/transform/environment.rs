//! Persisted per-transform state handed to transform instances.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    names::{NameKey, validate_user_name},
};

#[derive(Debug, Default)]
struct InstanceData {
    primary: Vec<u8>,
    streams: BTreeMap<NameKey, Vec<u8>>,
    dirty: bool,
}

/// Access to the data a transform persists in its definition.
///
/// Every transform owns a primary instance-data blob, stored after the
/// transform header, plus any number of named private streams. Changes are
/// buffered here and written when the data-space tables are saved.
///
/// Clones share the same underlying data.
#[derive(Debug, Clone)]
pub struct TransformEnvironment {
    label: String,
    data: Arc<Mutex<InstanceData>>,
}

impl TransformEnvironment {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), data: Arc::new(Mutex::new(InstanceData::default())) }
    }

    /// Environment holding data loaded from the container.
    pub(crate) fn loaded(
        label: impl Into<String>,
        primary: Vec<u8>,
        streams: BTreeMap<NameKey, Vec<u8>>,
    ) -> Self {
        let data = InstanceData { primary, streams, dirty: false };
        Self { label: label.into(), data: Arc::new(Mutex::new(data)) }
    }

    /// Label of the transform this environment belongs to.
    pub fn transform_label(&self) -> &str {
        &self.label
    }

    /// Copy of the primary instance data.
    pub fn primary_instance_data(&self) -> Vec<u8> {
        self.data.lock().primary.clone()
    }

    /// Replaces the primary instance data.
    pub fn set_primary_instance_data(&self, bytes: Vec<u8>) {
        let mut data = self.data.lock();
        if data.primary != bytes {
            data.primary = bytes;
            data.dirty = true;
        }
    }

    /// Contents of private stream `name`, if present.
    pub fn instance_stream(&self, name: &str) -> Option<Vec<u8>> {
        self.data.lock().streams.get(NameKey::new(name).folded()).cloned()
    }

    /// Creates or replaces private stream `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] or [`Error::ReservedName`] if
    /// `name` is not a valid caller-supplied element name.
    pub fn set_instance_stream(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        validate_user_name(name)?;
        let mut data = self.data.lock();
        let key = NameKey::new(name);
        if data.streams.get(&key) != Some(&bytes) {
            data.streams.insert(key, bytes);
            data.dirty = true;
        }
        Ok(())
    }

    /// Removes private stream `name`, returning whether it existed.
    pub fn remove_instance_stream(&self, name: &str) -> bool {
        let mut data = self.data.lock();
        let removed = data.streams.remove(NameKey::new(name).folded()).is_some();
        data.dirty |= removed;
        removed
    }

    /// Names of the private streams.
    pub fn instance_stream_names(&self) -> Vec<String> {
        self.data.lock().streams.keys().map(|k| k.as_str().to_string()).collect()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.data.lock().dirty
    }

    pub(crate) fn mark_clean(&self) {
        self.data.lock().dirty = false;
    }

    /// Snapshot of everything to persist: primary data and private streams.
    pub(crate) fn persisted(&self) -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
        let data = self.data.lock();
        let streams =
            data.streams.iter().map(|(name, bytes)| (name.as_str().to_string(), bytes.clone()));
        (data.primary.clone(), streams.collect())
    }

    pub(crate) fn corrupted(&self, reason: impl std::fmt::Display) -> Error {
        Error::Corrupted { reason: format!("transform {}: {reason}", self.label) }
    }
}
