//! Node arena behind [`StorageInfo`](crate::StorageInfo) and
//! [`StreamInfo`](crate::StreamInfo) handles.
//!
//! Nodes are materialized lazily as handles are requested and cache whether
//! their element was seen in the backend. Storage nodes also cache the
//! results of enumeration until a create or delete beneath them. Node ids
//! are never reused, so a handle to a deleted node reports it disposed.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    backend::{ElementKind, StorageBackend, display_path},
    error::{Error, Result},
    names::{NameKey, fold, is_reserved_name},
    reference::ContainerReference,
    stream::{SharedStream, StreamCore},
};

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// The root storage node.
pub(crate) const ROOT: NodeId = NodeId(0);

#[derive(Default)]
struct StorageNode {
    storages: BTreeMap<NameKey, NodeId>,
    streams: BTreeMap<NameKey, NodeId>,
    storage_snapshot: Option<Vec<NodeId>>,
    stream_snapshot: Option<Vec<NodeId>>,
}

enum NodeKind {
    Storage(StorageNode),
    Stream { open: Vec<Weak<Mutex<StreamCore>>> },
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
    verified: bool,
}

impl Node {
    fn element_kind(&self) -> ElementKind {
        match self.kind {
            NodeKind::Storage(_) => ElementKind::Storage,
            NodeKind::Stream { .. } => ElementKind::Stream,
        }
    }
}

/// Arena of storage and stream nodes for one container.
pub(crate) struct Namespace {
    nodes: Vec<Option<Node>>,
}

impl Namespace {
    pub(crate) fn new() -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            kind: NodeKind::Storage(StorageNode::default()),
            verified: true,
        };
        Self { nodes: vec![Some(root)] }
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref).ok_or(Error::Disposed { object: "element" })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::Disposed { object: "element" })
    }

    fn storage(&self, id: NodeId) -> Result<&StorageNode> {
        match &self.node(id)?.kind {
            NodeKind::Storage(storage) => Ok(storage),
            NodeKind::Stream { .. } => Err(Error::InvalidArgument {
                reason: "element is a stream, not a storage".to_string(),
            }),
        }
    }

    fn storage_mut(&mut self, id: NodeId) -> Result<&mut StorageNode> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Storage(storage) => Ok(storage),
            NodeKind::Stream { .. } => Err(Error::InvalidArgument {
                reason: "element is a stream, not a storage".to_string(),
            }),
        }
    }

    /// Whether `id` refers to a live node.
    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    pub(crate) fn name(&self, id: NodeId) -> Result<String> {
        Ok(self.node(id)?.name.clone())
    }

    /// Element names from the root storage down to `id`.
    pub(crate) fn path(&self, id: NodeId) -> Result<Vec<String>> {
        let mut path = Vec::new();
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            path.push(current.name.clone());
            current = self.node(parent)?;
        }
        path.reverse();
        Ok(path)
    }

    pub(crate) fn reference(&self, id: NodeId) -> Result<ContainerReference> {
        let node = self.node(id)?;
        let mut path = self.path(id)?;
        Ok(match node.element_kind() {
            ElementKind::Storage => ContainerReference::storage(path),
            ElementKind::Stream => {
                let name = path.pop().unwrap_or_default();
                ContainerReference::stream(path, name)
            },
        })
    }

    /// Returns the child node `name` of the given kind, materializing an
    /// unverified node if needed.
    pub(crate) fn child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: ElementKind,
    ) -> Result<NodeId> {
        let key = NameKey::new(name);
        let storage = self.storage_mut(parent)?;
        let existing = match kind {
            ElementKind::Storage => storage.storages.get(&key),
            ElementKind::Stream => storage.streams.get(&key),
        };
        if let Some(id) = existing {
            return Ok(*id);
        }

        let id = NodeId(self.nodes.len());
        let node_kind = match kind {
            ElementKind::Storage => NodeKind::Storage(StorageNode::default()),
            ElementKind::Stream => NodeKind::Stream { open: Vec::new() },
        };
        self.nodes.push(Some(Node {
            name: name.to_string(),
            parent: Some(parent),
            kind: node_kind,
            verified: false,
        }));
        let storage = self.storage_mut(parent)?;
        match kind {
            ElementKind::Storage => storage.storages.insert(key, id),
            ElementKind::Stream => storage.streams.insert(key, id),
        };
        Ok(id)
    }

    /// Child `name` of the given kind if its element exists.
    ///
    /// A node is only materialized once the backend confirms the element,
    /// so lookups of missing names leave the arena unchanged.
    pub(crate) fn find<B: StorageBackend>(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: ElementKind,
        backend: &B,
    ) -> Result<Option<NodeId>> {
        let storage = self.storage(parent)?;
        let known = match kind {
            ElementKind::Storage => storage.storages.get(fold(name).as_str()),
            ElementKind::Stream => storage.streams.get(fold(name).as_str()),
        };
        if let Some(&id) = known {
            return Ok(self.exists(id, backend)?.then_some(id));
        }
        if !self.exists(parent, backend)? {
            return Ok(None);
        }

        let mut path = self.path(parent)?;
        path.push(name.to_string());
        match backend.open_element(&path, kind) {
            Ok(()) => {
                let id = self.child(parent, name, kind)?;
                self.mark_exists(id)?;
                Ok(Some(id))
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::native(display_path(&path), err)),
        }
    }

    /// Number of arena slots ever allocated.
    #[cfg(test)]
    fn allocated(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the element behind `id` exists, consulting the backend for
    /// nodes not yet seen there.
    pub(crate) fn exists<B: StorageBackend>(&mut self, id: NodeId, backend: &B) -> Result<bool> {
        let node = self.node(id)?;
        if node.verified {
            return Ok(true);
        }
        let kind = node.element_kind();
        if let Some(parent) = node.parent {
            if !self.exists(parent, backend)? {
                return Ok(false);
            }
        }
        let path = self.path(id)?;
        match backend.open_element(&path, kind) {
            Ok(()) => {
                self.mark_exists(id)?;
                Ok(true)
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::native(display_path(&path), err)),
        }
    }

    /// Replaces the stored casing of a node's name.
    pub(crate) fn set_name(&mut self, id: NodeId, name: &str) -> Result<()> {
        self.node_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub(crate) fn mark_exists(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.verified = true;
        Ok(())
    }

    /// Drops the cached enumerations of a storage.
    pub(crate) fn invalidate_snapshots(&mut self, id: NodeId) -> Result<()> {
        let storage = self.storage_mut(id)?;
        storage.storage_snapshot = None;
        storage.stream_snapshot = None;
        Ok(())
    }

    /// Children of kind `kind` beneath storage `id`, cached until the next
    /// invalidation. Reserved names are skipped.
    pub(crate) fn snapshot<B: StorageBackend>(
        &mut self,
        id: NodeId,
        kind: ElementKind,
        backend: &B,
    ) -> Result<Vec<NodeId>> {
        let storage = self.storage_mut(id)?;
        let cached = match kind {
            ElementKind::Storage => &storage.storage_snapshot,
            ElementKind::Stream => &storage.stream_snapshot,
        };
        if let Some(ids) = cached {
            return Ok(ids.clone());
        }

        let path = self.path(id)?;
        let entries =
            backend.list_elements(&path).map_err(|e| Error::native(display_path(&path), e))?;
        let mut ids = Vec::new();
        let visible = entries.into_iter().filter(|e| e.kind == kind && !is_reserved_name(&e.name));
        for entry in visible {
            let child = self.child(id, &entry.name, kind)?;
            self.mark_exists(child)?;
            ids.push(child);
        }

        let storage = self.storage_mut(id)?;
        match kind {
            ElementKind::Storage => storage.storage_snapshot = Some(ids.clone()),
            ElementKind::Stream => storage.stream_snapshot = Some(ids.clone()),
        }
        Ok(ids)
    }

    /// Records an open stream of node `id`.
    pub(crate) fn track_stream(&mut self, id: NodeId, core: &SharedStream) -> Result<()> {
        if let NodeKind::Stream { open } = &mut self.node_mut(id)?.kind {
            open.retain(|weak| weak.strong_count() > 0);
            open.push(Arc::downgrade(core));
        }
        Ok(())
    }

    /// Every stream still open through any node.
    pub(crate) fn open_streams(&self) -> Vec<SharedStream> {
        self.nodes
            .iter()
            .flatten()
            .filter_map(|node| match &node.kind {
                NodeKind::Stream { open } => Some(open.iter().filter_map(|weak| weak.upgrade())),
                NodeKind::Storage(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Disposes `id` and everything beneath it, closing open streams
    /// without flushing them.
    pub(crate) fn dispose_subtree(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let parent = node.parent;
        let key = NameKey::new(node.name.as_str());
        let kind = node.element_kind();

        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(node) = self.nodes.get_mut(current.0).and_then(Option::take) else {
                continue;
            };
            match node.kind {
                NodeKind::Storage(storage) => {
                    pending.extend(storage.storages.values().chain(storage.streams.values()));
                },
                NodeKind::Stream { open } => {
                    for core in open.iter().filter_map(|weak| weak.upgrade()) {
                        core.lock().abandon();
                    }
                },
            }
        }

        if let Some(parent) = parent {
            if let Ok(storage) = self.storage_mut(parent) {
                match kind {
                    ElementKind::Storage => storage.storages.remove(&key),
                    ElementKind::Stream => storage.streams.remove(&key),
                };
            }
        }
        Ok(())
    }

    /// Disposes every node, the root included.
    pub(crate) fn dispose_all(&mut self) {
        for node in self.nodes.iter_mut().filter_map(Option::take) {
            if let NodeKind::Stream { open } = node.kind {
                for core in open.iter().filter_map(|weak| weak.upgrade()) {
                    core.lock().abandon();
                }
            }
        }
    }
}
