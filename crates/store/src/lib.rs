//! dataspace-store: data-space transforms for hierarchical compound-file containers.
//!
//! A container is a tree of storages (directories) and streams (byte blobs).
//! On top of it, the data-space layer keeps a set of tables under the
//! reserved `\u{6}DataSpaces` storage:
//!
//! - **Transforms**: labelled, instantiable byte codecs (compression, rights-management encryption)
//! - **Data spaces**: labelled, ordered stacks of transforms
//! - **Data-space map**: which data space each stream or storage is stored in
//!
//! Opening a mapped stream yields its decoded contents; writes are encoded
//! back through the stack when the stream is flushed or the container
//! closes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        StorageRoot / StorageInfo             │
//! │   (create, open, delete, enumerate)         │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │           DataSpaceManager                   │
//! │  (map, definitions, transform stacks)       │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Transforms                      │
//! │   (zstd compression, XChaCha20-Poly1305)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                   │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::io::Write;
//!
//! use dataspace_store::{
//!     CompressionOption, EncryptionOption, StorageRoot, Transform, TransformInitialization,
//! };
//!
//! let root = StorageRoot::create("report.cfb")?;
//! root.data_space_manager()?.set_initialization_handler(
//!     |init: &mut TransformInitialization<'_>| {
//!         if let Transform::RightsManagementEncryption(rm) = &mut *init.transform {
//!             let _ = rm.set_content_key([7u8; 32]);
//!         }
//!     },
//! )?;
//!
//! let body = root.root_storage()?.create_stream(
//!     "Body",
//!     CompressionOption::Normal,
//!     EncryptionOption::RightsManagement,
//! )?;
//! body.open()?.write_all(b"secret")?;
//! root.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]

pub mod backend;
pub mod codec;
pub mod config;
pub mod dataspace;
pub mod error;
pub mod names;
mod namespace;
pub mod reference;
pub mod root;
pub mod storage;
pub mod stream;
pub mod transform;
pub mod version;

// Re-export commonly used types
pub use backend::{ElementEntry, ElementKind, FileBackend, InMemoryBackend, StorageBackend};
pub use config::ContainerConfig;
pub use dataspace::{
    COMPRESSED_DATA_SPACE, COMPRESSION_TRANSFORM_LABEL, DataSpaceManager,
    ENCRYPTED_COMPRESSED_DATA_SPACE, ENCRYPTED_DATA_SPACE, ENCRYPTION_TRANSFORM_LABEL,
};
pub use error::{Error, Result};
pub use reference::ContainerReference;
pub use root::StorageRoot;
pub use storage::{CompressionOption, EncryptionOption, StorageInfo, StreamInfo};
pub use stream::{ContainerStream, DataStream, ElementStream, StreamContext};
pub use transform::{
    CompressionTransform, EncryptionTransform, InitializationHandler, Transform,
    TransformEnvironment, TransformInitialization, TransformKind,
};
pub use version::{FormatVersion, VersionPair};
