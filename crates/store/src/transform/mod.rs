//! Stream transforms.
//!
//! A transform turns the bytes of the layer beneath it into the bytes of
//! the layer above: the compression transform inflates, the encryption
//! transform decrypts. A data space stacks transforms with index 0 closest
//! to the stored bytes, so a stream opened through
//! `[EncryptionTransform, CompressionTransform]` is decrypted first and
//! then decompressed.
//!
//! The set of transforms is closed. Class identifiers select the variant
//! when definitions are loaded from a container.

mod compression;
mod encryption;
mod environment;

use std::{
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use parking_lot::Mutex;

pub use compression::{COMPRESSION_FEATURE, CompressionTransform};
pub use encryption::{
    CONTENT_KEY_SIZE, ENCRYPTION_FEATURE, EncryptionTransform, KEY_FINGERPRINT_STREAM,
};
pub use environment::TransformEnvironment;

use crate::{
    config::ContainerConfig,
    error::Result,
    names::names_equal,
    reference::ContainerReference,
    stream::{DataStream, StreamContext},
    version::{FormatVersion, VersionPair},
};

/// Class identifier of the compression transform.
pub const COMPRESSION_TRANSFORM_CLASS: &str = "{86DE7F2B-DDCE-486d-B016-405BBE82B8BC}";

/// Class identifier of the rights-management encryption transform.
pub const RM_ENCRYPTION_TRANSFORM_CLASS: &str = "{C73DFACD-061F-43B0-8B64-0C620D2A8B50}";

/// Version of the per-transform instance-data records written here.
pub const CURRENT_TRANSFORM_VERSION: VersionPair = VersionPair::new(1, 0);

/// Context key recording which transforms a stream passed through.
pub const TRANSFORM_CHAIN_KEY: &str = "TransformChain";

/// Kinds of transform this crate can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    /// zstd compression.
    Compression,
    /// Rights-management encryption.
    RightsManagementEncryption,
}

impl TransformKind {
    /// The class identifier persisted in transform definitions.
    pub const fn class_identifier(self) -> &'static str {
        match self {
            TransformKind::Compression => COMPRESSION_TRANSFORM_CLASS,
            TransformKind::RightsManagementEncryption => RM_ENCRYPTION_TRANSFORM_CLASS,
        }
    }

    /// Looks up a kind by class identifier, ignoring case.
    pub fn from_class_identifier(class: &str) -> Option<Self> {
        [TransformKind::Compression, TransformKind::RightsManagementEncryption]
            .into_iter()
            .find(|kind| names_equal(kind.class_identifier(), class))
    }
}

/// An instantiated transform.
#[derive(Debug)]
pub enum Transform {
    /// See [`CompressionTransform`].
    Compression(CompressionTransform),
    /// See [`EncryptionTransform`].
    RightsManagementEncryption(EncryptionTransform),
}

impl Transform {
    pub(crate) fn create(
        kind: TransformKind,
        environment: TransformEnvironment,
        config: &ContainerConfig,
    ) -> Result<Self> {
        Ok(match kind {
            TransformKind::Compression => Transform::Compression(CompressionTransform::new(
                environment,
                config.compression_level,
            )?),
            TransformKind::RightsManagementEncryption => {
                Transform::RightsManagementEncryption(EncryptionTransform::new(environment)?)
            },
        })
    }

    /// Kind of this transform.
    pub fn kind(&self) -> TransformKind {
        match self {
            Transform::Compression(_) => TransformKind::Compression,
            Transform::RightsManagementEncryption(_) => TransformKind::RightsManagementEncryption,
        }
    }

    /// Label of the transform definition.
    pub fn label(&self) -> &str {
        self.environment().transform_label()
    }

    /// The transform's persisted state.
    pub fn environment(&self) -> &TransformEnvironment {
        match self {
            Transform::Compression(t) => t.environment(),
            Transform::RightsManagementEncryption(t) => t.environment(),
        }
    }

    /// Whether the transform can encode and decode.
    pub fn is_ready(&self) -> bool {
        match self {
            Transform::Compression(_) => true,
            Transform::RightsManagementEncryption(t) => t.has_content_key(),
        }
    }

    /// The encryption transform, if this is one.
    pub fn as_encryption_mut(&mut self) -> Option<&mut EncryptionTransform> {
        match self {
            Transform::RightsManagementEncryption(t) => Some(t),
            Transform::Compression(_) => None,
        }
    }

    /// Releases secrets held by the transform.
    pub(crate) fn dispose(&mut self) {
        if let Transform::RightsManagementEncryption(t) = self {
            t.clear_content_key();
        }
    }

    pub(crate) fn encode(&self, clear: &[u8]) -> Result<Vec<u8>> {
        match self {
            Transform::Compression(t) => t.encode(clear),
            Transform::RightsManagementEncryption(t) => t.encode(clear),
        }
    }

    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Transform::Compression(t) => t.decode(raw),
            Transform::RightsManagementEncryption(t) => t.decode(raw),
        }
    }

    /// Wraps `inner` in a layer applying `shared`.
    ///
    /// Every layer opened from one definition uses the same instance, so
    /// key changes and [`dispose`](Self::dispose) reach streams already open.
    pub(crate) fn transformed_stream(
        shared: &Arc<Mutex<Transform>>,
        inner: Box<dyn DataStream>,
        context: &mut StreamContext,
    ) -> Result<Box<dyn DataStream>> {
        let chain = {
            let transform = shared.lock();
            match context.get(TRANSFORM_CHAIN_KEY) {
                Some(existing) => format!("{existing},{}", transform.label()),
                None => transform.label().to_string(),
            }
        };
        context.insert(TRANSFORM_CHAIN_KEY, chain);
        Ok(Box::new(TransformedStream::open(inner, Arc::clone(shared))?))
    }
}

/// Event raised when a transform is instantiated or found not ready.
///
/// Handlers typically supply content keys here.
pub struct TransformInitialization<'a> {
    /// Label of the transform definition.
    pub transform_label: &'a str,
    /// Data space being opened, if any.
    pub data_space_label: Option<&'a str>,
    /// Element being opened, if any.
    pub reference: Option<&'a ContainerReference>,
    /// The transform instance.
    pub transform: &'a mut Transform,
}

/// Callback invoked with a [`TransformInitialization`].
pub type InitializationHandler = Box<dyn FnMut(&mut TransformInitialization<'_>) + Send>;

/// A stream layer holding decoded bytes of the layer beneath.
///
/// The inner stream is decoded in full on open. On flush, modified content
/// is re-encoded and replaces the inner stream's contents.
struct TransformedStream {
    inner: Box<dyn DataStream>,
    codec: Arc<Mutex<Transform>>,
    buffer: Cursor<Vec<u8>>,
    dirty: bool,
}

impl TransformedStream {
    fn open(mut inner: Box<dyn DataStream>, codec: Arc<Mutex<Transform>>) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        inner.read_to_end(&mut raw)?;
        let clear = if raw.is_empty() { Vec::new() } else { codec.lock().decode(&raw)? };
        Ok(Self { inner, codec, buffer: Cursor::new(clear), dirty: false })
    }
}

impl Read for TransformedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buffer.read(buf)
    }
}

impl Write for TransformedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            self.dirty = true;
        }
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            let clear = self.buffer.get_ref();
            let encoded = if clear.is_empty() {
                Vec::new()
            } else {
                self.codec.lock().encode(clear).map_err(crate::Error::into_io)?
            };
            self.inner.seek(SeekFrom::Start(0))?;
            self.inner.set_len(0)?;
            self.inner.write_all(&encoded)?;
            self.dirty = false;
        }
        self.inner.flush()
    }
}

impl Seek for TransformedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buffer.seek(pos)
    }
}

impl DataStream for TransformedStream {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if len != self.buffer.get_ref().len() as u64 {
            self.dirty = true;
        }
        self.buffer.set_len(len)
    }
}

/// Validates a transform's stored instance-data version record.
fn check_feature_version(
    environment: &TransformEnvironment,
    primary: &[u8],
    feature: &str,
) -> Result<()> {
    let version = FormatVersion::from_bytes(primary)?;
    if !version.same_feature(feature) {
        return Err(environment.corrupted(format!(
            "expected feature {feature}, found {}",
            version.feature_identifier()
        )));
    }
    version.ensure_readable_by(CURRENT_TRANSFORM_VERSION)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig::default()
    }

    fn shared(kind: TransformKind, label: &str) -> Arc<Mutex<Transform>> {
        let transform =
            Transform::create(kind, TransformEnvironment::new(label), &config()).unwrap();
        Arc::new(Mutex::new(transform))
    }

    #[test]
    fn test_kind_from_class_identifier_ignores_case() {
        assert_eq!(
            TransformKind::from_class_identifier("{86de7f2b-ddce-486D-B016-405BBE82B8BC}"),
            Some(TransformKind::Compression)
        );
        assert_eq!(
            TransformKind::from_class_identifier(RM_ENCRYPTION_TRANSFORM_CLASS),
            Some(TransformKind::RightsManagementEncryption)
        );
        assert_eq!(TransformKind::from_class_identifier("{00000000}"), None);
    }

    #[test]
    fn test_readiness() {
        let compression = Transform::create(
            TransformKind::Compression,
            TransformEnvironment::new("C"),
            &config(),
        )
        .unwrap();
        assert!(compression.is_ready());

        let mut encryption = Transform::create(
            TransformKind::RightsManagementEncryption,
            TransformEnvironment::new("E"),
            &config(),
        )
        .unwrap();
        assert!(!encryption.is_ready());
        encryption.as_encryption_mut().unwrap().set_content_key([1; CONTENT_KEY_SIZE]).unwrap();
        assert!(encryption.is_ready());
        encryption.dispose();
        assert!(!encryption.is_ready());
    }

    #[test]
    fn test_transformed_stream_reencodes_on_flush() {
        let transform = shared(TransformKind::Compression, "C");
        let mut context = StreamContext::new();

        let inner: Box<dyn DataStream> = Box::new(Cursor::new(Vec::new()));
        let mut layer = Transform::transformed_stream(&transform, inner, &mut context).unwrap();
        layer.write_all(&[42u8; 4096]).unwrap();
        layer.flush().unwrap();
        assert_eq!(context.get(TRANSFORM_CHAIN_KEY), Some("C"));

        layer.seek(SeekFrom::Start(0)).unwrap();
        let mut clear = Vec::new();
        layer.read_to_end(&mut clear).unwrap();
        assert_eq!(clear, vec![42u8; 4096]);
    }

    #[test]
    fn test_layers_stack_in_order() {
        let encryption = shared(TransformKind::RightsManagementEncryption, "E");
        encryption
            .lock()
            .as_encryption_mut()
            .unwrap()
            .set_content_key([9; CONTENT_KEY_SIZE])
            .unwrap();
        let compression = shared(TransformKind::Compression, "C");

        let mut context = StreamContext::new();
        let raw: Box<dyn DataStream> = Box::new(Cursor::new(Vec::new()));
        let decrypted = Transform::transformed_stream(&encryption, raw, &mut context).unwrap();
        let mut clear =
            Transform::transformed_stream(&compression, decrypted, &mut context).unwrap();
        clear.write_all(b"layered").unwrap();
        clear.flush().unwrap();
        assert_eq!(context.get(TRANSFORM_CHAIN_KEY), Some("E,C"));
    }

    #[test]
    fn test_empty_inner_stream_is_not_decoded() {
        let encryption = shared(TransformKind::RightsManagementEncryption, "E");
        // Not ready, but an empty stream never reaches the cipher.
        let raw: Box<dyn DataStream> = Box::new(Cursor::new(Vec::new()));
        let mut layer =
            Transform::transformed_stream(&encryption, raw, &mut StreamContext::new()).unwrap();
        assert_eq!(layer.len().unwrap(), 0);
    }

    #[test]
    fn test_open_layers_share_the_instance() {
        let encryption = shared(TransformKind::RightsManagementEncryption, "E");
        encryption
            .lock()
            .as_encryption_mut()
            .unwrap()
            .set_content_key([3; CONTENT_KEY_SIZE])
            .unwrap();
        let raw: Box<dyn DataStream> = Box::new(Cursor::new(Vec::new()));
        let mut layer =
            Transform::transformed_stream(&encryption, raw, &mut StreamContext::new()).unwrap();
        assert_eq!(Arc::strong_count(&encryption), 2);

        layer.write_all(b"secret").unwrap();
        encryption.lock().dispose();
        assert!(layer.flush().is_err());
    }
}
