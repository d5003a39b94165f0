//! Compression transform backed by zstd.

use std::io::{Read, Write};

use zstd::stream::{Decoder, Encoder};

use super::{CURRENT_TRANSFORM_VERSION, TransformEnvironment, check_feature_version};
use crate::{
    config::{MAX_COMPRESSION_LEVEL, MIN_COMPRESSION_LEVEL},
    error::{Error, Result},
    version::FormatVersion,
};

/// Feature identifier of the compression transform's instance data.
pub const COMPRESSION_FEATURE: &str = "Microsoft.Metadata.CompressionTransform";

/// Compresses stream contents with zstd.
///
/// Always ready: it needs no keys or other external input.
#[derive(Debug)]
pub struct CompressionTransform {
    environment: TransformEnvironment,
    level: i32,
}

impl CompressionTransform {
    pub(crate) fn new(environment: TransformEnvironment, level: i32) -> Result<Self> {
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level) {
            return Err(Error::Config { message: format!("invalid zstd level {level}") });
        }
        let primary = environment.primary_instance_data();
        if primary.is_empty() {
            let version = FormatVersion::uniform(COMPRESSION_FEATURE, CURRENT_TRANSFORM_VERSION)?;
            environment.set_primary_instance_data(version.to_bytes()?);
        } else {
            check_feature_version(&environment, &primary, COMPRESSION_FEATURE)?;
        }
        Ok(Self { environment, level })
    }

    /// Zstd level used when encoding.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// The transform's persisted state.
    pub fn environment(&self) -> &TransformEnvironment {
        &self.environment
    }

    pub(crate) fn encode(&self, clear: &[u8]) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        {
            let mut encoder =
                Encoder::new(&mut compressed, self.level).map_err(|e| self.failure(e))?;
            encoder.write_all(clear).map_err(|e| self.failure(e))?;
            encoder.finish().map_err(|e| self.failure(e))?;
        }
        Ok(compressed)
    }

    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = Decoder::new(raw).map_err(|e| self.failure(e))?;
        let mut clear = Vec::new();
        decoder.read_to_end(&mut clear).map_err(|e| self.failure(e))?;
        Ok(clear)
    }

    fn failure(&self, err: std::io::Error) -> Error {
        Error::Transform {
            label: self.environment.transform_label().to_string(),
            reason: format!("zstd: {err}"),
        }
    }
}
