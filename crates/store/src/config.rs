//! Container configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum zstd compression level.
pub(crate) const MAX_COMPRESSION_LEVEL: i32 = 22;

/// Minimum zstd compression level.
pub(crate) const MIN_COMPRESSION_LEVEL: i32 = 1;

/// Options applied when a container is opened or created.
///
/// # Validation Rules
///
/// - `compression_level` must be 1-22 (zstd valid range)
///
/// # Example
///
/// ```
/// # use dataspace_store::ContainerConfig;
/// let config = ContainerConfig::builder()
///     .compression_level(9)
///     .build()
///     .expect("valid container config");
/// assert!(config.enable_data_spaces);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Zstd level used by the compression transform (1-22, 3 recommended).
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Whether the container maintains data-space tables at all.
    ///
    /// When disabled, streams can only be created without compression or
    /// encryption and any existing data-space tables are left untouched.
    #[serde(default = "default_enable_data_spaces")]
    pub enable_data_spaces: bool,
}

#[bon::bon]
impl ContainerConfig {
    /// Creates a new container configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `compression_level` is outside 1-22.
    #[builder]
    pub fn new(
        #[builder(default = default_compression_level())] compression_level: i32,
        #[builder(default = default_enable_data_spaces())] enable_data_spaces: bool,
    ) -> Result<Self> {
        let config = Self { compression_level, enable_data_spaces };
        config.validate()?;
        Ok(config)
    }
}

impl ContainerConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&self.compression_level) {
            return Err(Error::Config {
                message: format!(
                    "compression_level must be {}-{}, got {}",
                    MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.compression_level
                ),
            });
        }
        Ok(())
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            enable_data_spaces: default_enable_data_spaces(),
        }
    }
}

fn default_compression_level() -> i32 {
    3
}

fn default_enable_data_spaces() -> bool {
    true
}
