//! Instance and Object Configuration
//!
//! Configuration for a population instance and for the lazily populated
//! objects it serves. Instance configuration can be set programmatically
//! or loaded from environment variables; it is locked once the instance
//! is initialized.
//!
//! # Environment Variables
//!
//! All environment variables use the `PAGEFILL_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `PAGEFILL_NUM_WORKERS` | Number of fault-servicing worker threads | CPU count |
//!
//! # Example
//!
//! ```rust,ignore
//! use pagefill::config::{InstanceConfig, ObjectConfig};
//!
//! let config = InstanceConfig::builder().num_workers(4).build()?;
//!
//! let object = ObjectConfig::for_type::<u64>(1_000, 16)?
//!     .with_populator(MyPopulator::new());
//! ```

use std::env;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::callout::Populator;

/// Configuration error raised by builders and validated constructors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Element stride must be at least one byte.
    #[error("element stride must be greater than zero")]
    ZeroStride,
    /// Objects must contain at least one element.
    #[error("element count must be greater than zero")]
    ZeroCount,
    /// The batching floor must satisfy `1 <= min_load <= element_count`.
    #[error("min load count {min_load} must be in 1..={element_count}")]
    BadMinLoad {
        /// Requested batching floor.
        min_load: u32,
        /// Element count it was checked against.
        element_count: u64,
    },
    /// An object cannot be created without a populate implementation.
    #[error("object config has no populator attached")]
    MissingPopulator,
    /// An instance-level value was out of range.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Configuration for a population instance.
///
/// Locked when the instance is initialized; later mutation of a copy has
/// no effect on a running instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Number of worker threads servicing fault events.
    /// Default: number of available CPUs, at least 1.
    pub num_workers: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
        }
    }
}

impl InstanceConfig {
    /// Create a new builder with default values.
    pub fn builder() -> InstanceConfigBuilder {
        InstanceConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are
    /// ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(val) = parse_env_usize("PAGEFILL_NUM_WORKERS") {
            if val > 0 {
                config.num_workers = val;
            }
        }
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_workers".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Builder for [`InstanceConfig`].
#[derive(Debug, Clone, Default)]
pub struct InstanceConfigBuilder {
    config: InstanceConfig,
}

impl InstanceConfigBuilder {
    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<InstanceConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for one lazily populated object.
///
/// The config is copied into the object at creation; the caller may
/// reuse or drop it afterwards without affecting live objects.
#[derive(Clone)]
pub struct ObjectConfig {
    stride: u32,
    element_count: u64,
    min_load_count: u32,
    populator: Option<Arc<dyn Populator>>,
}

impl ObjectConfig {
    /// Create a config from validated parameters.
    ///
    /// `stride` is the element size in bytes, `element_count` the array
    /// length, and `min_load_count` the batching floor: no population
    /// request ever covers fewer elements, so expensive sources (for
    /// example seek-bound readers) amortize each fill.
    pub fn new(stride: u32, element_count: u64, min_load_count: u32) -> Result<Self, ConfigError> {
        if stride == 0 {
            return Err(ConfigError::ZeroStride);
        }
        if element_count == 0 {
            return Err(ConfigError::ZeroCount);
        }
        if min_load_count == 0 || u64::from(min_load_count) > element_count {
            return Err(ConfigError::BadMinLoad {
                min_load: min_load_count,
                element_count,
            });
        }
        Ok(Self {
            stride,
            element_count,
            min_load_count,
            populator: None,
        })
    }

    /// Create a config whose stride is the size of `T`.
    pub fn for_type<T>(element_count: u64, min_load_count: u32) -> Result<Self, ConfigError> {
        let stride = std::mem::size_of::<T>();
        let stride = u32::try_from(stride).map_err(|_| ConfigError::ZeroStride)?;
        Self::new(stride, element_count, min_load_count)
    }

    /// Attach the populate implementation invoked to fill faulted
    /// ranges. State the populate code needs travels inside `populator`
    /// itself.
    pub fn with_populator<P>(mut self, populator: P) -> Self
    where
        P: Populator + 'static,
    {
        self.populator = Some(Arc::new(populator));
        self
    }

    /// Attach an already shared populate implementation.
    pub fn with_shared_populator(mut self, populator: Arc<dyn Populator>) -> Self {
        self.populator = Some(populator);
        self
    }

    /// Element size in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Number of elements in the object.
    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    /// Minimum elements loaded per population request.
    pub fn min_load_count(&self) -> u32 {
        self.min_load_count
    }

    /// Total value-region length in bytes.
    pub fn value_len(&self) -> u64 {
        self.element_count * u64::from(self.stride)
    }

    pub(crate) fn require_populator(&self) -> Result<Arc<dyn Populator>, ConfigError> {
        self.populator.clone().ok_or(ConfigError::MissingPopulator)
    }
}

impl fmt::Debug for ObjectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectConfig")
            .field("stride", &self.stride)
            .field("element_count", &self.element_count)
            .field("min_load_count", &self.min_load_count)
            .field("has_populator", &self.populator.is_some())
            .finish()
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_instance_config() {
        let config = InstanceConfig::default();
        assert!(config.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = InstanceConfig::builder().num_workers(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_sets_workers() {
        let config = InstanceConfig::builder().num_workers(3).build().unwrap();
        assert_eq!(config.num_workers, 3);
    }

    #[test]
    fn test_from_env_defaults() {
        env::remove_var("PAGEFILL_NUM_WORKERS");
        let config = InstanceConfig::from_env();
        assert!(config.num_workers >= 1);
    }

    #[test]
    fn test_object_config_valid() {
        let config = ObjectConfig::new(8, 1000, 16).unwrap();
        assert_eq!(config.stride(), 8);
        assert_eq!(config.element_count(), 1000);
        assert_eq!(config.min_load_count(), 16);
        assert_eq!(config.value_len(), 8000);
    }

    #[test]
    fn test_object_config_zero_stride() {
        let err = ObjectConfig::new(0, 10, 1).unwrap_err();
        assert_eq!(err, ConfigError::ZeroStride);
    }

    #[test]
    fn test_object_config_zero_count() {
        let err = ObjectConfig::new(8, 0, 1).unwrap_err();
        assert_eq!(err, ConfigError::ZeroCount);
    }

    #[test]
    fn test_object_config_min_load_bounds() {
        assert!(ObjectConfig::new(8, 10, 0).is_err());
        assert!(ObjectConfig::new(8, 10, 11).is_err());
        assert!(ObjectConfig::new(8, 10, 10).is_ok());
        assert!(ObjectConfig::new(8, 10, 1).is_ok());
    }

    #[test]
    fn test_for_type_uses_size_of() {
        let config = ObjectConfig::for_type::<u64>(100, 4).unwrap();
        assert_eq!(config.stride(), 8);

        let config = ObjectConfig::for_type::<[u8; 24]>(100, 4).unwrap();
        assert_eq!(config.stride(), 24);
    }

    #[test]
    fn test_for_type_rejects_zst() {
        assert!(ObjectConfig::for_type::<()>(100, 4).is_err());
    }

    #[test]
    fn test_missing_populator() {
        let config = ObjectConfig::new(8, 10, 1).unwrap();
        assert!(config.require_populator().is_err());
    }
}
