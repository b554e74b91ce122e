//! Allocator configuration.
//!
//! Loaded from a TOML file. Every section and field has a default, so an
//! empty file yields a usable configuration:
//!
//! ```toml
//! [geometry]
//! blocks_per_stripe = 128
//! stripes_per_segment = 1024
//! write_buffer_stripes = 1024
//! user_segments = 64
//!
//! [gc]
//! normal_threshold = 20
//! urgent_threshold = 5
//!
//! [meta]
//! dir = "/var/lib/pos/allocator"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top level allocator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Array geometry.
    #[serde(default)]
    pub geometry: GeometryConfig,

    /// Garbage collection thresholds.
    #[serde(default)]
    pub gc: GcConfig,

    /// Metadata file placement.
    #[serde(default)]
    pub meta: MetaConfig,

    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Write-buffer and user-area geometry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeometryConfig {
    /// Blocks in one stripe.
    #[serde(default = "default_blocks_per_stripe")]
    pub blocks_per_stripe: u32,

    /// Stripes in one user-data segment.
    #[serde(default = "default_stripes_per_segment")]
    pub stripes_per_segment: u32,

    /// Data chunks (one per data device) in one stripe.
    #[serde(default = "default_chunks_per_stripe")]
    pub chunks_per_stripe: u32,

    /// Size of one chunk buffer in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Number of stripes in the NVRAM write buffer.
    #[serde(default = "default_write_buffer_stripes")]
    pub write_buffer_stripes: u32,

    /// Number of user-data segments.
    #[serde(default = "default_user_segments")]
    pub user_segments: u32,

    /// Maximum number of volumes. Each gets a user and a GC tail.
    #[serde(default = "default_max_volumes")]
    pub max_volumes: u32,
}

fn default_blocks_per_stripe() -> u32 {
    128
}

fn default_stripes_per_segment() -> u32 {
    1024
}

fn default_chunks_per_stripe() -> u32 {
    4
}

fn default_chunk_size() -> usize {
    4096
}

fn default_write_buffer_stripes() -> u32 {
    1024
}

fn default_user_segments() -> u32 {
    64
}

fn default_max_volumes() -> u32 {
    256
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            blocks_per_stripe: default_blocks_per_stripe(),
            stripes_per_segment: default_stripes_per_segment(),
            chunks_per_stripe: default_chunks_per_stripe(),
            chunk_size: default_chunk_size(),
            write_buffer_stripes: default_write_buffer_stripes(),
            user_segments: default_user_segments(),
            max_volumes: default_max_volumes(),
        }
    }
}

impl GeometryConfig {
    /// Set the number of blocks per stripe.
    pub fn blocks_per_stripe(mut self, blocks: u32) -> Self {
        self.blocks_per_stripe = blocks;
        self
    }

    /// Set the number of stripes per segment.
    pub fn stripes_per_segment(mut self, stripes: u32) -> Self {
        self.stripes_per_segment = stripes;
        self
    }

    /// Set the number of chunks per stripe.
    pub fn chunks_per_stripe(mut self, chunks: u32) -> Self {
        self.chunks_per_stripe = chunks;
        self
    }

    /// Set the chunk buffer size in bytes.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the number of write-buffer stripes.
    pub fn write_buffer_stripes(mut self, stripes: u32) -> Self {
        self.write_buffer_stripes = stripes;
        self
    }

    /// Set the number of user-data segments.
    pub fn user_segments(mut self, segments: u32) -> Self {
        self.user_segments = segments;
        self
    }

    /// Set the maximum volume count.
    pub fn max_volumes(mut self, volumes: u32) -> Self {
        self.max_volumes = volumes;
        self
    }
}

/// Free-segment thresholds that drive the GC mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// Free-segment count at or below which normal GC runs.
    #[serde(default = "default_normal_threshold")]
    pub normal_threshold: u32,

    /// Free-segment count at or below which user allocation is blocked.
    #[serde(default = "default_urgent_threshold")]
    pub urgent_threshold: u32,
}

fn default_normal_threshold() -> u32 {
    20
}

fn default_urgent_threshold() -> u32 {
    5
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            normal_threshold: default_normal_threshold(),
            urgent_threshold: default_urgent_threshold(),
        }
    }
}

/// Where the two allocator metadata files live.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaConfig {
    /// Directory holding the metadata files.
    #[serde(default = "default_meta_dir")]
    pub dir: PathBuf,

    /// Name of the main allocator metadata file.
    #[serde(default = "default_meta_file_name")]
    pub file_name: String,

    /// Name of the rebuild-target segment file.
    #[serde(default = "default_rebuild_file_name")]
    pub rebuild_file_name: String,
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("/var/lib/pos/allocator")
}

fn default_meta_file_name() -> String {
    "AllocatorMeta".to_string()
}

fn default_rebuild_file_name() -> String {
    "AllocatorRebuildSegments".to_string()
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            dir: default_meta_dir(),
            file_name: default_meta_file_name(),
            rebuild_file_name: default_rebuild_file_name(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    #[default]
    Compact,
    /// Newline delimited JSON.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default = "default_true")]
    pub target: bool,

    /// Include thread names.
    #[serde(default)]
    pub thread_names: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

impl AllocatorConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the geometry section.
    pub fn geometry(mut self, geometry: GeometryConfig) -> Self {
        self.geometry = geometry;
        self
    }

    /// Set both GC thresholds.
    pub fn gc_thresholds(mut self, normal: u32, urgent: u32) -> Self {
        self.gc.normal_threshold = normal;
        self.gc.urgent_threshold = urgent;
        self
    }

    /// Set the metadata directory.
    pub fn meta_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.meta.dir = dir.into();
        self
    }

    /// Check that the configuration describes a usable array.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.geometry;
        let nonzero = [
            ("blocks_per_stripe", g.blocks_per_stripe as usize),
            ("stripes_per_segment", g.stripes_per_segment as usize),
            ("chunks_per_stripe", g.chunks_per_stripe as usize),
            ("chunk_size", g.chunk_size),
            ("write_buffer_stripes", g.write_buffer_stripes as usize),
            ("user_segments", g.user_segments as usize),
            ("max_volumes", g.max_volumes as usize),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        if (g.user_segments as u64) * (g.stripes_per_segment as u64) >= u32::MAX as u64 {
            return Err(ConfigError::Invalid(
                "user area stripe count does not fit a 32-bit stripe id".to_string(),
            ));
        }

        if self.gc.urgent_threshold > self.gc.normal_threshold {
            return Err(ConfigError::Invalid(format!(
                "urgent_threshold ({}) must not exceed normal_threshold ({})",
                self.gc.urgent_threshold, self.gc.normal_threshold
            )));
        }

        Ok(())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
