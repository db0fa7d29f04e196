//! Runtime settings for a node, loaded from an optional TOML file and
//! `LIQUID_`-prefixed environment variables.
//!
//! Nested fields are set from the environment with a double underscore, for
//! example `LIQUID_MRTASK__THREADS=4` or `LIQUID_CACHE__MAX_BYTES=1048576`.
//! Every field has a default, so an empty configuration is valid.
use crate::error::LiquidError;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub mrtask: MRTaskConfig,
    pub ingest: IngestConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

/// Bounds on the cache of values fetched from other nodes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total deep size of cached values in bytes. `0` uses a third of the
    /// physical memory of the machine.
    pub max_bytes: u64,
    /// Maximum number of cached values
    pub max_values: usize,
    /// Directory owned values are spilled to, kept in memory when unset
    pub spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MRTaskConfig {
    /// Threads used by the fork-join on each node, `0` means one per core
    pub threads: usize,
    /// Stop splitting once a branch holds this many chunks or fewer
    pub min_leaf_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Rows per chunk used by `FrameBuilder` unless a layout is given
    pub rows_per_chunk: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Capacity of the inbound and per-peer outbound message queues
    pub channel_capacity: usize,
    /// Largest frame accepted on a TCP connection
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug` or `trace`
    pub level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cache: CacheConfig::default(),
            mrtask: MRTaskConfig::default(),
            ingest: IngestConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_bytes: 0,
            max_values: 1024,
            spill_dir: None,
        }
    }
}

impl Default for MRTaskConfig {
    fn default() -> Self {
        MRTaskConfig {
            threads: 0,
            min_leaf_chunks: 1,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            rows_per_chunk: 1 << 16,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            channel_capacity: 64,
            max_frame_bytes: 1_073_741_824, // 1 GiB
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl MRTaskConfig {
    /// The number of threads to use, resolving `0` to the number of cores
    pub fn thread_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

impl Settings {
    /// Loads settings from the TOML file at `path` (if given, the file must
    /// exist) overlaid with `LIQUID_` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, LiquidError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("LIQUID")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
