//! Configuration management for sediment
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file, then `SEDIMENT_*` environment variables read once at startup.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use sediment_storage::kv::source_dir;
use sediment_storage::{
    CompressionAlgorithm, KvEngineKind, RedbOptions, StorageType, DEFAULT_MAX_TXN_BYTES,
};

use crate::error::{Error, Result};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_RESULTS: usize = 10000;
pub const DEFAULT_AGGREGATION_TERMS_SIZE: usize = 1000;

pub const ENV_DATA_PATH: &str = "SEDIMENT_DATA_PATH";
pub const ENV_BATCH_SIZE: &str = "SEDIMENT_BATCH_SIZE";
pub const ENV_MAX_RESULTS: &str = "SEDIMENT_MAX_RESULTS";
pub const ENV_AGGREGATION_TERMS_SIZE: &str = "SEDIMENT_AGGREGATION_TERMS_SIZE";
pub const ENV_SOURCE_STORAGE_ENGINE: &str = "SEDIMENT_SOURCE_STORAGE_ENGINE";
pub const ENV_INDEX_COMPRESS_ALGORITHM: &str = "SEDIMENT_INDEX_COMPRESS_ALGORITHM";
pub const ENV_DEFAULT_STORAGE_TYPE: &str = "SEDIMENT_DEFAULT_STORAGE_TYPE";
pub const ENV_KV_MAX_TXN_BYTES: &str = "SEDIMENT_KV_MAX_TXN_BYTES";

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Root of all on-disk state
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Documents per committed batch during bulk ingestion
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum result window for searches
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Cap on terms returned by a terms aggregation
    #[serde(default = "default_aggregation_terms_size")]
    pub aggregation_terms_size: usize,

    /// Engine used for source documents
    #[serde(default, deserialize_with = "engine_by_name")]
    pub source_storage_engine: KvEngineKind,

    /// Codec for the compressed segment directory
    #[serde(default, deserialize_with = "compression_by_name")]
    pub index_compress_algorithm: CompressionAlgorithm,

    /// Segment backend for indexes created without an explicit one
    #[serde(default, deserialize_with = "storage_type_by_name")]
    pub default_storage_type: StorageType,

    /// Bulk transaction ceiling of the redb source store, in bytes
    #[serde(default = "default_kv_max_txn_bytes")]
    pub kv_max_txn_bytes: usize,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

fn default_aggregation_terms_size() -> usize {
    DEFAULT_AGGREGATION_TERMS_SIZE
}

fn default_kv_max_txn_bytes() -> usize {
    DEFAULT_MAX_TXN_BYTES
}

// Names in the file resolve like environment values: unknown ones fall back to the default.
fn by_name<'de, D, T>(deserializer: D, parse: fn(&str) -> T) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    Ok(parse(&name))
}

fn engine_by_name<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<KvEngineKind, D::Error> {
    by_name(d, KvEngineKind::from_name)
}

fn compression_by_name<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<CompressionAlgorithm, D::Error> {
    by_name(d, CompressionAlgorithm::from_name)
}

fn storage_type_by_name<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<StorageType, D::Error> {
    by_name(d, StorageType::from_name)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            batch_size: default_batch_size(),
            max_results: default_max_results(),
            aggregation_terms_size: default_aggregation_terms_size(),
            source_storage_engine: KvEngineKind::default(),
            index_compress_algorithm: CompressionAlgorithm::default(),
            default_storage_type: StorageType::default(),
            kv_max_txn_bytes: default_kv_max_txn_bytes(),
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if s == "~" {
        dirs::home_dir().ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

fn parse_usize(name: &str, value: &str, current: usize) -> usize {
    match value.trim().parse::<usize>() {
        Ok(v) if v > 0 => v,
        _ => {
            warn!(var = name, value, "ignoring invalid numeric setting, keeping {}", current);
            current
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.expand_paths()?;
        Ok(config)
    }

    /// Load a TOML file (defaults when `path` is `None`), then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Config::default(),
        };
        config.apply_env();
        config.expand_paths()?;
        Ok(config)
    }

    /// Parse a TOML config file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `SEDIMENT_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Empty values are skipped. Unparseable numbers keep the current value.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_DATA_PATH) {
            self.data_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_BATCH_SIZE) {
            self.batch_size = parse_usize(ENV_BATCH_SIZE, &v, self.batch_size);
        }
        if let Some(v) = get(ENV_MAX_RESULTS) {
            self.max_results = parse_usize(ENV_MAX_RESULTS, &v, self.max_results);
        }
        if let Some(v) = get(ENV_AGGREGATION_TERMS_SIZE) {
            self.aggregation_terms_size =
                parse_usize(ENV_AGGREGATION_TERMS_SIZE, &v, self.aggregation_terms_size);
        }
        if let Some(v) = get(ENV_SOURCE_STORAGE_ENGINE) {
            self.source_storage_engine = KvEngineKind::from_name(&v);
        }
        if let Some(v) = get(ENV_INDEX_COMPRESS_ALGORITHM) {
            self.index_compress_algorithm = CompressionAlgorithm::from_name(&v);
        }
        if let Some(v) = get(ENV_DEFAULT_STORAGE_TYPE) {
            self.default_storage_type = StorageType::from_name(&v);
        }
        if let Some(v) = get(ENV_KV_MAX_TXN_BYTES) {
            self.kv_max_txn_bytes = parse_usize(ENV_KV_MAX_TXN_BYTES, &v, self.kv_max_txn_bytes);
        }
    }

    /// Expand ~ in all paths
    fn expand_paths(&mut self) -> Result<()> {
        self.data_path = expand_tilde(&self.data_path)?;
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml_string()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Segment directory of an index: `{data_path}/{index}`
    pub fn segments_dir(&self, index: &str) -> PathBuf {
        self.data_path.join(index)
    }

    /// Source store directory of an index: `{data_path}/_storage/{index}`
    pub fn source_dir(&self, index: &str) -> PathBuf {
        source_dir(&self.data_path, index)
    }

    pub fn redb_options(&self) -> RedbOptions {
        RedbOptions {
            max_txn_bytes: self.kv_max_txn_bytes,
        }
    }
}
