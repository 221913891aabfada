//! Persisted config (embedding model, store location, chunking, search) in the
//! app data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app_data;
use crate::chunks::{ChunkSettings, DEFAULT_CHUNK_SIZE, DEFAULT_MARGIN};
use crate::index::IndexOptions;
use crate::ollama::{DEFAULT_BASE_URL, DEFAULT_EMBED_DIM, DEFAULT_EMBED_MODEL};
use crate::store::milvus::DEFAULT_MILVUS_URL;
use crate::store::{Backend, CollectionPath, CollectionSchema, IndexSpec, MetricType, SchemaError, VECTOR_FIELD};

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Ollama base URL.
    pub base_url: String,
    pub model: String,
    /// Output size of `model`. Must match the collection's vector field.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_EMBED_MODEL.to_string(),
            dimension: DEFAULT_EMBED_DIM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub url: String,
    pub token: Option<String>,
    pub database: String,
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: DEFAULT_MILVUS_URL.to_string(),
            token: None,
            database: "nvim".to_string(),
            collection: "docs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Directory of plain-text documents to index.
    pub source_dir: String,
    /// Paragraph breaks per chunk.
    pub chunk_size: usize,
    /// Lines carried over from the previous chunk.
    pub margin: usize,
    pub queue_capacity: usize,
    /// Worker count. Defaults to the host's available parallelism.
    pub workers: Option<usize>,
    /// Drop and recreate the database if it already exists.
    pub overwrite: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            source_dir: "nvim-docs".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            margin: DEFAULT_MARGIN,
            queue_capacity: 4,
            workers: None,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { top_k: 10 }
    }
}

impl Config {
    /// Fails on settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.embedding.model.trim().is_empty() {
            return invalid("embedding.model must not be empty");
        }
        if self.store.database.trim().is_empty() || self.store.collection.trim().is_empty() {
            return invalid("store.database and store.collection must not be empty");
        }
        if self.indexing.chunk_size == 0 {
            return invalid("indexing.chunk_size must be at least 1");
        }
        if self.indexing.queue_capacity == 0 {
            return invalid("indexing.queue_capacity must be at least 1");
        }
        if self.indexing.workers == Some(0) {
            return invalid("indexing.workers must be at least 1");
        }
        if self.search.top_k == 0 {
            return invalid("search.top_k must be at least 1");
        }
        self.schema().validate()?;
        self.index_spec().validate(&self.schema())?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn collection_path(&self) -> CollectionPath {
        CollectionPath::new(&self.store.database, &self.store.collection)
    }

    pub fn schema(&self) -> CollectionSchema {
        CollectionSchema::chunks(self.embedding.dimension)
    }

    pub fn index_spec(&self) -> IndexSpec {
        IndexSpec::auto(VECTOR_FIELD, MetricType::InnerProduct)
    }

    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            chunk_size: self.indexing.chunk_size,
            margin: self.indexing.margin,
        }
    }

    pub fn index_options(&self) -> IndexOptions {
        let workers = self.indexing.workers.unwrap_or_else(default_workers);
        IndexOptions {
            chunking: self.chunk_settings(),
            queue_capacity: self.indexing.queue_capacity,
            workers,
            dimension: self.embedding.dimension,
        }
    }
}

/// Host parallelism, or 1 if it can't be determined.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Path of the config file in the app data directory.
pub fn config_path() -> Option<PathBuf> {
    app_data::app_data_dir().map(|d| d.join(CONFIG_FILENAME))
}

/// Load config from the app data directory. Returns default config if missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = config_path() else {
        return Config::default();
    };
    let Ok(s) = std::fs::read_to_string(&path) else {
        return Config::default();
    };
    toml::from_str(&s).unwrap_or_default()
}

/// Load config from an explicit file, reporting read and parse errors.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    toml::from_str(&s).map_err(ConfigError::Parse)
}

/// Save config to the app data directory.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoDataDir)?;
    let s = config.to_toml()?;
    std::fs::write(&path, s).map_err(ConfigError::Write)
}

/// Set and persist the document source directory.
pub fn set_source_dir(path: &Path) -> Result<(), ConfigError> {
    let path = path.canonicalize().map_err(ConfigError::Canonicalize)?;
    if !path.is_dir() {
        return Err(ConfigError::NotADirectory(path));
    }
    let mut config = load_config();
    config.indexing.source_dir = path.to_string_lossy().into_owned();
    save_config(&config)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine app data directory")]
    NoDataDir,
    #[error("failed to read config: {0}")]
    Read(std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config: {0}")]
    Write(std::io::Error),
    #[error("failed to resolve path: {0}")]
    Canonicalize(std::io::Error),
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid collection schema: {0}")]
    Schema(#[from] SchemaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.collection_path(), CollectionPath::new("nvim", "docs"));
        assert_eq!(c.chunk_settings(), ChunkSettings { chunk_size: 5, margin: 3 });
        assert!(c.index_options().workers >= 1);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[store]\nbackend = \"memory\"\n\n[indexing]\nworkers = 2\nmargin = 1\n",
        )
        .unwrap();
        let c = load_config_from(&path).unwrap();
        assert_eq!(c.store.backend, Backend::Memory);
        assert_eq!(c.store.collection, "docs");
        assert_eq!(c.indexing.workers, Some(2));
        assert_eq!(c.indexing.margin, 1);
        assert_eq!(c.indexing.chunk_size, 5);
        assert_eq!(c.embedding.dimension, 768);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut c = Config::default();
        c.embedding.dimension = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Schema(_))));

        let mut c = Config::default();
        c.indexing.workers = Some(0);
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = Config::default();
        c.indexing.queue_capacity = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut c = Config::default();
        c.store.token = Some("root:Milvus".to_string());
        c.indexing.overwrite = true;
        let s = c.to_toml().unwrap();
        assert_eq!(toml::from_str::<Config>(&s).unwrap(), c);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[indexing\nworkers = ").unwrap();
        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse(_))));
    }
}
