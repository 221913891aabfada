//! All backend logic independent of how it is run.
//!
//! Documents are split into overlapping chunks ([chunks]), fanned out to a pool
//! of workers that embed each one and insert it into a vector store ([index]),
//! and retrieved by similarity ([query]). The target collection is prepared
//! once up front ([lifecycle]). Config lives in the app data directory
//! (see [app_data]).

pub mod app_data;
pub mod chunks;
pub mod config;
pub mod docs;
pub mod index;
pub mod lifecycle;
pub mod ollama;
pub mod query;
pub mod source;
pub mod store;

pub use app_data::app_data_dir;
pub use chunks::{chunk_text, Chunk, ChunkSettings, Chunker, Chunks};
pub use config::{config_path, load_config, load_config_from, save_config, set_source_dir, Config, ConfigError};
pub use docs::{list_documents, read_line_range, Document, SourceError};
pub use index::{until_cancelled, IndexError, IndexOptions, IndexStats, Indexer};
pub use lifecycle::{ensure_collection, CollectionState};
pub use ollama::{probe_dimension, EmbedError, Embedder, OllamaClient};
pub use query::{Hit, Searcher};
pub use source::{produce_chunks, SourceStats};
pub use store::{CollectionPath, MemoryStore, MilvusStore, StoreError, VectorStore};

/// Returns a short status string. Used to verify the backend is wired up.
pub fn status() -> &'static str {
    "lodestone-core ready"
}
