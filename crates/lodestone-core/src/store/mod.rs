//! Vector store interface: databases, schema'd collections, columnar insert,
//! similarity search and lookup by primary key.
//!
//! Two backends: [`MemoryStore`] (in-process) and [`MilvusStore`] (Milvus REST API).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
pub(crate) mod flaky;
pub mod memory;
pub mod milvus;

pub use memory::MemoryStore;
pub use milvus::MilvusStore;

pub const ID_FIELD: &str = "id";
pub const FILENAME_FIELD: &str = "filename";
pub const LINE_START_FIELD: &str = "line_start";
pub const LINE_END_FIELD: &str = "line_end";
pub const VECTOR_FIELD: &str = "content";
pub const FILENAME_MAX_LENGTH: usize = 256;

/// A collection inside a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    pub database: String,
    pub collection: String,
}

impl CollectionPath {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int64,
    VarChar { max_length: usize },
    FloatVector { dim: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub data_type: DataType,
    pub is_primary: bool,
    pub auto_id: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_primary: false,
            auto_id: false,
        }
    }

    /// Auto-assigned int64 primary key.
    pub fn auto_id(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Int64,
            is_primary: true,
            auto_id: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// The indexed-chunk schema: auto id, filename, line range and the chunk embedding.
    pub fn chunks(dim: usize) -> Self {
        Self {
            fields: vec![
                FieldSchema::auto_id(ID_FIELD),
                FieldSchema::new(
                    FILENAME_FIELD,
                    DataType::VarChar {
                        max_length: FILENAME_MAX_LENGTH,
                    },
                ),
                FieldSchema::new(LINE_START_FIELD, DataType::Int64),
                FieldSchema::new(LINE_END_FIELD, DataType::Int64),
                FieldSchema::new(VECTOR_FIELD, DataType::FloatVector { dim }),
            ],
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary)
    }

    /// Checks the schema is one a store can create: exactly one int64 primary key,
    /// unique field names, non-zero string lengths and vector dimensions.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let primaries: Vec<_> = self.fields.iter().filter(|f| f.is_primary).collect();
        match primaries.as_slice() {
            [pk] if pk.data_type == DataType::Int64 => {}
            [pk] => return Err(SchemaError::PrimaryKeyType(pk.name.clone())),
            _ => return Err(SchemaError::PrimaryKeyCount(primaries.len())),
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(SchemaError::EmptyFieldName);
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
            match field.data_type {
                DataType::VarChar { max_length: 0 } => {
                    return Err(SchemaError::ZeroLength(field.name.clone()))
                }
                DataType::FloatVector { dim: 0 } => {
                    return Err(SchemaError::ZeroDimension(field.name.clone()))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema needs exactly one primary key, found {0}")]
    PrimaryKeyCount(usize),
    #[error("primary key {0} must be int64")]
    PrimaryKeyType(String),
    #[error("field name must not be empty")]
    EmptyFieldName,
    #[error("duplicate field {0}")]
    DuplicateField(String),
    #[error("varchar field {0} has max length 0")]
    ZeroLength(String),
    #[error("vector field {0} has dimension 0")]
    ZeroDimension(String),
    #[error("index field {0} is not a float vector field")]
    IndexField(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MetricType {
    #[default]
    #[serde(rename = "IP")]
    InnerProduct,
    #[serde(rename = "COSINE")]
    Cosine,
    #[serde(rename = "L2")]
    L2,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::InnerProduct => "IP",
            MetricType::Cosine => "COSINE",
            MetricType::L2 => "L2",
        }
    }

    /// Whether larger scores mean closer vectors.
    pub fn higher_is_closer(self) -> bool {
        !matches!(self, MetricType::L2)
    }
}

/// Similarity index over a vector field. Index parameters are left to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub metric: MetricType,
}

impl IndexSpec {
    pub fn auto(field: impl Into<String>, metric: MetricType) -> Self {
        Self {
            field: field.into(),
            metric,
        }
    }

    pub fn validate(&self, schema: &CollectionSchema) -> Result<(), SchemaError> {
        match schema.field(&self.field).map(|f| f.data_type) {
            Some(DataType::FloatVector { .. }) => Ok(()),
            _ => Err(SchemaError::IndexField(self.field.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int64(Vec<i64>),
    VarChar(Vec<String>),
    FloatVector { dim: usize, rows: Vec<Vec<f32>> },
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::VarChar(v) => v.len(),
            ColumnData::FloatVector { rows, .. } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value(&self, row: usize) -> Option<Value> {
        Some(match self {
            ColumnData::Int64(v) => Value::Int64(*v.get(row)?),
            ColumnData::VarChar(v) => Value::VarChar(v.get(row)?.clone()),
            ColumnData::FloatVector { rows, .. } => Value::FloatVector(rows.get(row)?.clone()),
        })
    }
}

/// Column-oriented insert payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnarRecord {
    pub columns: Vec<(String, ColumnData)>,
}

impl ColumnarRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_int64_column(mut self, name: &str, values: Vec<i64>) -> Self {
        self.columns.push((name.to_string(), ColumnData::Int64(values)));
        self
    }

    pub fn with_varchar_column(mut self, name: &str, values: Vec<String>) -> Self {
        self.columns.push((name.to_string(), ColumnData::VarChar(values)));
        self
    }

    pub fn with_float_vector_column(mut self, name: &str, dim: usize, rows: Vec<Vec<f32>>) -> Self {
        self.columns
            .push((name.to_string(), ColumnData::FloatVector { dim, rows }));
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Number of rows, or an error if the columns disagree.
    pub fn row_count(&self) -> Result<usize, StoreError> {
        let mut lens = self.columns.iter().map(|(_, c)| c.len());
        let first = lens.next().unwrap_or(0);
        if lens.any(|l| l != first) {
            return Err(StoreError::InvalidRecord(
                "columns have different lengths".to_string(),
            ));
        }
        Ok(first)
    }

    /// Row-oriented view, one map per row.
    pub fn rows(&self) -> Result<Vec<Row>, StoreError> {
        let n = self.row_count()?;
        Ok((0..n)
            .map(|i| {
                self.columns
                    .iter()
                    .filter_map(|(name, col)| col.value(i).map(|v| (name.clone(), v)))
                    .collect()
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int64(i64),
    VarChar(String),
    FloatVector(Vec<f32>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::VarChar(s) => Some(s),
            _ => None,
        }
    }
}

pub type Row = BTreeMap<String, Value>;

/// Hits for one query vector, best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub ids: Vec<i64>,
    pub scores: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyLevel {
    #[default]
    Strong,
    Session,
    Bounded,
    Eventually,
}

impl ConsistencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsistencyLevel::Strong => "Strong",
            ConsistencyLevel::Session => "Session",
            ConsistencyLevel::Bounded => "Bounded",
            ConsistencyLevel::Eventually => "Eventually",
        }
    }
}

/// Operations the indexer and searcher issue against a vector database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError>;
    async fn create_database(&self, name: &str) -> Result<(), StoreError>;
    async fn drop_database(&self, name: &str) -> Result<(), StoreError>;

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;
    async fn create_collection(
        &self,
        path: &CollectionPath,
        schema: &CollectionSchema,
        index: &IndexSpec,
    ) -> Result<(), StoreError>;
    async fn drop_collection(&self, path: &CollectionPath) -> Result<(), StoreError>;
    /// Returns once the collection is ready to serve searches.
    async fn load_collection(&self, path: &CollectionPath) -> Result<(), StoreError>;
    async fn release_collection(&self, path: &CollectionPath) -> Result<(), StoreError>;

    /// Inserts all rows of `record`; returns the assigned primary keys.
    async fn insert(
        &self,
        path: &CollectionPath,
        record: ColumnarRecord,
    ) -> Result<Vec<i64>, StoreError>;
    async fn search(
        &self,
        path: &CollectionPath,
        vector_field: &str,
        queries: &[Vec<f32>],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, StoreError>;
    async fn get_by_id(
        &self,
        path: &CollectionPath,
        ids: &[i64],
        output_fields: &[&str],
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Row>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database not found: {0}")]
    DatabaseNotFound(String),
    #[error("database already exists: {0}")]
    DatabaseExists(String),
    #[error("database {0} still has collections")]
    DatabaseNotEmpty(String),
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionPath),
    #[error("collection already exists: {0}")]
    CollectionExists(CollectionPath),
    #[error("collection not loaded: {0}")]
    NotLoaded(CollectionPath),
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("invalid store URL: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("unexpected store response: {0}")]
    Decode(String),
    #[error("timed out waiting for {0} to load")]
    LoadTimeout(CollectionPath),
    #[error("store state poisoned")]
    Poisoned,
}

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Milvus,
    Memory,
}

/// Opens the configured backend.
pub fn open(
    backend: Backend,
    url: &str,
    token: Option<&str>,
) -> Result<Arc<dyn VectorStore>, StoreError> {
    Ok(match backend {
        Backend::Milvus => Arc::new(MilvusStore::new(url, token)?),
        Backend::Memory => Arc::new(MemoryStore::new()),
    })
}
