//! In-memory vector store. Databases, collections and rows live in the process
//! and are discarded when it exits. Behaves like Milvus where the pipeline can
//! observe it: auto ids, schema checks on insert, search and lookup only on a
//! loaded collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    CollectionPath, CollectionSchema, ColumnarRecord, ConsistencyLevel, DataType, IndexSpec,
    MetricType, Row, SearchResult, StoreError, Value, VectorStore, ID_FIELD,
};

const DEFAULT_DATABASE: &str = "default";

#[derive(Debug)]
struct Collection {
    schema: CollectionSchema,
    index: IndexSpec,
    loaded: bool,
    next_id: i64,
    rows: BTreeMap<i64, Row>,
}

#[derive(Debug, Default)]
struct Database {
    collections: BTreeMap<String, Collection>,
}

/// Vector store held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    databases: Mutex<HashMap<String, Database>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Starts with an empty `default` database, as Milvus does.
    pub fn new() -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), Database::default());
        Self {
            databases: Mutex::new(databases),
        }
    }

    /// Number of rows in a collection, if it exists.
    pub fn row_count(&self, path: &CollectionPath) -> Option<usize> {
        let dbs = self.databases.lock().ok()?;
        dbs.get(&path.database)?
            .collections
            .get(&path.collection)
            .map(|c| c.rows.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Database>>, StoreError> {
        self.databases.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn collection_mut<'a>(
    dbs: &'a mut HashMap<String, Database>,
    path: &CollectionPath,
) -> Result<&'a mut Collection, StoreError> {
    dbs.get_mut(&path.database)
        .ok_or_else(|| StoreError::DatabaseNotFound(path.database.clone()))?
        .collections
        .get_mut(&path.collection)
        .ok_or_else(|| StoreError::CollectionNotFound(path.clone()))
}

fn loaded_collection<'a>(
    dbs: &'a mut HashMap<String, Database>,
    path: &CollectionPath,
) -> Result<&'a mut Collection, StoreError> {
    let coll = collection_mut(dbs, path)?;
    if !coll.loaded {
        return Err(StoreError::NotLoaded(path.clone()));
    }
    Ok(coll)
}

/// Checks one row against the schema. Auto ids must not be supplied.
fn check_row(schema: &CollectionSchema, row: &Row) -> Result<(), StoreError> {
    for name in row.keys() {
        match schema.field(name) {
            Some(f) if f.auto_id => {
                return Err(StoreError::InvalidRecord(format!(
                    "{name} is assigned by the store"
                )))
            }
            Some(_) => {}
            None => return Err(StoreError::UnknownField(name.clone())),
        }
    }
    for field in schema.fields.iter().filter(|f| !f.auto_id) {
        let value = row.get(&field.name).ok_or_else(|| {
            StoreError::InvalidRecord(format!("missing field {}", field.name))
        })?;
        let ok = match (field.data_type, value) {
            (DataType::Int64, Value::Int64(_)) => true,
            (DataType::VarChar { max_length }, Value::VarChar(s)) => {
                if s.len() > max_length {
                    return Err(StoreError::InvalidRecord(format!(
                        "{} exceeds max length {max_length}",
                        field.name
                    )));
                }
                true
            }
            (DataType::FloatVector { dim }, Value::FloatVector(v)) => {
                if v.len() != dim {
                    return Err(StoreError::InvalidRecord(format!(
                        "{} has {} dimensions, expected {dim}",
                        field.name,
                        v.len()
                    )));
                }
                true
            }
            _ => false,
        };
        if !ok {
            return Err(StoreError::InvalidRecord(format!(
                "{} has the wrong type",
                field.name
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_database(&self, name: &str) -> Result<(), StoreError> {
        let mut dbs = self.lock()?;
        if dbs.contains_key(name) {
            return Err(StoreError::DatabaseExists(name.to_string()));
        }
        dbs.insert(name.to_string(), Database::default());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), StoreError> {
        let mut dbs = self.lock()?;
        let db = dbs
            .get(name)
            .ok_or_else(|| StoreError::DatabaseNotFound(name.to_string()))?;
        if !db.collections.is_empty() {
            return Err(StoreError::DatabaseNotEmpty(name.to_string()));
        }
        dbs.remove(name);
        Ok(())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let dbs = self.lock()?;
        let db = dbs
            .get(database)
            .ok_or_else(|| StoreError::DatabaseNotFound(database.to_string()))?;
        Ok(db.collections.keys().cloned().collect())
    }

    async fn create_collection(
        &self,
        path: &CollectionPath,
        schema: &CollectionSchema,
        index: &IndexSpec,
    ) -> Result<(), StoreError> {
        schema.validate()?;
        index.validate(schema)?;
        let mut dbs = self.lock()?;
        let db = dbs
            .get_mut(&path.database)
            .ok_or_else(|| StoreError::DatabaseNotFound(path.database.clone()))?;
        if db.collections.contains_key(&path.collection) {
            return Err(StoreError::CollectionExists(path.clone()));
        }
        db.collections.insert(
            path.collection.clone(),
            Collection {
                schema: schema.clone(),
                index: index.clone(),
                loaded: false,
                next_id: 1,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        let mut dbs = self.lock()?;
        let db = dbs
            .get_mut(&path.database)
            .ok_or_else(|| StoreError::DatabaseNotFound(path.database.clone()))?;
        db.collections
            .remove(&path.collection)
            .map(|_| ())
            .ok_or_else(|| StoreError::CollectionNotFound(path.clone()))
    }

    async fn load_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        collection_mut(&mut *self.lock()?, path)?.loaded = true;
        Ok(())
    }

    async fn release_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        collection_mut(&mut *self.lock()?, path)?.loaded = false;
        Ok(())
    }

    async fn insert(
        &self,
        path: &CollectionPath,
        record: ColumnarRecord,
    ) -> Result<Vec<i64>, StoreError> {
        let rows = record.rows()?;
        let mut dbs = self.lock()?;
        let coll = collection_mut(&mut dbs, path)?;
        for row in &rows {
            check_row(&coll.schema, row)?;
        }
        let pk = coll
            .schema
            .primary_key()
            .map(|f| f.name.clone())
            .unwrap_or_else(|| ID_FIELD.to_string());
        let mut ids = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = coll.next_id;
            coll.next_id += 1;
            row.insert(pk.clone(), Value::Int64(id));
            coll.rows.insert(id, row);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn search(
        &self,
        path: &CollectionPath,
        vector_field: &str,
        queries: &[Vec<f32>],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let mut dbs = self.lock()?;
        let coll = loaded_collection(&mut dbs, path)?;
        let dim = match coll.schema.field(vector_field).map(|f| f.data_type) {
            Some(DataType::FloatVector { dim }) => dim,
            _ => return Err(StoreError::UnknownField(vector_field.to_string())),
        };
        let metric = if coll.index.field == vector_field {
            coll.index.metric
        } else {
            MetricType::default()
        };

        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            if query.len() != dim {
                return Err(StoreError::InvalidRecord(format!(
                    "query has {} dimensions, expected {dim}",
                    query.len()
                )));
            }
            let mut scored: Vec<(i64, f32)> = coll
                .rows
                .iter()
                .filter_map(|(id, row)| match row.get(vector_field) {
                    Some(Value::FloatVector(v)) => Some((*id, score(metric, query, v))),
                    _ => None,
                })
                .collect();
            scored.sort_by(|a, b| {
                let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                let ord = if metric.higher_is_closer() { ord.reverse() } else { ord };
                ord.then(a.0.cmp(&b.0))
            });
            scored.truncate(top_k);
            results.push(SearchResult {
                ids: scored.iter().map(|(id, _)| *id).collect(),
                scores: scored.iter().map(|(_, s)| *s).collect(),
            });
        }
        Ok(results)
    }

    async fn get_by_id(
        &self,
        path: &CollectionPath,
        ids: &[i64],
        output_fields: &[&str],
        _consistency: ConsistencyLevel,
    ) -> Result<Vec<Row>, StoreError> {
        let mut dbs = self.lock()?;
        let coll = loaded_collection(&mut dbs, path)?;
        if let Some(unknown) = output_fields
            .iter()
            .find(|f| coll.schema.field(f).is_none())
        {
            return Err(StoreError::UnknownField(unknown.to_string()));
        }
        let pk = coll
            .schema
            .primary_key()
            .map(|f| f.name.as_str())
            .unwrap_or(ID_FIELD);
        Ok(ids
            .iter()
            .filter_map(|id| coll.rows.get(id))
            .map(|row| {
                row.iter()
                    .filter(|(name, _)| name.as_str() == pk || output_fields.contains(&name.as_str()))
                    .map(|(name, v)| (name.clone(), v.clone()))
                    .collect()
            })
            .collect())
    }
}

fn score(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricType::InnerProduct => dot(a, b),
        MetricType::Cosine => dot(&normalize(a), &normalize(b)),
        MetricType::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    (0..n).map(|i| a[i] * b[i]).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        FILENAME_FIELD, FILENAME_MAX_LENGTH, LINE_END_FIELD, LINE_START_FIELD, VECTOR_FIELD,
    };

    fn path() -> CollectionPath {
        CollectionPath::new("default", "docs")
    }

    fn record(filename: &str, start: i64, end: i64, v: Vec<f32>) -> ColumnarRecord {
        ColumnarRecord::new()
            .with_varchar_column(FILENAME_FIELD, vec![filename.to_string()])
            .with_int64_column(LINE_START_FIELD, vec![start])
            .with_int64_column(LINE_END_FIELD, vec![end])
            .with_float_vector_column(VECTOR_FIELD, v.len(), vec![v])
    }

    async fn store_with(metric: MetricType) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_collection(
                &path(),
                &CollectionSchema::chunks(2),
                &IndexSpec::auto(VECTOR_FIELD, metric),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = store_with(MetricType::InnerProduct).await;
        let a = store.insert(&path(), record("a", 0, 1, vec![1.0, 0.0])).await.unwrap();
        let b = store.insert(&path(), record("b", 1, 2, vec![0.0, 1.0])).await.unwrap();
        assert_eq!((a, b), (vec![1], vec![2]));
        assert_eq!(store.row_count(&path()), Some(2));
    }

    #[tokio::test]
    async fn insert_checks_schema() {
        let store = store_with(MetricType::InnerProduct).await;
        let wrong_dim = store.insert(&path(), record("a", 0, 1, vec![1.0])).await;
        assert!(matches!(wrong_dim, Err(StoreError::InvalidRecord(_))));

        let long_name = "x".repeat(257);
        let too_long = store.insert(&path(), record(&long_name, 0, 1, vec![1.0, 0.0])).await;
        assert!(matches!(too_long, Err(StoreError::InvalidRecord(_))));

        let missing = ColumnarRecord::new().with_int64_column(LINE_START_FIELD, vec![0]);
        assert!(store.insert(&path(), missing).await.is_err());
        assert_eq!(store.row_count(&path()), Some(0));
    }

    #[tokio::test]
    async fn inner_product_search_ranks_best_first() {
        let store = store_with(MetricType::InnerProduct).await;
        let a = store.insert(&path(), record("a", 0, 1, vec![0.9, 0.1])).await.unwrap()[0];
        let b = store.insert(&path(), record("b", 1, 2, vec![0.1, 0.9])).await.unwrap()[0];

        let q = vec![vec![1.0, 0.0]];
        let not_loaded = store.search(&path(), VECTOR_FIELD, &q, 1).await;
        assert!(matches!(not_loaded, Err(StoreError::NotLoaded(_))));

        store.load_collection(&path()).await.unwrap();
        let top1 = store.search(&path(), VECTOR_FIELD, &q, 1).await.unwrap();
        assert_eq!(top1[0].ids, vec![a]);

        let all = store.search(&path(), VECTOR_FIELD, &q, 10).await.unwrap();
        assert_eq!(all[0].ids, vec![a, b]);
        assert!(all[0].scores[0] > all[0].scores[1]);
    }

    #[tokio::test]
    async fn l2_search_ranks_nearest_first() {
        let store = store_with(MetricType::L2).await;
        store.insert(&path(), record("far", 0, 1, vec![5.0, 5.0])).await.unwrap();
        let near = store.insert(&path(), record("near", 0, 1, vec![1.0, 1.0])).await.unwrap()[0];
        store.load_collection(&path()).await.unwrap();
        let res = store
            .search(&path(), VECTOR_FIELD, &[vec![1.0, 1.2]], 1)
            .await
            .unwrap();
        assert_eq!(res[0].ids, vec![near]);
    }

    #[tokio::test]
    async fn get_by_id_returns_requested_fields() {
        let store = store_with(MetricType::InnerProduct).await;
        let id = store.insert(&path(), record("a.txt", 3, 7, vec![1.0, 0.0])).await.unwrap()[0];
        store.load_collection(&path()).await.unwrap();
        let rows = store
            .get_by_id(
                &path(),
                &[id, 999],
                &[FILENAME_FIELD, LINE_START_FIELD],
                ConsistencyLevel::Strong,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][ID_FIELD].as_i64(), Some(id));
        assert_eq!(rows[0][FILENAME_FIELD].as_str(), Some("a.txt"));
        assert_eq!(rows[0][LINE_START_FIELD].as_i64(), Some(3));
        assert!(!rows[0].contains_key(LINE_END_FIELD));
        assert!(!rows[0].contains_key(VECTOR_FIELD));
    }

    #[tokio::test]
    async fn database_with_collections_cannot_be_dropped() {
        let store = MemoryStore::new();
        store.create_database("nvim").await.unwrap();
        let p = CollectionPath::new("nvim", "docs");
        store
            .create_collection(
                &p,
                &CollectionSchema::chunks(2),
                &IndexSpec::auto(VECTOR_FIELD, MetricType::InnerProduct),
            )
            .await
            .unwrap();
        assert!(matches!(
            store.drop_database("nvim").await,
            Err(StoreError::DatabaseNotEmpty(_))
        ));
        store.drop_collection(&p).await.unwrap();
        store.drop_database("nvim").await.unwrap();
        assert_eq!(store.list_databases().await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn varchar_limit_counts_utf8_bytes() {
        let store = store_with(MetricType::InnerProduct).await;
        // 128 two-byte characters: 128 chars but 256 bytes, right at the limit.
        let at_limit = "é".repeat(FILENAME_MAX_LENGTH / 2);
        store.insert(&path(), record(&at_limit, 0, 1, vec![1.0, 0.0])).await.unwrap();

        let over = "é".repeat(FILENAME_MAX_LENGTH / 2 + 1);
        assert!(over.chars().count() < FILENAME_MAX_LENGTH);
        let err = store
            .insert(&path(), record(&over, 0, 1, vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
