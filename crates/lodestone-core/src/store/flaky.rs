//! Test wrapper around [`MemoryStore`] that fails or stalls chosen calls.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    CollectionPath, CollectionSchema, ColumnarRecord, ConsistencyLevel, IndexSpec, MemoryStore,
    Row, SearchResult, StoreError, VectorStore,
};

pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryStore,
    /// Insert call (1-based) that fails.
    pub(crate) fail_insert_on: Option<usize>,
    /// `load_collection` never returns.
    pub(crate) stall_load: bool,
    inserts: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_insert_on: None,
            stall_load: false,
            inserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VectorStore for FlakyStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_databases().await
    }

    async fn create_database(&self, name: &str) -> Result<(), StoreError> {
        self.inner.create_database(name).await
    }

    async fn drop_database(&self, name: &str) -> Result<(), StoreError> {
        self.inner.drop_database(name).await
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_collections(database).await
    }

    async fn create_collection(
        &self,
        path: &CollectionPath,
        schema: &CollectionSchema,
        index: &IndexSpec,
    ) -> Result<(), StoreError> {
        self.inner.create_collection(path, schema, index).await
    }

    async fn drop_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        self.inner.drop_collection(path).await
    }

    async fn load_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        if self.stall_load {
            std::future::pending::<()>().await;
        }
        self.inner.load_collection(path).await
    }

    async fn release_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        self.inner.release_collection(path).await
    }

    async fn insert(
        &self,
        path: &CollectionPath,
        record: ColumnarRecord,
    ) -> Result<Vec<i64>, StoreError> {
        let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_insert_on == Some(n) {
            return Err(StoreError::Api {
                code: 65535,
                message: format!("injected failure on insert {n}"),
            });
        }
        self.inner.insert(path, record).await
    }

    async fn search(
        &self,
        path: &CollectionPath,
        vector_field: &str,
        queries: &[Vec<f32>],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        self.inner.search(path, vector_field, queries, top_k).await
    }

    async fn get_by_id(
        &self,
        path: &CollectionPath,
        ids: &[i64],
        output_fields: &[&str],
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner.get_by_id(path, ids, output_fields, consistency).await
    }
}
