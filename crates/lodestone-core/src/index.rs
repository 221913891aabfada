//! Index pipeline: one producer chunks documents onto a bounded queue, a pool of
//! workers embeds each chunk and inserts it into the vector store.
//!
//! The queue is closed when the producer returns. The first failing task cancels
//! the rest: the producer stops sending, idle workers stop dequeuing, and busy
//! workers finish their current chunk. Rows already inserted are not rolled back.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chunks::{Chunk, ChunkSettings};
use crate::config::ConfigError;
use crate::docs::SourceError;
use crate::ollama::{check_dimension, EmbedError, Embedder};
use crate::source::{produce_chunks, SourceStats};
use crate::store::{
    CollectionPath, ColumnarRecord, SchemaError, StoreError, VectorStore, FILENAME_FIELD,
    LINE_END_FIELD, LINE_START_FIELD, VECTOR_FIELD,
};

/// Pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    pub chunking: ChunkSettings,
    pub queue_capacity: usize,
    pub workers: usize,
    /// Vector size the collection was created with.
    pub dimension: usize,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks_produced: usize,
    pub chunks_inserted: usize,
    pub elapsed: Duration,
}

enum TaskOutcome {
    Produced(SourceStats),
    Drained(usize),
}

type TaskResult = Result<TaskOutcome, IndexError>;

/// Embeds and stores chunks into one collection.
#[derive(Clone)]
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    target: Arc<CollectionPath>,
    options: IndexOptions,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        target: CollectionPath,
        options: IndexOptions,
    ) -> Self {
        Self {
            embedder,
            store,
            target: Arc::new(target),
            options,
        }
    }

    /// Chunks every document under `root` and indexes the chunks concurrently.
    /// Returns once the producer and every worker have exited.
    pub async fn index_directory(
        &self,
        root: &Path,
        cancel: CancellationToken,
    ) -> Result<IndexStats, IndexError> {
        let started = Instant::now();
        let stop = cancel.child_token();
        let (tx, rx) = flume::bounded(self.options.queue_capacity.max(1));

        let mut tasks = JoinSet::new();
        let root = root.to_path_buf();
        let chunking = self.options.chunking;
        let producer_stop = stop.clone();
        tasks.spawn(async move {
            produce_chunks(&root, chunking, tx, producer_stop)
                .await
                .map(TaskOutcome::Produced)
                .map_err(IndexError::from)
        });
        self.spawn_workers(&mut tasks, rx, &stop, &cancel);

        let stats = join_tasks(tasks, &stop, &cancel).await?;
        let stats = IndexStats {
            elapsed: started.elapsed(),
            ..stats
        };
        tracing::info!(
            collection = %self.target,
            documents = stats.documents,
            chunks = stats.chunks_inserted,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "indexing complete"
        );
        Ok(stats)
    }

    /// Runs only the worker pool over an existing queue, until it is closed and empty.
    pub async fn drain_queue(
        &self,
        queue: flume::Receiver<Chunk>,
        cancel: CancellationToken,
    ) -> Result<IndexStats, IndexError> {
        let started = Instant::now();
        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        self.spawn_workers(&mut tasks, queue, &stop, &cancel);
        let stats = join_tasks(tasks, &stop, &cancel).await?;
        Ok(IndexStats {
            elapsed: started.elapsed(),
            ..stats
        })
    }

    fn spawn_workers(
        &self,
        tasks: &mut JoinSet<TaskResult>,
        queue: flume::Receiver<Chunk>,
        stop: &CancellationToken,
        cancel: &CancellationToken,
    ) {
        let workers = self.options.workers.max(1);
        tracing::debug!(workers, collection = %self.target, "starting index workers");
        for id in 0..workers {
            let worker = Worker {
                id,
                embedder: self.embedder.clone(),
                store: self.store.clone(),
                target: self.target.clone(),
                dimension: self.options.dimension,
                queue: queue.clone(),
                stop: stop.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(async move { worker.run().await.map(TaskOutcome::Drained) });
        }
    }
}

struct Worker {
    id: usize,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    target: Arc<CollectionPath>,
    dimension: usize,
    queue: flume::Receiver<Chunk>,
    /// Pipeline-wide stop: checked before taking the next chunk.
    stop: CancellationToken,
    /// External cancellation: also aborts in-flight embed and insert calls.
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<usize, IndexError> {
        let mut inserted = 0;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                next = self.queue.recv_async() => match next {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                },
            };
            if let Err(e) = self.index_chunk(&chunk).await {
                tracing::warn!(
                    worker = self.id,
                    filename = %chunk.filename,
                    line_start = chunk.line_start,
                    error = %e,
                    "failed to index chunk"
                );
                return Err(e);
            }
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Embed, then insert. Exactly one attempt at each.
    async fn index_chunk(&self, chunk: &Chunk) -> Result<(), IndexError> {
        let vector = until_cancelled(&self.cancel, self.embedder.embed(&chunk.content)).await?;
        check_dimension(&vector, self.dimension)?;

        let record = ColumnarRecord::new()
            .with_int64_column(LINE_START_FIELD, vec![chunk.line_start as i64])
            .with_int64_column(LINE_END_FIELD, vec![chunk.line_end as i64])
            .with_varchar_column(FILENAME_FIELD, vec![chunk.filename.clone()])
            .with_float_vector_column(VECTOR_FIELD, self.dimension, vec![vector]);
        until_cancelled(&self.cancel, self.store.insert(&self.target, record)).await?;
        tracing::debug!(
            worker = self.id,
            filename = %chunk.filename,
            line_start = chunk.line_start,
            line_end = chunk.line_end,
            "inserted chunk"
        );
        Ok(())
    }
}

/// Awaits an embedder or store call, giving up with [`IndexError::Cancelled`]
/// as soon as `cancel` fires. The abandoned call is dropped.
pub async fn until_cancelled<T, E, F>(
    cancel: &CancellationToken,
    call: F,
) -> Result<T, IndexError>
where
    F: Future<Output = Result<T, E>>,
    IndexError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IndexError::Cancelled),
        res = call => Ok(res?),
    }
}

/// Waits for every task. The first root-cause error wins; cancellation fallout
/// from other tasks only reports if nothing better is known.
async fn join_tasks(
    mut tasks: JoinSet<TaskResult>,
    stop: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<IndexStats, IndexError> {
    let mut stats = IndexStats::default();
    let mut failure: Option<IndexError> = None;

    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(IndexError::Task(e.to_string())));
        match result {
            Ok(TaskOutcome::Produced(s)) => {
                stats.documents = s.documents;
                stats.chunks_produced = s.chunks;
            }
            Ok(TaskOutcome::Drained(n)) => stats.chunks_inserted += n,
            Err(e) => {
                stop.cancel();
                let replace = match &failure {
                    None => true,
                    Some(current) => current.is_fallout() && !e.is_fallout(),
                };
                if replace {
                    failure = Some(e);
                }
            }
        }
    }

    match failure {
        Some(e) if e.is_fallout() && cancel.is_cancelled() => Err(IndexError::Cancelled),
        Some(e) => Err(e),
        None if cancel.is_cancelled() => Err(IndexError::Cancelled),
        None => Ok(stats),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("indexing cancelled")]
    Cancelled,
    #[error("indexing task failed: {0}")]
    Task(String),
}

impl From<SchemaError> for IndexError {
    fn from(e: SchemaError) -> Self {
        IndexError::Config(ConfigError::Schema(e))
    }
}

impl IndexError {
    /// Errors caused by another task stopping the pipeline, not a failure of their own.
    fn is_fallout(&self) -> bool {
        matches!(
            self,
            IndexError::Cancelled
                | IndexError::Source(SourceError::Cancelled)
                | IndexError::Source(SourceError::QueueClosed)
        )
    }
}
