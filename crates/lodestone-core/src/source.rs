//! Chunk source: the single producer feeding the indexing queue.
//!
//! Reads each document line by line, runs the [`Chunker`] over it and sends every
//! chunk to the bounded queue. Returning drops the only sender, which closes the
//! queue; workers treat that as the end of input.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::chunks::{Chunk, ChunkSettings, Chunker};
use crate::docs::{list_documents, Document, SourceError};

/// What the producer got through before returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub documents: usize,
    pub chunks: usize,
}

/// Chunks every document under `root` onto `queue`. Blocks while the queue is full.
/// Stops with [`SourceError::Cancelled`] once `stop` fires.
pub async fn produce_chunks(
    root: &Path,
    settings: ChunkSettings,
    queue: flume::Sender<Chunk>,
    stop: CancellationToken,
) -> Result<SourceStats, SourceError> {
    let root_buf = root.to_path_buf();
    let listed = tokio::task::spawn_blocking(move || list_documents(&root_buf)).await;
    let docs = listing_result(listed)?;
    tracing::info!(root = %root.display(), documents = docs.len(), "chunking documents");

    let mut stats = SourceStats::default();
    for doc in &docs {
        stats.chunks += send_document(doc, settings, &queue, &stop).await?;
        stats.documents += 1;
    }
    Ok(stats)
}

fn listing_result(
    joined: Result<Result<Vec<Document>, SourceError>, JoinError>,
) -> Result<Vec<Document>, SourceError> {
    joined.map_err(|e| SourceError::ListingTask(e.to_string()))?
}

async fn send_document(
    doc: &Document,
    settings: ChunkSettings,
    queue: &flume::Sender<Chunk>,
    stop: &CancellationToken,
) -> Result<usize, SourceError> {
    let read_err = |e| SourceError::Read(doc.path.clone(), e);
    let file = File::open(&doc.path).await.map_err(read_err)?;
    let mut lines = BufReader::new(file).lines();
    let mut chunker = Chunker::new(doc.filename.clone(), settings);
    let mut sent = 0;

    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => return Err(SourceError::Cancelled),
            line = lines.next_line() => line.map_err(read_err)?,
        };
        let Some(line) = line else { break };
        if let Some(chunk) = chunker.push_line(&line) {
            send(queue, chunk, stop).await?;
            sent += 1;
        }
    }
    if let Some(chunk) = chunker.finish() {
        send(queue, chunk, stop).await?;
        sent += 1;
    }
    tracing::debug!(filename = %doc.filename, chunks = sent, "document chunked");
    Ok(sent)
}

async fn send(
    queue: &flume::Sender<Chunk>,
    chunk: Chunk,
    stop: &CancellationToken,
) -> Result<(), SourceError> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(SourceError::Cancelled),
        sent = queue.send_async(chunk) => sent.map_err(|_| SourceError::QueueClosed),
    }
}
