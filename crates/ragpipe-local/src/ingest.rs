//! URL hydration: fetch, extract, chunk, embed, index.
//!
//! Per-URL failures drop that URL and the run keeps going. Only a run that
//! loads zero documents is an error.

use std::collections::BTreeSet;

use futures_util::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::chunk::{Chunker, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::extract;
use crate::index::ChunkIndex;
use ragpipe_core::{Document, EmbeddingBackend, Error, FetchBackend, FetchRequest, Result};

/// Content fingerprint for exact-duplicate document detection.
pub fn fingerprint(text: &str) -> String {
    let mut h = Sha256::new();
    h.update(text.as_bytes());
    hex::encode(h.finalize())
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Max fetches in flight at once.
    pub parallelism: usize,
    pub fetch_timeout_ms: u64,
    /// Hard cap on bytes read per page.
    pub max_bytes: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Render width for text extraction.
    pub extract_width: usize,
    /// Overall deadline. When it passes, remaining fetches are abandoned and
    /// the documents gathered so far go through chunking and indexing.
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            fetch_timeout_ms: 20_000,
            max_bytes: 2_000_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            extract_width: 100,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub attempted: usize,
    pub loaded: usize,
    /// Documents dropped because an earlier URL had identical text.
    pub duplicates: usize,
    /// Fetches abandoned at the deadline.
    pub abandoned: usize,
    pub chunks: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub index: ChunkIndex,
    pub report: IngestReport,
}

/// Hydrate `urls` into an embedded chunk index.
///
/// Fetches run with bounded concurrency; extraction, chunking, and embedding
/// happen per completed fetch in input order. Returns an error only when the
/// chunker knobs are invalid, zero documents load, or the embedding backend
/// fails.
pub async fn ingest(
    fetcher: &dyn FetchBackend,
    embeddings: &dyn EmbeddingBackend,
    urls: &[String],
    opts: &IngestOptions,
) -> Result<IngestOutcome> {
    let chunker = Chunker::new(opts.chunk_size, opts.chunk_overlap)?;

    let mut report = IngestReport {
        attempted: urls.len(),
        ..Default::default()
    };

    let parallelism = opts.parallelism.max(1);
    let mut fetched = futures_util::stream::iter(urls.iter().map(|url| {
        let req = FetchRequest {
            url: url.clone(),
            timeout_ms: Some(opts.fetch_timeout_ms),
            max_bytes: Some(opts.max_bytes),
        };
        async move {
            let resp = fetcher.fetch(&req).await;
            (url, resp)
        }
    }))
    .buffered(parallelism);

    let mut documents: Vec<Document> = Vec::new();
    let mut seen_fingerprints: BTreeSet<String> = BTreeSet::new();
    let mut completed = 0usize;

    loop {
        let next = match opts.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, fetched.next()).await {
                Ok(item) => item,
                Err(_) => {
                    report.abandoned = urls.len() - completed;
                    tracing::warn!(
                        abandoned = report.abandoned,
                        loaded = documents.len(),
                        "deadline elapsed during ingestion, keeping partial results"
                    );
                    break;
                }
            },
            None => fetched.next().await,
        };
        let Some((url, fetched_result)) = next else {
            break;
        };
        completed += 1;

        let resp = match fetched_result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "dropping url: fetch failed");
                report.failures.push(IngestFailure {
                    url: url.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if !(200..300).contains(&resp.status) {
            tracing::warn!(url = %url, status = resp.status, "dropping url: non-success status");
            report.failures.push(IngestFailure {
                url: url.clone(),
                reason: format!("HTTP {}", resp.status),
            });
            continue;
        }

        let extracted = extract::best_effort_text_from_bytes(
            &resp.bytes,
            resp.content_type.as_deref(),
            opts.extract_width,
        );
        if !extract::has_any_text(&extracted.text) {
            tracing::warn!(
                url = %url,
                engine = extracted.engine,
                warnings = ?extracted.warnings,
                "dropping url: no extractable text"
            );
            report.failures.push(IngestFailure {
                url: url.clone(),
                reason: format!("no extractable text ({})", extracted.engine),
            });
            continue;
        }

        let fp = fingerprint(&extracted.text);
        if !seen_fingerprints.insert(fp.clone()) {
            tracing::debug!(url = %url, "dropping url: duplicate document body");
            report.duplicates += 1;
            continue;
        }

        documents.push(Document {
            url: url.clone(),
            text: extracted.text,
            fingerprint: fp,
        });
    }

    report.loaded = documents.len();
    if documents.is_empty() {
        return Err(Error::NoEvidence {
            stage: "ingest",
            detail: format!("0 of {} urls yielded text", report.attempted),
        });
    }

    let mut chunks = Vec::new();
    for doc in &documents {
        chunks.extend(chunker.chunk_document(doc));
    }
    report.chunks = chunks.len();

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embeddings.embed_batch(&texts).await?;
    if vectors.len() != chunks.len() {
        return Err(Error::Embed(format!(
            "backend returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        )));
    }

    let mut index = ChunkIndex::new();
    for (chunk, vector) in chunks.into_iter().zip(vectors) {
        index.insert(chunk, vector);
    }

    tracing::info!(
        loaded = report.loaded,
        duplicates = report.duplicates,
        failed = report.failures.len(),
        chunks = report.chunks,
        "ingestion complete"
    );

    Ok(IngestOutcome { index, report })
}
