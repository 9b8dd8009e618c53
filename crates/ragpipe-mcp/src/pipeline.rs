//! End-to-end run orchestration shared by the CLI commands.
//!
//! A run is: plan one site-restricted query per trusted domain, fan the
//! queries out through a [`QueryRunner`], hydrate the merged URL set into an
//! embedded chunk index, retrieve a diverse evidence window, and generate the
//! final answer from that evidence only.

use std::time::Duration;

use ragpipe_core::{
    plan_queries, Answer, ChatBackend, EmbeddingBackend, Error, FetchBackend, Result,
};
use ragpipe_local::aggregate::{aggregate, AggregateOptions, AggregateReport, QueryRunner};
use ragpipe_local::answer::{generate_answer, DEFAULT_ANSWER_TIMEOUT_MS};
use ragpipe_local::chunk::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use ragpipe_local::index::{DEFAULT_MMR_LAMBDA, DEFAULT_TOP_K};
use ragpipe_local::ingest::{ingest, IngestOptions, IngestReport};

#[derive(Debug, Clone)]
pub(crate) struct PipelineOptions {
    /// Hard cap on unique URLs across all queries.
    pub cap: usize,
    /// Bounded concurrency for both the query fanout and page fetching.
    pub parallelism: usize,
    /// Result budget per provider call.
    pub per_query_results: usize,
    pub query_timeout_ms: u64,
    /// Soft wall-clock budget for the whole run. Stages keep the partial
    /// progress they have when it elapses instead of failing.
    pub overall_timeout_ms: Option<u64>,
    pub fetch_timeout_ms: u64,
    /// Hard cap on bytes read per page.
    pub max_bytes: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Evidence window size handed to the answering model.
    pub top_k: usize,
    /// MMR relevance/diversity trade-off (1.0 = pure relevance).
    pub lambda: f32,
    pub answer_timeout_ms: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            cap: 20,
            parallelism: 4,
            per_query_results: 10,
            query_timeout_ms: 20_000,
            overall_timeout_ms: None,
            fetch_timeout_ms: 20_000,
            max_bytes: 2_000_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            lambda: DEFAULT_MMR_LAMBDA,
            answer_timeout_ms: DEFAULT_ANSWER_TIMEOUT_MS,
        }
    }
}

fn deadline_from(overall_timeout_ms: Option<u64>) -> Option<tokio::time::Instant> {
    overall_timeout_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms))
}

fn fanout_options(
    opts: &PipelineOptions,
    deadline: Option<tokio::time::Instant>,
) -> AggregateOptions {
    AggregateOptions {
        cap: opts.cap,
        parallelism: opts.parallelism,
        per_query_results: opts.per_query_results,
        query_timeout_ms: opts.query_timeout_ms,
        deadline,
    }
}

/// Search stage only: plan, fan out, merge. Never fails; per-query errors are
/// recorded in the report.
pub(crate) async fn search_urls(
    runner: &dyn QueryRunner,
    question: &str,
    domains: &[String],
    opts: &PipelineOptions,
) -> AggregateReport {
    let queries = plan_queries(question, domains);
    let deadline = deadline_from(opts.overall_timeout_ms);
    aggregate(runner, &queries, &fanout_options(opts, deadline)).await
}

#[derive(Debug)]
pub(crate) struct AskOutcome {
    pub answer: Answer,
    pub search: AggregateReport,
    pub ingest: IngestReport,
    /// Chunks actually handed to the answering model.
    pub retrieved: usize,
}

/// Full run: search, ingest, retrieve, answer.
pub(crate) async fn ask(
    runner: &dyn QueryRunner,
    fetcher: &dyn FetchBackend,
    embeddings: &dyn EmbeddingBackend,
    chat: &dyn ChatBackend,
    question: &str,
    domains: &[String],
    opts: &PipelineOptions,
) -> Result<AskOutcome> {
    // One deadline shared by the search and ingest stages.
    let deadline = deadline_from(opts.overall_timeout_ms);

    let queries = plan_queries(question, domains);
    let search = aggregate(runner, &queries, &fanout_options(opts, deadline)).await;
    if search.urls.is_empty() {
        return Err(Error::NoEvidence {
            stage: "search",
            detail: format!("0 urls from {} queries", search.per_query.len()),
        });
    }
    tracing::info!(
        urls = search.urls.len(),
        failed_queries = search.failed_count(),
        "search fanout complete"
    );

    let hydrated = ingest(
        fetcher,
        embeddings,
        search.urls.as_slice(),
        &IngestOptions {
            parallelism: opts.parallelism,
            fetch_timeout_ms: opts.fetch_timeout_ms,
            max_bytes: opts.max_bytes,
            chunk_size: opts.chunk_size,
            chunk_overlap: opts.chunk_overlap,
            deadline,
            ..IngestOptions::default()
        },
    )
    .await?;

    let query_vector = embeddings.embed(question).await?;
    let retrieved = hydrated.index.mmr(&query_vector, opts.top_k, opts.lambda);
    tracing::debug!(retrieved = retrieved.len(), "evidence window selected");

    let answer = generate_answer(chat, question, &retrieved, opts.answer_timeout_ms).await?;
    Ok(AskOutcome {
        answer,
        search,
        ingest: hydrated.report,
        retrieved: retrieved.len(),
    })
}
