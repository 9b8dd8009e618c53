#![recursion_limit = "256"]

use anyhow::Result;
use clap::{Parser, Subcommand};

#[path = "mcp/envelope.rs"]
mod envelope;
mod pipeline;

use envelope::{add_envelope_fields, code_for, error_obj, hint_for, warning_hints_from};

const SCHEMA_VERSION: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "ragpipe")]
#[command(
    about = "Domain-scoped web question answering (MCP stdio server + CLI)",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for Cursor / MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Plan site-restricted queries, fan them out, and print the merged URL set (json).
    Search(SearchCmd),
    /// Answer a question from pages on the trusted domains (json).
    Ask(AskCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    /// Natural-language question to expand into one query per domain.
    #[arg(long)]
    question: String,
    /// Comma-separated trusted domains, e.g. "cdc.gov,who.int".
    #[arg(long)]
    domains: String,
    /// Hard cap on unique URLs across all queries.
    #[arg(long, default_value_t = 20)]
    cap: usize,
    /// Max queries in flight at once.
    #[arg(long, default_value_t = 4)]
    parallelism: usize,
    /// Result budget per provider call.
    #[arg(long, default_value_t = 10)]
    per_query_results: usize,
    /// Per-query provider timeout.
    #[arg(long, default_value_t = 20_000)]
    query_timeout_ms: u64,
    /// Overall wall-clock budget; partial results are kept when it elapses.
    #[arg(long)]
    overall_timeout_ms: Option<u64>,
    /// Search in-process instead of through the MCP tool child.
    #[arg(long, default_value_t = false)]
    direct: bool,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct AskCmd {
    /// Natural-language question to answer.
    #[arg(long)]
    question: String,
    /// Comma-separated trusted domains, e.g. "cdc.gov,who.int".
    #[arg(long)]
    domains: String,
    /// Hard cap on unique URLs across all queries.
    #[arg(long, default_value_t = 20)]
    cap: usize,
    /// Max queries (and page fetches) in flight at once.
    #[arg(long, default_value_t = 4)]
    parallelism: usize,
    /// Result budget per provider call.
    #[arg(long, default_value_t = 10)]
    per_query_results: usize,
    /// Per-query provider timeout.
    #[arg(long, default_value_t = 20_000)]
    query_timeout_ms: u64,
    /// Per-page fetch timeout.
    #[arg(long, default_value_t = 20_000)]
    fetch_timeout_ms: u64,
    /// Hard cap on bytes read per page.
    #[arg(long, default_value_t = 2_000_000)]
    max_bytes: u64,
    /// Evidence chunks handed to the answering model.
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    /// MMR relevance/diversity trade-off in [0,1]; 1.0 is pure relevance.
    #[arg(long, default_value_t = 0.3)]
    lambda: f32,
    /// Timeout for the final model call.
    #[arg(long, default_value_t = 60_000)]
    answer_timeout_ms: u64,
    /// Overall wall-clock budget for search+ingest; partial evidence is kept
    /// when it elapses.
    #[arg(long)]
    overall_timeout_ms: Option<u64>,
    /// Search in-process instead of through the MCP tool child.
    #[arg(long, default_value_t = false)]
    direct: bool,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    // stdout belongs to the command output (and to the MCP transport in
    // mcp-stdio mode); all diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_domains(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Print an `{ok:false, error}` envelope on stdout and exit non-zero.
fn fail_envelope(
    kind: &str,
    t0: std::time::Instant,
    e: &ragpipe_core::Error,
    warnings: &[&'static str],
) -> ! {
    let code = code_for(e);
    let mut payload = serde_json::json!({
        "ok": false,
        "error": error_obj(code, e.to_string(), hint_for(code)),
    });
    if !warnings.is_empty() {
        payload["warnings"] = serde_json::json!(warnings);
        payload["warning_hints"] = warning_hints_from(warnings);
    }
    add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
    println!("{payload}");
    std::process::exit(1);
}

fn in_process_runner(
    http: &reqwest::Client,
) -> ragpipe_core::Result<ragpipe_local::aggregate::InProcessRunner> {
    let provider = ragpipe_local::search::provider_from_env(http.clone())?;
    Ok(ragpipe_local::aggregate::InProcessRunner::new(
        ragpipe_local::retry::SearchClient::new(
            std::sync::Arc::from(provider),
            ragpipe_local::retry::RetryPolicy::default(),
        ),
    ))
}

async fn run_search(args: SearchCmd) -> Result<()> {
    let t0 = std::time::Instant::now();
    let mut warnings: Vec<&'static str> = Vec::new();

    let question = args.question.trim().to_string();
    let domains = parse_domains(&args.domains);
    if question.is_empty() {
        fail_envelope(
            "search",
            t0,
            &ragpipe_core::Error::NotSupported("question must be non-empty".to_string()),
            &warnings,
        );
    }
    if domains.is_empty() {
        fail_envelope(
            "search",
            t0,
            &ragpipe_core::Error::NotSupported(
                "domains must contain at least one domain".to_string(),
            ),
            &warnings,
        );
    }

    let opts = pipeline::PipelineOptions {
        cap: args.cap,
        parallelism: args.parallelism,
        per_query_results: args.per_query_results,
        query_timeout_ms: args.query_timeout_ms,
        overall_timeout_ms: args.overall_timeout_ms,
        ..pipeline::PipelineOptions::default()
    };
    let http = reqwest::Client::builder().user_agent("ragpipe/0.1").build()?;

    let report;
    #[cfg(feature = "stdio")]
    {
        report = if args.direct {
            let runner = match in_process_runner(&http) {
                Ok(r) => r,
                Err(e) => fail_envelope("search", t0, &e, &warnings),
            };
            pipeline::search_urls(&runner, &question, &domains, &opts).await
        } else {
            match mcp::FallbackController::spawn(&http).await {
                Ok(controller) => {
                    let r = pipeline::search_urls(&controller, &question, &domains, &opts).await;
                    if controller.fell_back() {
                        warnings.push("tool_fallback_used");
                    }
                    controller.shutdown().await;
                    r
                }
                // No provider configured: the in-process path would fail the
                // same way, so surface the configuration error directly.
                Err(e) if matches!(e, ragpipe_core::Error::NotConfigured(_)) => {
                    fail_envelope("search", t0, &e, &warnings)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "mcp tool unavailable, searching in-process");
                    warnings.push("tool_unavailable");
                    let runner = match in_process_runner(&http) {
                        Ok(r) => r,
                        Err(e) => fail_envelope("search", t0, &e, &warnings),
                    };
                    pipeline::search_urls(&runner, &question, &domains, &opts).await
                }
            }
        };
    }
    #[cfg(not(feature = "stdio"))]
    {
        let runner = match in_process_runner(&http) {
            Ok(r) => r,
            Err(e) => fail_envelope("search", t0, &e, &warnings),
        };
        report = pipeline::search_urls(&runner, &question, &domains, &opts).await;
    }

    if report.failed_count() > 0 {
        warnings.push("search_degraded_empty");
    }
    if report.deadline_hit {
        warnings.push("deadline_partial_results");
    }
    if report.urls.is_empty() {
        warnings.push("no_results");
    }

    let mut payload = serde_json::json!({
        "ok": true,
        "question": question,
        "domains": domains,
        "count": report.urls.len(),
        "urls": report.urls.as_slice(),
        "per_query": report.per_query,
    });
    if !warnings.is_empty() {
        payload["warnings"] = serde_json::json!(warnings);
        payload["warning_hints"] = warning_hints_from(&warnings);
    }
    add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            for url in report.urls.iter() {
                println!("{url}");
            }
        }
        _ => println!("{payload}"),
    }
    Ok(())
}

async fn run_ask(args: AskCmd) -> Result<()> {
    let t0 = std::time::Instant::now();
    let mut warnings: Vec<&'static str> = Vec::new();

    let question = args.question.trim().to_string();
    let domains = parse_domains(&args.domains);
    if question.is_empty() {
        fail_envelope(
            "ask",
            t0,
            &ragpipe_core::Error::NotSupported("question must be non-empty".to_string()),
            &warnings,
        );
    }
    if domains.is_empty() {
        fail_envelope(
            "ask",
            t0,
            &ragpipe_core::Error::NotSupported(
                "domains must contain at least one domain".to_string(),
            ),
            &warnings,
        );
    }

    let opts = pipeline::PipelineOptions {
        cap: args.cap,
        parallelism: args.parallelism,
        per_query_results: args.per_query_results,
        query_timeout_ms: args.query_timeout_ms,
        overall_timeout_ms: args.overall_timeout_ms,
        fetch_timeout_ms: args.fetch_timeout_ms,
        max_bytes: args.max_bytes,
        top_k: args.top_k,
        lambda: args.lambda,
        answer_timeout_ms: args.answer_timeout_ms,
        ..pipeline::PipelineOptions::default()
    };
    let http = reqwest::Client::builder().user_agent("ragpipe/0.1").build()?;

    // Resolve every backend before spawning anything, so configuration errors
    // surface without a child process to tear down.
    let fetcher = match ragpipe_local::LocalFetcher::new() {
        Ok(f) => f,
        Err(e) => fail_envelope("ask", t0, &e, &warnings),
    };
    let embeddings = match ragpipe_local::embed::embeddings_from_env(&http) {
        Ok(b) => b,
        Err(e) => fail_envelope("ask", t0, &e, &warnings),
    };
    let chat = match ragpipe_local::answer::chat_backend_from_env(http.clone()) {
        Ok(b) => b,
        Err(e) => fail_envelope("ask", t0, &e, &warnings),
    };
    tracing::debug!(
        embeddings = embeddings.name(),
        chat = chat.name(),
        "backends resolved"
    );

    let outcome;
    #[cfg(feature = "stdio")]
    {
        outcome = if args.direct {
            let runner = match in_process_runner(&http) {
                Ok(r) => r,
                Err(e) => fail_envelope("ask", t0, &e, &warnings),
            };
            pipeline::ask(
                &runner,
                &fetcher,
                embeddings.as_ref(),
                chat.as_ref(),
                &question,
                &domains,
                &opts,
            )
            .await
        } else {
            match mcp::FallbackController::spawn(&http).await {
                Ok(controller) => {
                    let res = pipeline::ask(
                        &controller,
                        &fetcher,
                        embeddings.as_ref(),
                        chat.as_ref(),
                        &question,
                        &domains,
                        &opts,
                    )
                    .await;
                    if controller.fell_back() {
                        warnings.push("tool_fallback_used");
                    }
                    controller.shutdown().await;
                    res
                }
                Err(e) if matches!(e, ragpipe_core::Error::NotConfigured(_)) => {
                    fail_envelope("ask", t0, &e, &warnings)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "mcp tool unavailable, searching in-process");
                    warnings.push("tool_unavailable");
                    let runner = match in_process_runner(&http) {
                        Ok(r) => r,
                        Err(e) => fail_envelope("ask", t0, &e, &warnings),
                    };
                    pipeline::ask(
                        &runner,
                        &fetcher,
                        embeddings.as_ref(),
                        chat.as_ref(),
                        &question,
                        &domains,
                        &opts,
                    )
                    .await
                }
            }
        };
    }
    #[cfg(not(feature = "stdio"))]
    {
        let runner = match in_process_runner(&http) {
            Ok(r) => r,
            Err(e) => fail_envelope("ask", t0, &e, &warnings),
        };
        outcome = pipeline::ask(
            &runner,
            &fetcher,
            embeddings.as_ref(),
            chat.as_ref(),
            &question,
            &domains,
            &opts,
        )
        .await;
    }

    let out = match outcome {
        Ok(o) => o,
        Err(e) => fail_envelope("ask", t0, &e, &warnings),
    };
    if out.search.failed_count() > 0 {
        warnings.push("search_degraded_empty");
    }
    if out.search.deadline_hit || out.ingest.abandoned > 0 {
        warnings.push("deadline_partial_results");
    }
    if out
        .ingest
        .failures
        .iter()
        .any(|f| f.reason.starts_with("no extractable text"))
    {
        warnings.push("empty_extraction");
    }

    let mut payload = serde_json::json!({
        "ok": true,
        "question": question,
        "domains": domains,
        "answer": out.answer.text,
        "sources": out.answer.sources,
        "search": {
            "count": out.search.urls.len(),
            "failed_queries": out.search.failed_count(),
            "per_query": out.search.per_query,
        },
        "ingest": out.ingest,
        "retrieved": out.retrieved,
    });
    if !warnings.is_empty() {
        payload["warnings"] = serde_json::json!(warnings);
        payload["warning_hints"] = warning_hints_from(&warnings);
    }
    add_envelope_fields(&mut payload, "ask", t0.elapsed().as_millis());

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("{}", out.answer.text);
            if !out.answer.sources.is_empty() {
                println!();
                println!("sources:");
                for s in &out.answer.sources {
                    println!("- {s}");
                }
            }
        }
        _ => println!("{payload}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Optional env-file loader (opt-in).
    //
    // Rationale: MCP server environments often aren't interactive shells, so
    // users want a single place to keep keys without exporting them manually.
    //
    // Safety:
    // - opt-in only (RAGPIPE_ENV_FILE)
    // - sets vars only if not already set in the process environment
    // - does not log values
    if let Ok(p) = std::env::var("RAGPIPE_ENV_FILE") {
        let p = p.trim();
        if !p.is_empty() {
            if let Ok(txt) = std::fs::read_to_string(p) {
                for raw in txt.lines() {
                    let s = raw.trim();
                    if s.is_empty() || s.starts_with('#') {
                        continue;
                    }
                    let Some((k, v)) = s.split_once('=') else {
                        continue;
                    };
                    let k = k.trim();
                    let v = v.trim();
                    if k.is_empty() {
                        continue;
                    }
                    // Don't override explicit process env.
                    if std::env::var_os(k).is_none() {
                        std::env::set_var(k, v);
                    }
                }
            }
        }
    }

    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Search(args) => run_search(args).await?,
        Commands::Ask(args) => run_ask(args).await?,
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "ragpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("ragpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}

#[cfg(feature = "stdio")]
mod mcp {
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{CallToolRequestParam, CallToolResult, Content, ServerCapabilities, ServerInfo},
        service::{RoleClient, RunningService},
        tool, tool_handler, tool_router,
        transport::{stdio, ConfigureCommandExt, TokioChildProcess},
        ErrorData as McpError, ServiceExt,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use ragpipe_core::{Error, PlannedQuery, SearchQuery, SearchResult};
    use ragpipe_local::aggregate::QueryRunner;
    use ragpipe_local::retry::{RetryPolicy, SearchClient, SearchOutcome};
    use ragpipe_local::search::provider_from_env;

    use crate::envelope::*;

    /// Budget for the child handshake plus tools/list at startup.
    const STARTUP_TIMEOUT_MS: u64 = 10_000;

    fn tool_result(payload: serde_json::Value) -> CallToolResult {
        // Always attach structured content for machine consumers, and include
        // a text fallback for older clients that only read `content[0].text`.
        let mut r = CallToolResult::structured(payload.clone());
        r.content = vec![Content::text(payload.to_string())];
        r
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    pub(crate) struct SearchArgs {
        /// Search query (required).
        #[serde(default)]
        pub query: Option<String>,
        /// Max results to return (default 10, clamped to 1..=20).
        #[serde(default)]
        pub max_results: Option<usize>,
    }

    #[derive(Clone)]
    pub(crate) struct RagpipeMcp {
        tool_router: RmcpToolRouter<Self>,
        http: reqwest::Client,
    }

    #[tool_router]
    impl RagpipeMcp {
        pub(crate) fn new() -> Result<Self, McpError> {
            Ok(Self {
                tool_router: Self::tool_router(),
                http: reqwest::Client::builder()
                    .user_agent("ragpipe-mcp/0.1")
                    .build()
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?,
            })
        }

        #[tool(
            description = "Run one web search query and return result URLs with titles and snippets"
        )]
        pub(crate) async fn search(
            &self,
            params: Parameters<Option<SearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let t0 = std::time::Instant::now();
            let args = params.0.unwrap_or_default();

            let query = args.query.unwrap_or_default().trim().to_string();
            if query.is_empty() {
                let mut payload = serde_json::json!({
                    "ok": false,
                    "query": "",
                    "error": error_obj(
                        ErrorCode::InvalidParams,
                        "query must be non-empty",
                        "Provide a query string."
                    ),
                });
                add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
                return Ok(tool_result(payload));
            }
            let max_results = args.max_results.unwrap_or(10).clamp(1, 20);

            // Stateless: the provider is resolved per call from the current env.
            let provider = match provider_from_env(self.http.clone()) {
                Ok(p) => p,
                Err(e) => {
                    let code = code_for(&e);
                    let mut payload = serde_json::json!({
                        "ok": false,
                        "query": query,
                        "error": error_obj(code, e.to_string(), hint_for(code)),
                    });
                    add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
                    return Ok(tool_result(payload));
                }
            };
            let client = SearchClient::new(Arc::from(provider), RetryPolicy::default());
            let outcome = client
                .search(&SearchQuery {
                    query: query.clone(),
                    max_results: Some(max_results),
                    timeout_ms: None,
                })
                .await;

            if outcome.failed {
                let mut payload = serde_json::json!({
                    "ok": false,
                    "query": query,
                    "provider": outcome.provider,
                    "attempts": { "count": outcome.attempts },
                    "error": error_obj(
                        ErrorCode::SearchFailed,
                        outcome.error.unwrap_or_else(|| "search failed".to_string()),
                        hint_for(ErrorCode::SearchFailed)
                    ),
                });
                add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
                return Ok(tool_result(payload));
            }

            let results: Vec<serde_json::Value> = outcome
                .results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "title": r.title,
                        "url": r.url,
                        "snippet": r.snippet,
                    })
                })
                .collect();
            let mut payload = serde_json::json!({
                "ok": true,
                "query": query,
                "provider": outcome.provider,
                "attempts": { "count": outcome.attempts },
                "count": results.len(),
                "results": results,
            });
            add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
            Ok(tool_result(payload))
        }
    }

    #[tool_handler]
    impl rmcp::ServerHandler for RagpipeMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "Web search over a configured provider. The `search` tool runs one query \
                     and returns result URLs with titles and snippets; failures come back as \
                     structured {ok:false, error} payloads."
                        .into(),
                ),
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio() -> Result<(), McpError> {
        let service = RagpipeMcp::new()?;
        let running = service
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(())
    }

    // ---- Client side: spawn our own binary as the tool child ----

    /// How a single tool call ended, before any fallback decision.
    #[derive(Debug)]
    pub(crate) enum ToolCallOutcome {
        /// Spawn/protocol/timeout failure.
        Transport(String),
        /// The tool answered with an `{ok:false, error}` payload.
        Structured { code: String, message: String },
        /// The tool answered ok with zero results.
        Empty,
        Results(Vec<SearchResult>),
    }

    impl ToolCallOutcome {
        fn kind(&self) -> &'static str {
            match self {
                Self::Transport(_) => "transport_error",
                Self::Structured { .. } => "structured_error",
                Self::Empty => "empty",
                Self::Results(_) => "results",
            }
        }

        fn detail(&self) -> String {
            match self {
                Self::Transport(msg) => msg.clone(),
                Self::Structured { code, message } => format!("{code}: {message}"),
                Self::Empty => "0 results".to_string(),
                Self::Results(rs) => format!("{} results", rs.len()),
            }
        }
    }

    /// The one predicate that decides per-query fallback: anything except
    /// usable results goes back through the in-process provider.
    pub(crate) fn should_fall_back(outcome: &ToolCallOutcome) -> bool {
        !matches!(outcome, ToolCallOutcome::Results(_))
    }

    fn payload_from_call(r: &CallToolResult) -> Option<serde_json::Value> {
        if let Some(v) = r.structured_content.clone() {
            return Some(v);
        }
        for c in &r.content {
            if let Some(t) = c.as_text() {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&t.text) {
                    return Some(v);
                }
            }
        }
        None
    }

    fn outcome_from_payload(payload: &serde_json::Value) -> ToolCallOutcome {
        if payload.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let code = payload["error"]["code"]
                .as_str()
                .unwrap_or("unexpected_error")
                .to_string();
            let message = payload["error"]["message"].as_str().unwrap_or("").to_string();
            return ToolCallOutcome::Structured { code, message };
        }
        let results: Vec<SearchResult> = payload["results"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let url = r.get("url").and_then(|v| v.as_str())?.trim().to_string();
                        if url.is_empty() {
                            return None;
                        }
                        Some(SearchResult {
                            url,
                            title: r
                                .get("title")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            snippet: r
                                .get("snippet")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            source: "tool".to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if results.is_empty() {
            ToolCallOutcome::Empty
        } else {
            ToolCallOutcome::Results(results)
        }
    }

    /// Accepts `{"type":"string"}`, nullable variants like
    /// `{"type":["string","null"]}`, and anyOf unions, since schemars output
    /// differs across versions for `Option<String>`.
    fn schema_has_string_query(schema: &serde_json::Map<String, serde_json::Value>) -> bool {
        let Some(props) = schema.get("properties").and_then(|v| v.as_object()) else {
            return false;
        };
        let Some(q) = props.get("query").and_then(|v| v.as_object()) else {
            return false;
        };
        match q.get("type") {
            Some(serde_json::Value::String(t)) => t == "string",
            Some(serde_json::Value::Array(ts)) => {
                ts.iter().any(|t| t.as_str() == Some("string"))
            }
            _ => q.get("anyOf").and_then(|v| v.as_array()).is_some_and(|arr| {
                arr.iter()
                    .any(|alt| alt.get("type").and_then(|t| t.as_str()) == Some("string"))
            }),
        }
    }

    pub(crate) struct ToolClient {
        service: RunningService<RoleClient, ()>,
    }

    impl ToolClient {
        /// Spawn `<current_exe> mcp-stdio` and verify it exposes a usable
        /// `search` tool before returning.
        pub(crate) async fn spawn() -> ragpipe_core::Result<Self> {
            let exe = std::env::current_exe()
                .map_err(|e| Error::Tool(format!("current_exe: {e}")))?;
            let child = TokioChildProcess::new(tokio::process::Command::new(exe).configure(
                |cmd| {
                    cmd.args(["mcp-stdio"]);
                },
            ))
            .map_err(|e| Error::Tool(format!("spawn mcp-stdio child: {e}")))?;
            let service = ()
                .serve(child)
                .await
                .map_err(|e| Error::Tool(format!("mcp handshake: {e}")))?;

            let tools = match tokio::time::timeout(
                std::time::Duration::from_millis(STARTUP_TIMEOUT_MS),
                service.list_tools(Default::default()),
            )
            .await
            {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    let _ = service.cancel().await;
                    return Err(Error::Tool(format!("list_tools: {e}")));
                }
                Err(_) => {
                    let _ = service.cancel().await;
                    return Err(Error::Tool(format!(
                        "list_tools timed out after {STARTUP_TIMEOUT_MS}ms"
                    )));
                }
            };

            let Some(tool) = tools.tools.iter().find(|t| t.name.as_ref() == "search") else {
                let _ = service.cancel().await;
                return Err(Error::Tool(
                    "child does not expose a `search` tool".to_string(),
                ));
            };
            if !schema_has_string_query(tool.input_schema.as_ref()) {
                let _ = service.cancel().await;
                return Err(Error::Tool(
                    "`search` tool schema lacks a string `query` property".to_string(),
                ));
            }

            Ok(Self { service })
        }

        pub(crate) async fn call_search(
            &self,
            query: &str,
            max_results: usize,
            timeout_ms: u64,
        ) -> ToolCallOutcome {
            let args = serde_json::json!({ "query": query, "max_results": max_results });
            let call = self.service.call_tool(CallToolRequestParam {
                name: "search".into(),
                arguments: args.as_object().cloned(),
            });
            let result =
                match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), call)
                    .await
                {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => return ToolCallOutcome::Transport(e.to_string()),
                    Err(_) => {
                        return ToolCallOutcome::Transport(format!(
                            "tool call timed out after {timeout_ms}ms"
                        ))
                    }
                };
            match payload_from_call(&result) {
                Some(payload) => outcome_from_payload(&payload),
                None => ToolCallOutcome::Transport("tool returned no JSON payload".to_string()),
            }
        }

        pub(crate) async fn shutdown(self) {
            let _ = self.service.cancel().await;
        }
    }

    /// Runs each planned query through the tool child, retrying it against the
    /// in-process provider when the tool cannot serve it.
    pub(crate) struct FallbackController {
        tool: ToolClient,
        local: SearchClient,
        fell_back: AtomicBool,
    }

    impl FallbackController {
        pub(crate) async fn spawn(http: &reqwest::Client) -> ragpipe_core::Result<Self> {
            // Resolve the provider first: without one, neither path can work.
            let provider = provider_from_env(http.clone())?;
            let tool = ToolClient::spawn().await?;
            Ok(Self {
                tool,
                local: SearchClient::new(Arc::from(provider), RetryPolicy::default()),
                fell_back: AtomicBool::new(false),
            })
        }

        /// True when at least one query fell back to the in-process provider.
        pub(crate) fn fell_back(&self) -> bool {
            self.fell_back.load(Ordering::Relaxed)
        }

        pub(crate) async fn shutdown(self) {
            self.tool.shutdown().await;
        }
    }

    #[async_trait::async_trait]
    impl QueryRunner for FallbackController {
        async fn run(
            &self,
            query: &PlannedQuery,
            max_results: usize,
            timeout_ms: u64,
        ) -> SearchOutcome {
            let rendered = query.rendered();
            let outcome = self.tool.call_search(&rendered, max_results, timeout_ms).await;
            if should_fall_back(&outcome) {
                self.fell_back.store(true, Ordering::Relaxed);
                tracing::warn!(
                    domain = %query.domain,
                    outcome = outcome.kind(),
                    detail = %outcome.detail(),
                    "tool result unusable, falling back to in-process search"
                );
                return self
                    .local
                    .search(&SearchQuery {
                        query: rendered,
                        max_results: Some(max_results),
                        timeout_ms: Some(timeout_ms),
                    })
                    .await;
            }
            let ToolCallOutcome::Results(results) = outcome else {
                // should_fall_back admits only usable results.
                return SearchOutcome {
                    results: Vec::new(),
                    provider: "tool".to_string(),
                    attempts: 1,
                    failed: false,
                    error: None,
                };
            };
            SearchOutcome {
                results,
                provider: "tool".to_string(),
                attempts: 1,
                failed: false,
                error: None,
            }
        }
    }

}
