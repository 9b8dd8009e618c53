use ragpipe_core::{Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    // Keep a conservative cap even if callers pass something huge.
    q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000)
}

fn serper_api_key_from_env() -> Option<String> {
    std::env::var("RAGPIPE_SERPER_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("SERPER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

fn serper_endpoint_from_env() -> Option<String> {
    std::env::var("RAGPIPE_SERPER_ENDPOINT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn searxng_endpoints_from_env() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    // Allow a comma/whitespace-separated list of endpoints for simple load spreading.
    if let Ok(v) = std::env::var("RAGPIPE_SEARXNG_ENDPOINTS") {
        for raw in v.split(|c: char| c == ',' || c.is_whitespace()) {
            let s = raw.trim();
            if s.is_empty() {
                continue;
            }
            let s = s.to_string();
            if !out.contains(&s) {
                out.push(s);
            }
        }
    }

    // Back-compat: single endpoint.
    if let Ok(v) = std::env::var("RAGPIPE_SEARXNG_ENDPOINT") {
        let s = v.trim().to_string();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }

    out
}

#[derive(Debug, Clone)]
pub struct SerperSearchProvider {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Debug, Clone)]
pub struct SearxngSearchProvider {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl SerperSearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = serper_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured("missing RAGPIPE_SERPER_API_KEY (or SERPER_API_KEY)".to_string())
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        serper_endpoint_from_env()
            .unwrap_or_else(|| "https://google.serper.dev/search".to_string())
    }
}

impl SearxngSearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let endpoints = searxng_endpoints_from_env();
        if endpoints.is_empty() {
            return Err(Error::NotConfigured(
                "missing RAGPIPE_SEARXNG_ENDPOINT (or RAGPIPE_SEARXNG_ENDPOINTS)".to_string(),
            ));
        }
        Ok(Self { client, endpoints })
    }

    fn endpoint_search_for(base_endpoint: &str) -> String {
        // Accept either a base URL, or a full /search endpoint.
        let mut base = base_endpoint.trim().trim_end_matches('/').to_string();
        if !base.ends_with("/search") {
            base.push_str("/search");
        }
        base
    }

    fn stable_hash64(query: &SearchQuery) -> u64 {
        // Stable across runs (unlike HashMap's RandomState). FNV-1a over the query text.
        let mut h: u64 = 1469598103934665603;
        for b in query.query.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(1099511628211);
        }
        h
    }

    fn pick_endpoint_index(&self, q: &SearchQuery) -> usize {
        if self.endpoints.is_empty() {
            return 0;
        }
        (Self::stable_hash64(q) as usize) % self.endpoints.len()
    }
}

#[derive(Debug, Deserialize)]
struct SerperSearchResponse {
    organic: Option<Vec<SerperOrganicResult>>,
}

#[derive(Debug, Deserialize)]
struct SerperOrganicResult {
    link: Option<String>,
    title: Option<String>,
    snippet: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for SerperSearchProvider {
    fn name(&self) -> &'static str {
        "serper"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let max_results = q.max_results.unwrap_or(10).min(20);
        let timeout_ms = timeout_ms_from_query(q);

        let body = serde_json::json!({
            "q": q.query,
            "num": max_results,
        });

        let resp = self
            .client
            .post(Self::endpoint())
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("serper search HTTP {status}")));
        }

        let parsed: SerperSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut out = Vec::new();
        if let Some(rs) = parsed.organic {
            for r in rs.into_iter().take(max_results) {
                let Some(url) = r.link else { continue };
                out.push(SearchResult {
                    url,
                    title: r.title,
                    snippet: r.snippet,
                    source: "serper".to_string(),
                });
            }
        }

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            results: out,
            provider: "serper".to_string(),
            timings_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<Vec<SearxngResult>>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: Option<String>,
    title: Option<String>,
    // SearXNG uses `content` for snippets in JSON format.
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for SearxngSearchProvider {
    fn name(&self) -> &'static str {
        "searxng"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let max_results = q.max_results.unwrap_or(10).min(20);
        let timeout_ms = timeout_ms_from_query(q);

        // Deterministic sharding when multiple endpoints are configured.
        let idx = self.pick_endpoint_index(q);
        let base_endpoint = self.endpoints.get(idx).map(|s| s.as_str()).unwrap_or("");
        let endpoint_search = Self::endpoint_search_for(base_endpoint);

        let resp = self
            .client
            .get(endpoint_search)
            .query(&[("q", q.query.as_str()), ("format", "json")])
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("searxng search HTTP {status}")));
        }

        let parsed: SearxngSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut out = Vec::new();
        if let Some(rs) = parsed.results {
            for r in rs.into_iter().take(max_results) {
                let Some(url) = r.url else { continue };
                out.push(SearchResult {
                    url,
                    title: r.title,
                    snippet: r.content,
                    source: "searxng".to_string(),
                });
            }
        }

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            results: out,
            provider: "searxng".to_string(),
            timings_ms,
        })
    }
}

/// Pick a provider from the environment.
///
/// `RAGPIPE_SEARCH_PROVIDER` forces `serper` or `searxng`; the default
/// (`auto`) prefers Serper when a key is configured, then SearXNG.
pub fn provider_from_env(client: reqwest::Client) -> Result<Box<dyn SearchProvider>> {
    let forced = std::env::var("RAGPIPE_SEARCH_PROVIDER")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match forced.as_str() {
        "serper" => return Ok(Box::new(SerperSearchProvider::from_env(client)?)),
        "searxng" => return Ok(Box::new(SearxngSearchProvider::from_env(client)?)),
        "" | "auto" => {}
        other => {
            return Err(Error::NotConfigured(format!(
                "unknown RAGPIPE_SEARCH_PROVIDER: {other}"
            )))
        }
    }
    if serper_api_key_from_env().is_some() {
        return Ok(Box::new(SerperSearchProvider::from_env(client)?));
    }
    if !searxng_endpoints_from_env().is_empty() {
        return Ok(Box::new(SearxngSearchProvider::from_env(client)?));
    }
    Err(Error::NotConfigured(
        "no search provider configured; set RAGPIPE_SERPER_API_KEY or RAGPIPE_SEARXNG_ENDPOINT"
            .to_string(),
    ))
}
