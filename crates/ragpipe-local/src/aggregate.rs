use crate::retry::{SearchClient, SearchOutcome};
use futures_util::StreamExt;
use ragpipe_core::{PlannedQuery, SearchQuery, UrlSet};
use serde::Serialize;

/// Anything that can answer one planned query. The in-process search client
/// implements it directly; the tool-backed path implements it with a
/// per-query fallback onto the in-process client.
#[async_trait::async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(&self, query: &PlannedQuery, max_results: usize, timeout_ms: u64)
        -> SearchOutcome;
}

pub struct InProcessRunner {
    client: SearchClient,
}

impl InProcessRunner {
    pub fn new(client: SearchClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl QueryRunner for InProcessRunner {
    async fn run(
        &self,
        query: &PlannedQuery,
        max_results: usize,
        timeout_ms: u64,
    ) -> SearchOutcome {
        let q = SearchQuery {
            query: query.rendered(),
            max_results: Some(max_results),
            timeout_ms: Some(timeout_ms),
        };
        self.client.search(&q).await
    }
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Hard cap on unique URLs across all queries.
    pub cap: usize,
    /// Max queries in flight at once.
    pub parallelism: usize,
    /// Result budget per provider call.
    pub per_query_results: usize,
    pub query_timeout_ms: u64,
    /// Overall deadline. When it passes, merging stops and whatever is in
    /// the set already is kept.
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            cap: 20,
            parallelism: 4,
            per_query_results: 10,
            query_timeout_ms: 20_000,
            deadline: None,
        }
    }
}

/// Per-query slice of an aggregation run, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub domain: String,
    pub query: String,
    pub provider: String,
    pub attempts: u32,
    pub result_count: usize,
    /// URLs actually admitted into the set (post dedup/cap).
    pub admitted: usize,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct AggregateReport {
    pub urls: UrlSet,
    pub per_query: Vec<QueryReport>,
    /// True when the deadline cut the fanout short.
    pub deadline_hit: bool,
}

impl AggregateReport {
    /// Queries that terminally failed (after retries).
    pub fn failed_count(&self) -> usize {
        self.per_query.iter().filter(|q| q.failed).count()
    }
}

/// Fan planned queries through `runner` with bounded concurrency and merge
/// links into one capped set.
///
/// Merging happens in planned-query order regardless of arrival order, so
/// the set is deterministic for deterministic runners. Once the set is full
/// the stream is dropped: no further queries are consumed, even mid-domain.
/// A passed deadline also drops the stream, keeping what was merged so far.
pub async fn aggregate(
    runner: &dyn QueryRunner,
    queries: &[PlannedQuery],
    opts: &AggregateOptions,
) -> AggregateReport {
    let mut urls = UrlSet::new(opts.cap);
    let mut per_query = Vec::with_capacity(queries.len());
    let mut deadline_hit = false;
    let parallelism = opts.parallelism.max(1);

    let mut outcomes = futures_util::stream::iter(queries.iter().map(|pq| async move {
        let outcome = runner
            .run(pq, opts.per_query_results, opts.query_timeout_ms)
            .await;
        (pq, outcome)
    }))
    .buffered(parallelism);

    loop {
        let next = match opts.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, outcomes.next()).await {
                Ok(item) => item,
                Err(_) => {
                    deadline_hit = true;
                    tracing::warn!(
                        gathered = urls.len(),
                        "deadline elapsed during search fanout, keeping partial results"
                    );
                    break;
                }
            },
            None => outcomes.next().await,
        };
        let Some((pq, outcome)) = next else {
            break;
        };
        let mut admitted = 0usize;
        for r in &outcome.results {
            if urls.is_full() {
                break;
            }
            if ragpipe_core::ensure_url(&r.url).is_err() {
                tracing::debug!(domain = %pq.domain, url = %r.url, "skipping invalid result url");
                continue;
            }
            if urls.insert(&r.url) {
                admitted += 1;
            }
        }
        tracing::debug!(
            domain = %pq.domain,
            provider = %outcome.provider,
            results = outcome.results.len(),
            admitted,
            total = urls.len(),
            "merged query results"
        );
        per_query.push(QueryReport {
            domain: pq.domain.clone(),
            query: pq.rendered(),
            provider: outcome.provider.clone(),
            attempts: outcome.attempts,
            result_count: outcome.results.len(),
            admitted,
            failed: outcome.failed,
            error: outcome.error.clone(),
        });
        if urls.is_full() {
            break;
        }
    }

    AggregateReport {
        urls,
        per_query,
        deadline_hit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragpipe_core::plan_queries;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubRunner {
        by_domain: BTreeMap<String, Vec<String>>,
        delay_ms_by_domain: BTreeMap<String, u64>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl StubRunner {
        fn new(by_domain: &[(&str, &[&str])]) -> Self {
            let mut map = BTreeMap::new();
            for (d, urls) in by_domain {
                map.insert(
                    d.to_string(),
                    urls.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
                );
            }
            Self {
                by_domain: map,
                delay_ms_by_domain: BTreeMap::new(),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_delay(mut self, domain: &str, ms: u64) -> Self {
            self.delay_ms_by_domain.insert(domain.to_string(), ms);
            self
        }
    }

    #[async_trait::async_trait]
    impl QueryRunner for StubRunner {
        async fn run(
            &self,
            query: &PlannedQuery,
            _max_results: usize,
            _timeout_ms: u64,
        ) -> SearchOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(ms) = self.delay_ms_by_domain.get(&query.domain) {
                tokio::time::sleep(std::time::Duration::from_millis(*ms)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let urls = self.by_domain.get(&query.domain).cloned();
            match urls {
                Some(urls) => SearchOutcome {
                    results: urls
                        .into_iter()
                        .map(|u| ragpipe_core::SearchResult {
                            url: u,
                            title: None,
                            snippet: None,
                            source: "stub".to_string(),
                        })
                        .collect(),
                    provider: "stub".to_string(),
                    attempts: 1,
                    failed: false,
                    error: None,
                },
                None => SearchOutcome {
                    results: Vec::new(),
                    provider: "stub".to_string(),
                    attempts: 3,
                    failed: true,
                    error: Some("search failed: down".to_string()),
                },
            }
        }
    }

    fn domains(ds: &[&str]) -> Vec<String> {
        ds.iter().map(|d| d.to_string()).collect()
    }

    #[tokio::test]
    async fn merges_disjoint_results_in_domain_order() {
        let cdc: Vec<String> = (1..=5).map(|i| format!("https://cdc.gov/p{i}")).collect();
        let who: Vec<String> = (1..=4).map(|i| format!("https://who.int/p{i}")).collect();
        let cdc_refs: Vec<&str> = cdc.iter().map(|s| s.as_str()).collect();
        let who_refs: Vec<&str> = who.iter().map(|s| s.as_str()).collect();
        let runner = StubRunner::new(&[("cdc.gov", &cdc_refs[..]), ("who.int", &who_refs[..])]);

        let queries = plan_queries("How to prevent Rabies?", &domains(&["cdc.gov", "who.int"]));
        let report = aggregate(&runner, &queries, &AggregateOptions::default()).await;

        assert_eq!(report.urls.len(), 9);
        let got: Vec<&str> = report.urls.iter().collect();
        let want: Vec<String> = cdc.iter().chain(who.iter()).cloned().collect();
        assert_eq!(got, want.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn merge_order_follows_plan_not_arrival() {
        // First domain answers slowly; merged output must still lead with it.
        let runner = StubRunner::new(&[
            ("slow.example", &["https://slow.example/1"][..]),
            ("fast.example", &["https://fast.example/1"][..]),
        ])
        .with_delay("slow.example", 50);

        let queries = plan_queries("q", &domains(&["slow.example", "fast.example"]));
        let opts = AggregateOptions {
            parallelism: 2,
            ..Default::default()
        };
        let report = aggregate(&runner, &queries, &opts).await;

        let got: Vec<&str> = report.urls.iter().collect();
        assert_eq!(got, vec!["https://slow.example/1", "https://fast.example/1"]);
    }

    #[tokio::test]
    async fn overlapping_urls_keep_first_domain_position() {
        let shared = "https://shared.example/page";
        let runner = StubRunner::new(&[
            ("a.example", &[shared, "https://a.example/1"][..]),
            ("b.example", &[shared, "https://b.example/1"][..]),
        ]);

        let queries = plan_queries("q", &domains(&["a.example", "b.example"]));
        let report = aggregate(&runner, &queries, &AggregateOptions::default()).await;

        let got: Vec<&str> = report.urls.iter().collect();
        assert_eq!(
            got,
            vec![shared, "https://a.example/1", "https://b.example/1"]
        );
    }

    #[tokio::test]
    async fn stops_at_cap_even_mid_domain() {
        let many: Vec<String> = (1..=8).map(|i| format!("https://a.example/{i}")).collect();
        let many_refs: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
        let runner = StubRunner::new(&[
            ("a.example", &many_refs[..]),
            ("b.example", &["https://b.example/1"][..]),
        ]);

        let queries = plan_queries("q", &domains(&["a.example", "b.example"]));
        let opts = AggregateOptions {
            cap: 3,
            parallelism: 1,
            ..Default::default()
        };
        let report = aggregate(&runner, &queries, &opts).await;

        assert_eq!(report.urls.len(), 3);
        // The second query is never consumed once the set froze.
        assert_eq!(report.per_query.len(), 1);
        assert_eq!(report.per_query[0].admitted, 3);
    }

    #[tokio::test]
    async fn all_empty_queries_yield_empty_set_without_error() {
        let runner = StubRunner::new(&[]);
        let ds: Vec<String> = (0..28).map(|i| format!("d{i}.example")).collect();
        let queries = plan_queries("q", &ds);

        let report = aggregate(&runner, &queries, &AggregateOptions::default()).await;
        assert!(report.urls.is_empty());
        assert_eq!(report.per_query.len(), 28);
        assert_eq!(report.failed_count(), 28);
    }

    #[tokio::test]
    async fn skips_results_that_are_not_urls() {
        let runner = StubRunner::new(&[(
            "a.example",
            &["notaurl", "https://a.example/ok", "ftp://a.example/no"][..],
        )]);
        let queries = plan_queries("q", &domains(&["a.example"]));
        let report = aggregate(&runner, &queries, &AggregateOptions::default()).await;

        let got: Vec<&str> = report.urls.iter().collect();
        assert_eq!(got, vec!["https://a.example/ok"]);
    }

    #[tokio::test]
    async fn deadline_keeps_partial_results() {
        let runner = StubRunner::new(&[
            ("fast.example", &["https://fast.example/1"][..]),
            ("slow.example", &["https://slow.example/1"][..]),
        ])
        .with_delay("slow.example", 500);

        let queries = plan_queries("q", &domains(&["fast.example", "slow.example"]));
        let opts = AggregateOptions {
            parallelism: 1,
            deadline: Some(tokio::time::Instant::now() + std::time::Duration::from_millis(80)),
            ..Default::default()
        };
        let report = aggregate(&runner, &queries, &opts).await;

        assert!(report.deadline_hit);
        let got: Vec<&str> = report.urls.iter().collect();
        assert_eq!(got, vec!["https://fast.example/1"]);
        assert_eq!(report.per_query.len(), 1);
    }

    #[tokio::test]
    async fn respects_parallelism_bound() {
        let ds: Vec<String> = (0..6).map(|i| format!("d{i}.example")).collect();
        let pairs: Vec<(String, Vec<String>)> = ds
            .iter()
            .map(|d| (d.clone(), vec![format!("https://{d}/1")]))
            .collect();
        let pair_refs: Vec<(&str, Vec<&str>)> = pairs
            .iter()
            .map(|(d, urls)| (d.as_str(), urls.iter().map(|u| u.as_str()).collect()))
            .collect();
        let mut runner = StubRunner::new(
            &pair_refs
                .iter()
                .map(|(d, urls)| (*d, &urls[..]))
                .collect::<Vec<_>>(),
        );
        for d in &ds {
            runner.delay_ms_by_domain.insert(d.clone(), 20);
        }
        let max_seen = runner.max_in_flight.clone();

        let queries = plan_queries("q", &ds);
        let opts = AggregateOptions {
            parallelism: 2,
            ..Default::default()
        };
        let report = aggregate(&runner, &queries, &opts).await;

        assert_eq!(report.urls.len(), 6);
        assert!(
            max_seen.load(Ordering::SeqCst) <= 2,
            "in-flight exceeded bound: {}",
            max_seen.load(Ordering::SeqCst)
        );
    }
}
