//! Search-result discovery across providers.
//!
//! The [`SearchAggregator`] fans a query out to every configured
//! [`SearchProvider`] in priority order and merges the results into one
//! deduplicated list of [`SearchHit`]s keyed by normalized URL. When two
//! providers return the same URL the higher-priority provider's hit is kept
//! and the other's title and snippet are discarded.

mod providers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use eventcatalog_shared::{CatalogError, Result, RetryPolicy, SearchHit, normalize_url};
use tracing::{debug, info, instrument, warn};

pub use providers::{
    GoogleCseProvider, ProviderError, RawHit, SearchProvider, SerpApiProvider, build_client,
    providers_from_config,
};

// ---------------------------------------------------------------------------
// SearchAggregator
// ---------------------------------------------------------------------------

/// Merges and deduplicates hits from several providers.
pub struct SearchAggregator {
    /// Priority order: first listed wins on duplicates.
    providers: Vec<Arc<dyn SearchProvider>>,
    retry: RetryPolicy,
    /// Normalized URLs already handled by earlier runs.
    processed: HashSet<String>,
    /// Ignore `processed` and return every hit.
    force: bool,
}

impl SearchAggregator {
    pub fn new(providers: Vec<Arc<dyn SearchProvider>>, retry: RetryPolicy) -> Self {
        Self {
            providers,
            retry,
            processed: HashSet::new(),
            force: false,
        }
    }

    /// Skip hits whose normalized URL is in `processed`.
    pub fn with_processed(mut self, processed: HashSet<String>) -> Self {
        self.processed = processed;
        self
    }

    /// Return already-processed URLs too.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Search every provider for `query` near `location`.
    ///
    /// Providers that fail are logged and excluded; if all of them fail the
    /// result is [`CatalogError::SearchUnavailable`].
    #[instrument(skip_all, fields(query = %query))]
    pub async fn search(&self, query: &str, location: &str) -> Result<Vec<SearchHit>> {
        let full_query = compose_query(query, location);
        let mut hits = Vec::new();
        let mut seen = HashSet::new();
        let mut failures = Vec::new();

        for provider in &self.providers {
            let raw = match self.call_with_retry(provider.as_ref(), &full_query).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "search provider failed, excluding");
                    failures.push(format!("{}: {e}", provider.name()));
                    continue;
                }
            };

            for hit in raw {
                let normalized = match normalize_url(&hit.url) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(url = %hit.url, error = %e, "dropping unusable hit");
                        continue;
                    }
                };
                if !seen.insert(normalized.clone()) {
                    continue;
                }
                if !self.force && self.processed.contains(&normalized) {
                    debug!(url = %normalized, "already processed");
                    continue;
                }
                hits.push(SearchHit {
                    url: hit.url,
                    normalized_url: normalized,
                    title: hit.title,
                    snippet: hit.snippet,
                    provider: provider.name().to_string(),
                    query: query.to_string(),
                });
            }
        }

        if !self.providers.is_empty() && failures.len() == self.providers.len() {
            return Err(CatalogError::SearchUnavailable(failures.join("; ")));
        }
        if self.providers.is_empty() {
            return Err(CatalogError::SearchUnavailable(
                "no search providers configured".into(),
            ));
        }

        info!(count = hits.len(), "search complete");
        Ok(hits)
    }

    /// Run every query in order, deduplicating across queries and stopping
    /// once `max_hits` new hits have been collected.
    #[instrument(skip_all, fields(queries = queries.len()))]
    pub async fn search_all(
        &self,
        queries: &[String],
        location: &str,
        max_hits: usize,
        pause: Duration,
    ) -> Result<Vec<SearchHit>> {
        let mut all = Vec::new();
        let mut seen = HashSet::new();

        for (i, query) in queries.iter().enumerate() {
            if all.len() >= max_hits {
                info!(max_hits, "reached per-run hit cap");
                break;
            }
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            for hit in self.search(query, location).await? {
                if all.len() >= max_hits {
                    break;
                }
                if seen.insert(hit.normalized_url.clone()) {
                    all.push(hit);
                }
            }
        }

        info!(total = all.len(), "discovery finished");
        Ok(all)
    }

    async fn call_with_retry(
        &self,
        provider: &dyn SearchProvider,
        query: &str,
    ) -> std::result::Result<Vec<RawHit>, ProviderError> {
        let mut attempt = 1;
        loop {
            match provider.search(query).await {
                Ok(hits) => return Ok(hits),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(provider = provider.name(), attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Append the location unless the query already names its city.
fn compose_query(query: &str, location: &str) -> String {
    let location = location.trim();
    let city = location.split(',').next().unwrap_or("").trim().to_lowercase();
    if location.is_empty() || (!city.is_empty() && query.to_lowercase().contains(&city)) {
        query.to_string()
    } else {
        format!("{query} {location}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Scripted provider: a queue of replies per call, then the fallback.
    struct ScriptedProvider {
        name: String,
        replies: Mutex<Vec<std::result::Result<Vec<RawHit>, ProviderError>>>,
        fallback: Vec<RawHit>,
        calls: AtomicUsize,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn ok(name: &str, hits: Vec<RawHit>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                replies: Mutex::new(Vec::new()),
                fallback: hits,
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn scripted(
            name: &str,
            replies: Vec<std::result::Result<Vec<RawHit>, ProviderError>>,
            fallback: Vec<RawHit>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                replies: Mutex::new(replies.into_iter().rev().collect()),
                fallback,
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SearchProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search(&self, query: &str) -> std::result::Result<Vec<RawHit>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            match self.replies.lock().unwrap().pop() {
                Some(reply) => reply,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    fn hit(url: &str, title: &str) -> RawHit {
        RawHit {
            url: url.into(),
            title: title.into(),
            snippet: format!("snippet for {title}"),
        }
    }

    fn aggregator(providers: Vec<Arc<ScriptedProvider>>) -> SearchAggregator {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn SearchProvider>)
            .collect();
        SearchAggregator::new(providers, RetryPolicy::new(3, Duration::ZERO))
    }

    #[tokio::test]
    async fn duplicate_urls_keep_higher_priority_hit() {
        let serp = ScriptedProvider::ok(
            "serpapi",
            vec![hit("https://a.org/gala?utm=1", "Serp title")],
        );
        let cse = ScriptedProvider::ok(
            "google_cse",
            vec![
                hit("https://a.org/gala", "CSE title"),
                hit("https://b.org/ball", "Ball"),
            ],
        );
        let agg = aggregator(vec![serp, cse]);

        let hits = agg.search("charity gala", "Chicago, IL").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].normalized_url, "https://a.org/gala");
        assert_eq!(hits[0].provider, "serpapi");
        assert_eq!(hits[0].title, "Serp title");
        assert_eq!(hits[1].provider, "google_cse");
    }

    #[tokio::test]
    async fn failing_provider_is_excluded() {
        let broken = ScriptedProvider::scripted(
            "serpapi",
            vec![Err(ProviderError::Auth("bad key".into()))],
            vec![],
        );
        let cse = ScriptedProvider::ok("google_cse", vec![hit("https://a.org/gala", "Gala")]);
        let agg = aggregator(vec![broken.clone(), cse]);

        let hits = agg.search("gala", "").await.unwrap();
        assert_eq!(hits.len(), 1);
        // Auth errors are not retried.
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_providers_failing_is_search_unavailable() {
        let a = ScriptedProvider::scripted(
            "serpapi",
            vec![Err(ProviderError::Other("boom".into()))],
            vec![],
        );
        let b = ScriptedProvider::scripted(
            "google_cse",
            vec![Err(ProviderError::Auth("denied".into()))],
            vec![],
        );
        let agg = aggregator(vec![a, b]);

        let err = agg.search("gala", "").await.unwrap_err();
        assert!(matches!(err, CatalogError::SearchUnavailable(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let flaky = ScriptedProvider::scripted(
            "serpapi",
            vec![
                Err(ProviderError::Transient("429".into())),
                Err(ProviderError::Transient("503".into())),
            ],
            vec![hit("https://a.org/gala", "Gala")],
        );
        let agg = aggregator(vec![flaky.clone()]);

        let hits = agg.search("gala", "").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let down = ScriptedProvider::scripted(
            "serpapi",
            (0..5)
                .map(|_| Err(ProviderError::Transient("503".into())))
                .collect(),
            vec![],
        );
        let agg = aggregator(vec![down.clone()]);

        assert!(agg.search("gala", "").await.is_err());
        assert_eq!(down.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn processed_urls_are_skipped_unless_forced() {
        let provider = ScriptedProvider::ok(
            "serpapi",
            vec![
                hit("https://a.org/gala", "Gala"),
                hit("https://b.org/ball", "Ball"),
            ],
        );
        let processed: HashSet<String> = ["https://a.org/gala".to_string()].into();

        let agg = aggregator(vec![provider.clone()]).with_processed(processed.clone());
        let hits = agg.search("gala", "").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].normalized_url, "https://b.org/ball");

        let forced = aggregator(vec![provider])
            .with_processed(processed)
            .with_force(true);
        assert_eq!(forced.search("gala", "").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn search_all_dedupes_across_queries_and_caps() {
        let provider = ScriptedProvider::ok(
            "serpapi",
            vec![
                hit("https://a.org/gala", "Gala"),
                hit("https://b.org/ball", "Ball"),
                hit("https://c.org/run", "Run"),
            ],
        );
        let agg = aggregator(vec![provider.clone()]);
        let queries = vec!["charity gala".to_string(), "charity ball".to_string()];

        let all = agg
            .search_all(&queries, "Chicago, IL", 100, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].query, "charity gala");

        let capped = agg
            .search_all(&queries, "Chicago, IL", 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn location_is_appended_once() {
        let provider = ScriptedProvider::ok("serpapi", vec![]);
        let agg = aggregator(vec![provider.clone()]);
        agg.search("charity gala", "Chicago, IL").await.unwrap();
        agg.search("nonprofit gala Chicago 2025", "Chicago, IL")
            .await
            .unwrap();

        let queries = provider.queries.lock().unwrap().clone();
        assert_eq!(queries[0], "charity gala Chicago, IL");
        assert_eq!(queries[1], "nonprofit gala Chicago 2025");
    }

    #[test]
    fn compose_query_without_location() {
        assert_eq!(compose_query("gala", ""), "gala");
        assert_eq!(compose_query("gala", "Evanston, IL"), "gala Evanston, IL");
    }
}
