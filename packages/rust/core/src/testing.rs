//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventcatalog_crawler::{FetchError, FetchOptions, FetchedPage, PageContent, PageFetcher};
use eventcatalog_discovery::{ProviderError, RawHit, SearchProvider};
use eventcatalog_shared::{OrganizerRecord, TrustTier};

use crate::oracle::{ExtractionOracle, OracleError, OracleOutcome, SchemaHint};
use crate::sources::{IdentitySource, LookupOutcome, SourceError};

/// Minimal HTML page with a title, a heading and `body` inside `<main>`.
pub fn html_page(title: &str, body: &str) -> String {
    format!(
        "<html><head><title>{title}</title></head>\
         <body><main><h1>{title}</h1>{body}</main></body></html>"
    )
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Serves canned pages by exact URL; anything else is a 404.
#[derive(Default)]
pub struct MockFetcher {
    pages: HashMap<String, String>,
    failures: HashMap<String, u16>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }

    pub fn failing(mut self, url: &str, status: u16) -> Self {
        self.failures.insert(url.to_string(), status);
        self
    }

    /// URLs requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &str,
        _opts: &FetchOptions,
    ) -> std::result::Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(status) = self.failures.get(url) {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: *status,
            });
        }
        match self.pages.get(url) {
            Some(html) => Ok(FetchedPage {
                html: html.clone(),
                final_url: url.to_string(),
                status_code: 200,
            }),
            None => Err(FetchError::Http {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Scripted extraction by page URL. Unscripted pages have no event.
#[derive(Default)]
pub struct MockOracle {
    replies: HashMap<String, OracleOutcome>,
    malformed: HashSet<String>,
    panicking: HashSet<String>,
    unavailable: bool,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, url: &str, outcome: OracleOutcome) -> Self {
        self.replies.insert(url.to_string(), outcome);
        self
    }

    pub fn malformed(mut self, url: &str) -> Self {
        self.malformed.insert(url.to_string());
        self
    }

    /// Extraction of `url` panics.
    pub fn panics(mut self, url: &str) -> Self {
        self.panicking.insert(url.to_string());
        self
    }

    /// Every call fails as if the service were down.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }
}

#[async_trait]
impl ExtractionOracle for MockOracle {
    async fn extract(
        &self,
        page: &PageContent,
        _hint: SchemaHint,
    ) -> std::result::Result<OracleOutcome, OracleError> {
        if self.unavailable {
            return Err(OracleError::Unavailable("HTTP 401: invalid key".into()));
        }
        if self.panicking.contains(&page.url) {
            panic!("extraction blew up on {}", page.url);
        }
        if self.malformed.contains(&page.url) {
            return Err(OracleError::Malformed("reply is not JSON".into()));
        }
        Ok(self
            .replies
            .get(&page.url)
            .cloned()
            .unwrap_or(OracleOutcome::NoEvent))
    }
}

// ---------------------------------------------------------------------------
// Identity source
// ---------------------------------------------------------------------------

/// Identity source that fails a set number of times, then answers.
pub struct MockSource {
    name: String,
    tier: TrustTier,
    failures: usize,
    record: Option<OrganizerRecord>,
    calls: AtomicUsize,
}

impl MockSource {
    fn build(name: &str, tier: TrustTier, failures: usize, record: Option<OrganizerRecord>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tier,
            failures,
            record,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn not_found(name: &str, tier: TrustTier) -> Arc<Self> {
        Self::build(name, tier, 0, None)
    }

    pub fn found(name: &str, tier: TrustTier, record: OrganizerRecord) -> Arc<Self> {
        Self::build(name, tier, 0, Some(record))
    }

    /// Fails `times` calls, then reports no match.
    pub fn failing(name: &str, tier: TrustTier, times: usize) -> Arc<Self> {
        Self::build(name, tier, times, None)
    }

    /// Fails `times` calls, then returns `record`.
    pub fn failing_then(
        name: &str,
        tier: TrustTier,
        times: usize,
        record: OrganizerRecord,
    ) -> Arc<Self> {
        Self::build(name, tier, times, Some(record))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentitySource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> TrustTier {
        self.tier
    }

    async fn lookup(
        &self,
        _name: &str,
        _known: &OrganizerRecord,
    ) -> std::result::Result<LookupOutcome, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SourceError::new(&self.name, "HTTP 503"));
        }
        Ok(match &self.record {
            Some(record) => LookupOutcome::Found(record.clone()),
            None => LookupOutcome::NotFound,
        })
    }
}

// ---------------------------------------------------------------------------
// Search provider
// ---------------------------------------------------------------------------

/// Returns the same hits for every query and records the queries.
pub struct MockProvider {
    hits: Vec<RawHit>,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(hits: Vec<RawHit>) -> Arc<Self> {
        Arc::new(Self {
            hits,
            fail: false,
            queries: Mutex::new(Vec::new()),
        })
    }

    /// Rejects every call with an authentication error.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            hits: Vec::new(),
            fail: true,
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(&self, query: &str) -> std::result::Result<Vec<RawHit>, ProviderError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(ProviderError::Auth("HTTP 401".into()));
        }
        Ok(self.hits.clone())
    }
}
