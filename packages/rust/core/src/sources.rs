//! Organizer identity sources.
//!
//! Each source looks an organizer up by name and returns whatever it found
//! as an [`OrganizerRecord`] whose fields carry the source's trust tier. The
//! resolver decides what to keep.
//!
//! Registry-style sources run a site-scoped web search and read the EIN out
//! of result titles and snippets, falling back to the top result page. The
//! profile source asks the oracle to read the organizer's own website.

use std::sync::Arc;

use async_trait::async_trait;
use eventcatalog_crawler::{FetchOptions, PageContent, PageFetcher};
use eventcatalog_discovery::{RawHit, SearchProvider};
use eventcatalog_shared::{
    AppConfig, CatalogError, OrganizerRecord, Result, ResolverConfig, TrustTier, find_ein,
    normalize_name, offer, offer_ein,
};
use tracing::{debug, instrument};

use crate::oracle::{ExtractionOracle, OracleOutcome, SchemaHint};

// ---------------------------------------------------------------------------
// Trait + types
// ---------------------------------------------------------------------------

/// What a source knows about an organizer.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(OrganizerRecord),
    NotFound,
}

/// A lookup that could not be completed.
#[derive(Debug, thiserror::Error)]
#[error("{source_name} lookup failed: {message}")]
pub struct SourceError {
    pub source_name: String,
    pub message: String,
}

impl SourceError {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// An external system that can identify organizers.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Name as used in the `[resolver]` config.
    fn name(&self) -> &str;

    /// Trust tier of every field this source writes.
    fn tier(&self) -> TrustTier;

    /// Look up `name`. `known` holds what is already known about the
    /// organizer (website, EIN) for sources that can use it.
    async fn lookup(
        &self,
        name: &str,
        known: &OrganizerRecord,
    ) -> std::result::Result<LookupOutcome, SourceError>;
}

// ---------------------------------------------------------------------------
// Search-backed sources
// ---------------------------------------------------------------------------

/// Site-scoped search lookup.
pub struct SearchSource {
    name: &'static str,
    tier: TrustTier,
    /// `site:` filters; empty for an open web search.
    sites: &'static [&'static str],
    /// Whether result titles are registry listings naming the organization.
    titles_name_organization: bool,
    provider: Arc<dyn SearchProvider>,
    /// Fetches the top result when titles and snippets carry no EIN.
    fetcher: Option<Arc<dyn PageFetcher>>,
    fetch: FetchOptions,
    max_results: usize,
}

impl SearchSource {
    /// ProPublica Nonprofit Explorer and the IRS exempt-organization search.
    pub fn irs_registry(provider: Arc<dyn SearchProvider>) -> Self {
        Self::new(
            "irs_registry",
            TrustTier::IrsRegistry,
            &["projects.propublica.org", "apps.irs.gov"],
            true,
            provider,
        )
    }

    pub fn causeiq(provider: Arc<dyn SearchProvider>) -> Self {
        Self::new("causeiq", TrustTier::CauseIq, &["causeiq.com"], true, provider)
    }

    pub fn charity_navigator(provider: Arc<dyn SearchProvider>) -> Self {
        Self::new(
            "charity_navigator",
            TrustTier::CharityNavigator,
            &["charitynavigator.org"],
            true,
            provider,
        )
    }

    /// Open `"<name>" nonprofit EIN` search.
    pub fn web_search(provider: Arc<dyn SearchProvider>) -> Self {
        Self::new("web_search", TrustTier::WebSearch, &[], false, provider)
    }

    fn new(
        name: &'static str,
        tier: TrustTier,
        sites: &'static [&'static str],
        titles_name_organization: bool,
        provider: Arc<dyn SearchProvider>,
    ) -> Self {
        Self {
            name,
            tier,
            sites,
            titles_name_organization,
            provider,
            fetcher: None,
            fetch: FetchOptions::default(),
            max_results: 5,
        }
    }

    /// Fall back to fetching the top matching result page.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>, fetch: FetchOptions) -> Self {
        self.fetcher = Some(fetcher);
        self.fetch = fetch;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    fn query(&self, name: &str) -> String {
        if self.sites.is_empty() {
            format!("\"{name}\" nonprofit EIN")
        } else {
            let sites: Vec<String> = self.sites.iter().map(|s| format!("site:{s}")).collect();
            format!("\"{name}\" {}", sites.join(" OR "))
        }
    }

    fn found(&self, ein: String, hit: &RawHit) -> OrganizerRecord {
        let mut record = OrganizerRecord::default();
        offer_ein(&mut record, ein, self.tier);
        if self.titles_name_organization {
            if let Some(legal_name) = listing_name(&hit.title) {
                offer(&mut record.legal_name, legal_name, self.tier);
            }
        }
        record
    }
}

#[async_trait]
impl IdentitySource for SearchSource {
    fn name(&self) -> &str {
        self.name
    }

    fn tier(&self) -> TrustTier {
        self.tier
    }

    #[instrument(skip_all, fields(name = %name))]
    async fn lookup(
        &self,
        name: &str,
        _known: &OrganizerRecord,
    ) -> std::result::Result<LookupOutcome, SourceError> {
        let key = normalize_name(name);
        if key.is_empty() {
            return Ok(LookupOutcome::NotFound);
        }

        let hits = self
            .provider
            .search(&self.query(name))
            .await
            .map_err(|e| SourceError::new(self.name, e.to_string()))?;

        let relevant: Vec<&RawHit> = hits
            .iter()
            .take(self.max_results)
            .filter(|hit| mentions(hit, &key))
            .collect();
        debug!(source = self.name, hits = hits.len(), relevant = relevant.len(), "search lookup");

        for hit in &relevant {
            if let Some(ein) = find_ein(&format!("{} {}", hit.title, hit.snippet)) {
                return Ok(LookupOutcome::Found(self.found(ein, hit)));
            }
        }

        let (Some(fetcher), Some(top)) = (&self.fetcher, relevant.first()) else {
            return Ok(LookupOutcome::NotFound);
        };
        match fetcher.fetch(&top.url, &self.fetch).await {
            Ok(page) => {
                let content = PageContent::from_html(&page.final_url, &page.html, usize::MAX);
                match find_ein(&content.text) {
                    Some(ein) => Ok(LookupOutcome::Found(self.found(ein, top))),
                    None => Ok(LookupOutcome::NotFound),
                }
            }
            Err(e) => Err(SourceError::new(self.name, e.to_string())),
        }
    }
}

/// Whether a hit is about the organization named by `key`.
fn mentions(hit: &RawHit, key: &str) -> bool {
    normalize_name(&format!("{} {}", hit.title, hit.snippet)).contains(key)
}

/// Organization name from a listing title such as
/// `"Lakeview Charities Inc - Nonprofit Explorer - ProPublica"`.
fn listing_name(title: &str) -> Option<String> {
    let cut = [" - ", " | ", " – ", " — "]
        .iter()
        .filter_map(|sep| title.find(sep))
        .min()
        .unwrap_or(title.len());
    let name = title[..cut].trim();
    (!name.is_empty()).then(|| name.to_string())
}

// ---------------------------------------------------------------------------
// Oracle profile source
// ---------------------------------------------------------------------------

/// Reads the organizer's own website through the oracle.
pub struct ProfileSource {
    fetcher: Arc<dyn PageFetcher>,
    oracle: Arc<dyn ExtractionOracle>,
    fetch: FetchOptions,
    content_chars: usize,
}

impl ProfileSource {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        oracle: Arc<dyn ExtractionOracle>,
        fetch: FetchOptions,
        content_chars: usize,
    ) -> Self {
        Self {
            fetcher,
            oracle,
            fetch,
            content_chars,
        }
    }
}

#[async_trait]
impl IdentitySource for ProfileSource {
    fn name(&self) -> &str {
        "oracle_profile"
    }

    fn tier(&self) -> TrustTier {
        TrustTier::OracleProfile
    }

    #[instrument(skip_all, fields(source = "oracle_profile", name = %name))]
    async fn lookup(
        &self,
        name: &str,
        known: &OrganizerRecord,
    ) -> std::result::Result<LookupOutcome, SourceError> {
        let Some(website) = known.website.as_ref().map(|w| w.value.as_str()) else {
            debug!("no website to read");
            return Ok(LookupOutcome::NotFound);
        };

        let page = self
            .fetcher
            .fetch(website, &self.fetch)
            .await
            .map_err(|e| SourceError::new(self.name(), e.to_string()))?;
        let content = PageContent::from_html(&page.final_url, &page.html, self.content_chars);

        let partial = match self.oracle.extract(&content, SchemaHint::OrganizerProfile).await {
            Ok(OracleOutcome::Extracted(partial)) => partial,
            Ok(OracleOutcome::NoEvent) => return Ok(LookupOutcome::NotFound),
            Err(e) => return Err(SourceError::new(self.name(), e.to_string())),
        };

        let tier = self.tier();
        let mut record = OrganizerRecord::default();
        if let Some(legal_name) = partial.organizer_name {
            offer(&mut record.legal_name, legal_name, tier);
        }
        record.absorb_hints(&partial.hints, tier);
        if record == OrganizerRecord::default() {
            return Ok(LookupOutcome::NotFound);
        }
        record.aliases.insert(name.to_string());
        Ok(LookupOutcome::Found(record))
    }
}

// ---------------------------------------------------------------------------
// Config wiring
// ---------------------------------------------------------------------------

/// Build the sources enabled in `[resolver]`.
///
/// Search-backed sources share `provider`; without one they are skipped.
pub fn sources_from_config(
    config: &AppConfig,
    provider: Option<Arc<dyn SearchProvider>>,
    fetcher: Arc<dyn PageFetcher>,
    oracle: Arc<dyn ExtractionOracle>,
) -> Result<Vec<Arc<dyn IdentitySource>>> {
    let resolver: &ResolverConfig = &config.resolver;
    let fetch = FetchOptions {
        timeout: std::time::Duration::from_secs(config.pipeline.fetch_timeout_secs),
    };
    let mut sources: Vec<Arc<dyn IdentitySource>> = Vec::new();

    for name in &resolver.sources {
        let search = |build: fn(Arc<dyn SearchProvider>) -> SearchSource| {
            provider.clone().map(|p| {
                let source = build(p).with_max_results(resolver.results_per_lookup as usize);
                if resolver.fetch_result_pages {
                    source.with_fetcher(fetcher.clone(), fetch.clone())
                } else {
                    source
                }
            })
        };

        let source: Option<Arc<dyn IdentitySource>> = match name.as_str() {
            "irs_registry" => search(SearchSource::irs_registry).map(|s| Arc::new(s) as _),
            "causeiq" => search(SearchSource::causeiq).map(|s| Arc::new(s) as _),
            "charity_navigator" => {
                search(SearchSource::charity_navigator).map(|s| Arc::new(s) as _)
            }
            "web_search" => search(SearchSource::web_search).map(|s| Arc::new(s) as _),
            "oracle_profile" => Some(Arc::new(ProfileSource::new(
                fetcher.clone(),
                oracle.clone(),
                fetch.clone(),
                config.pipeline.content_chars,
            )) as Arc<dyn IdentitySource>),
            other => {
                return Err(CatalogError::config(format!(
                    "unknown identity source `{other}`"
                )));
            }
        };

        match source {
            Some(source) => sources.push(source),
            None => debug!(source = %name, "no search provider, skipping source"),
        }
    }

    Ok(sources)
}
