//! Multi-page event assembly.
//!
//! Starting from a search hit, the [`EventAssembler`] fetches the seed page,
//! asks the oracle for an event, then walks the pages that extraction points
//! at (ticket, sponsorship and detail pages) breadth-first. Every page that
//! yields an extraction is merged into one [`EventRecord`].
//!
//! The walk is bounded by a page-visit cap and a link depth; a visited set
//! keyed by normalized URL keeps it from looping.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use eventcatalog_crawler::{FetchOptions, PageContent, PageFetcher};
use eventcatalog_shared::{EventRecord, PipelineConfig, Result, normalize_url};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::oracle::{ExtractionOracle, OracleError, OracleOutcome, SchemaHint};

/// Bounds for one assembly.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Pages visited per event, seed included.
    pub max_pages: usize,
    /// Link hops followed from the seed.
    pub max_depth: u32,
    pub fetch: FetchOptions,
    /// Characters of page text handed to the oracle.
    pub content_chars: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for AssemblerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_pages: config.max_pages_per_event.max(1),
            max_depth: config.max_depth,
            fetch: FetchOptions {
                timeout: Duration::from_secs(config.fetch_timeout_secs),
            },
            content_chars: config.content_chars,
        }
    }
}

/// Result of assembling one seed URL.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyOutcome {
    Assembled(EventRecord),
    /// The seed page does not describe an event.
    NoEvent,
}

/// Drives fetcher and oracle across the pages of one event.
pub struct EventAssembler {
    fetcher: Arc<dyn PageFetcher>,
    oracle: Arc<dyn ExtractionOracle>,
    config: AssemblerConfig,
}

impl EventAssembler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        oracle: Arc<dyn ExtractionOracle>,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            fetcher,
            oracle,
            config,
        }
    }

    /// Assemble the event described at `seed_url`.
    ///
    /// A seed fetch failure is [`CatalogError::ContentUnavailable`]; an
    /// unavailable oracle is returned as is so the run can halt. Failures on
    /// secondary pages only shrink the evidence.
    ///
    /// [`CatalogError::ContentUnavailable`]: eventcatalog_shared::CatalogError::ContentUnavailable
    #[instrument(skip_all, fields(seed = %seed_url))]
    pub async fn assemble(&self, seed_url: &str) -> Result<AssemblyOutcome> {
        let seed_key = normalize_url(seed_url)?;
        let mut visited: HashSet<String> = HashSet::from([seed_key]);
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();

        // Seed page: every failure here decides the unit.
        let page = self.load(seed_url).await?;
        let outcome = self.oracle.extract(&page, SchemaHint::Event).await?;
        let OracleOutcome::Extracted(partial) = outcome else {
            debug!("seed page has no event");
            return Ok(AssemblyOutcome::NoEvent);
        };

        let links = follow_targets(&page, &partial.related_urls);
        let mut record = partial.into_event(seed_url);
        if record.name.is_none() {
            record.name = page.fallback_name();
            record.refresh_canonical_id();
        }
        if record.name.is_none() {
            debug!("extraction has no name and page has no title");
            return Ok(AssemblyOutcome::NoEvent);
        }
        enqueue(&mut queue, &mut visited, links, 1, self.config.max_depth);

        let mut pages_visited = 1;
        while let Some((url, depth)) = queue.pop_front() {
            if pages_visited >= self.config.max_pages {
                debug!(remaining = queue.len() + 1, "page cap reached");
                break;
            }
            pages_visited += 1;

            let page = match self.load(&url).await {
                Ok(page) => page,
                Err(e) => {
                    debug!(url = %url, error = %e, "secondary page unavailable");
                    continue;
                }
            };

            let partial = match self.oracle.extract(&page, SchemaHint::Event).await {
                Ok(OracleOutcome::Extracted(partial)) => partial,
                Ok(OracleOutcome::NoEvent) => {
                    debug!(url = %url, "secondary page has no event");
                    continue;
                }
                Err(e @ OracleError::Unavailable(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(url = %url, error = %e, "secondary extraction failed");
                    continue;
                }
            };

            let links = follow_targets(&page, &partial.related_urls);
            let evidence = partial.into_event(&page.url);
            record.absorb(&evidence, &page.url);
            enqueue(&mut queue, &mut visited, links, depth + 1, self.config.max_depth);
        }

        if record.details.registration_url.is_none() {
            record.details.registration_url = Some(seed_url.to_string());
        }
        record.refresh_canonical_id();

        info!(
            pages = pages_visited,
            sources = record.source_urls.len(),
            confidence = record.confidence,
            ambiguous = record.is_ambiguous(),
            "event assembled"
        );
        Ok(AssemblyOutcome::Assembled(record))
    }

    async fn load(&self, url: &str) -> Result<PageContent> {
        let fetched = self.fetcher.fetch(url, &self.config.fetch).await?;
        Ok(PageContent::from_html(
            &fetched.final_url,
            &fetched.html,
            self.config.content_chars,
        ))
    }
}

/// Links worth visiting from `page`: oracle-named pages first, then
/// same-host links that look like event detail pages.
fn follow_targets(page: &PageContent, related: &[String]) -> Vec<String> {
    let base = Url::parse(&page.url).ok();
    related
        .iter()
        .filter_map(|r| match &base {
            Some(base) => base.join(r).ok().map(|u| u.to_string()),
            None => Url::parse(r).ok().map(|u| u.to_string()),
        })
        .chain(page.event_links())
        .collect()
}

fn enqueue(
    queue: &mut VecDeque<(String, u32)>,
    visited: &mut HashSet<String>,
    links: Vec<String>,
    depth: u32,
    max_depth: u32,
) {
    if depth > max_depth {
        return;
    }
    for link in links {
        let Ok(key) = normalize_url(&link) else {
            continue;
        };
        if visited.insert(key) {
            queue.push_back((link, depth));
        }
    }
}
