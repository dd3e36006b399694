//! Organizer identity resolution.
//!
//! The [`OrganizerResolver`] consults identity sources from most to least
//! authoritative and folds each answer into the organizer record with the
//! trust merge: a field set by a higher tier is never overwritten by a lower
//! one, unset fields are always filled. Resolution stops as soon as the
//! high-value fields (EIN, legal name, a social handle, a contact title) are
//! all known.

use std::sync::Arc;
use std::time::Duration;

use eventcatalog_shared::{OrganizerRecord, OrganizerStub};
use tracing::{debug, info, instrument, warn};

use crate::sources::{IdentitySource, LookupOutcome, SourceError};

/// Outcome of asking one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Found,
    NotFound,
    Error,
}

/// One source consulted for one organizer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolutionAttempt {
    pub organizer_name: String,
    pub source: String,
    pub outcome: AttemptOutcome,
    pub ein_candidate: Option<String>,
}

/// Resolves organizer identity across the configured sources.
pub struct OrganizerResolver {
    /// Most authoritative first.
    sources: Vec<Arc<dyn IdentitySource>>,
    retry_backoff: Duration,
}

impl OrganizerResolver {
    pub fn new(mut sources: Vec<Arc<dyn IdentitySource>>, retry_backoff: Duration) -> Self {
        sources.sort_by(|a, b| b.tier().cmp(&a.tier()));
        Self {
            sources,
            retry_backoff,
        }
    }

    /// Source names in the order they are consulted.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Resolve the organizer an event page named.
    ///
    /// The page hints seed the record at the lowest tier. Never fails: an
    /// organizer no source can identify comes back without an EIN.
    pub async fn resolve(&self, stub: &OrganizerStub) -> OrganizerRecord {
        self.enrich(OrganizerRecord::from_stub(stub)).await
    }

    /// Run the sources again over an existing record. Fields already held
    /// at a higher tier than a source's are left alone.
    pub async fn enrich(&self, record: OrganizerRecord) -> OrganizerRecord {
        self.enrich_traced(record).await.0
    }

    #[instrument(skip_all, fields(organizer = record.display_name().unwrap_or("")))]
    pub(crate) async fn enrich_traced(
        &self,
        mut record: OrganizerRecord,
    ) -> (OrganizerRecord, Vec<ResolutionAttempt>) {
        let mut attempts = Vec::new();
        if record.has_high_value_fields() {
            debug!("already complete");
            return (record, attempts);
        }

        for source in &self.sources {
            let Some(name) = record.display_name().map(str::to_string) else {
                break;
            };

            let attempt = match self.lookup_with_retry(source.as_ref(), &name, &record).await {
                Ok(LookupOutcome::Found(found)) => {
                    let ein_candidate = found.ein_value().map(str::to_string);
                    record.absorb(&found);
                    ResolutionAttempt {
                        organizer_name: name,
                        source: source.name().to_string(),
                        outcome: AttemptOutcome::Found,
                        ein_candidate,
                    }
                }
                Ok(LookupOutcome::NotFound) => ResolutionAttempt {
                    organizer_name: name,
                    source: source.name().to_string(),
                    outcome: AttemptOutcome::NotFound,
                    ein_candidate: None,
                },
                Err(e) => {
                    warn!(source = source.name(), error = %e, "source failed twice, treating as not found");
                    ResolutionAttempt {
                        organizer_name: name,
                        source: source.name().to_string(),
                        outcome: AttemptOutcome::Error,
                        ein_candidate: None,
                    }
                }
            };
            debug!(
                source = %attempt.source,
                outcome = ?attempt.outcome,
                ein = attempt.ein_candidate.as_deref().unwrap_or(""),
                "resolution attempt"
            );
            attempts.push(attempt);

            if record.has_high_value_fields() {
                debug!("high-value fields complete, stopping early");
                break;
            }
        }

        info!(
            ein = record.ein_value().unwrap_or(""),
            status = record.status().as_str(),
            sources = attempts.len(),
            "organizer resolved"
        );
        (record, attempts)
    }

    /// One retry with backoff, then give up.
    async fn lookup_with_retry(
        &self,
        source: &dyn IdentitySource,
        name: &str,
        known: &OrganizerRecord,
    ) -> std::result::Result<LookupOutcome, SourceError> {
        match source.lookup(name, known).await {
            Err(e) => {
                debug!(source = source.name(), error = %e, backoff = ?self.retry_backoff, "retrying source");
                tokio::time::sleep(self.retry_backoff).await;
                source.lookup(name, known).await
            }
            ok => ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use eventcatalog_shared::{OrganizerHints, Sourced, TrustTier};

    use super::*;
    use crate::testing::MockSource;

    fn sourced(value: &str, tier: TrustTier) -> Option<Sourced<String>> {
        Some(Sourced::new(value.to_string(), tier))
    }

    fn stub() -> OrganizerStub {
        OrganizerStub {
            name: "Lakeview Charities".into(),
            hints: OrganizerHints {
                website: Some("https://lakeview.org".into()),
                ..Default::default()
            },
        }
    }

    fn with_ein(ein: &str, tier: TrustTier) -> OrganizerRecord {
        let mut record = OrganizerRecord::default();
        record.ein = sourced(ein, tier);
        record
    }

    fn resolver(sources: Vec<Arc<MockSource>>) -> OrganizerResolver {
        OrganizerResolver::new(
            sources
                .into_iter()
                .map(|s| s as Arc<dyn IdentitySource>)
                .collect(),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn sources_run_most_authoritative_first() {
        let web = MockSource::not_found("web_search", TrustTier::WebSearch);
        let irs = MockSource::not_found("irs_registry", TrustTier::IrsRegistry);
        let resolver = resolver(vec![web, irs]);
        assert_eq!(resolver.source_names(), vec!["irs_registry", "web_search"]);
    }

    #[tokio::test]
    async fn conflicting_eins_keep_higher_priority() {
        let irs = MockSource::found(
            "irs_registry",
            TrustTier::IrsRegistry,
            with_ein("36-1234567", TrustTier::IrsRegistry),
        );
        let web = MockSource::found(
            "web_search",
            TrustTier::WebSearch,
            with_ein("99-7654321", TrustTier::WebSearch),
        );
        let resolver = resolver(vec![web, irs]);

        let (record, attempts) = resolver
            .enrich_traced(OrganizerRecord::from_stub(&stub()))
            .await;
        assert_eq!(record.ein_value(), Some("36-1234567"));
        assert!(record.alternate_eins.contains("99-7654321"));
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].ein_candidate.as_deref(), Some("99-7654321"));
    }

    #[tokio::test]
    async fn lower_tier_fills_unset_fields_only() {
        let irs = MockSource::found("irs_registry", TrustTier::IrsRegistry, {
            let mut r = with_ein("36-1234567", TrustTier::IrsRegistry);
            r.legal_name = sourced("Lakeview Charities Inc", TrustTier::IrsRegistry);
            r
        });
        let profile = MockSource::found("oracle_profile", TrustTier::OracleProfile, {
            let mut r = OrganizerRecord::default();
            r.legal_name = sourced("Lakeview", TrustTier::OracleProfile);
            r.contact_title = sourced("Executive Director", TrustTier::OracleProfile);
            r
        });
        let record = resolver(vec![irs, profile]).resolve(&stub()).await;

        assert_eq!(record.legal_name, sourced("Lakeview Charities Inc", TrustTier::IrsRegistry));
        assert_eq!(record.contact_title, sourced("Executive Director", TrustTier::OracleProfile));
        assert_eq!(record.website, sourced("https://lakeview.org", TrustTier::PageExtraction));
    }

    #[tokio::test]
    async fn stops_once_high_value_fields_are_complete() {
        let irs = MockSource::found("irs_registry", TrustTier::IrsRegistry, {
            let mut r = with_ein("36-1234567", TrustTier::IrsRegistry);
            r.legal_name = sourced("Lakeview Charities Inc", TrustTier::IrsRegistry);
            r.contact_title = sourced("Executive Director", TrustTier::IrsRegistry);
            r.socials.insert(
                "facebook".into(),
                Sourced::new("lakeview".into(), TrustTier::IrsRegistry),
            );
            r
        });
        let web = MockSource::not_found("web_search", TrustTier::WebSearch);
        let resolver = resolver(vec![irs, web.clone()]);

        let record = resolver.resolve(&stub()).await;
        assert!(record.has_high_value_fields());
        assert_eq!(web.calls(), 0);
    }

    #[tokio::test]
    async fn failing_source_is_retried_once_then_skipped() {
        let flaky = MockSource::failing("causeiq", TrustTier::CauseIq, 5);
        let web = MockSource::found(
            "web_search",
            TrustTier::WebSearch,
            with_ein("36-1234567", TrustTier::WebSearch),
        );
        let resolver = resolver(vec![flaky.clone(), web]);

        let (record, attempts) = resolver
            .enrich_traced(OrganizerRecord::from_stub(&stub()))
            .await;
        assert_eq!(flaky.calls(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Error);
        assert_eq!(record.ein_value(), Some("36-1234567"));
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let flaky = MockSource::failing_then(
            "causeiq",
            TrustTier::CauseIq,
            1,
            with_ein("36-1234567", TrustTier::CauseIq),
        );
        let record = resolver(vec![flaky.clone()]).resolve(&stub()).await;
        assert_eq!(flaky.calls(), 2);
        assert_eq!(record.ein_value(), Some("36-1234567"));
    }

    #[tokio::test]
    async fn unresolvable_organizer_has_no_ein() {
        let record = resolver(vec![MockSource::not_found("irs_registry", TrustTier::IrsRegistry)])
            .resolve(&stub())
            .await;
        assert_eq!(record.ein, None);
        assert_eq!(record.display_name(), Some("Lakeview Charities"));
    }

    #[tokio::test]
    async fn re_resolving_complete_organizer_changes_nothing() {
        let irs = MockSource::found("irs_registry", TrustTier::IrsRegistry, {
            let mut r = with_ein("36-1234567", TrustTier::IrsRegistry);
            r.legal_name = sourced("Lakeview Charities Inc", TrustTier::IrsRegistry);
            r.contact_title = sourced("Executive Director", TrustTier::IrsRegistry);
            r.socials.insert(
                "facebook".into(),
                Sourced::new("lakeview".into(), TrustTier::IrsRegistry),
            );
            r
        });
        let first = resolver(vec![irs]).resolve(&stub()).await;

        let contrary = MockSource::found("irs_registry", TrustTier::IrsRegistry, {
            let mut r = with_ein("11-1111111", TrustTier::IrsRegistry);
            r.legal_name = sourced("Someone Else", TrustTier::IrsRegistry);
            r
        });
        let again = resolver(vec![contrary]).enrich(first.clone()).await;
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn re_enrichment_never_degrades_higher_tier_fields() {
        let mut existing = OrganizerRecord::named("Lakeview Charities");
        existing.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        existing.legal_name = sourced("Lakeview Charities Inc", TrustTier::IrsRegistry);

        let web = MockSource::found("web_search", TrustTier::WebSearch, {
            let mut r = with_ein("99-7654321", TrustTier::WebSearch);
            r.legal_name = sourced("Lakeview Charity", TrustTier::WebSearch);
            r.contact_title = sourced("Board Chair", TrustTier::WebSearch);
            r
        });
        let record = resolver(vec![web]).enrich(existing).await;
        assert_eq!(record.ein, sourced("36-1234567", TrustTier::IrsRegistry));
        assert_eq!(record.legal_name, sourced("Lakeview Charities Inc", TrustTier::IrsRegistry));
        assert_eq!(record.contact_title, sourced("Board Chair", TrustTier::WebSearch));
    }
}
