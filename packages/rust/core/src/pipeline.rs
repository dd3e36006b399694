//! End-to-end run: search → assemble → resolve → store.
//!
//! Every search hit is one unit of work, carried through
//! `Discovered → Assembled → Resolved → Stored` or ending early as
//! `Skipped` or `Failed`. Units run concurrently up to the worker limit and
//! never affect each other, except that a fatal error (search or oracle
//! unavailable) halts the run: units in flight finish, units not yet started
//! are left for the next run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use eventcatalog_discovery::SearchAggregator;
use eventcatalog_shared::{CatalogError, Result, SearchConfig, SearchHit};
use eventcatalog_storage::{CatalogStore, UrlStatus};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::assembler::{AssemblyOutcome, EventAssembler};
use crate::resolver::OrganizerResolver;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Where a unit of work ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Discovered,
    Assembled,
    Resolved,
    Stored,
    Skipped(String),
    Failed(String),
}

impl UnitState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Assembled => "assembled",
            Self::Resolved => "resolved",
            Self::Stored => "stored",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

/// A unit named in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub url: String,
    pub reason: String,
}

/// Per-run counts and the units worth a second look.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Hits handed to the pipeline.
    pub discovered: usize,
    pub stored: usize,
    /// Units that never started because the run halted.
    pub not_started: usize,
    pub skipped: Vec<UnitReport>,
    pub failed: Vec<UnitReport>,
    /// Stored events carrying at least one conflict flag.
    pub ambiguous: Vec<UnitReport>,
    /// Why the run stopped early, if it did.
    pub halted: Option<String>,
    pub elapsed_ms: u64,
}

/// Shared, mutable state of one run.
pub struct RunContext {
    pub run_id: String,
    halted: AtomicBool,
    summary: Mutex<RunSummary>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            summary: Mutex::new(RunSummary {
                run_id: run_id.clone(),
                ..Default::default()
            }),
            run_id,
            halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop starting new units. The first reason wins.
    pub fn halt(&self, reason: &CatalogError) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(error = %reason, "fatal error, halting run");
            self.with_summary(|s| s.halted = Some(reason.to_string()));
        }
    }

    fn record(&self, url: &str, state: &UnitState, ambiguous: bool) {
        self.with_summary(|s| match state {
            UnitState::Stored => {
                s.stored += 1;
                if ambiguous {
                    s.ambiguous.push(UnitReport {
                        url: url.to_string(),
                        reason: "conflicting values across pages".into(),
                    });
                }
            }
            UnitState::Skipped(reason) => s.skipped.push(UnitReport {
                url: url.to_string(),
                reason: reason.clone(),
            }),
            UnitState::Failed(reason) => s.failed.push(UnitReport {
                url: url.to_string(),
                reason: reason.clone(),
            }),
            _ => {}
        });
    }

    fn with_summary<T>(&self, f: impl FnOnce(&mut RunSummary) -> T) -> T {
        let mut guard = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn summary(&self) -> RunSummary {
        self.with_summary(|s| s.clone())
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a unit reaches its terminal state.
    fn unit_done(&self, url: &str, state: &UnitState, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn unit_done(&self, _url: &str, _state: &UnitState, _current: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Sequences search, assembly, resolution and storage.
pub struct Pipeline {
    store: Arc<CatalogStore>,
    assembler: Arc<EventAssembler>,
    resolver: Arc<OrganizerResolver>,
    workers: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<CatalogStore>,
        assembler: Arc<EventAssembler>,
        resolver: Arc<OrganizerResolver>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            assembler,
            resolver,
            workers: workers.max(1),
        }
    }

    /// Search, then process every new hit. The run is recorded in the store
    /// whether or not it completes.
    #[instrument(skip_all, fields(queries = search.queries.len()))]
    pub async fn run(
        &self,
        aggregator: &SearchAggregator,
        search: &SearchConfig,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let run_id = self.store.start_run().await?;
        let ctx = Arc::new(RunContext::new(run_id));
        let start = Instant::now();

        progress.phase("Searching");
        let hits = aggregator
            .search_all(
                &search.queries,
                &search.location,
                search.max_hits_per_run,
                Duration::from_millis(search.query_pause_ms),
            )
            .await;

        match hits {
            Ok(hits) => self.process(&ctx, hits, progress).await?,
            Err(e) if e.is_fatal() => ctx.halt(&e),
            Err(e) => return Err(e),
        }

        self.finish(&ctx, start, progress).await
    }

    /// Process already discovered hits as a run of their own.
    pub async fn run_hits(
        &self,
        hits: Vec<SearchHit>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let run_id = self.store.start_run().await?;
        let ctx = Arc::new(RunContext::new(run_id));
        let start = Instant::now();
        self.process(&ctx, hits, progress).await?;
        self.finish(&ctx, start, progress).await
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        start: Instant,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let mut summary = ctx.summary();
        summary.elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let json = serde_json::to_string(&summary)
            .map_err(|e| CatalogError::Storage(format!("failed to encode run summary: {e}")))?;
        self.store.finish_run(&ctx.run_id, &json).await?;

        info!(
            run_id = %summary.run_id,
            discovered = summary.discovered,
            stored = summary.stored,
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            ambiguous = summary.ambiguous.len(),
            halted = summary.halted.is_some(),
            "run complete"
        );
        progress.done(&summary);
        Ok(summary)
    }

    /// Carry every hit through its unit of work, bounded by the worker limit.
    async fn process(
        &self,
        ctx: &Arc<RunContext>,
        hits: Vec<SearchHit>,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let total = hits.len();
        ctx.with_summary(|s| s.discovered += total);

        for hit in &hits {
            self.store.record_hit(hit).await?;
        }

        progress.phase("Processing events");
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<task::Id, SearchHit> = HashMap::new();
        let mut started = 0;

        for hit in hits {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CatalogError::InvariantViolation(format!("worker pool closed: {e}")))?;
            if ctx.is_halted() {
                break;
            }
            started += 1;

            let unit = Unit {
                store: self.store.clone(),
                assembler: self.assembler.clone(),
                resolver: self.resolver.clone(),
                ctx: ctx.clone(),
            };
            let handle = tasks.spawn({
                let hit = hit.clone();
                async move {
                    let _permit = permit;
                    unit.run(&hit).await
                }
            });
            pending.insert(handle.id(), hit);

            // Report units that finished while we were waiting for permits.
            while let Some(joined) = tasks.try_join_next_with_id() {
                self.settle(joined, &mut pending, ctx, progress, total).await;
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            self.settle(joined, &mut pending, ctx, progress, total).await;
        }

        let not_started = total - started;
        if not_started > 0 {
            warn!(not_started, "run halted before all units started");
            ctx.with_summary(|s| s.not_started = not_started);
        }
        Ok(())
    }

    /// Report a finished unit. A panicked unit is recorded as failed.
    async fn settle(
        &self,
        joined: std::result::Result<(task::Id, UnitState), JoinError>,
        pending: &mut HashMap<task::Id, SearchHit>,
        ctx: &RunContext,
        progress: &dyn ProgressReporter,
        total: usize,
    ) {
        let (id, state) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "unit task panicked");
                let state = UnitState::Failed(PANICKED.into());
                if let Some(hit) = pending.get(&e.id()) {
                    let marked = self
                        .store
                        .mark_url(&hit.normalized_url, UrlStatus::Failed, Some(PANICKED))
                        .await;
                    if let Err(e) = marked {
                        warn!(error = %e, "failed to record URL state");
                    }
                    ctx.record(&hit.url, &state, false);
                }
                (e.id(), state)
            }
        };
        let Some(hit) = pending.remove(&id) else {
            return;
        };
        let current = ctx.with_summary(|s| s.stored + s.skipped.len() + s.failed.len());
        progress.unit_done(&hit.url, &state, current, total);
    }
}

/// One unit of work with handles to the shared collaborators.
struct Unit {
    store: Arc<CatalogStore>,
    assembler: Arc<EventAssembler>,
    resolver: Arc<OrganizerResolver>,
    ctx: Arc<RunContext>,
}

impl Unit {
    #[instrument(skip_all, fields(url = %hit.url))]
    async fn run(&self, hit: &SearchHit) -> UnitState {
        let (state, ambiguous) = match self.advance(hit).await {
            Ok(done) => done,
            Err(e) => {
                if e.is_fatal() {
                    self.ctx.halt(&e);
                }
                match e {
                    CatalogError::ContentUnavailable { reason, .. } => {
                        (UnitState::Skipped(format!("content unavailable: {reason}")), false)
                    }
                    other => (UnitState::Failed(other.to_string()), false),
                }
            }
        };

        let (status, message) = match &state {
            UnitState::Stored => (UrlStatus::Stored, None),
            UnitState::Skipped(reason) if reason == NO_EVENT => (UrlStatus::NoEvent, None),
            UnitState::Skipped(reason) => (UrlStatus::Skipped, Some(reason.as_str())),
            UnitState::Failed(reason) => (UrlStatus::Failed, Some(reason.as_str())),
            _ => (UrlStatus::Discovered, None),
        };
        if let Err(e) = self.store.mark_url(&hit.normalized_url, status, message).await {
            warn!(error = %e, "failed to record URL state");
        }

        self.ctx.record(&hit.url, &state, ambiguous);
        debug!(state = state.label(), "unit finished");
        state
    }

    /// Discovered → Assembled → Resolved → Stored. Returns the terminal
    /// state and whether the stored event is ambiguous.
    async fn advance(&self, hit: &SearchHit) -> Result<(UnitState, bool)> {
        let mut state = UnitState::Discovered;
        debug!(state = state.label(), "unit started");

        let event = match self.assembler.assemble(&hit.url).await? {
            AssemblyOutcome::Assembled(event) => event,
            AssemblyOutcome::NoEvent => {
                return Ok((UnitState::Skipped(NO_EVENT.into()), false));
            }
        };
        state = UnitState::Assembled;
        debug!(state = state.label(), name = event.name.as_deref().unwrap_or(""));

        let organizer = match &event.organizer {
            Some(stub) => Some(self.resolver.resolve(stub).await),
            None => None,
        };
        state = UnitState::Resolved;
        debug!(state = state.label(), has_organizer = organizer.is_some());

        let stored = self.store.store_unit(&event, organizer.as_ref()).await?;
        debug!(event_id = stored.event_id, organizer_id = ?stored.organizer_id, "stored");
        Ok((UnitState::Stored, event.is_ambiguous()))
    }
}

/// Skip reason for pages that describe no event.
const NO_EVENT: &str = "no event";

/// Failure reason for a unit whose task panicked.
const PANICKED: &str = "panicked";

// ---------------------------------------------------------------------------
// Re-enrichment
// ---------------------------------------------------------------------------

/// Counts from a re-enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReenrichSummary {
    pub examined: usize,
    /// Records the sources added information to.
    pub improved: usize,
    /// Records that gained an EIN.
    pub resolved: usize,
}

/// Re-run the resolver over stored organizers that are unresolved or
/// missing high-value fields, merging the results through the store.
#[instrument(skip_all, fields(limit = limit))]
pub async fn reenrich_organizers(
    store: &CatalogStore,
    resolver: &OrganizerResolver,
    limit: usize,
    progress: &dyn ProgressReporter,
) -> Result<ReenrichSummary> {
    progress.phase("Re-enriching organizers");
    let candidates = store.organizers_needing_enrichment(limit).await?;
    let mut summary = ReenrichSummary {
        examined: candidates.len(),
        ..Default::default()
    };

    for (id, record) in candidates {
        let enriched = resolver.enrich(record.clone()).await;
        if enriched == record {
            debug!(id, "no new information");
            continue;
        }
        if record.ein.is_none() && enriched.ein.is_some() {
            summary.resolved += 1;
        }
        summary.improved += 1;
        let stored_id = store.update_organizer(id, &enriched).await?;
        debug!(id, stored_id, "organizer updated");
    }

    info!(
        examined = summary.examined,
        improved = summary.improved,
        resolved = summary.resolved,
        "re-enrichment complete"
    );
    Ok(summary)
}
