//! CLI command definitions, routing, and tracing setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use eventcatalog_core::{
    AssemblerConfig, EventAssembler, ExtractionOracle, OpenRouterOracle, OrganizerResolver,
    Pipeline, ProgressReporter, ReenrichSummary, RunSummary, UnitState, reenrich_organizers,
    sources_from_config,
};
use eventcatalog_crawler::{HttpFetcher, PageFetcher};
use eventcatalog_discovery::{SearchAggregator, SearchProvider, providers_from_config};
use eventcatalog_shared::{
    AppConfig, CatalogEntry, RetryPolicy, init_config, load_config, validate_api_key,
};
use eventcatalog_storage::CatalogStore;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Event Catalog: find local fundraising events and the nonprofits behind them.
#[derive(Parser)]
#[command(
    name = "eventcatalog",
    version,
    about = "Discover fundraising events from search results and catalog them with their organizers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `[storage] db_path`).
    #[arg(long, global = true, env = "EVENTCATALOG_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Export output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum ExportFormat {
    /// One JSON object per line.
    Jsonl,
    /// A single JSON array.
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Search, assemble, resolve and store events.
    Run {
        /// Reprocess URLs already stored or judged to have no event.
        #[arg(long)]
        force: bool,

        /// Query to run instead of the configured list (repeatable).
        #[arg(short, long = "query")]
        queries: Vec<String>,

        /// Location appended to queries.
        #[arg(long)]
        location: Option<String>,

        /// Concurrent units of work.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Cap on new hits accepted this run.
        #[arg(long)]
        max_hits: Option<usize>,
    },

    /// Run discovery only and print the hits.
    Search {
        /// Query to run instead of the configured list (repeatable).
        #[arg(short, long = "query")]
        queries: Vec<String>,

        /// Location appended to queries.
        #[arg(long)]
        location: Option<String>,

        /// Include URLs already processed.
        #[arg(long)]
        force: bool,
    },

    /// Re-run organizer resolution over stored organizers missing data.
    Resolve {
        /// Maximum organizers to examine.
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Write the catalog snapshot.
    Export {
        #[arg(short, long, value_enum, default_value = "jsonl")]
        format: ExportFormat,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show catalog counts and recent run state.
    Status,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "eventcatalog=info",
        1 => "eventcatalog=debug",
        _ => "eventcatalog=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db;
    match cli.command {
        Command::Run {
            force,
            queries,
            location,
            workers,
            max_hits,
        } => {
            let mut config = load_config()?;
            apply_search_overrides(&mut config, queries, location);
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
            }
            if let Some(max_hits) = max_hits {
                config.search.max_hits_per_run = max_hits;
            }
            cmd_run(&config, db.as_deref(), force).await
        }
        Command::Search {
            queries,
            location,
            force,
        } => {
            let mut config = load_config()?;
            apply_search_overrides(&mut config, queries, location);
            cmd_search(&config, db.as_deref(), force).await
        }
        Command::Resolve { limit } => cmd_resolve(&load_config()?, db.as_deref(), limit).await,
        Command::Export { format, output } => {
            cmd_export(&load_config()?, db.as_deref(), format, output.as_deref()).await
        }
        Command::Status => cmd_status(&load_config()?, db.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Flags override config values.
fn apply_search_overrides(config: &mut AppConfig, queries: Vec<String>, location: Option<String>) {
    if !queries.is_empty() {
        config.search.queries = queries;
    }
    if let Some(location) = location {
        config.search.location = location;
    }
}

fn db_path(config: &AppConfig, db: Option<&Path>) -> Result<PathBuf> {
    match db {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config.storage.resolved_path()?),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Search aggregator over the configured providers, skipping URLs already
/// processed unless `force`.
async fn build_aggregator(
    config: &AppConfig,
    store: &CatalogStore,
    force: bool,
) -> Result<SearchAggregator> {
    let providers = providers_from_config(config)?;
    let mut aggregator = SearchAggregator::new(providers, RetryPolicy::from(&config.search));
    if force {
        aggregator = aggregator.with_force(true);
    } else {
        aggregator = aggregator.with_processed(store.processed_urls().await?);
    }
    Ok(aggregator)
}

/// Organizer resolver over the configured identity sources. Search-backed
/// sources use the first provider with credentials; without one they are
/// left out.
fn build_resolver(
    config: &AppConfig,
    fetcher: Arc<dyn PageFetcher>,
    oracle: Arc<dyn ExtractionOracle>,
) -> Result<OrganizerResolver> {
    let provider: Option<Arc<dyn SearchProvider>> = match providers_from_config(config) {
        Ok(providers) => providers.into_iter().next(),
        Err(e) => {
            warn!(error = %e, "search-backed identity sources disabled");
            None
        }
    };
    let sources = sources_from_config(config, provider, fetcher, oracle)?;
    let resolver = OrganizerResolver::new(
        sources,
        Duration::from_millis(config.resolver.retry_backoff_ms),
    );
    info!(sources = ?resolver.source_names(), "identity sources");
    Ok(resolver)
}

fn build_collaborators(
    config: &AppConfig,
) -> Result<(Arc<dyn PageFetcher>, Arc<dyn ExtractionOracle>)> {
    validate_api_key(config)?;
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new()?);
    let oracle: Arc<dyn ExtractionOracle> = Arc::new(OpenRouterOracle::from_config(config)?);
    Ok((fetcher, oracle))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, db: Option<&Path>, force: bool) -> Result<()> {
    let store = Arc::new(CatalogStore::open(&db_path(config, db)?).await?);
    let aggregator = build_aggregator(config, &store, force).await?;
    let (fetcher, oracle) = build_collaborators(config)?;

    let assembler = EventAssembler::new(
        fetcher.clone(),
        oracle.clone(),
        AssemblerConfig::from(&config.pipeline),
    );
    let resolver = build_resolver(config, fetcher, oracle)?;
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(assembler),
        Arc::new(resolver),
        config.pipeline.workers,
    );

    info!(
        queries = config.search.queries.len(),
        location = %config.search.location,
        workers = config.pipeline.workers,
        force,
        "starting run"
    );

    let reporter = CliProgress::new();
    let summary = pipeline.run(&aggregator, &config.search, &reporter).await?;
    print_run_summary(&summary);

    match &summary.halted {
        Some(reason) => Err(eyre!("run halted: {reason}")),
        None => Ok(()),
    }
}

async fn cmd_search(config: &AppConfig, db: Option<&Path>, force: bool) -> Result<()> {
    let store = CatalogStore::open(&db_path(config, db)?).await?;
    let aggregator = build_aggregator(config, &store, force).await?;

    let hits = aggregator
        .search_all(
            &config.search.queries,
            &config.search.location,
            config.search.max_hits_per_run,
            Duration::from_millis(config.search.query_pause_ms),
        )
        .await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for hit in &hits {
        writeln!(out, "{}\t{}\t{}", hit.provider, hit.url, hit.title)?;
    }
    info!(count = hits.len(), "search finished");
    Ok(())
}

async fn cmd_resolve(config: &AppConfig, db: Option<&Path>, limit: usize) -> Result<()> {
    let store = CatalogStore::open(&db_path(config, db)?).await?;
    let (fetcher, oracle) = build_collaborators(config)?;
    let resolver = build_resolver(config, fetcher, oracle)?;

    let reporter = CliProgress::new();
    let summary = reenrich_organizers(&store, &resolver, limit, &reporter).await?;
    reporter.spinner.finish_and_clear();
    print_reenrich_summary(&summary);
    Ok(())
}

async fn cmd_export(
    config: &AppConfig,
    db: Option<&Path>,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let store = CatalogStore::open_readonly(&db_path(config, db)?).await?;
    let entries = store.snapshot().await?;

    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| eyre!("cannot create '{}': {e}", path.display()))?;
            let mut writer = std::io::BufWriter::new(file);
            write_export(&entries, format, &mut writer)?;
            writer.flush()?;
            info!(count = entries.len(), path = %path.display(), "catalog exported");
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            write_export(&entries, format, &mut out)?;
        }
    }
    Ok(())
}

/// Serialize the snapshot in the requested format.
fn write_export(entries: &[CatalogEntry], format: ExportFormat, out: &mut impl Write) -> Result<()> {
    match format {
        ExportFormat::Jsonl => {
            for entry in entries {
                serde_json::to_writer(&mut *out, entry)?;
                writeln!(out)?;
            }
        }
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, entries)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

async fn cmd_status(config: &AppConfig, db: Option<&Path>) -> Result<()> {
    let path = db_path(config, db)?;
    let store = CatalogStore::open_readonly(&path).await?;
    let (events, organizers) = store.counts().await?;
    let processed = store.processed_urls().await?.len();

    println!();
    println!("  Database:   {}", path.display());
    println!("  Events:     {events}");
    println!("  Organizers: {organizers}");
    println!("  Processed:  {processed} URLs");
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("  Run {}", summary.run_id);
    println!("  Discovered: {}", summary.discovered);
    println!("  Stored:     {}", summary.stored);
    println!("  Skipped:    {}", summary.skipped.len());
    println!("  Failed:     {}", summary.failed.len());
    if summary.not_started > 0 {
        println!("  Not started: {}", summary.not_started);
    }
    println!("  Time:       {:.1}s", summary.elapsed_ms as f64 / 1000.0);

    if !summary.ambiguous.is_empty() {
        println!();
        println!("  Needs review (conflicting values):");
        for unit in &summary.ambiguous {
            println!("    {}", unit.url);
        }
    }
    if !summary.failed.is_empty() {
        println!();
        println!("  Failed:");
        for unit in &summary.failed {
            println!("    {}  {}", unit.url, unit.reason);
        }
    }
    println!();
}

fn print_reenrich_summary(summary: &ReenrichSummary) {
    println!();
    println!("  Examined: {}", summary.examined);
    println!("  Improved: {}", summary.improved);
    println!("  Resolved: {}", summary.resolved);
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn unit_done(&self, url: &str, state: &UnitState, current: usize, total: usize) {
        self.spinner
            .set_message(format!("[{current}/{total}] {} {url}", state.label()));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
