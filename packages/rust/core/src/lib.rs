//! Domain logic for the event catalog.
//!
//! Ties discovery, crawling, extraction, organizer resolution and storage
//! into end-to-end workflows ([`Pipeline::run`], [`reenrich_organizers`]).

pub mod assembler;
pub mod oracle;
pub mod pipeline;
pub mod resolver;
pub mod sources;

#[cfg(test)]
mod testing;

pub use assembler::{AssemblerConfig, AssemblyOutcome, EventAssembler};
pub use oracle::{
    ExtractionOracle, OpenRouterOracle, OracleError, OracleOutcome, PartialExtraction, SchemaHint,
};
pub use pipeline::{
    Pipeline, ProgressReporter, ReenrichSummary, RunContext, RunSummary, SilentProgress,
    UnitReport, UnitState, reenrich_organizers,
};
pub use resolver::OrganizerResolver;
pub use sources::{
    IdentitySource, LookupOutcome, ProfileSource, SearchSource, SourceError, sources_from_config,
};
