//! SQL migration definitions for the event catalog database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: organizers, organizer_names, events, processed_urls, runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Organizers, keyed by EIN once resolved
CREATE TABLE IF NOT EXISTS organizers (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ein         TEXT,
    legal_name  TEXT,
    name_key    TEXT NOT NULL,
    status      TEXT NOT NULL,
    record_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_organizers_ein ON organizers(ein) WHERE ein IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_organizers_name_key ON organizers(name_key);
CREATE INDEX IF NOT EXISTS idx_organizers_status ON organizers(status);

-- Every normalized name (legal name + aliases) an organizer is known by
CREATE TABLE IF NOT EXISTS organizer_names (
    name_key     TEXT NOT NULL,
    organizer_id INTEGER NOT NULL REFERENCES organizers(id) ON DELETE CASCADE,
    PRIMARY KEY (name_key, organizer_id)
);

CREATE INDEX IF NOT EXISTS idx_organizer_names_org ON organizer_names(organizer_id);

-- Canonical events, keyed by (name, date, location)
CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_key TEXT NOT NULL UNIQUE,
    canonical_id TEXT NOT NULL,
    name         TEXT NOT NULL,
    event_date   TEXT,
    location     TEXT,
    organizer_id INTEGER REFERENCES organizers(id),
    confidence   REAL NOT NULL,
    ambiguous    INTEGER NOT NULL DEFAULT 0,
    record_json  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_organizer ON events(organizer_id);
CREATE INDEX IF NOT EXISTS idx_events_date ON events(event_date);

-- Search hits seen by any run, with their terminal state
CREATE TABLE IF NOT EXISTS processed_urls (
    normalized_url TEXT PRIMARY KEY,
    url            TEXT NOT NULL,
    provider       TEXT,
    query          TEXT,
    title          TEXT,
    snippet        TEXT,
    status         TEXT NOT NULL,
    message        TEXT,
    first_seen_at  TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processed_urls_status ON processed_urls(status);

-- Pipeline run history
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    summary_json TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
