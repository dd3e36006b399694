//! libSQL storage layer for the event catalog.
//!
//! The [`CatalogStore`] persists events, organizers, the processed-URL set
//! and run history. Every write is an upsert under the record's identity key:
//! a matching row is merged (trust rule for organizers, first-non-null-wins
//! for events) rather than duplicated.
//!
//! **Write path:**
//! - per-key in-process locks serialize writers touching the same key
//! - each write runs in a `BEGIN IMMEDIATE` transaction on its own connection
//! - "database is locked" failures are retried with backoff
//!
//! An event and its organizer are written in one transaction, so a cancelled
//! unit never leaves an event pointing at a missing organizer.

mod locks;
mod migrations;

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use eventcatalog_shared::{
    CatalogEntry, CatalogError, EventRecord, OrganizerRecord, Result, SearchHit, StoredId,
    normalize_name,
};
use libsql::{Connection, Database, Transaction, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::locks::KeyLocks;

/// Attempts for a write that keeps hitting a locked database.
const WRITE_ATTEMPTS: u32 = 5;

/// Base delay between locked-database retries.
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// SQLite busy timeout per connection, in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Terminal (or initial) state of a discovered URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStatus {
    Discovered,
    Stored,
    NoEvent,
    Skipped,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Stored => "stored",
            Self::NoEvent => "no_event",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "stored" => Some(Self::Stored),
            "no_event" => Some(Self::NoEvent),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Row ids written for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredUnit {
    pub event_id: StoredId,
    pub organizer_id: Option<StoredId>,
}

/// One pipeline run as recorded in the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub summary_json: Option<String>,
}

// ---------------------------------------------------------------------------
// CatalogStore
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct CatalogStore {
    db: Database,
    locks: KeyLocks,
    readonly: bool,
}

impl CatalogStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let store = Self {
            db,
            locks: KeyLocks::default(),
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database at `path` in read-only mode (for export).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CatalogError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        Ok(Self {
            db,
            locks: KeyLocks::default(),
            readonly: true,
        })
    }

    async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(storage_err)?;
        // PRAGMA replies with a row, so it goes through `query`.
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), params![])
            .await
            .map_err(storage_err)?;
        Ok(conn)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let conn = self.connect().await?;
        let current_version = get_schema_version(&conn).await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    CatalogError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CatalogError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Retry `op` while the database reports it is locked.
    async fn with_write_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if is_busy(&e) && attempt < WRITE_ATTEMPTS => {
                    let delay = WRITE_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(attempt, ?delay, error = %e, "database busy, retrying write");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn begin(conn: &Connection) -> Result<Transaction> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)
    }

    // -----------------------------------------------------------------------
    // Organizers
    // -----------------------------------------------------------------------

    /// Insert or merge an organizer. Idempotent under the organizer identity key.
    pub async fn upsert_organizer(&self, record: &OrganizerRecord) -> Result<StoredId> {
        self.check_writable()?;
        let _guards = self.locks.acquire(organizer_lock_keys(record)).await;
        self.with_write_retry(move || self.try_upsert_organizer(record))
            .await
    }

    async fn try_upsert_organizer(&self, record: &OrganizerRecord) -> Result<StoredId> {
        let conn = self.connect().await?;
        let tx = Self::begin(&conn).await?;
        let result = upsert_organizer_tx(&tx, record).await;
        finish(tx, result).await
    }

    /// Merge `record` into the organizer stored at `id`.
    ///
    /// The row's EIN may change when `record` carries one from a higher
    /// tier. If another row already holds the winning EIN, `id` is folded
    /// into that row and its id is returned.
    pub async fn update_organizer(&self, id: StoredId, record: &OrganizerRecord) -> Result<StoredId> {
        self.check_writable()?;
        let _guards = self.locks.acquire(organizer_lock_keys(record)).await;
        self.with_write_retry(move || self.try_update_organizer(id, record))
            .await
    }

    async fn try_update_organizer(&self, id: StoredId, record: &OrganizerRecord) -> Result<StoredId> {
        let conn = self.connect().await?;
        let tx = Self::begin(&conn).await?;
        let result = update_organizer_tx(&tx, id, record).await;
        finish(tx, result).await
    }

    /// Fetch an organizer by row id.
    pub async fn get_organizer(&self, id: StoredId) -> Result<Option<OrganizerRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT record_json FROM organizers WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(decode_organizer(&row.get::<String>(0).map_err(storage_err)?)?)),
            None => Ok(None),
        }
    }

    /// Fetch the organizer holding `ein`, if any.
    pub async fn find_organizer_by_ein(
        &self,
        ein: &str,
    ) -> Result<Option<(StoredId, OrganizerRecord)>> {
        let conn = self.connect().await?;
        find_by_ein(&conn, ein).await
    }

    /// Organizers that are unresolved or missing high-value fields.
    pub async fn organizers_needing_enrichment(
        &self,
        limit: usize,
    ) -> Result<Vec<(StoredId, OrganizerRecord)>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, record_json FROM organizers ORDER BY (ein IS NOT NULL), id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id = row.get::<i64>(0).map_err(storage_err)?;
            let record = decode_organizer(&row.get::<String>(1).map_err(storage_err)?)?;
            if !record.has_high_value_fields() {
                results.push((id, record));
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Insert or merge an event. Idempotent under the event identity key.
    pub async fn upsert_event(&self, event: &EventRecord) -> Result<StoredId> {
        self.check_writable()?;
        let key = event_lock_key(event)?;
        let _guards = self.locks.acquire([key]).await;
        self.with_write_retry(move || self.try_upsert_event(event))
            .await
    }

    async fn try_upsert_event(&self, event: &EventRecord) -> Result<StoredId> {
        let conn = self.connect().await?;
        let tx = Self::begin(&conn).await?;
        let result = upsert_event_tx(&tx, event).await;
        finish(tx, result).await
    }

    /// Write an event and its organizer atomically.
    ///
    /// The organizer (if any) is upserted first and its row id becomes the
    /// event's organizer reference unless the event already carries one.
    pub async fn store_unit(
        &self,
        event: &EventRecord,
        organizer: Option<&OrganizerRecord>,
    ) -> Result<StoredUnit> {
        self.check_writable()?;
        let mut keys = vec![event_lock_key(event)?];
        if let Some(org) = organizer {
            keys.extend(organizer_lock_keys(org));
        }
        let _guards = self.locks.acquire(keys).await;
        self.with_write_retry(move || self.try_store_unit(event, organizer))
            .await
    }

    async fn try_store_unit(
        &self,
        event: &EventRecord,
        organizer: Option<&OrganizerRecord>,
    ) -> Result<StoredUnit> {
        let conn = self.connect().await?;
        let tx = Self::begin(&conn).await?;
        let result = async {
            let organizer_id = match organizer {
                Some(org) => Some(upsert_organizer_tx(&tx, org).await?),
                None => None,
            };
            let mut event = event.clone();
            if event.organizer_ref.is_none() {
                event.organizer_ref = organizer_id;
            }
            let event_id = upsert_event_tx(&tx, &event).await?;
            Ok(StoredUnit {
                event_id,
                organizer_id,
            })
        }
        .await;
        finish(tx, result).await
    }

    /// Fetch an event by row id.
    pub async fn get_event(&self, id: StoredId) -> Result<Option<EventRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT record_json, organizer_id FROM events WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let mut event = decode_event(&row.get::<String>(0).map_err(storage_err)?)?;
                event.organizer_ref = row.get::<i64>(1).ok();
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Read-only snapshot of every event with its organizer, for exporters.
    pub async fn snapshot(&self) -> Result<Vec<CatalogEntry>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT e.id, e.record_json, e.organizer_id, o.record_json
                 FROM events e LEFT JOIN organizers o ON o.id = e.organizer_id
                 ORDER BY e.event_date, e.id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let event_id = row.get::<i64>(0).map_err(storage_err)?;
            let mut event = decode_event(&row.get::<String>(1).map_err(storage_err)?)?;
            let organizer_id = row.get::<i64>(2).ok();
            event.organizer_ref = organizer_id;
            let organizer = match row.get::<String>(3).ok() {
                Some(json) => Some(decode_organizer(&json)?),
                None => None,
            };
            entries.push(CatalogEntry {
                event_id,
                event,
                organizer_id,
                organizer,
            });
        }
        Ok(entries)
    }

    /// Row counts: `(events, organizers)`.
    pub async fn counts(&self) -> Result<(u64, u64)> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT (SELECT COUNT(*) FROM events), (SELECT COUNT(*) FROM organizers)",
                params![],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok((
                row.get::<i64>(0).map_err(storage_err)? as u64,
                row.get::<i64>(1).map_err(storage_err)? as u64,
            )),
            None => Ok((0, 0)),
        }
    }

    // -----------------------------------------------------------------------
    // Processed URLs
    // -----------------------------------------------------------------------

    /// Record a search hit as discovered. An already-known URL keeps its state.
    pub async fn record_hit(&self, hit: &SearchHit) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let now = now.as_str();
        self.with_write_retry(move || async move {
            let conn = self.connect().await?;
            conn.execute(
                "INSERT INTO processed_urls
                   (normalized_url, url, provider, query, title, snippet, status, first_seen_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(normalized_url) DO UPDATE SET updated_at = excluded.updated_at",
                params![
                    hit.normalized_url.as_str(),
                    hit.url.as_str(),
                    hit.provider.as_str(),
                    hit.query.as_str(),
                    hit.title.as_str(),
                    hit.snippet.as_str(),
                    UrlStatus::Discovered.as_str(),
                    now,
                ],
            )
            .await
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    /// Set the terminal state of a URL.
    pub async fn mark_url(
        &self,
        normalized_url: &str,
        status: UrlStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let now = now.as_str();
        self.with_write_retry(move || async move {
            let conn = self.connect().await?;
            conn.execute(
                "INSERT INTO processed_urls (normalized_url, url, status, message, first_seen_at, updated_at)
                 VALUES (?1, ?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(normalized_url) DO UPDATE SET
                   status = excluded.status,
                   message = excluded.message,
                   updated_at = excluded.updated_at",
                params![normalized_url, status.as_str(), message, now],
            )
            .await
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    /// Normalized URLs later runs may skip: those that produced an event or
    /// were judged not to describe one. Failed and skipped URLs are retried.
    pub async fn processed_urls(&self) -> Result<HashSet<String>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT normalized_url FROM processed_urls WHERE status IN (?1, ?2)",
                params![UrlStatus::Stored.as_str(), UrlStatus::NoEvent.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut set = HashSet::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            set.insert(row.get::<String>(0).map_err(storage_err)?);
        }
        Ok(set)
    }

    /// Current state of a URL, if it has been seen.
    pub async fn url_status(&self, normalized_url: &str) -> Result<Option<UrlStatus>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT status FROM processed_urls WHERE normalized_url = ?1",
                params![normalized_url],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(UrlStatus::parse(&row.get::<String>(0).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Record the start of a pipeline run. Returns the new run ID.
    pub async fn start_run(&self) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO runs (id, started_at) VALUES (?1, ?2)",
            params![id.as_str(), now.as_str()],
        )
        .await
        .map_err(storage_err)?;
        Ok(id)
    }

    /// Mark a run finished with its summary.
    pub async fn finish_run(&self, run_id: &str, summary_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let now = now.as_str();
        self.with_write_retry(move || async move {
            let conn = self.connect().await?;
            conn.execute(
                "UPDATE runs SET finished_at = ?1, summary_json = ?2 WHERE id = ?3",
                params![now, summary_json, run_id],
            )
            .await
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    /// Fetch a run by ID.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, started_at, finished_at, summary_json FROM runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: row.get::<String>(1).map_err(storage_err)?,
                finished_at: row.get::<String>(2).ok(),
                summary_json: row.get::<String>(3).ok(),
            })),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

async fn finish<T>(tx: Transaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(storage_err)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

async fn get_schema_version(conn: &Connection) -> u32 {
    let result = conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await;

    match result {
        Ok(mut rows) => {
            if let Ok(Some(row)) = rows.next().await {
                row.get::<u32>(0).unwrap_or(0)
            } else {
                0
            }
        }
        Err(_) => 0, // Table doesn't exist yet
    }
}

async fn upsert_organizer_tx(conn: &Connection, incoming: &OrganizerRecord) -> Result<StoredId> {
    let name_keys: Vec<String> = incoming.name_keys().into_iter().collect();
    if name_keys.is_empty() && incoming.ein.is_none() {
        return Err(CatalogError::validation(
            "organizer has neither an EIN nor a name",
        ));
    }

    let target = match incoming.ein_value() {
        Some(ein) => match find_by_ein(conn, ein).await? {
            Some(found) => Some(found),
            None => match find_by_alternates(conn, incoming).await? {
                Some(found) => Some(found),
                // Promote a name-only placeholder; never merge into another EIN.
                None => find_by_names(conn, &name_keys, true).await?,
            },
        },
        None => find_by_names(conn, &name_keys, false).await?,
    };

    match target {
        Some((id, mut existing)) => {
            existing.absorb(incoming);
            if existing.ein.is_some() {
                fold_placeholders(conn, id, &mut existing).await?;
            }
            write_organizer(conn, Some(id), &existing).await?;
            debug!(id, "merged organizer");
            Ok(id)
        }
        None => {
            let id = write_organizer(conn, None, incoming).await?;
            debug!(id, "inserted organizer");
            Ok(id)
        }
    }
}

/// Merge unresolved rows sharing a name with the EIN holder into it.
async fn fold_placeholders(
    conn: &Connection,
    holder_id: StoredId,
    holder: &mut OrganizerRecord,
) -> Result<()> {
    for key in holder.name_keys() {
        let mut rows = conn
            .query(
                "SELECT o.id, o.record_json FROM organizer_names n
                 JOIN organizers o ON o.id = n.organizer_id
                 WHERE n.name_key = ?1 AND o.ein IS NULL AND o.id != ?2",
                params![key.as_str(), holder_id],
            )
            .await
            .map_err(storage_err)?;

        let mut placeholders = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            placeholders.push((
                row.get::<i64>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            ));
        }

        for (placeholder_id, json) in placeholders {
            holder.absorb(&decode_organizer(&json)?);
            retire_organizer(conn, placeholder_id, holder_id).await?;
            info!(holder_id, placeholder_id, "folded unresolved organizer into EIN holder");
        }
    }
    Ok(())
}

/// Repoint events from `from` to `into`, then delete `from`.
async fn retire_organizer(conn: &Connection, from: StoredId, into: StoredId) -> Result<()> {
    conn.execute(
        "UPDATE events SET organizer_id = ?1 WHERE organizer_id = ?2",
        params![into, from],
    )
    .await
    .map_err(storage_err)?;
    conn.execute(
        "DELETE FROM organizer_names WHERE organizer_id = ?1",
        params![from],
    )
    .await
    .map_err(storage_err)?;
    conn.execute("DELETE FROM organizers WHERE id = ?1", params![from])
        .await
        .map_err(storage_err)?;
    Ok(())
}

async fn update_organizer_tx(
    conn: &Connection,
    id: StoredId,
    incoming: &OrganizerRecord,
) -> Result<StoredId> {
    let mut rows = conn
        .query(
            "SELECT record_json FROM organizers WHERE id = ?1",
            params![id],
        )
        .await
        .map_err(storage_err)?;
    let json = match rows.next().await.map_err(storage_err)? {
        Some(row) => row.get::<String>(0).map_err(storage_err)?,
        None => {
            return Err(CatalogError::validation(format!(
                "organizer {id} does not exist"
            )));
        }
    };
    drop(rows);

    let mut existing = decode_organizer(&json)?;
    existing.absorb(incoming);

    let Some(ein) = existing.ein_value().map(str::to_string) else {
        write_organizer(conn, Some(id), &existing).await?;
        return Ok(id);
    };

    // The winning EIN may already belong to another row; that row absorbs this one.
    if let Some((holder_id, mut holder)) = find_by_ein(conn, &ein).await? {
        if holder_id != id {
            holder.absorb(&existing);
            retire_organizer(conn, id, holder_id).await?;
            fold_placeholders(conn, holder_id, &mut holder).await?;
            write_organizer(conn, Some(holder_id), &holder).await?;
            info!(from = id, into = holder_id, ein = %ein, "merged organizer into EIN holder");
            return Ok(holder_id);
        }
    }

    fold_placeholders(conn, id, &mut existing).await?;
    write_organizer(conn, Some(id), &existing).await?;
    debug!(id, "updated organizer");
    Ok(id)
}

async fn write_organizer(
    conn: &Connection,
    id: Option<StoredId>,
    record: &OrganizerRecord,
) -> Result<StoredId> {
    let now = Utc::now().to_rfc3339();
    let json = serde_json::to_string(record)
        .map_err(|e| CatalogError::Storage(format!("failed to encode organizer: {e}")))?;
    let name_key = record.display_name().map(normalize_name).unwrap_or_default();
    let legal_name = record.legal_name.as_ref().map(|s| s.value.as_str());

    let id = match id {
        Some(id) => {
            conn.execute(
                "UPDATE organizers SET ein = ?1, legal_name = ?2, name_key = ?3, status = ?4,
                   record_json = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    record.ein_value(),
                    legal_name,
                    name_key.as_str(),
                    record.status().as_str(),
                    json.as_str(),
                    now.as_str(),
                    id,
                ],
            )
            .await
            .map_err(storage_err)?;
            id
        }
        None => {
            conn.execute(
                "INSERT INTO organizers (ein, legal_name, name_key, status, record_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    record.ein_value(),
                    legal_name,
                    name_key.as_str(),
                    record.status().as_str(),
                    json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
            conn.last_insert_rowid()
        }
    };

    for key in record.name_keys() {
        conn.execute(
            "INSERT OR IGNORE INTO organizer_names (name_key, organizer_id) VALUES (?1, ?2)",
            params![key.as_str(), id],
        )
        .await
        .map_err(storage_err)?;
    }
    Ok(id)
}

async fn find_by_ein(conn: &Connection, ein: &str) -> Result<Option<(StoredId, OrganizerRecord)>> {
    let mut rows = conn
        .query(
            "SELECT id, record_json FROM organizers WHERE ein = ?1",
            params![ein],
        )
        .await
        .map_err(storage_err)?;

    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(Some((
            row.get::<i64>(0).map_err(storage_err)?,
            decode_organizer(&row.get::<String>(1).map_err(storage_err)?)?,
        ))),
        None => Ok(None),
    }
}

/// Row holding an EIN the incoming record has superseded.
async fn find_by_alternates(
    conn: &Connection,
    incoming: &OrganizerRecord,
) -> Result<Option<(StoredId, OrganizerRecord)>> {
    for ein in &incoming.alternate_eins {
        if let Some(found) = find_by_ein(conn, ein).await? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// First organizer known by any of `keys`; resolved rows are preferred.
async fn find_by_names(
    conn: &Connection,
    keys: &[String],
    unresolved_only: bool,
) -> Result<Option<(StoredId, OrganizerRecord)>> {
    let sql = if unresolved_only {
        "SELECT o.id, o.record_json FROM organizer_names n
         JOIN organizers o ON o.id = n.organizer_id
         WHERE n.name_key = ?1 AND o.ein IS NULL
         ORDER BY o.id LIMIT 1"
    } else {
        "SELECT o.id, o.record_json FROM organizer_names n
         JOIN organizers o ON o.id = n.organizer_id
         WHERE n.name_key = ?1
         ORDER BY (o.ein IS NULL), o.id LIMIT 1"
    };

    for key in keys {
        let mut rows = conn
            .query(sql, params![key.as_str()])
            .await
            .map_err(storage_err)?;
        if let Some(row) = rows.next().await.map_err(storage_err)? {
            return Ok(Some((
                row.get::<i64>(0).map_err(storage_err)?,
                decode_organizer(&row.get::<String>(1).map_err(storage_err)?)?,
            )));
        }
    }
    Ok(None)
}

async fn upsert_event_tx(conn: &Connection, incoming: &EventRecord) -> Result<StoredId> {
    let key = incoming
        .identity_key()
        .ok_or_else(|| CatalogError::validation("event has no name"))?;
    let storage_key = key.as_storage_key();

    if let Some(org_id) = incoming.organizer_ref {
        let mut rows = conn
            .query("SELECT 1 FROM organizers WHERE id = ?1", params![org_id])
            .await
            .map_err(storage_err)?;
        if rows.next().await.map_err(storage_err)?.is_none() {
            return Err(CatalogError::validation(format!(
                "event references missing organizer {org_id}"
            )));
        }
    }

    let mut rows = conn
        .query(
            "SELECT id, record_json, organizer_id FROM events WHERE identity_key = ?1",
            params![storage_key.as_str()],
        )
        .await
        .map_err(storage_err)?;
    let existing = match rows.next().await.map_err(storage_err)? {
        Some(row) => {
            let id = row.get::<i64>(0).map_err(storage_err)?;
            let mut event = decode_event(&row.get::<String>(1).map_err(storage_err)?)?;
            event.organizer_ref = row.get::<i64>(2).ok();
            Some((id, event))
        }
        None => None,
    };
    drop(rows);

    let now = Utc::now().to_rfc3339();
    match existing {
        Some((id, mut stored)) => {
            let source = incoming
                .source_urls
                .iter()
                .next()
                .map(String::as_str)
                .unwrap_or("");
            stored.absorb(incoming, source);
            let json = encode_event(&stored)?;
            conn.execute(
                "UPDATE events SET canonical_id = ?1, organizer_id = ?2, confidence = ?3,
                   ambiguous = ?4, record_json = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    stored.canonical_id.as_str(),
                    stored.organizer_ref,
                    f64::from(stored.confidence),
                    i64::from(stored.is_ambiguous()),
                    json.as_str(),
                    now.as_str(),
                    id,
                ],
            )
            .await
            .map_err(storage_err)?;
            debug!(id, "merged event");
            Ok(id)
        }
        None => {
            let mut record = incoming.clone();
            record.refresh_canonical_id();
            let json = encode_event(&record)?;
            conn.execute(
                "INSERT INTO events (identity_key, canonical_id, name, event_date, location,
                   organizer_id, confidence, ambiguous, record_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    storage_key.as_str(),
                    record.canonical_id.as_str(),
                    record.name.as_deref().unwrap_or_default(),
                    record.date.map(|d| d.to_string()),
                    record.location.as_deref(),
                    record.organizer_ref,
                    f64::from(record.confidence),
                    i64::from(record.is_ambiguous()),
                    json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
            let id = conn.last_insert_rowid();
            debug!(id, "inserted event");
            Ok(id)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage_err(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::Storage(e.to_string())
}

fn is_busy(err: &CatalogError) -> bool {
    match err {
        CatalogError::Storage(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("busy")
        }
        _ => false,
    }
}

fn decode_organizer(json: &str) -> Result<OrganizerRecord> {
    serde_json::from_str(json)
        .map_err(|e| CatalogError::Storage(format!("corrupt organizer record: {e}")))
}

fn decode_event(json: &str) -> Result<EventRecord> {
    serde_json::from_str(json)
        .map_err(|e| CatalogError::Storage(format!("corrupt event record: {e}")))
}

fn encode_event(event: &EventRecord) -> Result<String> {
    serde_json::to_string(event)
        .map_err(|e| CatalogError::Storage(format!("failed to encode event: {e}")))
}

fn event_lock_key(event: &EventRecord) -> Result<String> {
    event
        .identity_key()
        .map(|k| format!("event:{}", k.as_storage_key()))
        .ok_or_else(|| CatalogError::validation("event has no name"))
}

fn organizer_lock_keys(record: &OrganizerRecord) -> Vec<String> {
    record
        .ein_value()
        .into_iter()
        .chain(record.alternate_eins.iter().map(String::as_str))
        .map(|ein| format!("org:ein:{ein}"))
        .chain(record.name_keys().into_iter().map(|k| format!("org:name:{k}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use eventcatalog_shared::{OrganizerStub, Sourced, TrustTier};

    use super::*;

    /// Create a temp file store for testing.
    async fn test_store() -> CatalogStore {
        let tmp = std::env::temp_dir().join(format!("ec_test_{}.db", Uuid::now_v7()));
        CatalogStore::open(&tmp).await.expect("open test db")
    }

    fn sourced(value: &str, tier: TrustTier) -> Option<Sourced<String>> {
        Some(Sourced::new(value.to_string(), tier))
    }

    fn gala(url: &str) -> EventRecord {
        let mut event = EventRecord {
            name: Some("Spring Gala".into()),
            date: NaiveDate::from_ymd_opt(2025, 5, 1),
            location: Some("Navy Pier".into()),
            organizer: Some(OrganizerStub {
                name: "Lakeview Charities".into(),
                hints: Default::default(),
            }),
            ..Default::default()
        };
        event.source_urls.insert(url.to_string());
        event
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        let conn = store.connect().await.unwrap();
        assert_eq!(get_schema_version(&conn).await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ec_test_{}.db", Uuid::now_v7()));
        let _s1 = CatalogStore::open(&tmp).await.unwrap();
        let s2 = CatalogStore::open(&tmp).await.unwrap();
        let conn = s2.connect().await.unwrap();
        assert_eq!(get_schema_version(&conn).await, 1);
    }

    #[tokio::test]
    async fn same_ein_disjoint_fields_merge_into_one_row() {
        let store = test_store().await;

        let mut a = OrganizerRecord::named("Lakeview Charities");
        a.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        a.legal_name = sourced("Lakeview Charities Inc", TrustTier::IrsRegistry);

        let mut b = OrganizerRecord::default();
        b.ein = sourced("36-1234567", TrustTier::CauseIq);
        b.contact_title = sourced("Executive Director", TrustTier::OracleProfile);
        b.socials.insert(
            "facebook".into(),
            Sourced::new("lakeviewcharities".into(), TrustTier::OracleProfile),
        );

        let id_a = store.upsert_organizer(&a).await.unwrap();
        let id_b = store.upsert_organizer(&b).await.unwrap();
        assert_eq!(id_a, id_b);

        let stored = store.get_organizer(id_a).await.unwrap().unwrap();
        assert_eq!(stored.legal_name, a.legal_name);
        assert_eq!(stored.contact_title, b.contact_title);
        assert_eq!(stored.socials.len(), 1);
        assert_eq!(stored.ein, sourced("36-1234567", TrustTier::IrsRegistry));
        assert_eq!(store.counts().await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn upsert_organizer_is_idempotent() {
        let store = test_store().await;
        let mut org = OrganizerRecord::named("Lakeview Charities");
        org.ein = sourced("36-1234567", TrustTier::IrsRegistry);

        let first = store.upsert_organizer(&org).await.unwrap();
        let before = store.get_organizer(first).await.unwrap();
        let second = store.upsert_organizer(&org).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get_organizer(first).await.unwrap(), before);
    }

    #[tokio::test]
    async fn placeholder_is_promoted_when_ein_arrives() {
        let store = test_store().await;
        let placeholder = OrganizerRecord::named("Lakeview Charities");
        let pid = store.upsert_organizer(&placeholder).await.unwrap();

        let mut resolved = OrganizerRecord::named("Lakeview Charities");
        resolved.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        let rid = store.upsert_organizer(&resolved).await.unwrap();

        assert_eq!(pid, rid);
        let stored = store.get_organizer(rid).await.unwrap().unwrap();
        assert_eq!(stored.ein_value(), Some("36-1234567"));
    }

    #[tokio::test]
    async fn different_eins_with_same_name_stay_separate() {
        let store = test_store().await;
        let mut a = OrganizerRecord::named("Hope Foundation");
        a.ein = sourced("11-1111111", TrustTier::IrsRegistry);
        let mut b = OrganizerRecord::named("Hope Foundation");
        b.ein = sourced("22-2222222", TrustTier::IrsRegistry);

        let id_a = store.upsert_organizer(&a).await.unwrap();
        let id_b = store.upsert_organizer(&b).await.unwrap();
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn placeholder_folds_into_existing_ein_holder() {
        let store = test_store().await;

        let mut holder = OrganizerRecord::named("Lakeview Charities");
        holder.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        let holder_id = store.upsert_organizer(&holder).await.unwrap();

        // An event stored against a separate placeholder row for an alias.
        let mut event = gala("https://a.org/gala");
        event.organizer = Some(OrganizerStub {
            name: "Lakeview".into(),
            hints: Default::default(),
        });
        let unit = store
            .store_unit(&event, Some(&OrganizerRecord::named("Lakeview")))
            .await
            .unwrap();
        let placeholder_id = unit.organizer_id.unwrap();
        assert_ne!(placeholder_id, holder_id);

        // The resolver later learns the alias belongs to the EIN holder.
        let mut update = OrganizerRecord::named("Lakeview");
        update.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        let id = store.upsert_organizer(&update).await.unwrap();
        assert_eq!(id, holder_id);

        assert!(store.get_organizer(placeholder_id).await.unwrap().is_none());
        let event = store.get_event(unit.event_id).await.unwrap().unwrap();
        assert_eq!(event.organizer_ref, Some(holder_id));
        assert_eq!(store.counts().await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn update_replaces_lower_trust_ein_in_place() {
        let store = test_store().await;
        let mut weak = OrganizerRecord::named("Lakeview Charities");
        weak.ein = sourced("99-7654321", TrustTier::WebSearch);
        let unit = store.store_unit(&gala("https://a.org/gala"), Some(&weak)).await.unwrap();
        let id = unit.organizer_id.unwrap();

        let mut enriched = store.get_organizer(id).await.unwrap().unwrap();
        enriched.absorb(&{
            let mut irs = OrganizerRecord::default();
            irs.ein = sourced("36-1234567", TrustTier::IrsRegistry);
            irs
        });
        assert_eq!(store.update_organizer(id, &enriched).await.unwrap(), id);

        assert_eq!(store.counts().await.unwrap(), (1, 1));
        let stored = store.get_organizer(id).await.unwrap().unwrap();
        assert_eq!(stored.ein, sourced("36-1234567", TrustTier::IrsRegistry));
        assert!(stored.alternate_eins.contains("99-7654321"));
        assert!(store.find_organizer_by_ein("99-7654321").await.unwrap().is_none());
        let event = store.get_event(unit.event_id).await.unwrap().unwrap();
        assert_eq!(event.organizer_ref, Some(id));
    }

    #[tokio::test]
    async fn update_folds_row_into_holder_of_winning_ein() {
        let store = test_store().await;
        let mut weak = OrganizerRecord::named("Lakeview");
        weak.ein = sourced("99-7654321", TrustTier::WebSearch);
        let unit = store.store_unit(&gala("https://a.org/gala"), Some(&weak)).await.unwrap();
        let weak_id = unit.organizer_id.unwrap();

        let mut holder = OrganizerRecord::named("Lakeview Charities");
        holder.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        let holder_id = store.upsert_organizer(&holder).await.unwrap();
        assert_ne!(weak_id, holder_id);

        let mut correction = OrganizerRecord::default();
        correction.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        let id = store.update_organizer(weak_id, &correction).await.unwrap();

        assert_eq!(id, holder_id);
        assert_eq!(store.counts().await.unwrap().1, 1);
        let merged = store.get_organizer(holder_id).await.unwrap().unwrap();
        assert!(merged.aliases.contains("Lakeview"));
        assert!(merged.alternate_eins.contains("99-7654321"));
        let event = store.get_event(unit.event_id).await.unwrap().unwrap();
        assert_eq!(event.organizer_ref, Some(holder_id));
    }

    #[tokio::test]
    async fn upsert_finds_row_by_superseded_ein() {
        let store = test_store().await;
        let mut weak = OrganizerRecord::named("Lakeview Charities");
        weak.ein = sourced("99-7654321", TrustTier::WebSearch);
        let id = store.upsert_organizer(&weak).await.unwrap();

        let mut better = OrganizerRecord::named("Lakeview Charities");
        better.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        better.alternate_eins.insert("99-7654321".into());
        assert_eq!(store.upsert_organizer(&better).await.unwrap(), id);

        assert_eq!(store.counts().await.unwrap().1, 1);
        let stored = store.get_organizer(id).await.unwrap().unwrap();
        assert_eq!(stored.ein_value(), Some("36-1234567"));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_rejected() {
        let store = test_store().await;
        let err = store
            .update_organizer(42, &OrganizerRecord::named("Lakeview Charities"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation { .. }));
    }

    #[tokio::test]
    async fn concurrent_same_ein_upserts_serialize_to_one_row() {
        let store = Arc::new(test_store().await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut org = OrganizerRecord::named(&format!("Lakeview alias {i}"));
                org.ein = sourced("36-1234567", TrustTier::CauseIq);
                org.phone = sourced(&format!("312-555-010{i}"), TrustTier::PageExtraction);
                store.upsert_organizer(&org).await
            }));
        }

        let mut ids = HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.counts().await.unwrap().1, 1);

        let id = *ids.iter().next().unwrap();
        let stored = store.get_organizer(id).await.unwrap().unwrap();
        assert_eq!(stored.aliases.len(), 8);
    }

    #[tokio::test]
    async fn event_upsert_merges_by_identity_key() {
        let store = test_store().await;

        let mut first = gala("https://a.org/gala");
        first.description = None;
        let id1 = store.upsert_event(&first).await.unwrap();

        let mut second = gala("https://b.org/spring-gala");
        second.name = Some("SPRING GALA".into());
        second.description = Some("Annual benefit".into());
        let id2 = store.upsert_event(&second).await.unwrap();
        assert_eq!(id1, id2);

        let stored = store.get_event(id1).await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Spring Gala"));
        assert_eq!(stored.description.as_deref(), Some("Annual benefit"));
        assert_eq!(stored.source_urls.len(), 2);
        assert!(!stored.canonical_id.is_empty());
        assert_eq!(store.counts().await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn stored_data_is_never_cleared() {
        let store = test_store().await;
        let mut full = gala("https://a.org/gala");
        full.description = Some("Annual benefit".into());
        full.details.dress_code = Some("Black tie".into());
        let id = store.upsert_event(&full).await.unwrap();

        let sparse = gala("https://a.org/gala");
        store.upsert_event(&sparse).await.unwrap();

        let stored = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(stored.description.as_deref(), Some("Annual benefit"));
        assert_eq!(stored.details.dress_code.as_deref(), Some("Black tie"));
    }

    #[tokio::test]
    async fn event_without_name_is_rejected() {
        let store = test_store().await;
        let err = store.upsert_event(&EventRecord::default()).await.unwrap_err();
        assert!(matches!(err, CatalogError::Validation { .. }));
    }

    #[tokio::test]
    async fn dangling_organizer_ref_is_rejected() {
        let store = test_store().await;
        let mut event = gala("https://a.org/gala");
        event.organizer_ref = Some(999);
        assert!(store.upsert_event(&event).await.is_err());
    }

    #[tokio::test]
    async fn store_unit_links_event_to_organizer() {
        let store = test_store().await;
        let event = gala("https://a.org/gala");
        let org = OrganizerRecord::from_stub(event.organizer.as_ref().unwrap());

        let unit = store.store_unit(&event, Some(&org)).await.unwrap();
        let again = store.store_unit(&event, Some(&org)).await.unwrap();
        assert_eq!(unit, again);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].organizer_id, unit.organizer_id);
        assert_eq!(
            snapshot[0].organizer.as_ref().and_then(|o| o.display_name()),
            Some("Lakeview Charities")
        );
    }

    #[tokio::test]
    async fn store_unit_rolls_back_on_failure() {
        let store = test_store().await;
        let org = OrganizerRecord::named("Lakeview Charities");
        // The event write fails after the organizer write inside the transaction.
        let mut event = gala("https://a.org/gala");
        event.organizer_ref = Some(999);

        assert!(store.store_unit(&event, Some(&org)).await.is_err());
        assert_eq!(store.counts().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn processed_url_lifecycle() {
        let store = test_store().await;
        let hit = SearchHit {
            url: "https://a.org/gala?utm=1".into(),
            normalized_url: "https://a.org/gala".into(),
            title: "Spring Gala".into(),
            snippet: "Join us".into(),
            provider: "serpapi".into(),
            query: "charity gala".into(),
        };

        store.record_hit(&hit).await.unwrap();
        assert_eq!(
            store.url_status("https://a.org/gala").await.unwrap(),
            Some(UrlStatus::Discovered)
        );
        assert!(store.processed_urls().await.unwrap().is_empty());

        store
            .mark_url("https://a.org/gala", UrlStatus::Stored, None)
            .await
            .unwrap();
        // Seeing the hit again keeps its terminal state.
        store.record_hit(&hit).await.unwrap();
        assert_eq!(
            store.url_status("https://a.org/gala").await.unwrap(),
            Some(UrlStatus::Stored)
        );
        assert!(store.processed_urls().await.unwrap().contains("https://a.org/gala"));

        store
            .mark_url("https://b.org/x", UrlStatus::Failed, Some("HTTP 500"))
            .await
            .unwrap();
        assert!(!store.processed_urls().await.unwrap().contains("https://b.org/x"));
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let store = test_store().await;
        let run_id = store.start_run().await.unwrap();
        store
            .finish_run(&run_id, r#"{"stored":3}"#)
            .await
            .unwrap();

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert!(run.finished_at.is_some());
        assert_eq!(run.summary_json.as_deref(), Some(r#"{"stored":3}"#));
    }

    #[tokio::test]
    async fn enrichment_candidates_exclude_complete_organizers() {
        let store = test_store().await;

        let mut complete = OrganizerRecord::named("Lakeview Charities");
        complete.ein = sourced("36-1234567", TrustTier::IrsRegistry);
        complete.legal_name = sourced("Lakeview Charities Inc", TrustTier::IrsRegistry);
        complete.contact_title = sourced("Executive Director", TrustTier::OracleProfile);
        complete.socials.insert(
            "instagram".into(),
            Sourced::new("@lakeview".into(), TrustTier::OracleProfile),
        );
        store.upsert_organizer(&complete).await.unwrap();
        store
            .upsert_organizer(&OrganizerRecord::named("Hope Foundation"))
            .await
            .unwrap();

        let candidates = store.organizers_needing_enrichment(10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1.display_name(), Some("Hope Foundation"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ec_test_{}.db", Uuid::now_v7()));
        let _rw = CatalogStore::open(&tmp).await.unwrap();
        let ro = CatalogStore::open_readonly(&tmp).await.unwrap();
        let result = ro.upsert_event(&gala("https://a.org/gala")).await;
        assert!(result.is_err());
        assert!(ro.snapshot().await.unwrap().is_empty());
    }
}
