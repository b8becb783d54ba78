//! `SQLite` metadata store: schema, pragmas, migrations and listing queries.
//!
//! All writes go through a single writer connection. Lookups and predicate
//! queries draw read-only connections from a small pool, so they run side by
//! side and only ever observe committed transactions. A [`MetadataBatch`] holds the
//! writer inside an open `BEGIN IMMEDIATE` transaction so the insertion
//! protocol can allocate ids, do more work, and only then decide whether the
//! rows become visible.

use std::fs;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ListingError, ListingResult};
use crate::model::types::{ListingPredicate, ListingRecord, NewListing};

pub const SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_DB_FILE: &str = "listings.db";

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;
const MAX_REPORTED_GAPS: usize = 10;
/// Idle read-only connections kept open between queries.
const MAX_IDLE_READERS: usize = 4;

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    location TEXT,
    price_min REAL,
    price_max REAL,
    beds INTEGER,
    baths REAL,
    owner_id TEXT NOT NULL DEFAULT '',
    owner_name TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_listings_price_min ON listings(price_min);
CREATE INDEX IF NOT EXISTS idx_listings_beds ON listings(beds);
CREATE INDEX IF NOT EXISTS idx_listings_owner ON listings(owner_id);
";

const SELECT_COLUMNS: &str =
    "id, text, location, price_min, price_max, beds, baths, owner_id, owner_name, created_at";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PriceSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BedsBucket {
    /// `None` groups listings where no bedroom count was extracted.
    pub beds: Option<i64>,
    pub count: usize,
}

/// Aggregate view of the metadata store.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreStats {
    pub total: usize,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    /// First missing ids inside `[min_id, max_id]`, at most ten.
    pub id_gaps: Vec<i64>,
    pub price: Option<PriceSummary>,
    pub beds_distribution: Vec<BedsBucket>,
    pub distinct_owners: usize,
}

/// Listings whose raw text is byte-identical.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TextDuplicate {
    pub raw_text: String,
    pub ids: Vec<i64>,
}

pub struct MetadataStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: ReaderPool,
}

/// Read-only connections opened on demand and returned after each query.
struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn open(path: &Path) -> ListingResult<Self> {
        let pool = Self {
            path: path.to_path_buf(),
            idle: Mutex::new(Vec::with_capacity(MAX_IDLE_READERS)),
        };
        let first = pool.connect()?;
        pool.idle.lock().push(first);
        Ok(pool)
    }

    fn connect(&self) -> ListingResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_common_pragmas(&conn)?;
        Ok(conn)
    }

    fn get(&self) -> ListingResult<PooledReader<'_>> {
        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!("all readers busy; opening another");
                self.connect()?
            }
        };
        Ok(PooledReader {
            pool: self,
            conn: ManuallyDrop::new(conn),
        })
    }
}

struct PooledReader<'a> {
    pool: &'a ReaderPool,
    conn: ManuallyDrop<Connection>,
}

impl Deref for PooledReader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        // SAFETY: `conn` is taken exactly once, here, and never touched again.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        let mut idle = self.pool.idle.lock();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    pub fn open(path: &Path) -> ListingResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                ListingError::Persistence(format!(
                    "creating db directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut writer = Connection::open(path)?;
        apply_pragmas(&writer)?;
        init_meta(&writer)?;
        migrate(&mut writer)?;

        let readers = ReaderPool::open(path)?;

        info!(path = %path.display(), "metadata store opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> ListingResult<i64> {
        let conn = self.readers.get()?;
        read_schema_version(&conn)?
            .ok_or_else(|| ListingError::NotFound("schema_version missing".into()))
    }

    /// Open a write transaction. Blocks other writers until it is finished.
    pub fn begin_batch(&self) -> ListingResult<MetadataBatch<'_>> {
        let conn = self.writer.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(MetadataBatch {
            conn,
            ids: Vec::new(),
            finished: false,
        })
    }

    pub fn insert(&self, listing: &NewListing) -> ListingResult<i64> {
        let mut batch = self.begin_batch()?;
        let id = batch.insert(listing)?;
        batch.commit()?;
        Ok(id)
    }

    /// Insert every row or none; ids are returned in input order.
    pub fn insert_batch(&self, listings: &[NewListing]) -> ListingResult<Vec<i64>> {
        let mut batch = self.begin_batch()?;
        for listing in listings {
            batch.insert(listing)?;
        }
        batch.commit()
    }

    /// Returns whether a row was removed; deleting an absent id is a no-op.
    pub fn delete_by_id(&self, id: i64) -> ListingResult<bool> {
        let conn = self.writer.lock();
        let removed = conn.execute("DELETE FROM listings WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Delete `ids` in one transaction, returning how many rows went away.
    pub fn delete_many(&self, ids: &[i64]) -> ListingResult<usize> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM listings WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn get_by_id(&self, id: i64) -> ListingResult<Option<ListingRecord>> {
        let conn = self.readers.get()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM listings WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Fetch the committed records for `ids`, in input order; unknown ids are skipped.
    pub fn get_many(&self, ids: &[i64]) -> ListingResult<Vec<ListingRecord>> {
        let conn = self.readers.get()?;
        let mut found = fxhash::FxHashMap::default();
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM listings WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), row_to_record)?;
            for row in rows {
                let record = row?;
                found.insert(record.id, record);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Ids of committed rows satisfying `predicate`, ascending.
    pub fn query_by_predicate(&self, predicate: &ListingPredicate) -> ListingResult<Vec<i64>> {
        let (where_clause, values) = predicate_sql(predicate);
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM listings WHERE {where_clause} ORDER BY id"
        ))?;
        let ids = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        debug!(matched = ids.len(), "predicate query");
        Ok(ids)
    }

    pub fn all_ids(&self) -> ListingResult<Vec<i64>> {
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare_cached("SELECT id FROM listings ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn count(&self) -> ListingResult<usize> {
        let conn = self.readers.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn stats(&self) -> ListingResult<StoreStats> {
        let conn = self.readers.get()?;

        let (total, min_id, max_id): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(id), MAX(id) FROM listings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let id_gaps = {
            let mut stmt = conn.prepare(
                "SELECT l.id + 1 FROM listings l
                 WHERE l.id < (SELECT MAX(id) FROM listings)
                   AND NOT EXISTS (SELECT 1 FROM listings n WHERE n.id = l.id + 1)
                 ORDER BY l.id LIMIT ?1",
            )?;
            let gaps = stmt
                .query_map(params![MAX_REPORTED_GAPS as i64], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            gaps
        };

        let price = conn
            .query_row(
                "SELECT MIN(price_min), MAX(price_max), AVG(price_min)
                 FROM listings WHERE price_min IS NOT NULL",
                [],
                |row| {
                    let min: Option<f64> = row.get(0)?;
                    let max: Option<f64> = row.get(1)?;
                    let avg: Option<f64> = row.get(2)?;
                    Ok(min.zip(avg).map(|(min, avg)| PriceSummary {
                        min,
                        max: max.unwrap_or(min),
                        avg: (avg * 100.0).round() / 100.0,
                    }))
                },
            )?;

        let beds_distribution = {
            let mut stmt =
                conn.prepare("SELECT beds, COUNT(*) FROM listings GROUP BY beds ORDER BY beds")?;
            let buckets = stmt
                .query_map([], |row| {
                    Ok(BedsBucket {
                        beds: row.get(0)?,
                        count: row.get::<_, i64>(1)? as usize,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            buckets
        };

        let distinct_owners: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT owner_id) FROM listings WHERE owner_id != ''",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            total: total as usize,
            min_id,
            max_id,
            id_gaps,
            price,
            beds_distribution,
            distinct_owners: distinct_owners as usize,
        })
    }

    /// Groups of listings sharing identical text, largest groups first.
    pub fn find_text_duplicates(&self, limit: usize) -> ListingResult<Vec<TextDuplicate>> {
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare(
            "SELECT text, GROUP_CONCAT(id) FROM (SELECT id, text FROM listings ORDER BY id)
             GROUP BY text HAVING COUNT(*) > 1
             ORDER BY COUNT(*) DESC, MIN(id) LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let raw_text: String = row.get(0)?;
            let joined: String = row.get(1)?;
            Ok((raw_text, joined))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (raw_text, joined) = row?;
            let mut ids: Vec<i64> = joined
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            ids.sort_unstable();
            out.push(TextDuplicate { raw_text, ids });
        }
        Ok(out)
    }

    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// An open write transaction on the metadata store.
///
/// Rows inserted here have ids but are invisible to readers until
/// [`commit`](Self::commit). Dropping an unfinished batch rolls it back.
pub struct MetadataBatch<'a> {
    conn: MutexGuard<'a, Connection>,
    ids: Vec<i64>,
    finished: bool,
}

impl MetadataBatch<'_> {
    pub fn insert(&mut self, listing: &NewListing) -> ListingResult<i64> {
        listing.validate()?;
        let f = &listing.fields;
        self.conn
            .prepare_cached(
                "INSERT INTO listings(text, location, price_min, price_max, beds, baths, owner_id, owner_name, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?
            .execute(params![
                &listing.raw_text,
                &f.location,
                f.price_min,
                f.price_max,
                f.beds,
                f.baths,
                &listing.owner_id,
                &listing.owner_name,
                MetadataStore::now_millis(),
            ])?;
        let id = self.conn.last_insert_rowid();
        self.ids.push(id);
        Ok(id)
    }

    /// Ids allocated so far, in insertion order.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn commit(mut self) -> ListingResult<Vec<i64>> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(std::mem::take(&mut self.ids))
    }

    pub fn rollback(mut self) -> ListingResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for MetadataBatch<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(err) = self.conn.execute_batch("ROLLBACK")
        {
            warn!(error = %err, ids = ?self.ids, "rollback of abandoned metadata batch failed");
        }
    }
}

fn predicate_sql(predicate: &ListingPredicate) -> (String, Vec<rusqlite::types::Value>) {
    use rusqlite::types::Value;

    let mut clauses: Vec<&str> = Vec::new();
    let mut values = Vec::new();
    if let Some(max_price) = predicate.max_price {
        clauses.push("price_min IS NOT NULL AND price_min <= ?");
        values.push(Value::Real(max_price));
    }
    if let Some(min_price) = predicate.min_price {
        clauses.push("price_max IS NOT NULL AND price_max >= ?");
        values.push(Value::Real(min_price));
    }
    if let Some(min_beds) = predicate.min_beds {
        clauses.push("beds IS NOT NULL AND beds >= ?");
        values.push(Value::Integer(min_beds));
    }
    if let Some(min_baths) = predicate.min_baths {
        clauses.push("baths IS NOT NULL AND baths >= ?");
        values.push(Value::Real(min_baths));
    }
    if let Some(location) = &predicate.location {
        clauses.push(r"location IS NOT NULL AND location LIKE ? ESCAPE '\'");
        values.push(Value::Text(format!("%{}%", escape_like(location))));
    }

    if clauses.is_empty() {
        ("1".to_string(), values)
    } else {
        let joined = clauses
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" AND ");
        (joined, values)
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ListingRecord> {
    Ok(ListingRecord {
        id: row.get(0)?,
        raw_text: row.get(1)?,
        location: row.get(2)?,
        price_min: row.get(3)?,
        price_max: row.get(4)?,
        beds: row.get(5)?,
        baths: row.get(6)?,
        owner_id: row.get(7)?,
        owner_name: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 1000;
        ",
    )?;
    apply_common_pragmas(conn)
}

fn apply_common_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA temp_store = MEMORY;
        PRAGMA cache_size = -16384; -- 16MB
        PRAGMA foreign_keys = ON;
        ",
    )
}

fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
    )
    .optional()
}

fn init_meta(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    if read_schema_version(conn)?.is_none() {
        // Start at version 0 so migrate() applies the full schema on first open.
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', '0')",
            [],
        )?;
    }
    Ok(())
}

fn migrate(conn: &mut Connection) -> ListingResult<()> {
    let current = read_schema_version(conn)?.unwrap_or(0);
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current > SCHEMA_VERSION {
        return Err(ListingError::Persistence(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    let tx = conn.transaction()?;
    if current == 0 {
        tx.execute_batch(MIGRATION_V1)?;
    }
    tx.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    info!(from = current, to = SCHEMA_VERSION, "metadata schema migrated");
    Ok(())
}
