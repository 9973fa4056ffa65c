// SQLite registration store
//
// One append-only row per EffectRow, keyed by (entity_id, tx_start) and
// carrying the owning registration's metadata. `tx_end IS NULL` marks the
// live registration. Closing the old registration and inserting the new one
// happen in a single SQLite transaction.
//
// Writes go through one connection; reads check out their own read-only
// connection, so a reader never holds what a writer needs. On disk, WAL
// gives each read a committed snapshot.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Params, TransactionBehavior};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::algebra::EffectRow;
use crate::attributes::{ActiveState, Actor, AttributeSnapshot, AttributeTrack, EntityId, EntityKind};
use crate::error::{RegistryError, Result};
use crate::interval::{Bound, Instant, Interval};
use crate::store::{stale_base, RegistrationReader, RegistrationStore};
use crate::timeline::{Lifecycle, Registration};

/// Track name used for the active-state rows
const ACTIVE_STATE_TRACK: &str = "active_state";

const SELECT_COLUMNS: &str = "entity_id, entity_kind, tx_start, tx_end, actor, lifecycle, note,
     attribute_track, value, valid_from, valid_to";

/// How long a connection waits on a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL so readers keep their snapshot while a write is in flight
    conn.pragma_update(None, "journal_mode", "WAL")?;
    create_schema(conn)
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS effect_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            tx_start TEXT NOT NULL,
            tx_end TEXT,
            actor TEXT NOT NULL,
            lifecycle TEXT NOT NULL,
            note TEXT,
            attribute_track TEXT NOT NULL,
            value TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_effect_rows_registration ON effect_rows(entity_id, tx_start)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_effect_rows_live ON effect_rows(entity_id, tx_end)",
        [],
    )?;

    Ok(())
}

/// Raw column values of one stored row
struct StoredRow {
    entity_id: String,
    entity_kind: String,
    tx_start: String,
    tx_end: Option<String>,
    actor: String,
    lifecycle: String,
    note: Option<String>,
    attribute_track: String,
    value: String,
    valid_from: String,
    valid_to: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        entity_id: row.get(0)?,
        entity_kind: row.get(1)?,
        tx_start: row.get(2)?,
        tx_end: row.get(3)?,
        actor: row.get(4)?,
        lifecycle: row.get(5)?,
        note: row.get(6)?,
        attribute_track: row.get(7)?,
        value: row.get(8)?,
        valid_from: row.get(9)?,
        valid_to: row.get(10)?,
    })
}

fn instant_text(t: Instant) -> String {
    Bound::At(t).to_string()
}

fn parse_entity_id(text: &str) -> Result<EntityId> {
    text.parse()
        .map_err(|e| RegistryError::Storage(format!("bad entity id '{text}': {e}")))
}

/// Registrations always open at a finite instant
fn parse_tx_start(text: &str) -> Result<Instant> {
    text.parse::<Bound>()?
        .instant()
        .ok_or_else(|| RegistryError::Storage(format!("non-finite tx_start '{text}'")))
}

/// Fold rows (ordered by tx_start) into registrations
fn assemble(rows: Vec<StoredRow>) -> Result<Vec<Registration>> {
    let mut registrations: Vec<Registration> = Vec::new();

    for row in rows {
        let tx_start = Bound::At(parse_tx_start(&row.tx_start)?);
        let validity = Interval::new(row.valid_from.parse::<Bound>()?, row.valid_to.parse::<Bound>()?)?;

        let starts_new = registrations
            .last()
            .map_or(true, |r| r.tx_validity.from() != tx_start);
        if starts_new {
            let tx_end = match row.tx_end.as_deref() {
                Some(text) => text.parse()?,
                None => Bound::PosInfinity,
            };
            registrations.push(Registration {
                entity_id: parse_entity_id(&row.entity_id)?,
                kind: row.entity_kind.parse::<EntityKind>()?,
                tx_validity: Interval::new(tx_start, tx_end)?,
                actor: Actor::new(row.actor),
                lifecycle: Lifecycle::parse(&row.lifecycle)?,
                note: row.note,
                effects: BTreeMap::new(),
                active_flag_rows: Vec::new(),
            });
        }

        let Some(current) = registrations.last_mut() else {
            continue;
        };
        if row.attribute_track == ACTIVE_STATE_TRACK {
            let state: ActiveState = serde_json::from_str(&row.value)?;
            current.active_flag_rows.push(EffectRow::new(state, validity));
        } else {
            let track: AttributeTrack = row.attribute_track.parse()?;
            let value: AttributeSnapshot = serde_json::from_str(&row.value)?;
            current
                .effects
                .entry(track)
                .or_default()
                .push(EffectRow::new(value, validity));
        }
    }

    Ok(registrations)
}

// ============================================================================
// READ CONNECTIONS
// ============================================================================

/// Read-only connections on the store's database, opened on demand and
/// returned after each read
struct ReaderPool {
    target: PathBuf,
    flags: OpenFlags,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(target: PathBuf, extra_flags: OpenFlags) -> Self {
        ReaderPool {
            target,
            flags: OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | extra_flags,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self) -> Result<PooledReader<'_>> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(&self.target, self.flags)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                debug!(target = %self.target.display(), "read connection opened");
                conn
            }
        };
        Ok(PooledReader {
            pool: self,
            conn: Some(conn),
        })
    }
}

struct PooledReader<'a> {
    pool: &'a ReaderPool,
    conn: Option<Connection>,
}

impl Deref for PooledReader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // only taken in drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!("reader used after release"))
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(conn);
        }
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    writer: Mutex<Connection>,
    readers: ReaderPool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        setup_database(&conn)?;
        Ok(SqliteStore {
            writer: Mutex::new(conn),
            readers: ReaderPool::new(path.to_path_buf(), OpenFlags::empty()),
        })
    }

    /// Private database shared by this store's connections only. It lives
    /// as long as the store.
    pub fn open_in_memory() -> Result<Self> {
        // memdb names starting with '/' are shared across connections of
        // this process
        let target = PathBuf::from(format!("file:/bitemporal-registry-{}?vfs=memdb", Uuid::new_v4()));
        let conn = Connection::open_with_flags(
            &target,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // memdb has no WAL; keep the rollback journal off the filesystem
        conn.pragma_update(None, "journal_mode", "MEMORY")?;
        create_schema(&conn)?;
        Ok(SqliteStore {
            writer: Mutex::new(conn),
            readers: ReaderPool::new(target, OpenFlags::SQLITE_OPEN_URI),
        })
    }

    fn query(&self, sql: &str, params: impl Params) -> Result<Vec<Registration>> {
        let conn = self.readers.checkout()?;
        let rows = {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        drop(conn);
        debug!(rows = rows.len(), "effect rows loaded");
        assemble(rows)
    }

    /// Number of stored effect rows, across all registrations
    pub fn row_count(&self) -> Result<i64> {
        let conn = self.readers.checkout()?;
        let count = conn.query_row("SELECT COUNT(*) FROM effect_rows", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl RegistrationReader for SqliteStore {
    fn registration_at(
        &self,
        id: EntityId,
        registration_time: Option<Instant>,
    ) -> Result<Option<Registration>> {
        let id_text = id.to_string();
        let found = match registration_time {
            None => self.query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM effect_rows
                     WHERE entity_id = ?1 AND tx_end IS NULL
                     ORDER BY tx_start, id"
                ),
                params![id_text],
            )?,
            // fixed-width RFC 3339 text compares in time order
            Some(t) => self.query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM effect_rows
                     WHERE entity_id = ?1 AND tx_start <= ?2 AND (tx_end IS NULL OR tx_end > ?2)
                     ORDER BY tx_start, id"
                ),
                params![id_text, instant_text(t)],
            )?,
        };
        Ok(found.into_iter().next())
    }

    fn history(&self, id: EntityId) -> Result<Vec<Registration>> {
        self.query(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM effect_rows
                 WHERE entity_id = ?1
                 ORDER BY tx_start, id"
            ),
            params![id.to_string()],
        )
    }

    fn entity_ids(&self, kind: Option<EntityKind>) -> Result<Vec<EntityId>> {
        let conn = self.readers.checkout()?;
        let texts = {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT entity_id FROM effect_rows
                 WHERE ?1 IS NULL OR entity_kind = ?1",
            )?;
            let texts = stmt
                .query_map(params![kind.map(|k| k.as_str())], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            texts
        };
        drop(conn);

        // UUID order, not text order
        let mut ids = texts
            .iter()
            .map(|text| parse_entity_id(text))
            .collect::<Result<Vec<_>>>()?;
        ids.sort();
        Ok(ids)
    }
}

impl RegistrationStore for SqliteStore {
    fn append(&self, expected_live: Option<Instant>, next: Registration) -> Result<()> {
        let next_start = next.tx_start()?;
        let mut conn = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // IMMEDIATE takes the write lock before the live row is read, so a
        // writer in another process cannot slip in between
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let id_text = next.entity_id.to_string();
        let tx_start = instant_text(next_start);

        let live_start = tx
            .query_row(
                "SELECT tx_start FROM effect_rows WHERE entity_id = ?1 AND tx_end IS NULL LIMIT 1",
                params![id_text],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|text| parse_tx_start(&text))
            .transpose()?;
        if live_start != expected_live {
            return Err(stale_base(&next));
        }
        if let Some(live_start) = live_start {
            if next_start <= live_start {
                return Err(RegistryError::InvalidInterval {
                    from: Bound::At(live_start),
                    to: Bound::At(next_start),
                    entity_id: Some(next.entity_id),
                });
            }
        }

        tx.execute(
            "UPDATE effect_rows SET tx_end = ?2 WHERE entity_id = ?1 AND tx_end IS NULL",
            params![id_text, tx_start],
        )?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO effect_rows (
                    entity_id, entity_kind, tx_start, tx_end, actor, lifecycle, note,
                    attribute_track, value, valid_from, valid_to
                ) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;

            let mut write = |track: &str, value: String, validity: &Interval| -> Result<()> {
                insert.execute(params![
                    id_text,
                    next.kind.as_str(),
                    tx_start,
                    next.actor.as_str(),
                    next.lifecycle.as_str(),
                    next.note,
                    track,
                    value,
                    validity.from().to_string(),
                    validity.to().to_string(),
                ])?;
                Ok(())
            };

            for row in &next.active_flag_rows {
                write(ACTIVE_STATE_TRACK, serde_json::to_string(&row.value)?, &row.validity)?;
            }
            for (track, rows) in &next.effects {
                for row in rows {
                    write(track.as_str(), serde_json::to_string(&row.value)?, &row.validity)?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn remove(&self, id: EntityId) -> Result<usize> {
        let mut conn = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let registrations: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT tx_start) FROM effect_rows WHERE entity_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM effect_rows WHERE entity_id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        Ok(usize::try_from(registrations).unwrap_or(0))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Change, RegistrationTimeline};
    use chrono::{TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> Instant {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn address(value: &str, validity: Interval) -> Change {
        Change::new(
            vec![AttributeSnapshot::address("postal", value)],
            validity,
            Actor::new("importer"),
        )
    }

    fn registration(id: EntityId, start: Instant, value: &str) -> Registration {
        Registration {
            entity_id: id,
            kind: EntityKind::Address,
            tx_validity: Interval::starting_at(start),
            actor: Actor::new("importer"),
            lifecycle: Lifecycle::Created,
            note: None,
            effects: BTreeMap::from([(
                AttributeTrack::Properties,
                vec![EffectRow::new(AttributeSnapshot::address("postal", value), Interval::unbounded())],
            )]),
            active_flag_rows: vec![EffectRow::new(ActiveState::Active, Interval::unbounded())],
        }
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();
    }

    #[test]
    fn test_append_closes_live_rows() {
        let tl = RegistrationTimeline::new(SqliteStore::open_in_memory().unwrap()).unwrap();
        let id = EntityId::new();
        let (t0, t1) = (date(2024, 1, 1), date(2024, 1, 2));

        tl.create(id, EntityKind::Address, address("Home", Interval::unbounded()), t0)
            .unwrap();
        tl.update(id, address("Away", Interval::starting_at(date(2020, 1, 1))), t1)
            .unwrap();

        let history = tl.reader().history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].tx_validity, Interval::new(t0, t1).unwrap());
        assert!(history[1].is_live());
        assert_eq!(history[1].track(AttributeTrack::Properties).len(), 2);
    }

    #[test]
    fn test_infinities_survive_storage() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tl = RegistrationTimeline::new(store).unwrap();
        let id = EntityId::new();
        tl.create(id, EntityKind::Address, address("Home", Interval::unbounded()), date(2024, 1, 1))
            .unwrap();

        let live = tl.reader().registration_at(id, None).unwrap().unwrap();
        let row = &live.track(AttributeTrack::Properties)[0];
        assert_eq!(row.validity.from(), Bound::NegInfinity);
        assert_eq!(row.validity.to(), Bound::PosInfinity);
        assert_eq!(live.active_flag_rows[0].validity, Interval::unbounded());
    }

    #[test]
    fn test_registration_time_is_pushed_down() {
        let tl = RegistrationTimeline::new(SqliteStore::open_in_memory().unwrap()).unwrap();
        let id = EntityId::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        let t1 = t0 + chrono::Duration::milliseconds(1);

        tl.create(id, EntityKind::Address, address("Home", Interval::unbounded()), t0)
            .unwrap();
        tl.update(id, address("Away", Interval::unbounded()), t1)
            .unwrap();

        let reader = tl.reader();
        assert!(reader
            .registration_at(id, Some(t0 - chrono::Duration::nanoseconds(1)))
            .unwrap()
            .is_none());
        assert_eq!(reader.registration_at(id, Some(t0)).unwrap().unwrap().tx_start().unwrap(), t0);
        assert_eq!(reader.registration_at(id, Some(t1)).unwrap().unwrap().tx_start().unwrap(), t1);
    }

    #[test]
    fn test_in_memory_stores_are_isolated() {
        let a = SqliteStore::open_in_memory().unwrap();
        let b = SqliteStore::open_in_memory().unwrap();
        a.append(None, registration(EntityId::new(), date(2024, 1, 1), "Home"))
            .unwrap();

        assert_eq!(a.entity_ids(None).unwrap().len(), 1);
        assert!(b.entity_ids(None).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let id = EntityId::new();

        {
            let tl = RegistrationTimeline::new(SqliteStore::open(&path).unwrap()).unwrap();
            tl.create(id, EntityKind::Address, address("Home", Interval::unbounded()), date(2024, 1, 1))
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.entity_ids(Some(EntityKind::Address)).unwrap(), vec![id]);
        assert!(store.entity_ids(Some(EntityKind::Person)).unwrap().is_empty());
        assert_eq!(store.row_count().unwrap(), 2);
    }

    #[test]
    fn test_open_read_does_not_block_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("registry.db")).unwrap();
        let id = EntityId::new();
        let (t0, t1) = (date(2024, 1, 1), date(2024, 1, 2));
        store.append(None, registration(id, t0, "Home")).unwrap();

        let reader = store.readers.checkout().unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let count = |conn: &Connection| -> i64 {
            conn.query_row("SELECT COUNT(*) FROM effect_rows", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count(&reader), 2);

        // the write lands while the read transaction is still open
        store.append(Some(t0), registration(id, t1, "Away")).unwrap();
        assert_eq!(count(&reader), 2);
        assert_eq!(
            store.registration_at(id, None).unwrap().unwrap().tx_start().unwrap(),
            t1
        );

        reader.execute_batch("COMMIT").unwrap();
        assert_eq!(count(&reader), 4);
    }

    #[test]
    fn test_append_rejects_stale_base_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();
        let id = EntityId::new();
        let t0 = date(2024, 1, 1);

        first.append(None, registration(id, t0, "Home")).unwrap();
        second
            .append(Some(t0), registration(id, date(2024, 1, 2), "Away"))
            .unwrap();

        // both derived from t0; only the first to commit wins
        let err = first
            .append(Some(t0), registration(id, date(2024, 1, 3), "Cabin"))
            .unwrap_err();
        assert_eq!(err.kind(), "ConcurrentMutation");
        assert!(err.is_retryable());

        let err = second
            .append(None, registration(id, date(2024, 1, 4), "Again"))
            .unwrap_err();
        assert_eq!(err.kind(), "ConcurrentMutation");

        let history = first.history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].is_live());
    }

    #[test]
    fn test_corrupt_tx_start_is_reported() {
        assert_eq!(parse_tx_start("-infinity").unwrap_err().kind(), "Storage");
        assert_eq!(parse_tx_start("2024-01-01T00:00:00.000000000Z").unwrap(), date(2024, 1, 1));
    }

    #[test]
    fn test_remove_reports_registration_count() {
        let tl = RegistrationTimeline::new(SqliteStore::open_in_memory().unwrap()).unwrap();
        let id = EntityId::new();
        tl.create(id, EntityKind::Address, address("Home", Interval::unbounded()), date(2024, 1, 1))
            .unwrap();
        tl.update(id, address("Away", Interval::unbounded()), date(2024, 1, 2))
            .unwrap();

        tl.delete(id).unwrap();
        assert!(tl.reader().history(id).unwrap().is_empty());
        assert!(tl.reader().entity_ids(None).unwrap().is_empty());
    }
}
