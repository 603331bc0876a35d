//! SQLite storage implementation
//!
//! One connection guarded by a mutex serves both the work log and the
//! entity store. WAL mode keeps readers from blocking the writer.

use crate::state::{FailureClass, ItemState};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{EntityStore, StorageError, StorageResult, Transition, WorkLog};
use crate::storage::{EntityRecord, RunRecord, RunStatus, UpsertOutcome, WorkRecord};
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const WORK_COLUMNS: &str = "identifier, host, state, attempt_count, source_hint, discovered_at,
     next_eligible_at, updated_at, failure_class, last_error";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Opens or creates the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(classify_sqlite_error)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))
    }
}

/// Maps SQLite failures onto the storage taxonomy
///
/// Unique-key races become `ConstraintViolation`; failures that mean the
/// database itself cannot be used become `Unavailable`.
fn classify_sqlite_error(err: rusqlite::Error) -> StorageError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StorageError::ConstraintViolation(err.to_string()),
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::ReadOnly
            | ErrorCode::DiskFull
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase,
        ) => StorageError::Unavailable(err.to_string()),
        _ => StorageError::Sqlite(err),
    }
}

fn work_record_from_row(row: &Row<'_>) -> rusqlite::Result<WorkRecord> {
    let state: String = row.get(2)?;
    let failure_class: Option<String> = row.get(8)?;
    Ok(WorkRecord {
        identifier: row.get(0)?,
        host: row.get(1)?,
        state: ItemState::from_db_string(&state).unwrap_or(ItemState::Discovered),
        attempt_count: row.get(3)?,
        source_hint: row.get(4)?,
        discovered_at: row.get(5)?,
        next_eligible_at: row.get(6)?,
        updated_at: row.get(7)?,
        failure_class: failure_class.as_deref().and_then(FailureClass::from_db_string),
        last_error: row.get(9)?,
    })
}

impl WorkLog for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&self, config_hash: &str) -> StorageResult<i64> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )
        .map_err(classify_sqlite_error)?;
        Ok(conn.last_insert_rowid())
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        config_hash: row.get(3)?,
                        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                            .unwrap_or(RunStatus::Running),
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let updated = conn
            .execute(
                "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![status.to_db_string(), now, run_id],
            )
            .map_err(classify_sqlite_error)?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Work Items =====

    fn record_discovered(
        &self,
        identifier: &str,
        host: &str,
        source_hint: Option<&str>,
        state: ItemState,
    ) -> StorageResult<bool> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO work_items
                 (identifier, host, state, attempt_count, source_hint, discovered_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
                params![identifier, host, state.to_db_string(), source_hint, now],
            )
            .map_err(classify_sqlite_error)?;
        Ok(inserted == 1)
    }

    fn get_item(&self, identifier: &str) -> StorageResult<Option<WorkRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM work_items WHERE identifier = ?1", WORK_COLUMNS),
                params![identifier],
                work_record_from_row,
            )
            .optional()
            .map_err(classify_sqlite_error)?;
        Ok(record)
    }

    fn update_state(&self, identifier: &str, transition: &Transition<'_>) -> StorageResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let (failure_class, last_error) = match transition.failure {
            Some((class, message)) => (Some(class.to_db_string()), Some(message)),
            None => (None, None),
        };
        let next_eligible_at = transition.next_eligible_at.map(|t| t.to_rfc3339());

        // Failure details survive a later non-failing transition so a stalled
        // item keeps its last error until it is overwritten by a new one.
        conn.execute(
            "UPDATE work_items SET state = ?1, attempt_count = ?2, next_eligible_at = ?3,
             updated_at = ?4,
             failure_class = COALESCE(?5, failure_class),
             last_error = COALESCE(?6, last_error)
             WHERE identifier = ?7",
            params![
                transition.state.to_db_string(),
                transition.attempt_count,
                next_eligible_at,
                now,
                failure_class,
                last_error,
                identifier
            ],
        )
        .map_err(classify_sqlite_error)?;
        Ok(())
    }

    fn reset_active(&self) -> StorageResult<usize> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let reset = conn
            .execute(
                "UPDATE work_items SET state = ?1, updated_at = ?2
                 WHERE state IN (?3, ?4, ?5, ?6)",
                params![
                    ItemState::Discovered.to_db_string(),
                    now,
                    ItemState::Queued.to_db_string(),
                    ItemState::Fetching.to_db_string(),
                    ItemState::Retrying.to_db_string(),
                    ItemState::Parsing.to_db_string(),
                ],
            )
            .map_err(classify_sqlite_error)?;
        Ok(reset)
    }

    fn load_discovered(&self, limit: usize) -> StorageResult<Vec<WorkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM work_items WHERE state = ?1 ORDER BY discovered_at, identifier LIMIT ?2",
            WORK_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(
                params![ItemState::Discovered.to_db_string(), limit],
                work_record_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_sqlite_error)?;
        Ok(records)
    }

    fn count_by_state(&self, state: ItemState) -> StorageResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM work_items WHERE state = ?1",
                params![state.to_db_string()],
                |row| row.get(0),
            )
            .map_err(classify_sqlite_error)?;
        Ok(count as u64)
    }

    fn dead_letters(&self) -> StorageResult<Vec<WorkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM work_items WHERE state = ?1 ORDER BY updated_at, identifier",
            WORK_COLUMNS
        ))?;
        let records = stmt
            .query_map(
                params![ItemState::DeadLettered.to_db_string()],
                work_record_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

impl EntityStore for SqliteStorage {
    fn upsert_entity(&self, entity: &EntityRecord) -> StorageResult<UpsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(classify_sqlite_error)?;
        let now = Utc::now().to_rfc3339();

        let existing: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM entities WHERE entity_key = ?1",
                params![entity.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify_sqlite_error)?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO entities
                     (entity_key, kind, source_identifier, content, content_hash, first_seen_at, last_updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        entity.key,
                        entity.kind,
                        entity.source_identifier,
                        entity.content,
                        entity.content_hash,
                        now
                    ],
                )
                .map_err(classify_sqlite_error)?;
                UpsertOutcome::Inserted
            }
            Some(hash) if hash == entity.content_hash => UpsertOutcome::Unchanged,
            Some(_) => {
                tx.execute(
                    "UPDATE entities SET kind = ?1, source_identifier = ?2, content = ?3,
                     content_hash = ?4, last_updated_at = ?5 WHERE entity_key = ?6",
                    params![
                        entity.kind,
                        entity.source_identifier,
                        entity.content,
                        entity.content_hash,
                        now,
                        entity.key
                    ],
                )
                .map_err(classify_sqlite_error)?;
                UpsertOutcome::Updated
            }
        };

        tx.commit().map_err(classify_sqlite_error)?;
        Ok(outcome)
    }

    fn get_entity(&self, key: &str) -> StorageResult<Option<EntityRecord>> {
        let conn = self.conn()?;
        let entity = conn
            .query_row(
                "SELECT entity_key, kind, source_identifier, content, content_hash
                 FROM entities WHERE entity_key = ?1",
                params![key],
                |row| {
                    Ok(EntityRecord {
                        key: row.get(0)?,
                        kind: row.get(1)?,
                        source_identifier: row.get(2)?,
                        content: row.get(3)?,
                        content_hash: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(classify_sqlite_error)?;
        Ok(entity)
    }

    fn count_entities(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
            .map_err(classify_sqlite_error)?;
        Ok(count as u64)
    }
}
