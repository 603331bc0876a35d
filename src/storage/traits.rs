//! Storage traits and error types
//!
//! The pipeline depends on two capabilities: a durable work log that backs
//! the visited store and frontier spill, and an entity store with upsert
//! semantics. Both take `&self` so one handle can be shared across workers.

use crate::state::{FailureClass, ItemState};
use crate::storage::{EntityRecord, RunRecord, RunStatus, UpsertOutcome, WorkRecord};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    /// True when a concurrent writer claimed the same key first
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A state change for one work item
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub state: ItemState,
    pub attempt_count: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub failure: Option<(FailureClass, &'a str)>,
}

impl<'a> Transition<'a> {
    pub fn to(state: ItemState, attempt_count: u32) -> Self {
        Self {
            state,
            attempt_count,
            next_eligible_at: None,
            failure: None,
        }
    }

    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_eligible_at = Some(at);
        self
    }

    pub fn with_failure(mut self, class: FailureClass, message: &'a str) -> Self {
        self.failure = Some((class, message));
        self
    }
}

/// Durable record of every admitted work item and its state
pub trait WorkLog: Send + Sync {
    // ===== Run Management =====

    /// Creates a new run and returns its id
    fn create_run(&self, config_hash: &str) -> StorageResult<i64>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Marks a run finished with the given status
    fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    // ===== Work Items =====

    /// Inserts a work item if the identifier has never been seen
    ///
    /// Returns true if this call created the row. Existing rows are never
    /// modified, so concurrent callers see exactly one `true`.
    fn record_discovered(
        &self,
        identifier: &str,
        host: &str,
        source_hint: Option<&str>,
        state: ItemState,
    ) -> StorageResult<bool>;

    /// Gets a work item by identifier
    fn get_item(&self, identifier: &str) -> StorageResult<Option<WorkRecord>>;

    /// Applies a state transition
    fn update_state(&self, identifier: &str, transition: &Transition<'_>) -> StorageResult<()>;

    /// Moves items stuck in active states back to `Discovered`
    ///
    /// Used at startup so work interrupted by a crash or shutdown is resumed.
    /// Returns the number of items reset.
    fn reset_active(&self) -> StorageResult<usize>;

    /// Loads up to `limit` items in the `Discovered` state, oldest first
    fn load_discovered(&self, limit: usize) -> StorageResult<Vec<WorkRecord>>;

    /// Counts items in a state
    fn count_by_state(&self, state: ItemState) -> StorageResult<u64>;

    /// Lists dead-lettered items with their failure details
    fn dead_letters(&self) -> StorageResult<Vec<WorkRecord>>;
}

/// Durable store of extracted entities
pub trait EntityStore: Send + Sync {
    /// Inserts or updates an entity keyed by `entity.key`
    ///
    /// Identical content is reported as `Unchanged` without a write.
    /// A unique-key race surfaces as `StorageError::ConstraintViolation`.
    fn upsert_entity(&self, entity: &EntityRecord) -> StorageResult<UpsertOutcome>;

    /// Gets an entity by key
    fn get_entity(&self, key: &str) -> StorageResult<Option<EntityRecord>>;

    /// Counts stored entities
    fn count_entities(&self) -> StorageResult<u64>;
}
