//! Storage module for durable pipeline state
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - The work log backing dedup, resume and dead-letter reporting
//! - Idempotent entity upserts
//! - Run tracking

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{EntityStore, StorageError, StorageResult, Transition, WorkLog};

use crate::state::{FailureClass, ItemState};
use std::path::Path;

/// Opens or creates a storage database
pub fn open_storage(path: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path)
}

/// A work item as recorded in the work log
#[derive(Debug, Clone)]
pub struct WorkRecord {
    pub identifier: String,
    pub host: String,
    pub state: ItemState,
    pub attempt_count: u32,
    pub source_hint: Option<String>,
    pub discovered_at: String,
    pub next_eligible_at: Option<String>,
    pub updated_at: String,
    pub failure_class: Option<FailureClass>,
    pub last_error: Option<String>,
}

/// A stored entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: String,
    pub kind: String,
    pub source_identifier: String,
    /// Canonical JSON of the entity fields
    pub content: String,
    /// Hex SHA-256 of `content`
    pub content_hash: String,
}

/// Result of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Represents a pipeline run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
