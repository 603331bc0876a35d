//! Database schema definitions
//!
//! Every statement is idempotent so the schema can be applied on each open.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track pipeline runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

-- Durable work log: one row per normalized identifier ever admitted
CREATE TABLE IF NOT EXISTS work_items (
    identifier TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    state TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    source_hint TEXT,
    discovered_at TEXT NOT NULL,
    next_eligible_at TEXT,
    updated_at TEXT NOT NULL,
    failure_class TEXT,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_work_items_state ON work_items(state);
CREATE INDEX IF NOT EXISTS idx_work_items_host ON work_items(host);

-- Extracted entities keyed by stable identity
CREATE TABLE IF NOT EXISTS entities (
    entity_key TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    source_identifier TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
