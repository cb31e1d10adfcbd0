//! SQL migration definitions for the bulkresearch database.
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
        description: "Initial schema: runs, records, tier_usage",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per bulk research run
CREATE TABLE IF NOT EXISTS runs (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    settings_json     TEXT NOT NULL,
    entities_json     TEXT NOT NULL,
    entities_hash     TEXT NOT NULL,
    total_entities    INTEGER NOT NULL,
    next_window_start INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

-- Cumulative per-entity results
CREATE TABLE IF NOT EXISTS records (
    run_id           TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    entity_id        TEXT NOT NULL,
    display_name     TEXT NOT NULL,
    outputs_json     TEXT,
    error            TEXT,
    processed_at     TEXT NOT NULL,
    processing_index INTEGER NOT NULL,
    PRIMARY KEY (run_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_records_run ON records(run_id, processing_index);

-- Requests dispatched per model tier, for budget accounting
CREATE TABLE IF NOT EXISTS tier_usage (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    tier        TEXT NOT NULL,
    requests    INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tier_usage_tier ON tier_usage(tier, recorded_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
