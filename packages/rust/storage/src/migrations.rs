//! SQL migration definitions for the Playbook state database.
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
    vec![
        Migration {
            version: 1,
            description: "Initial schema: enrichment_records, enrichment_leases",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- What was last applied to each external task
CREATE TABLE IF NOT EXISTS enrichment_records (
    task_id             TEXT PRIMARY KEY,
    matched_phase_index INTEGER NOT NULL,
    content_fingerprint TEXT NOT NULL,
    generated_text      TEXT NOT NULL,
    applied_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_phase ON enrichment_records(matched_phase_index);

-- Per-task exclusive leases; times are unix milliseconds
CREATE TABLE IF NOT EXISTS enrichment_leases (
    task_id     TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history and parsed-document cache",
            sql: r#"
-- Enrichment run history
CREATE TABLE IF NOT EXISTS enrichment_runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

-- Last parsed documents keyed by content hash
CREATE TABLE IF NOT EXISTS document_cache (
    content_hash  TEXT PRIMARY KEY,
    document_json TEXT NOT NULL,
    parsed_at     TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
