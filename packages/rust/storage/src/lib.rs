//! libSQL storage layer for durable enrichment state (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database holding:
//! - one [`EnrichmentRecord`] per enriched task
//! - per-task leases that serialize enrichment across processes
//! - enrichment run history
//! - a cache of parsed documents keyed by content hash
//!
//! **Access rules:**
//! - `playbook enrich`: read-write via [`Storage::open`]
//! - `playbook status`: read-only via [`Storage::open_for_reporting`]

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use playbook_shared::{Document, EnrichmentRecord, PlaybookError, Result};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of enrichment run history.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats_json: Option<String>,
}

fn db_err(e: impl std::fmt::Display) -> PlaybookError {
    PlaybookError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PlaybookError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PlaybookError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Read-only handle for reporting, or `None` when nothing has been stored yet.
    pub async fn open_for_reporting(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::open_readonly(path).await.map(Some)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PlaybookError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PlaybookError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Enrichment records
    // -----------------------------------------------------------------------

    /// Get the record for a task, if it was ever enriched.
    pub async fn get_record(&self, task_id: &str) -> Result<Option<EnrichmentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_id, matched_phase_index, content_fingerprint, generated_text, applied_at
                 FROM enrichment_records WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Insert or replace the record for a task.
    pub async fn put_record(&self, record: &EnrichmentRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO enrichment_records
                   (task_id, matched_phase_index, content_fingerprint, generated_text, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(task_id) DO UPDATE SET
                   matched_phase_index = excluded.matched_phase_index,
                   content_fingerprint = excluded.content_fingerprint,
                   generated_text = excluded.generated_text,
                   applied_at = excluded.applied_at",
                params![
                    record.task_id.as_str(),
                    i64::from(record.matched_phase_index),
                    record.content_fingerprint.as_str(),
                    record.generated_text.as_str(),
                    record.applied_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete the record for a task. Returns whether a row was removed.
    pub async fn delete_record(&self, task_id: &str) -> Result<bool> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM enrichment_records WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    /// All records, ordered by task id.
    pub async fn list_records(&self) -> Result<Vec<EnrichmentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_id, matched_phase_index, content_fingerprint, generated_text, applied_at
                 FROM enrichment_records ORDER BY task_id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Try to take the exclusive lease on `task_id` for `ttl`.
    ///
    /// Succeeds when no lease exists, the existing lease has expired, or
    /// `holder` already owns it (the expiry is then extended).
    pub async fn try_acquire_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_writable()?;
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        let changed = self
            .conn
            .execute(
                "INSERT INTO enrichment_leases (task_id, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id) DO UPDATE SET
                   holder = excluded.holder,
                   acquired_at = excluded.acquired_at,
                   expires_at = excluded.expires_at
                 WHERE enrichment_leases.expires_at <= ?3
                    OR enrichment_leases.holder = excluded.holder",
                params![task_id, holder, now, expires_at],
            )
            .await
            .map_err(db_err)?;

        Ok(changed == 1)
    }

    /// Release a lease held by `holder`. A lease held by someone else is left alone.
    pub async fn release_lease(&self, task_id: &str, holder: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM enrichment_leases WHERE task_id = ?1 AND holder = ?2",
                params![task_id, holder],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of an enrichment run. Returns the run ID.
    pub async fn insert_run(&self) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO enrichment_runs (id, started_at) VALUES (?1, ?2)",
                params![id.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    /// Mark a run finished with its stats.
    pub async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE enrichment_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recently started run, if any.
    pub async fn last_run(&self) -> Result<Option<RunSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, stats_json FROM enrichment_runs
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let started: String = row.get(1).map_err(db_err)?;
                let finished: Option<String> = row.get::<String>(2).ok();
                Ok(Some(RunSummary {
                    id: row.get(0).map_err(db_err)?,
                    started_at: parse_timestamp(&started)?,
                    finished_at: finished.as_deref().map(parse_timestamp).transpose()?,
                    stats_json: row.get::<String>(3).ok(),
                }))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Parsed-document cache
    // -----------------------------------------------------------------------

    /// Look up a previously parsed document by the hash of its raw text.
    pub async fn get_cached_document(&self, content_hash: &str) -> Result<Option<Document>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_json FROM document_cache WHERE content_hash = ?1",
                params![content_hash],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(db_err)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Store a parsed document under its content hash (upserts).
    pub async fn put_cached_document(&self, document: &Document) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(document)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO document_cache (content_hash, document_json, parsed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(content_hash) DO UPDATE SET
                   document_json = excluded.document_json,
                   parsed_at = excluded.parsed_at",
                params![document.content_hash.as_str(), json.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Whether this handle rejects writes.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PlaybookError::Storage(format!("invalid date: {e}")))
}

fn row_to_record(row: &libsql::Row) -> Result<EnrichmentRecord> {
    let index: i64 = row.get(1).map_err(db_err)?;
    let applied_at: String = row.get(4).map_err(db_err)?;
    Ok(EnrichmentRecord {
        task_id: row.get(0).map_err(db_err)?,
        matched_phase_index: u32::try_from(index)
            .map_err(|_| PlaybookError::Storage(format!("invalid phase index: {index}")))?,
        content_fingerprint: row.get(2).map_err(db_err)?,
        generated_text: row.get(3).map_err(db_err)?,
        applied_at: parse_timestamp(&applied_at)?,
    })
}
