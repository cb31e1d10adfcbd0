//! libSQL storage layer for bulk research runs (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the caller-side
//! state of bulk runs: run settings and entity lists, the cumulative result
//! map, the next window start, and the tier usage ledger used for budgeting.
//!
//! **Access rules:**
//! - `run` / `resume`: read-write via [`Storage::open`]
//! - `runs` / `report`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};

use bulkresearch_shared::{BulkResearchError, Result, ResultRecord};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Lifecycle of a stored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// A window is executing (or the process died mid-window).
    Running,
    /// Stopped at a checkpoint or by cancellation; resumable.
    Paused,
    /// Every entity has been processed.
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(BulkResearchError::Storage(format!("unknown run status: {other}"))),
        }
    }
}

/// A persisted run.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub id: String,
    pub name: String,
    /// Serialized `RunSettings`.
    pub settings_json: String,
    /// Serialized entity list.
    pub entities_json: String,
    /// SHA-256 of `entities_json`.
    pub entities_hash: String,
    pub total_entities: usize,
    /// Entities processed so far; the next window starts here.
    pub next_window_start: usize,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BulkResearchError::io(parent, e))?;
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

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BulkResearchError::Storage(format!(
                "no database at {}",
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
                        BulkResearchError::Storage(format!(
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

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BulkResearchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Insert a new run.
    pub async fn insert_run(&self, run: &StoredRun) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO runs (id, name, settings_json, entities_json, entities_hash,
                                   total_entities, next_window_start, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.id.as_str(),
                    run.name.as_str(),
                    run.settings_json.as_str(),
                    run.entities_json.as_str(),
                    run.entities_hash.as_str(),
                    run.total_entities as i64,
                    run.next_window_start as i64,
                    run.status.as_str(),
                    run.created_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &str) -> Result<Option<StoredRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, settings_json, entities_json, entities_hash, total_entities,
                        next_window_start, status, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List all runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<StoredRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, settings_json, entities_json, entities_hash, total_entities,
                        next_window_start, status, created_at, updated_at
                 FROM runs ORDER BY created_at DESC",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    /// Record how far a run has progressed.
    pub async fn update_run_progress(
        &self,
        id: &str,
        next_window_start: usize,
        status: RunStatus,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET next_window_start = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![next_window_start as i64, status.as_str(), now.as_str(), id],
            )
            .await
            .map_err(db_err)?;

        if changed == 0 {
            return Err(BulkResearchError::Storage(format!("run not found: {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Record operations
    // -----------------------------------------------------------------------

    /// Insert a record, replacing any earlier record for the same entity.
    pub async fn upsert_record(&self, run_id: &str, record: &ResultRecord) -> Result<()> {
        self.check_writable()?;

        let outputs_json = match &record.per_model_output {
            Some(outputs) => Some(serde_json::to_string(outputs).map_err(|e| {
                BulkResearchError::Storage(format!("failed to serialize outputs: {e}"))
            })?),
            None => None,
        };

        self.conn
            .execute(
                "INSERT INTO records (run_id, entity_id, display_name, outputs_json, error,
                                      processed_at, processing_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id, entity_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   outputs_json = excluded.outputs_json,
                   error = excluded.error,
                   processed_at = excluded.processed_at,
                   processing_index = excluded.processing_index",
                params![
                    run_id,
                    record.entity_id.as_str(),
                    record.display_name.as_str(),
                    outputs_json.as_deref(),
                    record.error.as_deref(),
                    record.processed_at.to_rfc3339(),
                    record.processing_index as i64,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All records of a run, ordered by processing index.
    pub async fn list_records(&self, run_id: &str) -> Result<Vec<ResultRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_id, display_name, outputs_json, error, processed_at, processing_index
                 FROM records WHERE run_id = ?1 ORDER BY processing_index",
                params![run_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Tier usage ledger
    // -----------------------------------------------------------------------

    /// Add `requests` dispatched with `tier` to the usage ledger.
    pub async fn record_tier_usage(&self, run_id: &str, tier: &str, requests: u64) -> Result<()> {
        self.check_writable()?;
        if requests == 0 {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO tier_usage (run_id, tier, requests, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, tier, requests as i64, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Total requests of `tier` recorded at or after `since`.
    pub async fn tier_usage_since(&self, tier: &str, since: DateTime<Utc>) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(requests), 0) FROM tier_usage WHERE tier = ?1 AND recorded_at >= ?2",
                params![tier, since.to_rfc3339()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }
}

/// Map a libSQL error into the storage variant.
fn db_err(e: libsql::Error) -> BulkResearchError {
    BulkResearchError::Storage(e.to_string())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BulkResearchError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`StoredRun`].
fn row_to_run(row: &libsql::Row) -> Result<StoredRun> {
    Ok(StoredRun {
        id: row.get::<String>(0).map_err(db_err)?,
        name: row.get::<String>(1).map_err(db_err)?,
        settings_json: row.get::<String>(2).map_err(db_err)?,
        entities_json: row.get::<String>(3).map_err(db_err)?,
        entities_hash: row.get::<String>(4).map_err(db_err)?,
        total_entities: row.get::<i64>(5).map_err(db_err)? as usize,
        next_window_start: row.get::<i64>(6).map_err(db_err)? as usize,
        status: RunStatus::parse(&row.get::<String>(7).map_err(db_err)?)?,
        created_at: parse_timestamp(&row.get::<String>(8).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(9).map_err(db_err)?)?,
    })
}

/// Convert a database row to a [`ResultRecord`].
fn row_to_record(row: &libsql::Row) -> Result<ResultRecord> {
    let per_model_output = match row.get::<String>(2).ok() {
        Some(json) => Some(serde_json::from_str::<BTreeMap<String, String>>(&json).map_err(
            |e| BulkResearchError::Storage(format!("corrupt outputs_json: {e}")),
        )?),
        None => None,
    };

    Ok(ResultRecord {
        entity_id: row.get::<String>(0).map_err(db_err)?,
        display_name: row.get::<String>(1).map_err(db_err)?,
        per_model_output,
        error: row.get::<String>(3).ok(),
        processed_at: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
        processing_index: row.get::<i64>(5).map_err(db_err)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("br_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn sample_run(id: &str) -> StoredRun {
        StoredRun {
            id: id.to_string(),
            name: "leads.txt".into(),
            settings_json: "{}".into(),
            entities_json: "[]".into(),
            entities_hash: "abc".into(),
            total_entities: 45,
            next_window_start: 0,
            status: RunStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn record(entity_id: &str, index: usize, error: Option<&str>) -> ResultRecord {
        ResultRecord {
            entity_id: entity_id.into(),
            display_name: entity_id.to_uppercase(),
            per_model_output: error.is_none().then(|| {
                [("openai".to_string(), format!("notes on {entity_id}"))]
                    .into_iter()
                    .collect()
            }),
            error: error.map(String::from),
            processed_at: Utc::now(),
            processing_index: index,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("br_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let storage = test_storage().await;
        let id = Uuid::now_v7().to_string();
        storage.insert_run(&sample_run(&id)).await.expect("insert run");

        let run = storage.get_run(&id).await.expect("get run").expect("run exists");
        assert_eq!(run.total_entities, 45);
        assert_eq!(run.status, RunStatus::Running);

        storage
            .update_run_progress(&id, 20, RunStatus::Paused)
            .await
            .expect("update progress");
        let run = storage.get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.next_window_start, 20);
        assert_eq!(run.status, RunStatus::Paused);

        assert_eq!(storage.list_runs().await.unwrap().len(), 1);
        assert!(storage.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_missing_run_fails() {
        let storage = test_storage().await;
        let err = storage
            .update_run_progress("nope", 1, RunStatus::Paused)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("run not found"));
    }

    #[tokio::test]
    async fn records_roundtrip_in_index_order() {
        let storage = test_storage().await;
        let id = Uuid::now_v7().to_string();
        storage.insert_run(&sample_run(&id)).await.unwrap();

        storage.upsert_record(&id, &record("b.com", 1, Some("HTTP 500"))).await.unwrap();
        storage.upsert_record(&id, &record("a.com", 0, None)).await.unwrap();

        let records = storage.list_records(&id).await.expect("list records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity_id, "a.com");
        assert_eq!(
            records[0].per_model_output.as_ref().unwrap()["openai"],
            "notes on a.com"
        );
        assert!(records[0].error.is_none());
        assert_eq!(records[1].error.as_deref(), Some("HTTP 500"));
        assert!(records[1].per_model_output.is_none());

        // Re-processing an entity replaces its record.
        storage.upsert_record(&id, &record("b.com", 1, None)).await.unwrap();
        let records = storage.list_records(&id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].error.is_none());
    }

    #[tokio::test]
    async fn tier_usage_ledger() {
        let storage = test_storage().await;
        let month_start = Utc::now() - Duration::days(1);

        assert_eq!(
            storage.tier_usage_since("sonar-deep-research", month_start).await.unwrap(),
            0
        );

        storage.record_tier_usage("r1", "sonar-deep-research", 20).await.unwrap();
        storage.record_tier_usage("r1", "sonar-deep-research", 5).await.unwrap();
        storage.record_tier_usage("r1", "sonar-pro", 7).await.unwrap();
        storage.record_tier_usage("r1", "sonar-pro", 0).await.unwrap();

        assert_eq!(
            storage.tier_usage_since("sonar-deep-research", month_start).await.unwrap(),
            25
        );
        assert_eq!(storage.tier_usage_since("sonar-pro", month_start).await.unwrap(), 7);

        let future = Utc::now() + Duration::days(1);
        assert_eq!(
            storage.tier_usage_since("sonar-deep-research", future).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("br_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_run(&sample_run("r1")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_runs().await.unwrap().len(), 1);
        let result = ro.insert_run(&sample_run("r2")).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
