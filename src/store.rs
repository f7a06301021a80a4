//! Persistent crawl state: runs, cells, the query audit log, and the
//! discovered-place table.
//!
//! This is the only module that knows about status transitions. Every
//! mutation commits before returning, so a crash mid-run leaves a state a
//! later `--resume` can continue from without repeating recorded calls.

use crate::error::Result;
use crate::grid::Cell;
use crate::places::PlaceRecord;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn bad_status(value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown status '{}'", value).into(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "stopped" => Some(RunStatus::Stopped),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Pending,
    Processing,
    Done,
    Split,
    Error,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Pending => "pending",
            CellStatus::Processing => "processing",
            CellStatus::Done => "done",
            CellStatus::Split => "split",
            CellStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CellStatus::Pending),
            "processing" => Some(CellStatus::Processing),
            "done" => Some(CellStatus::Done),
            "split" => Some(CellStatus::Split),
            "error" => Some(CellStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub db_path: String,
    pub config_path: Option<String>,
    pub max_calls: i64,
    pub calls_used: i64,
    pub allow_prod_db: bool,
    pub resume_from_run_id: Option<i64>,
    pub error_message: Option<String>,
}

/// A pending cell transitioned to `processing` and handed to the run loop.
#[derive(Debug, Clone)]
pub struct ClaimedCell {
    pub id: i64,
    pub cell: Cell,
}

/// One row of the append-only wire audit trail. Cell status records the
/// outcome decision; this records what happened on the wire.
#[derive(Debug, Clone)]
pub struct QueryLog {
    pub run_id: i64,
    pub cell_id: i64,
    pub requested_at: String,
    pub responded_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub api_call_number: i64,
    pub http_status: Option<i64>,
    pub result_count: Option<i64>,
    pub is_saturated: Option<bool>,
    pub error_message: Option<String>,
}

pub struct CrawlStore {
    conn: Connection,
}

impl CrawlStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS places (
                id INTEGER PRIMARY KEY,
                place_id TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                address TEXT,
                price_level INTEGER,
                business_status TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_places_place_id ON places(place_id);

            CREATE TABLE IF NOT EXISTS crawl_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                db_path TEXT NOT NULL,
                config_path TEXT,
                max_calls INTEGER NOT NULL,
                calls_used INTEGER NOT NULL DEFAULT 0,
                allow_prod_db INTEGER NOT NULL DEFAULT 0,
                resume_from_run_id INTEGER,
                error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS crawl_cells (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                region_name TEXT NOT NULL,
                cell_key TEXT NOT NULL,
                parent_cell_key TEXT,
                depth INTEGER NOT NULL,
                center_lat REAL NOT NULL,
                center_lng REAL NOT NULL,
                radius_m REAL NOT NULL,
                min_radius_m REAL NOT NULL,
                status TEXT NOT NULL,
                result_count INTEGER,
                inserted_count INTEGER,
                duplicate_count INTEGER,
                is_saturated INTEGER,
                error_message TEXT,
                scheduled_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                UNIQUE(run_id, cell_key),
                FOREIGN KEY(run_id) REFERENCES crawl_runs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_crawl_cells_run_status ON crawl_cells(run_id, status);

            CREATE TABLE IF NOT EXISTS crawl_queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                cell_id INTEGER,
                requested_at TEXT NOT NULL,
                responded_at TEXT,
                duration_ms INTEGER,
                api_call_number INTEGER NOT NULL,
                http_status INTEGER,
                result_count INTEGER,
                is_saturated INTEGER,
                error_message TEXT,
                FOREIGN KEY(run_id) REFERENCES crawl_runs(id),
                FOREIGN KEY(cell_id) REFERENCES crawl_cells(id)
            );
            CREATE INDEX IF NOT EXISTS idx_crawl_queries_run ON crawl_queries(run_id);
            "#,
        )?;
        Ok(())
    }

    pub fn create_run(
        &self,
        db_path: &Path,
        config_path: &Path,
        max_calls: i64,
        allow_prod_db: bool,
        resume_from_run_id: Option<i64>,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO crawl_runs (
                started_at, status, db_path, config_path, max_calls, calls_used,
                allow_prod_db, resume_from_run_id
            ) VALUES (?1, 'running', ?2, ?3, ?4, 0, ?5, ?6)
            "#,
            params![
                utc_now_iso(),
                db_path.display().to_string(),
                config_path.display().to_string(),
                max_calls,
                allow_prod_db,
                resume_from_run_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
        let status_str: String = row.get("status")?;
        let status = RunStatus::parse(&status_str).ok_or_else(|| bad_status(&status_str))?;
        Ok(RunRow {
            id: row.get("id")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            status,
            db_path: row.get("db_path")?,
            config_path: row.get("config_path")?,
            max_calls: row.get("max_calls")?,
            calls_used: row.get("calls_used")?,
            allow_prod_db: row.get("allow_prod_db")?,
            resume_from_run_id: row.get("resume_from_run_id")?,
            error_message: row.get("error_message")?,
        })
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT * FROM crawl_runs WHERE id = ?1",
                params![run_id],
                Self::run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The most recent run that can be picked up again. `completed` runs are
    /// final; `running` here means a prior process died mid-run.
    pub fn latest_resumable_run(&self) -> Result<Option<RunRow>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT * FROM crawl_runs
                WHERE status IN ('running', 'stopped', 'failed')
                ORDER BY id DESC
                LIMIT 1
                "#,
                [],
                Self::run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Reset a resumable run to `running` under a possibly updated call cap.
    /// The same row is reused; `calls_used` stays monotonic across resumes.
    pub fn reopen_run(&self, run_id: i64, max_calls: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE crawl_runs SET status = 'running', finished_at = NULL, max_calls = ?1 WHERE id = ?2",
            params![max_calls, run_id],
        )?;
        Ok(())
    }

    pub fn mark_run_finished(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE crawl_runs SET status = ?1, finished_at = ?2, error_message = ?3 WHERE id = ?4",
            params![status.as_str(), utc_now_iso(), error_message, run_id],
        )?;
        Ok(())
    }

    /// Persisted before the external call is issued, so a crash during the
    /// call still counts it against the budget on resume.
    pub fn update_run_calls(&self, run_id: i64, calls_used: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE crawl_runs SET calls_used = ?1 WHERE id = ?2",
            params![calls_used, run_id],
        )?;
        Ok(())
    }

    /// Insert cells as `pending`, ignoring any `(run_id, cell_key)` that
    /// already exists; replaying a plan after a crash is a no-op. Returns the
    /// number of newly inserted rows.
    pub fn insert_cells(&mut self, cells: &[Cell]) -> Result<usize> {
        if cells.is_empty() {
            return Ok(0);
        }

        let now = utc_now_iso();
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        for cell in cells {
            inserted += tx.execute(
                r#"
                INSERT OR IGNORE INTO crawl_cells (
                    run_id, region_name, cell_key, parent_cell_key, depth,
                    center_lat, center_lng, radius_m, min_radius_m, status, scheduled_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)
                "#,
                params![
                    cell.run_id,
                    cell.region_name,
                    cell.cell_key,
                    cell.parent_cell_key,
                    cell.depth,
                    cell.center_lat,
                    cell.center_lng,
                    cell.radius_m,
                    cell.min_radius_m,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Atomically move the oldest `pending` cell of the run to `processing`
    /// and return it. Single serialization point of the crawl; assumes at
    /// most one concurrent claimant.
    pub fn claim_next_pending_cell(&self, run_id: i64) -> Result<Option<ClaimedCell>> {
        let claimed = self
            .conn
            .query_row(
                r#"
                SELECT id, run_id, region_name, cell_key, parent_cell_key, depth,
                       center_lat, center_lng, radius_m, min_radius_m
                FROM crawl_cells
                WHERE run_id = ?1 AND status = 'pending'
                ORDER BY id
                LIMIT 1
                "#,
                params![run_id],
                |row| {
                    Ok(ClaimedCell {
                        id: row.get(0)?,
                        cell: Cell {
                            run_id: row.get(1)?,
                            region_name: row.get(2)?,
                            cell_key: row.get(3)?,
                            parent_cell_key: row.get(4)?,
                            depth: row.get(5)?,
                            center_lat: row.get(6)?,
                            center_lng: row.get(7)?,
                            radius_m: row.get(8)?,
                            min_radius_m: row.get(9)?,
                        },
                    })
                },
            )
            .optional()?;

        let Some(claimed) = claimed else {
            return Ok(None);
        };

        self.conn.execute(
            "UPDATE crawl_cells SET status = 'processing', started_at = ?1, error_message = NULL WHERE id = ?2",
            params![utc_now_iso(), claimed.id],
        )?;
        Ok(Some(claimed))
    }

    /// Put cells stuck in `processing` back to `pending`; a prior process
    /// died mid-call. Errored cells stay `error` and are not retried.
    pub fn requeue_processing_cells(&self, run_id: i64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE crawl_cells SET status = 'pending', started_at = NULL WHERE run_id = ?1 AND status = 'processing'",
            params![run_id],
        )?;
        Ok(changed)
    }

    pub fn update_cell_success(
        &self,
        cell_id: i64,
        status: CellStatus,
        result_count: i64,
        inserted_count: i64,
        duplicate_count: i64,
        is_saturated: bool,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE crawl_cells
            SET status = ?1, result_count = ?2, inserted_count = ?3, duplicate_count = ?4,
                is_saturated = ?5, finished_at = ?6, error_message = NULL
            WHERE id = ?7
            "#,
            params![
                status.as_str(),
                result_count,
                inserted_count,
                duplicate_count,
                is_saturated,
                utc_now_iso(),
                cell_id,
            ],
        )?;
        Ok(())
    }

    pub fn update_cell_error(&self, cell_id: i64, error_message: &str) -> Result<()> {
        let truncated: String = error_message.chars().take(1000).collect();
        self.conn.execute(
            "UPDATE crawl_cells SET status = 'error', error_message = ?1, finished_at = ?2 WHERE id = ?3",
            params![truncated, utc_now_iso(), cell_id],
        )?;
        Ok(())
    }

    pub fn count_cells_with_status(&self, run_id: i64, status: CellStatus) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM crawl_cells WHERE run_id = ?1 AND status = ?2",
            params![run_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn saturated_cell_count(&self, run_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM crawl_cells WHERE run_id = ?1 AND is_saturated = 1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Prime the run-wide dedup set from everything already discovered,
    /// including by earlier runs against the same store.
    pub fn load_existing_place_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT place_id FROM places")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    /// Insert places with `INSERT OR IGNORE` semantics; a place's canonical
    /// attributes are fixed at first discovery and never updated. Returns
    /// `(inserted, duplicates)`.
    pub fn insert_places(
        &mut self,
        places: &[PlaceRecord],
        seen_place_ids: &mut HashSet<String>,
    ) -> Result<(i64, i64)> {
        let mut inserted = 0;
        let mut duplicates = 0;

        let tx = self.conn.transaction()?;
        for place in places {
            if seen_place_ids.contains(&place.place_id) {
                duplicates += 1;
                continue;
            }

            let changed = tx.execute(
                r#"
                INSERT OR IGNORE INTO places (
                    place_id, name, latitude, longitude, address, price_level, business_status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    place.place_id,
                    place.name,
                    place.latitude,
                    place.longitude,
                    place.address,
                    place.price_level,
                    place.business_status,
                ],
            )?;

            seen_place_ids.insert(place.place_id.clone());
            if changed > 0 {
                inserted += 1;
            } else {
                duplicates += 1;
            }
        }
        tx.commit()?;

        Ok((inserted, duplicates))
    }

    pub fn record_query(&self, log: &QueryLog) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO crawl_queries (
                run_id, cell_id, requested_at, responded_at, duration_ms,
                api_call_number, http_status, result_count, is_saturated, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                log.run_id,
                log.cell_id,
                log.requested_at,
                log.responded_at,
                log.duration_ms,
                log.api_call_number,
                log.http_status,
                log.result_count,
                log.is_saturated,
                log.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn query_count(&self, run_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM crawl_queries WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_cell(run_id: i64, key: &str) -> Cell {
        Cell {
            run_id,
            region_name: "test".to_string(),
            cell_key: key.to_string(),
            parent_cell_key: None,
            depth: 0,
            center_lat: 0.0,
            center_lng: 0.0,
            radius_m: 100.0,
            min_radius_m: 35.0,
        }
    }

    fn test_place(id: &str) -> PlaceRecord {
        PlaceRecord {
            place_id: id.to_string(),
            name: "Test Place".to_string(),
            latitude: 37.75,
            longitude: -122.41,
            address: "somewhere".to_string(),
            price_level: Some(2),
            business_status: "OPERATIONAL".to_string(),
        }
    }

    fn new_run(store: &CrawlStore) -> i64 {
        store
            .create_run(
                &PathBuf::from("test.db"),
                &PathBuf::from("config.yaml"),
                100,
                false,
                None,
            )
            .unwrap()
    }

    #[test]
    fn run_lifecycle_and_resumability() {
        let store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.calls_used, 0);

        store.update_run_calls(run_id, 7).unwrap();
        store
            .mark_run_finished(run_id, RunStatus::Stopped, None)
            .unwrap();

        let resumable = store.latest_resumable_run().unwrap().unwrap();
        assert_eq!(resumable.id, run_id);
        assert_eq!(resumable.calls_used, 7);

        store.reopen_run(run_id, 200).unwrap();
        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.max_calls, 200);

        store
            .mark_run_finished(run_id, RunStatus::Completed, None)
            .unwrap();
        assert!(store.latest_resumable_run().unwrap().is_none());
    }

    #[test]
    fn insert_cells_is_idempotent() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);
        let cells = vec![test_cell(run_id, "a"), test_cell(run_id, "b")];

        assert_eq!(store.insert_cells(&cells).unwrap(), 2);
        assert_eq!(store.insert_cells(&cells).unwrap(), 0);
        assert_eq!(
            store
                .count_cells_with_status(run_id, CellStatus::Pending)
                .unwrap(),
            2
        );
    }

    #[test]
    fn claim_transitions_oldest_pending_to_processing() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);
        store
            .insert_cells(&[test_cell(run_id, "a"), test_cell(run_id, "b")])
            .unwrap();

        let claimed = store.claim_next_pending_cell(run_id).unwrap().unwrap();
        assert_eq!(claimed.cell.cell_key, "a");
        assert_eq!(
            store
                .count_cells_with_status(run_id, CellStatus::Processing)
                .unwrap(),
            1
        );

        let second = store.claim_next_pending_cell(run_id).unwrap().unwrap();
        assert_eq!(second.cell.cell_key, "b");
        assert!(store.claim_next_pending_cell(run_id).unwrap().is_none());
    }

    #[test]
    fn requeue_recovers_in_flight_cells() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);
        store.insert_cells(&[test_cell(run_id, "a")]).unwrap();
        store.claim_next_pending_cell(run_id).unwrap().unwrap();

        assert_eq!(store.requeue_processing_cells(run_id).unwrap(), 1);
        assert_eq!(
            store
                .count_cells_with_status(run_id, CellStatus::Pending)
                .unwrap(),
            1
        );
    }

    #[test]
    fn errored_cells_are_not_claimable() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);
        store.insert_cells(&[test_cell(run_id, "a")]).unwrap();

        let claimed = store.claim_next_pending_cell(run_id).unwrap().unwrap();
        store.update_cell_error(claimed.id, "timeout").unwrap();

        assert!(store.claim_next_pending_cell(run_id).unwrap().is_none());
        assert_eq!(store.requeue_processing_cells(run_id).unwrap(), 0);
        assert_eq!(
            store
                .count_cells_with_status(run_id, CellStatus::Error)
                .unwrap(),
            1
        );
    }

    #[test]
    fn cell_error_message_is_truncated() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);
        store.insert_cells(&[test_cell(run_id, "a")]).unwrap();
        let claimed = store.claim_next_pending_cell(run_id).unwrap().unwrap();

        let long = "x".repeat(5000);
        store.update_cell_error(claimed.id, &long).unwrap();
        // No direct read-back API for the message; the update itself must not
        // fail and the cell must land in error status.
        assert_eq!(
            store
                .count_cells_with_status(run_id, CellStatus::Error)
                .unwrap(),
            1
        );
    }

    #[test]
    fn insert_places_dedups_within_and_across_batches() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let mut seen = store.load_existing_place_ids().unwrap();
        assert!(seen.is_empty());

        let (inserted, duplicates) = store
            .insert_places(&[test_place("p1"), test_place("p2")], &mut seen)
            .unwrap();
        assert_eq!((inserted, duplicates), (2, 0));

        // Same ids again, same or different cell: duplicates, never inserts.
        let (inserted, duplicates) = store
            .insert_places(&[test_place("p1"), test_place("p3")], &mut seen)
            .unwrap();
        assert_eq!((inserted, duplicates), (1, 1));

        // A fresh seen-set still dedups against the table itself.
        let mut fresh = HashSet::new();
        let (inserted, duplicates) = store
            .insert_places(&[test_place("p1")], &mut fresh)
            .unwrap();
        assert_eq!((inserted, duplicates), (0, 1));
    }

    #[test]
    fn query_log_is_append_only_per_call() {
        let mut store = CrawlStore::open_in_memory().unwrap();
        let run_id = new_run(&store);
        store.insert_cells(&[test_cell(run_id, "a")]).unwrap();

        for call in 1..=3 {
            store
                .record_query(&QueryLog {
                    run_id,
                    cell_id: 1,
                    requested_at: utc_now_iso(),
                    responded_at: Some(utc_now_iso()),
                    duration_ms: Some(12),
                    api_call_number: call,
                    http_status: Some(200),
                    result_count: Some(5),
                    is_saturated: Some(false),
                    error_message: None,
                })
                .unwrap();
        }
        assert_eq!(store.query_count(run_id).unwrap(), 3);
    }
}
