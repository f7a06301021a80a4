//! Run orchestrator: drives the pending-cell queue to completion or to the
//! call budget, splitting saturated cells along the way.

use crate::config::CrawlConfig;
use crate::error::{CrawlError, Result};
use crate::grid::{estimate_calls_for_radius, generate_initial_cells, split_cell};
use crate::places::{normalize_place, PlaceRecord, SearchClient};
use crate::store::{utc_now_iso, CellStatus, CrawlStore, QueryLog, RunStatus};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// The protected production store; writes require an explicit override.
pub const PROTECTED_DB: &str = "data/places.db";

/// Make a path absolute and lexically strip `.`/`..` components. Unlike
/// `canonicalize`, this also resolves paths that do not exist yet, which is
/// exactly the first-write case the guard has to cover.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Pre-flight safety interlock, checked before any run is created.
pub fn ensure_db_guard(db_path: &Path, allow_prod_db: bool) -> Result<()> {
    let target = normalize_path(db_path)?;
    let prod = normalize_path(Path::new(PROTECTED_DB))?;

    if target == prod && !allow_prod_db {
        return Err(CrawlError::Guard(format!(
            "refusing to write to production store {}; pass --allow-prod-db only if this is intentional",
            PROTECTED_DB
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    /// Effective budget, already clamped to the hard ceiling.
    pub max_calls: i64,
    pub allow_prod_db: bool,
    pub resume: bool,
    pub request_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: i64,
    pub db_path: PathBuf,
    pub status: RunStatus,
    pub calls_used: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub saturated_cells: i64,
}

impl RunSummary {
    pub fn places_per_100_calls(&self) -> f64 {
        if self.calls_used == 0 {
            return 0.0;
        }
        self.inserted as f64 * 100.0 / self.calls_used as f64
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Ingestion Summary ===")?;
        writeln!(f, "run_id: {}", self.run_id)?;
        writeln!(f, "db_path: {}", self.db_path.display())?;
        writeln!(f, "status: {}", self.status.as_str())?;
        writeln!(f, "total_calls_used: {}", self.calls_used)?;
        writeln!(f, "unique_places_inserted: {}", self.inserted)?;
        writeln!(f, "duplicates_ignored: {}", self.duplicates)?;
        writeln!(f, "saturated_cells_processed: {}", self.saturated_cells)?;
        write!(
            f,
            "new_unique_places_per_100_calls: {:.2}",
            self.places_per_100_calls()
        )
    }
}

pub struct CrawlRunner<C: SearchClient> {
    store: CrawlStore,
    client: C,
    config: CrawlConfig,
    options: RunnerOptions,
}

impl<C: SearchClient> CrawlRunner<C> {
    pub fn new(store: CrawlStore, client: C, config: CrawlConfig, options: RunnerOptions) -> Self {
        Self {
            store,
            client,
            config,
            options,
        }
    }

    pub async fn run(mut self) -> Result<RunSummary> {
        let (run_id, calls_used) = self.prepare_run()?;
        match self.drive(run_id, calls_used).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.store
                    .mark_run_finished(run_id, RunStatus::Failed, Some(&err.to_string()))?;
                Err(err)
            }
        }
    }

    /// Pick up the latest resumable run, or create a new one seeded with the
    /// initial grid of every configured region.
    fn prepare_run(&mut self) -> Result<(i64, i64)> {
        if self.options.resume {
            if let Some(run) = self.store.latest_resumable_run()? {
                let requeued = self.store.requeue_processing_cells(run.id)?;
                self.store.reopen_run(run.id, self.options.max_calls)?;
                info!(
                    "Resuming run_id={} (requeued {} processing cells, {} calls already used)",
                    run.id, requeued, run.calls_used
                );
                return Ok((run.id, run.calls_used));
            }
            info!("No resumable run found, starting a new one");
        }

        // Record resolved paths so the audit trail is stable across
        // differing working directories.
        let db_path = normalize_path(&self.options.db_path)?;
        let config_path = normalize_path(&self.options.config_path)?;
        let run_id = self.store.create_run(
            &db_path,
            &config_path,
            self.options.max_calls,
            self.options.allow_prod_db,
            None,
        )?;

        let mut initial_cells = Vec::new();
        for region in &self.config.regions {
            initial_cells.extend(generate_initial_cells(region, run_id));
        }
        let inserted = self.store.insert_cells(&initial_cells)?;
        info!(
            "Created new run_id={} with {} initial cells",
            run_id, inserted
        );
        Ok((run_id, 0))
    }

    async fn drive(&mut self, run_id: i64, mut calls_used: i64) -> Result<RunSummary> {
        let mut seen_place_ids = self.store.load_existing_place_ids()?;
        let mut total_inserted = 0;
        let mut total_duplicates = 0;

        let final_status = loop {
            if calls_used >= self.options.max_calls {
                warn!(
                    "Call cap reached ({}). Stopping run.",
                    self.options.max_calls
                );
                self.store
                    .mark_run_finished(run_id, RunStatus::Stopped, None)?;
                break RunStatus::Stopped;
            }

            let Some(claimed) = self.store.claim_next_pending_cell(run_id)? else {
                self.store
                    .mark_run_finished(run_id, RunStatus::Completed, None)?;
                break RunStatus::Completed;
            };

            // Charge the budget before the call; a crash mid-call must still
            // count it on resume.
            calls_used += 1;
            self.store.update_run_calls(run_id, calls_used)?;

            let requested_at = utc_now_iso();
            let started = Instant::now();
            let outcome = self
                .client
                .search_nearby(
                    claimed.cell.center_lat,
                    claimed.cell.center_lng,
                    claimed.cell.radius_m,
                )
                .await;
            let duration_ms = started.elapsed().as_millis() as i64;

            match outcome {
                Ok(response) => {
                    let result_count = response.places.len();
                    let is_saturated = result_count >= self.config.saturation_threshold;

                    let records: Vec<PlaceRecord> =
                        response.places.iter().filter_map(normalize_place).collect();
                    let (inserted, duplicates) =
                        self.store.insert_places(&records, &mut seen_place_ids)?;
                    total_inserted += inserted;
                    total_duplicates += duplicates;

                    let children = if is_saturated {
                        split_cell(&claimed.cell, self.config.split_overlap_factor)
                    } else {
                        Vec::new()
                    };
                    let cell_status = if children.is_empty() {
                        CellStatus::Done
                    } else {
                        self.store.insert_cells(&children)?;
                        CellStatus::Split
                    };

                    self.store.update_cell_success(
                        claimed.id,
                        cell_status,
                        result_count as i64,
                        inserted,
                        duplicates,
                        is_saturated,
                    )?;
                    self.store.record_query(&QueryLog {
                        run_id,
                        cell_id: claimed.id,
                        requested_at,
                        responded_at: Some(utc_now_iso()),
                        duration_ms: Some(duration_ms),
                        api_call_number: calls_used,
                        http_status: Some(response.http_status as i64),
                        result_count: Some(result_count as i64),
                        is_saturated: Some(is_saturated),
                        error_message: None,
                    })?;

                    info!(
                        "run={} call={} cell={} status={} results={} inserted={} dup={} radius={:.1}",
                        run_id,
                        calls_used,
                        claimed.cell.cell_key,
                        cell_status.as_str(),
                        result_count,
                        inserted,
                        duplicates,
                        claimed.cell.radius_m,
                    );
                }
                Err(err) => {
                    // Per-cell failure: record it and keep the run going.
                    // Only store failures abort the run.
                    let message = err.to_string();
                    error!(
                        "Cell failed run={} cell={} error={}",
                        run_id, claimed.cell.cell_key, message
                    );

                    self.store.update_cell_error(claimed.id, &message)?;
                    self.store.record_query(&QueryLog {
                        run_id,
                        cell_id: claimed.id,
                        requested_at,
                        responded_at: Some(utc_now_iso()),
                        duration_ms: Some(duration_ms),
                        api_call_number: calls_used,
                        http_status: http_status_of(&err).map(i64::from),
                        result_count: None,
                        is_saturated: None,
                        error_message: Some(message),
                    })?;
                }
            }

            if !self.options.request_delay.is_zero() {
                tokio::time::sleep(self.options.request_delay).await;
            }
        };

        Ok(RunSummary {
            run_id,
            db_path: self.options.db_path.clone(),
            status: final_status,
            calls_used,
            inserted: total_inserted,
            duplicates: total_duplicates,
            saturated_cells: self.store.saturated_cell_count(run_id)?,
        })
    }
}

fn http_status_of(err: &CrawlError) -> Option<u16> {
    match err {
        CrawlError::Search { status, .. } => Some(*status),
        CrawlError::Http(e) => e.status().map(|s| s.as_u16()),
        _ => None,
    }
}

/// Analytic plan for `--dry-run`: initial cell counts plus a worst-case call
/// estimate per region, without touching the store or the network.
pub fn dry_run_report(config: &CrawlConfig, effective_max_calls: i64) -> String {
    let mut report = String::new();
    let mut total_initial = 0usize;
    let mut worst_case = 0u64;

    writeln!(report, "=== Dry Run Plan ===").unwrap();
    for region in &config.regions {
        let initial = generate_initial_cells(region, 0).len();
        let per_cell_worst = estimate_calls_for_radius(region.initial_radius_m, region.min_radius_m);
        let region_worst = initial as u64 * per_cell_worst;

        total_initial += initial;
        worst_case += region_worst;

        writeln!(
            report,
            "Region={} bbox=({}, {}, {}, {}) initial_radius_m={} min_radius_m={} overlap_step_ratio={} initial_cells={} worst_case_calls={}",
            region.name,
            region.sw_lat(),
            region.sw_lng(),
            region.ne_lat(),
            region.ne_lng(),
            region.initial_radius_m,
            region.min_radius_m,
            region.overlap_step_ratio,
            initial,
            region_worst,
        )
        .unwrap();
    }

    writeln!(report, "Total initial cells: {}", total_initial).unwrap();
    writeln!(report, "Estimated calls (initial only): {}", total_initial).unwrap();
    writeln!(report, "Estimated calls (worst-case adaptive): {}", worst_case).unwrap();
    writeln!(report, "Effective hard cap: {}", effective_max_calls).unwrap();
    writeln!(report, "No API calls made (--dry-run).").unwrap();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_protected_store_without_override() {
        let prod = Path::new(PROTECTED_DB);
        assert!(matches!(
            ensure_db_guard(prod, false),
            Err(CrawlError::Guard(_))
        ));
        assert!(ensure_db_guard(prod, true).is_ok());
        assert!(ensure_db_guard(Path::new("data/places_trial.db"), false).is_ok());
    }

    #[test]
    fn guard_blocks_variant_spellings_of_protected_store() {
        // Different spellings of the same (possibly not-yet-created) file
        // must not slip past the interlock.
        assert!(matches!(
            ensure_db_guard(Path::new("./data/places.db"), false),
            Err(CrawlError::Guard(_))
        ));
        assert!(matches!(
            ensure_db_guard(Path::new("data/../data/places.db"), false),
            Err(CrawlError::Guard(_))
        ));

        let absolute = std::env::current_dir().unwrap().join("data/places.db");
        assert!(matches!(
            ensure_db_guard(&absolute, false),
            Err(CrawlError::Guard(_))
        ));
        assert!(ensure_db_guard(&absolute, true).is_ok());
    }

    #[test]
    fn normalize_path_resolves_nonexistent_paths() {
        let normalized = normalize_path(Path::new("./no_such_dir/../other/file.db")).unwrap();
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("other/file.db"));
        assert!(!normalized
            .components()
            .any(|c| matches!(c, Component::CurDir | Component::ParentDir)));
    }

    #[test]
    fn dry_run_report_counts_regions() {
        let config = CrawlConfig::default_config();
        let report = dry_run_report(&config, 4000);
        assert!(report.contains("Region=mission_sf"));
        assert!(report.contains("Effective hard cap: 4000"));
        assert!(report.contains("No API calls made"));
    }

    #[test]
    fn summary_efficiency_handles_zero_calls() {
        let summary = RunSummary {
            run_id: 1,
            db_path: PathBuf::from("test.db"),
            status: RunStatus::Completed,
            calls_used: 0,
            inserted: 0,
            duplicates: 0,
            saturated_cells: 0,
        };
        assert_eq!(summary.places_per_100_calls(), 0.0);

        let summary = RunSummary {
            calls_used: 50,
            inserted: 20,
            ..summary
        };
        assert!((summary.places_per_100_calls() - 40.0).abs() < 1e-9);
    }
}
