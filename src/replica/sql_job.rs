// Fan-out discipline shared by the fleet-wide SQL jobs: per-worker table
// enumeration, batching, the per-(job, worker) registry, and result
// aggregation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::replica::controller::Controller;
use crate::replica::job::{ExtendedState, Job, JobCore, JobOptions};
use crate::replica::worker::{IndexRow, SqlRequestSummary};
use crate::util::Flag;

/// Sentinel chunk number of the per-table schema-carrier ("dummy") chunk.
/// DDL fan-outs touch it even when it holds no rows.
pub const DUMMY_CHUNK: u32 = 1234567890;

/// Concrete MySQL tables a SQL operation touches at one worker.
///
/// A regular table maps to itself. A partitioned table maps to one table per
/// chunk the worker owns plus the dummy chunk, and, when `overlap` is set,
/// the spatial-overlap variants of the same set.
pub fn worker_tables(table: &str, is_partitioned: bool, chunks: &[u32], overlap: bool) -> Vec<String> {
    if !is_partitioned {
        return vec![table.to_string()];
    }
    let all_chunks = chunks.iter().copied().chain(std::iter::once(DUMMY_CHUNK));
    let mut tables: Vec<String> = all_chunks.map(|chunk| format!("{}_{}", table, chunk)).collect();
    if overlap {
        let all_chunks = chunks.iter().copied().chain(std::iter::once(DUMMY_CHUNK));
        tables.extend(all_chunks.map(|chunk| format!("{}FullOverlap_{}", table, chunk)));
    }
    tables
}

/// Split `tables` into batches of at most `max_tables_per_request`.
pub fn distribute_tables(tables: Vec<String>, max_tables_per_request: usize) -> Vec<Vec<String>> {
    if tables.is_empty() {
        return Vec::new();
    }
    let batch = max_tables_per_request.max(1);
    tables.chunks(batch).map(|c| c.to_vec()).collect()
}

/// Aggregated outcome of one SQL fan-out job.
#[derive(Debug, Clone, Default)]
pub struct SqlJobResult {
    /// worker -> tables processed successfully
    pub completed: BTreeMap<String, Vec<String>>,
    /// worker -> (table, error) pairs
    pub failed: BTreeMap<String, Vec<(String, String)>>,
    /// worker -> tables skipped with a tolerated duplicate-key error
    pub duplicate_keys: BTreeMap<String, Vec<String>>,
    /// worker -> request count issued
    pub requests_per_worker: BTreeMap<String, usize>,
    /// worker -> SHOW INDEXES rows (index retrieval only)
    pub rows: BTreeMap<String, Vec<IndexRow>>,
    /// workers whose requests failed outright, with the error text
    pub worker_errors: BTreeMap<String, String>,
}

/// Description of one index: columns by position plus the comment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexInfo {
    /// column name -> seq_in_index
    pub columns: BTreeMap<String, u32>,
    pub comment: String,
}

/// worker -> table -> index name -> definition
pub type IndexMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, IndexInfo>>>;

impl SqlJobResult {
    pub fn total_completed(&self) -> usize {
        self.completed.values().map(|tables| tables.len()).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.failed.values().map(|tables| tables.len()).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.total_failed() > 0 || !self.worker_errors.is_empty()
    }

    /// Fold the raw SHOW INDEXES rows into the nested index mapping.
    pub fn index_map(&self) -> IndexMap {
        let mut map = IndexMap::new();
        for (worker, rows) in &self.rows {
            let worker_entry = map.entry(worker.clone()).or_default();
            for row in rows {
                let info = worker_entry
                    .entry(row.table.clone())
                    .or_default()
                    .entry(row.key_name.clone())
                    .or_default();
                info.columns.insert(row.column_name.clone(), row.seq_in_index);
                if info.comment.is_empty() {
                    info.comment = row.comment.clone();
                }
            }
        }
        map
    }
}

/// State shared by every SQL fan-out job.
pub struct SqlJobBase {
    pub core: JobCore,
    pub controller: Arc<Controller>,
    pub database: String,
    pub table: String,
    pub overlap: bool,
    pub all_workers: bool,
    /// Exactly one fan-out per worker per job (duplicate suppression).
    workers_served: Mutex<HashSet<String>>,
    outstanding: Mutex<usize>,
    in_flight: Mutex<HashMap<String, String>>,
    pub result: Mutex<SqlJobResult>,
    pub cancelled: Flag,
}

impl SqlJobBase {
    pub fn new(
        kind: &str,
        controller: Arc<Controller>,
        database: impl Into<String>,
        table: impl Into<String>,
        overlap: bool,
        all_workers: bool,
        parent_id: impl Into<String>,
        options: JobOptions,
    ) -> Self {
        Self {
            core: JobCore::new(kind, parent_id, options),
            controller,
            database: database.into(),
            table: table.into(),
            overlap,
            all_workers,
            workers_served: Mutex::new(HashSet::new()),
            outstanding: Mutex::new(0),
            in_flight: Mutex::new(HashMap::new()),
            result: Mutex::new(SqlJobResult::default()),
            cancelled: Flag::new(),
        }
    }

    /// Tables this job touches at `worker`, or None when the worker was
    /// already served.
    pub fn tables_for_worker(&self, worker: &str) -> Result<Option<Vec<String>>> {
        if !self.workers_served.lock().insert(worker.to_string()) {
            debug!(job_id = %self.core.id(), worker, "worker already served");
            return Ok(None);
        }
        let config = self.controller.config();
        let is_partitioned = config
            .database(&self.database)
            .and_then(|db| db.table(&self.table))
            .map(|t| t.is_partitioned)
            .unwrap_or(false);
        let chunks = if is_partitioned {
            self.controller.database().worker_chunks(worker, &self.database)?
        } else {
            Vec::new()
        };
        Ok(Some(worker_tables(&self.table, is_partitioned, &chunks, self.overlap)))
    }

    pub fn result(&self) -> SqlJobResult {
        self.result.lock().clone()
    }
}

/// The pieces a concrete SQL job contributes to the shared fan-out engine.
pub(crate) trait SqlFanoutJob: Job + Send + Sync + Sized + 'static {
    fn base(&self) -> &SqlJobBase;

    fn request_kind(&self) -> &'static str;

    /// Execute one batched request at one worker. Runs on a pool thread.
    fn execute_request(&self, worker: &str, tables: &[String]) -> Result<SqlRequestSummary>;

    /// Whether table-level failures fail the whole job.
    fn failures_are_fatal(&self) -> bool {
        true
    }
}

/// Validate state, enumerate workers/tables/batches, and launch everything.
pub(crate) fn start_fanout<J: SqlFanoutJob>(job: Arc<J>) -> Result<()> {
    let base = job.base();
    base.core.start_transition()?;

    let config = base.controller.config();
    let max_tables = config.max_tables_per_request;
    let mut launches: Vec<(String, Vec<String>)> = Vec::new();
    for worker in config.eligible_workers(base.all_workers) {
        let Some(tables) = base.tables_for_worker(&worker.name)? else {
            continue;
        };
        let batches = distribute_tables(tables, max_tables);
        base.result
            .lock()
            .requests_per_worker
            .insert(worker.name.clone(), batches.len());
        for batch in batches {
            launches.push((worker.name.clone(), batch));
        }
    }

    if launches.is_empty() {
        finish_fanout(&*job, ExtendedState::Success);
        return Ok(());
    }
    *base.outstanding.lock() = launches.len();

    for (worker, tables) in launches {
        let Some(request_id) =
            base.controller.begin_request(base.core.id(), &worker, job.request_kind())
        else {
            // Suppressed duplicate; account for it so the job can finish.
            request_finished(&*job);
            continue;
        };
        base.in_flight.lock().insert(worker.clone(), request_id.clone());
        let pooled = job.clone();
        base.controller.submit(move || {
            let outcome = pooled.execute_request(&worker, &tables);
            on_request_finish(&*pooled, &worker, &request_id, outcome);
        });
    }
    Ok(())
}

/// Fold one request outcome into the job result; finish when it was the last.
pub(crate) fn on_request_finish<J: SqlFanoutJob>(
    job: &J,
    worker: &str,
    request_id: &str,
    outcome: Result<SqlRequestSummary>,
) {
    let base = job.base();
    if base.core.is_finished() {
        return;
    }
    let state = match &outcome {
        Ok(_) => "SUCCESS",
        Err(_) => "FAILED",
    };
    base.controller.end_request(base.core.id(), worker, job.request_kind(), request_id, state);
    base.in_flight.lock().remove(worker);

    {
        let mut result = base.result.lock();
        match outcome {
            Ok(summary) => {
                result
                    .completed
                    .entry(worker.to_string())
                    .or_default()
                    .extend(summary.succeeded);
                if !summary.failed.is_empty() {
                    result
                        .failed
                        .entry(worker.to_string())
                        .or_default()
                        .extend(summary.failed);
                }
                if !summary.duplicate_keys.is_empty() {
                    result
                        .duplicate_keys
                        .entry(worker.to_string())
                        .or_default()
                        .extend(summary.duplicate_keys);
                }
                if !summary.rows.is_empty() {
                    result.rows.entry(worker.to_string()).or_default().extend(summary.rows);
                }
            }
            Err(e) => {
                error!(job_id = %base.core.id(), worker, error = %e, "worker request failed");
                result.worker_errors.insert(worker.to_string(), e.to_string());
            }
        }
    }
    request_finished(job);
}

fn request_finished<J: SqlFanoutJob>(job: &J) {
    let base = job.base();
    let all_done = {
        let mut outstanding = base.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        *outstanding == 0
    };
    if !all_done {
        return;
    }
    let extended = {
        let result = base.result.lock();
        if job.failures_are_fatal() && result.has_failures() {
            ExtendedState::Failed
        } else {
            ExtendedState::Success
        }
    };
    finish_fanout(job, extended);
}

pub(crate) fn finish_fanout<J: SqlFanoutJob>(job: &J, extended: ExtendedState) {
    let base = job.base();
    if !base.core.finish(extended) {
        return;
    }
    base.controller.persist_job(&base.core, job.extended_persistent_state());
    base.controller.log_event(
        "JOB_FINISHED",
        json!({
            "job": base.core.id(),
            "kind": base.core.kind(),
            "extended_state": extended.as_str(),
        }),
    );
}

/// Cooperative cancel shared by the SQL jobs: stop whatever is still running
/// on the workers, then finish with `extended`.
pub(crate) fn cancel_fanout<J: SqlFanoutJob>(job: &J, extended: ExtendedState) {
    let base = job.base();
    if !base.cancelled.raise() {
        return;
    }
    let in_flight: Vec<(String, String)> = base
        .in_flight
        .lock()
        .iter()
        .map(|(worker, request)| (worker.clone(), request.clone()))
        .collect();
    for (worker, request_id) in in_flight {
        if let Err(e) = base.controller.worker_service().stop_request(&worker, &request_id) {
            warn!(worker = %worker, error = %e, "stop request failed");
        }
    }
    finish_fanout(job, extended);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_tables_regular() {
        assert_eq!(worker_tables("Filter", false, &[100, 200], false), vec!["Filter"]);
    }

    #[test]
    fn test_worker_tables_partitioned_with_dummy() {
        let tables = worker_tables("Object", true, &[100, 200, 300], false);
        assert_eq!(
            tables,
            vec![
                "Object_100".to_string(),
                "Object_200".to_string(),
                "Object_300".to_string(),
                format!("Object_{}", DUMMY_CHUNK),
            ]
        );
    }

    #[test]
    fn test_worker_tables_with_overlap() {
        let tables = worker_tables("Object", true, &[100], true);
        assert_eq!(
            tables,
            vec![
                "Object_100".to_string(),
                format!("Object_{}", DUMMY_CHUNK),
                "ObjectFullOverlap_100".to_string(),
                format!("ObjectFullOverlap_{}", DUMMY_CHUNK),
            ]
        );
    }

    #[test]
    fn test_distribute_tables_batching() {
        let tables: Vec<String> = (0..4).map(|i| format!("t{}", i)).collect();
        let batches = distribute_tables(tables.clone(), 3);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 1);

        assert_eq!(distribute_tables(tables, 10).len(), 1);
        assert!(distribute_tables(Vec::new(), 3).is_empty());
    }

    #[test]
    fn test_index_map_aggregation() {
        let mut result = SqlJobResult::default();
        result.rows.insert(
            "w1".to_string(),
            vec![
                IndexRow {
                    table: "Object_100".to_string(),
                    key_name: "idx_radecl".to_string(),
                    column_name: "ra".to_string(),
                    seq_in_index: 1,
                    comment: "spatial lookup".to_string(),
                },
                IndexRow {
                    table: "Object_100".to_string(),
                    key_name: "idx_radecl".to_string(),
                    column_name: "decl".to_string(),
                    seq_in_index: 2,
                    comment: "spatial lookup".to_string(),
                },
            ],
        );
        let map = result.index_map();
        let info = &map["w1"]["Object_100"]["idx_radecl"];
        assert_eq!(info.columns["ra"], 1);
        assert_eq!(info.columns["decl"], 2);
        assert_eq!(info.comment, "spatial lookup");
    }
}
