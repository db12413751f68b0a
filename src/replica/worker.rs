// Per-worker RPC surface of the control plane, plus a scriptable mock
// implementation backed by the in-memory replica catalog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::replica::database::DatabaseServices;
use crate::replica::info::ReplicaInfo;

/// Index flavor for index-creation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSpec {
    Default,
    Unique,
    Fulltext,
    Spatial,
}

impl IndexSpec {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexSpec::Default => "DEFAULT",
            IndexSpec::Unique => "UNIQUE",
            IndexSpec::Fulltext => "FULLTEXT",
            IndexSpec::Spatial => "SPATIAL",
        }
    }

    pub fn from_str(text: &str) -> Result<Self> {
        match text {
            "DEFAULT" => Ok(IndexSpec::Default),
            "UNIQUE" => Ok(IndexSpec::Unique),
            "FULLTEXT" => Ok(IndexSpec::Fulltext),
            "SPATIAL" => Ok(IndexSpec::Spatial),
            other => Err(ShardError::InvalidInput(format!("unknown index spec: {}", other))),
        }
    }
}

/// One column of an index definition, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlIndexColumn {
    pub name: String,
    /// Prefix length for string columns; zero indexes the full value
    pub length: usize,
    pub ascending: bool,
}

impl SqlIndexColumn {
    pub fn new(name: impl Into<String>, length: usize, ascending: bool) -> Self {
        Self { name: name.into(), length, ascending }
    }
}

/// One row of a `SHOW INDEXES`-shaped result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub table: String,
    pub key_name: String,
    pub column_name: String,
    pub seq_in_index: u32,
    pub comment: String,
}

/// Per-request outcome of a batched SQL operation at one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlRequestSummary {
    pub succeeded: Vec<String>,
    /// `(table, error)` pairs for tables the worker could not process
    pub failed: Vec<(String, String)>,
    /// Tables rejected with a duplicate-key error; non-fatal when the
    /// caller opted into ignoring them
    pub duplicate_keys: Vec<String>,
    pub rows: Vec<IndexRow>,
}

/// Chunk-list verbs addressed to one worker service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    ReloadChunkList,
    AddChunkGroup { chunk: u32, databases: Vec<String> },
    RemoveChunkGroup { chunk: u32, databases: Vec<String>, force: bool },
    TestEcho { data: String },
}

impl WorkerCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            WorkerCommand::ReloadChunkList => "RELOAD_CHUNK_LIST",
            WorkerCommand::AddChunkGroup { .. } => "ADD_CHUNK_GROUP",
            WorkerCommand::RemoveChunkGroup { .. } => "REMOVE_CHUNK_GROUP",
            WorkerCommand::TestEcho { .. } => "TEST_ECHO",
        }
    }
}

/// Worker response to a [`WorkerCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommandOutcome {
    /// Chunk list changes: `(database, chunk)` pairs added and removed
    ChunkList { added: Vec<(String, u32)>, removed: Vec<(String, u32)> },
    Echo { data: String },
    Ack,
}

/// RPC surface of one worker as used by jobs. Implementations wrap the real
/// worker protocol; the mock below serves tests and dry runs.
pub trait WorkerService: Send + Sync {
    /// Inspect one replica, optionally recomputing file control sums.
    fn find_replica(
        &self,
        worker: &str,
        database: &str,
        chunk: u32,
        compute_check_sum: bool,
    ) -> Result<ReplicaInfo>;

    fn sql_create_indexes(
        &self,
        worker: &str,
        database: &str,
        tables: &[String],
        spec: IndexSpec,
        index_name: &str,
        comment: &str,
        columns: &[SqlIndexColumn],
        ignore_duplicate_key: bool,
    ) -> Result<SqlRequestSummary>;

    fn sql_drop_indexes(
        &self,
        worker: &str,
        database: &str,
        tables: &[String],
        index_name: &str,
    ) -> Result<SqlRequestSummary>;

    fn sql_get_indexes(
        &self,
        worker: &str,
        database: &str,
        tables: &[String],
    ) -> Result<SqlRequestSummary>;

    /// Move one chunk replica between workers.
    fn move_chunk(
        &self,
        source_worker: &str,
        destination_worker: &str,
        database: &str,
        chunk: u32,
    ) -> Result<()>;

    /// Chunk-list notification verbs.
    fn notify(&self, worker: &str, command: &WorkerCommand) -> Result<WorkerCommandOutcome>;

    /// Ask a worker to abandon an in-flight request. Fire-and-forget.
    fn stop_request(&self, worker: &str, request_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MockWorkerState {
    /// worker -> table -> index name -> rows
    indexes: HashMap<String, HashMap<String, HashMap<String, Vec<IndexRow>>>>,
    /// Replica observations reported instead of the catalog state
    observations: HashMap<(String, String, u32), ReplicaInfo>,
    stopped_requests: Vec<(String, String)>,
    notified: Vec<(String, String)>,
}

/// In-process [`WorkerService`] over the in-memory replica catalog.
pub struct MockWorkerService {
    database: Arc<dyn DatabaseServices>,
    state: Mutex<MockWorkerState>,
    /// Workers that fail every request, for error-path tests
    pub broken_workers: Mutex<HashSet<String>>,
}

impl MockWorkerService {
    pub fn new(database: Arc<dyn DatabaseServices>) -> Self {
        Self {
            database,
            state: Mutex::new(MockWorkerState::default()),
            broken_workers: Mutex::new(HashSet::new()),
        }
    }

    fn check_worker(&self, worker: &str) -> Result<()> {
        if self.broken_workers.lock().contains(worker) {
            return Err(ShardError::Worker(format!("worker {} unreachable", worker)));
        }
        Ok(())
    }

    pub fn stopped_requests(&self) -> Vec<(String, String)> {
        self.state.lock().stopped_requests.clone()
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.state.lock().notified.clone()
    }

    /// Script what `find_replica` reports for one replica, overriding the
    /// catalog state.
    pub fn observe(&self, replica: ReplicaInfo) {
        let key = (replica.worker.clone(), replica.database.clone(), replica.chunk);
        self.state.lock().observations.insert(key, replica);
    }

    /// Tables of `worker` carrying `index_name`.
    pub fn indexed_tables(&self, worker: &str, index_name: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut tables: Vec<String> = state
            .indexes
            .get(worker)
            .map(|tables| {
                tables
                    .iter()
                    .filter(|(_, indexes)| indexes.contains_key(index_name))
                    .map(|(table, _)| table.clone())
                    .collect()
            })
            .unwrap_or_default();
        tables.sort();
        tables
    }
}

impl WorkerService for MockWorkerService {
    fn find_replica(
        &self,
        worker: &str,
        database: &str,
        chunk: u32,
        compute_check_sum: bool,
    ) -> Result<ReplicaInfo> {
        self.check_worker(worker)?;
        let observed = self
            .state
            .lock()
            .observations
            .get(&(worker.to_string(), database.to_string(), chunk))
            .cloned();
        let mut replica = match observed {
            Some(replica) => replica,
            None => self
                .database
                .find_replicas(database, chunk)?
                .into_iter()
                .find(|r| r.worker == worker)
                .ok_or_else(|| ShardError::NotFound(format!("{}:{}/{}", worker, database, chunk)))?,
        };
        if !compute_check_sum {
            for file in &mut replica.files {
                file.cs.clear();
            }
        }
        Ok(replica)
    }

    fn sql_create_indexes(
        &self,
        worker: &str,
        database: &str,
        tables: &[String],
        _spec: IndexSpec,
        index_name: &str,
        comment: &str,
        columns: &[SqlIndexColumn],
        ignore_duplicate_key: bool,
    ) -> Result<SqlRequestSummary> {
        self.check_worker(worker)?;
        let mut summary = SqlRequestSummary::default();
        let mut state = self.state.lock();
        let worker_indexes = state.indexes.entry(worker.to_string()).or_default();
        for table in tables {
            let table_indexes = worker_indexes.entry(table.clone()).or_default();
            if table_indexes.contains_key(index_name) {
                if ignore_duplicate_key {
                    summary.duplicate_keys.push(table.clone());
                } else {
                    summary
                        .failed
                        .push((table.clone(), format!("duplicate key name '{}'", index_name)));
                }
                continue;
            }
            let rows: Vec<IndexRow> = columns
                .iter()
                .enumerate()
                .map(|(i, column)| IndexRow {
                    table: format!("{}.{}", database, table),
                    key_name: index_name.to_string(),
                    column_name: column.name.clone(),
                    seq_in_index: i as u32 + 1,
                    comment: comment.to_string(),
                })
                .collect();
            table_indexes.insert(index_name.to_string(), rows);
            summary.succeeded.push(table.clone());
        }
        Ok(summary)
    }

    fn sql_drop_indexes(
        &self,
        worker: &str,
        database: &str,
        tables: &[String],
        index_name: &str,
    ) -> Result<SqlRequestSummary> {
        self.check_worker(worker)?;
        let _ = database;
        let mut summary = SqlRequestSummary::default();
        let mut state = self.state.lock();
        let worker_indexes = state.indexes.entry(worker.to_string()).or_default();
        for table in tables {
            let dropped = worker_indexes
                .get_mut(table)
                .map(|indexes| indexes.remove(index_name).is_some())
                .unwrap_or(false);
            if dropped {
                summary.succeeded.push(table.clone());
            } else {
                summary.failed.push((table.clone(), format!("no index '{}'", index_name)));
            }
        }
        Ok(summary)
    }

    fn sql_get_indexes(
        &self,
        worker: &str,
        database: &str,
        tables: &[String],
    ) -> Result<SqlRequestSummary> {
        self.check_worker(worker)?;
        let _ = database;
        let mut summary = SqlRequestSummary::default();
        let state = self.state.lock();
        for table in tables {
            summary.succeeded.push(table.clone());
            let Some(indexes) = state.indexes.get(worker).and_then(|t| t.get(table)) else {
                continue;
            };
            for rows in indexes.values() {
                summary.rows.extend(rows.iter().cloned());
            }
        }
        Ok(summary)
    }

    fn move_chunk(
        &self,
        source_worker: &str,
        destination_worker: &str,
        database: &str,
        chunk: u32,
    ) -> Result<()> {
        self.check_worker(source_worker)?;
        self.check_worker(destination_worker)?;
        let replica = self.find_replica(source_worker, database, chunk, true)?;
        let mut moved = replica;
        moved.worker = destination_worker.to_string();
        self.database.save_replica(&moved)?;
        self.database.remove_replica(source_worker, database, chunk)
    }

    fn notify(&self, worker: &str, command: &WorkerCommand) -> Result<WorkerCommandOutcome> {
        self.check_worker(worker)?;
        self.state.lock().notified.push((worker.to_string(), command.verb().to_string()));
        match command {
            WorkerCommand::ReloadChunkList => Ok(WorkerCommandOutcome::ChunkList {
                added: Vec::new(),
                removed: Vec::new(),
            }),
            WorkerCommand::AddChunkGroup { chunk, databases } => {
                Ok(WorkerCommandOutcome::ChunkList {
                    added: databases.iter().map(|db| (db.clone(), *chunk)).collect(),
                    removed: Vec::new(),
                })
            }
            WorkerCommand::RemoveChunkGroup { chunk, databases, .. } => {
                Ok(WorkerCommandOutcome::ChunkList {
                    added: Vec::new(),
                    removed: databases.iter().map(|db| (db.clone(), *chunk)).collect(),
                })
            }
            WorkerCommand::TestEcho { data } => {
                Ok(WorkerCommandOutcome::Echo { data: data.clone() })
            }
        }
    }

    fn stop_request(&self, worker: &str, request_id: &str) -> Result<()> {
        self.state
            .lock()
            .stopped_requests
            .push((worker.to_string(), request_id.to_string()));
        Ok(())
    }
}
