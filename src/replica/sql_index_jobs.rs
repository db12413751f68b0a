// Fleet-wide index DDL jobs: create, drop, and retrieve table indexes.

use std::sync::Arc;

use crate::error::Result;
use crate::replica::controller::Controller;
use crate::replica::job::{ExtendedState, Job, JobCore, JobOptions};
use crate::replica::sql_job::{
    cancel_fanout, start_fanout, IndexMap, SqlFanoutJob, SqlJobBase, SqlJobResult,
};
use crate::replica::worker::{IndexSpec, SqlIndexColumn, SqlRequestSummary};

fn bool2str(value: bool) -> String {
    if value { "1".to_string() } else { "0".to_string() }
}

/// Broadcasts batched index-creation requests to the worker fleet.
///
/// For a regular table the index is created on the base table at every
/// worker; for a partitioned table on every chunk table (plus the dummy
/// chunk) and, when `overlap` is set, the overlap tables too.
pub struct SqlCreateIndexesJob {
    base: SqlJobBase,
    index_spec: IndexSpec,
    index_name: String,
    index_comment: String,
    index_columns: Vec<SqlIndexColumn>,
    ignore_duplicate_key: bool,
}

impl SqlCreateIndexesJob {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        database: impl Into<String>,
        table: impl Into<String>,
        overlap: bool,
        index_spec: IndexSpec,
        index_name: impl Into<String>,
        index_comment: impl Into<String>,
        index_columns: Vec<SqlIndexColumn>,
        ignore_duplicate_key: bool,
        all_workers: bool,
        controller: Arc<Controller>,
        parent_id: impl Into<String>,
        options: JobOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: SqlJobBase::new(
                "SQL_CREATE_TABLE_INDEXES",
                controller,
                database,
                table,
                overlap,
                all_workers,
                parent_id,
                options,
            ),
            index_spec,
            index_name: index_name.into(),
            index_comment: index_comment.into(),
            index_columns,
            ignore_duplicate_key,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn result(&self) -> SqlJobResult {
        self.base.result()
    }
}

impl SqlFanoutJob for SqlCreateIndexesJob {
    fn base(&self) -> &SqlJobBase {
        &self.base
    }

    fn request_kind(&self) -> &'static str {
        "SQL_CREATE_TABLE_INDEXES"
    }

    fn execute_request(&self, worker: &str, tables: &[String]) -> Result<SqlRequestSummary> {
        self.base.controller.worker_service().sql_create_indexes(
            worker,
            &self.base.database,
            tables,
            self.index_spec,
            &self.index_name,
            &self.index_comment,
            &self.index_columns,
            self.ignore_duplicate_key,
        )
    }
}

impl Job for SqlCreateIndexesJob {
    fn core(&self) -> &JobCore {
        &self.base.core
    }

    fn start(self: Arc<Self>) -> Result<()> {
        start_fanout(self)
    }

    fn cancel_with(&self, extended: ExtendedState) {
        cancel_fanout(self, extended);
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![
            ("database".to_string(), self.base.database.clone()),
            ("table".to_string(), self.base.table.clone()),
            ("overlap".to_string(), bool2str(self.base.overlap)),
            ("index_spec".to_string(), self.index_spec.as_str().to_string()),
            ("index_name".to_string(), self.index_name.clone()),
            ("index_comment".to_string(), self.index_comment.clone()),
            ("index_num_columns".to_string(), self.index_columns.len().to_string()),
            ("ignore_duplicate_key".to_string(), bool2str(self.ignore_duplicate_key)),
            ("all_workers".to_string(), bool2str(self.base.all_workers)),
        ]
    }
}

/// Broadcasts batched index-deletion requests to the worker fleet.
pub struct SqlDropIndexesJob {
    base: SqlJobBase,
    index_name: String,
}

impl SqlDropIndexesJob {
    pub fn create(
        database: impl Into<String>,
        table: impl Into<String>,
        overlap: bool,
        index_name: impl Into<String>,
        all_workers: bool,
        controller: Arc<Controller>,
        parent_id: impl Into<String>,
        options: JobOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: SqlJobBase::new(
                "SQL_DROP_TABLE_INDEXES",
                controller,
                database,
                table,
                overlap,
                all_workers,
                parent_id,
                options,
            ),
            index_name: index_name.into(),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn result(&self) -> SqlJobResult {
        self.base.result()
    }
}

impl SqlFanoutJob for SqlDropIndexesJob {
    fn base(&self) -> &SqlJobBase {
        &self.base
    }

    fn request_kind(&self) -> &'static str {
        "SQL_DROP_TABLE_INDEXES"
    }

    fn execute_request(&self, worker: &str, tables: &[String]) -> Result<SqlRequestSummary> {
        self.base.controller.worker_service().sql_drop_indexes(
            worker,
            &self.base.database,
            tables,
            &self.index_name,
        )
    }
}

impl Job for SqlDropIndexesJob {
    fn core(&self) -> &JobCore {
        &self.base.core
    }

    fn start(self: Arc<Self>) -> Result<()> {
        start_fanout(self)
    }

    fn cancel_with(&self, extended: ExtendedState) {
        cancel_fanout(self, extended);
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![
            ("database".to_string(), self.base.database.clone()),
            ("table".to_string(), self.base.table.clone()),
            ("overlap".to_string(), bool2str(self.base.overlap)),
            ("index_name".to_string(), self.index_name.clone()),
            ("all_workers".to_string(), bool2str(self.base.all_workers)),
        ]
    }
}

/// Collects `SHOW INDEXES`-shaped rows from the worker fleet and aggregates
/// them by worker, table, and index. Per-worker partial failures are
/// reported in the result but do not fail the job.
pub struct SqlGetIndexesJob {
    base: SqlJobBase,
}

impl SqlGetIndexesJob {
    pub fn create(
        database: impl Into<String>,
        table: impl Into<String>,
        overlap: bool,
        all_workers: bool,
        controller: Arc<Controller>,
        parent_id: impl Into<String>,
        options: JobOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: SqlJobBase::new(
                "SQL_GET_TABLE_INDEXES",
                controller,
                database,
                table,
                overlap,
                all_workers,
                parent_id,
                options,
            ),
        })
    }

    pub fn result(&self) -> SqlJobResult {
        self.base.result()
    }

    /// worker -> table -> index name -> definition
    pub fn indexes(&self) -> IndexMap {
        self.base.result().index_map()
    }
}

impl SqlFanoutJob for SqlGetIndexesJob {
    fn base(&self) -> &SqlJobBase {
        &self.base
    }

    fn request_kind(&self) -> &'static str {
        "SQL_GET_TABLE_INDEXES"
    }

    fn execute_request(&self, worker: &str, tables: &[String]) -> Result<SqlRequestSummary> {
        self.base.controller.worker_service().sql_get_indexes(worker, &self.base.database, tables)
    }

    fn failures_are_fatal(&self) -> bool {
        false
    }
}

impl Job for SqlGetIndexesJob {
    fn core(&self) -> &JobCore {
        &self.base.core
    }

    fn start(self: Arc<Self>) -> Result<()> {
        start_fanout(self)
    }

    fn cancel_with(&self, extended: ExtendedState) {
        cancel_fanout(self, extended);
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![
            ("database".to_string(), self.base.database.clone()),
            ("table".to_string(), self.base.table.clone()),
            ("overlap".to_string(), bool2str(self.base.overlap)),
            ("all_workers".to_string(), bool2str(self.base.all_workers)),
        ]
    }
}
