// Streaming merge of response fragments into a local result table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{ErrorReport, ErrorValue, Result, ShardError};
use crate::merge::row_buffer::{unescape_bytes, ProtoRowBuffer, COL_SEP, NULL_TOKEN, ROW_SEP};
use crate::proto::worker::{ResponseData, WorkerResponse};

/// One column of the result table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self { name: name.into(), sql_type: sql_type.into() }
    }
}

/// The slice of a MySQL session the merger depends on: table creation from a
/// schema and bulk loading from an in-process virtual file. The real
/// connector lives outside this crate.
pub trait LocalInfileSink: Send {
    /// Create `table` if missing, or verify that the existing definition
    /// matches `columns`.
    fn create_or_verify(&mut self, table: &str, columns: &[ColumnDef]) -> Result<()>;

    /// Load bulk-format bytes into `table`. Returns the number of bytes
    /// consumed; a negative value signals a connector-level invariant
    /// violation and fails the whole query.
    fn load_infile(&mut self, table: &str, csv: &[u8]) -> i64;
}

/// Streams decoded response fragments into the user query's result table.
///
/// The schema is fixed by the first fragment; the merger becomes `dirty` on
/// the first byte the session accepts, after which the owning pipeline can no
/// longer be reset for a retry.
pub struct InfileMerger {
    sink: Mutex<Box<dyn LocalInfileSink>>,
    table: String,
    job_id_sql_type: String,
    schema: Mutex<Option<Vec<ColumnDef>>>,
    staging: Mutex<BytesMut>,
    dirty: AtomicBool,
    rows_merged: AtomicU64,
    error: ErrorReport,
}

impl InfileMerger {
    pub fn new(
        sink: Box<dyn LocalInfileSink>,
        table: impl Into<String>,
        job_id_sql_type: impl Into<String>,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            table: table.into(),
            job_id_sql_type: job_id_sql_type.into(),
            schema: Mutex::new(None),
            staging: Mutex::new(BytesMut::new()),
            dirty: AtomicBool::new(false),
            rows_merged: AtomicU64::new(0),
            error: ErrorReport::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// True once any bytes have been accepted by the session.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Rows handed to the session so far. A failed query reports this so
    /// callers can tell "no rows" from "partial, then failed".
    pub fn rows_merged(&self) -> u64 {
        self.rows_merged.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> ErrorValue {
        self.error.get()
    }

    /// Merge one decoded fragment. The first fragment must carry the result
    /// schema; any later fragment that advertises a different schema fails
    /// the whole query.
    pub fn merge(&self, job_id: i64, attempt: u32, response: &WorkerResponse) -> Result<()> {
        let data = &response.data;
        self.prepare_schema(data)?;
        if data.rows.is_empty() {
            return Ok(());
        }

        let mut row_buffer = ProtoRowBuffer::new(data, job_id, attempt);
        let mut staging = self.staging.lock();
        staging.extend_from_slice(&row_buffer.read_all());

        let mut sink = self.sink.lock();
        while !staging.is_empty() {
            let consumed = sink.load_infile(&self.table, &staging[..]);
            if consumed < 0 {
                let msg = format!("bulk loader returned impossible value {}", consumed);
                error!(table = %self.table, "{}", msg);
                self.error.set(consumed as i32, msg.clone());
                return Err(ShardError::Merge(msg));
            }
            let consumed = consumed as usize;
            if consumed > staging.len() {
                let msg = "bulk loader consumed more than offered".to_string();
                self.error.set(-1, msg.clone());
                return Err(ShardError::Merge(msg));
            }
            if consumed == 0 {
                // Nothing fit; leave the remainder staged for the next fragment.
                debug!(table = %self.table, staged = staging.len(), "merge deferred");
                break;
            }
            self.dirty.store(true, Ordering::SeqCst);
            staging.advance(consumed);
        }
        self.rows_merged.fetch_add(data.rows.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn prepare_schema(&self, data: &ResponseData) -> Result<()> {
        let mut schema_guard = self.schema.lock();
        if let Some(advertised) = &data.schema {
            let received: Vec<ColumnDef> = advertised
                .columns
                .iter()
                .map(|c| ColumnDef::new(c.name.clone(), c.sql_type.clone()))
                .collect();
            if let Some(stored) = &*schema_guard {
                let expected: Vec<ColumnDef> = stored.iter().skip(2).cloned().collect();
                if expected != received {
                    let msg = format!("schema drift on table {}", self.table);
                    self.error.set(-1, msg.clone());
                    return Err(ShardError::Merge(msg));
                }
                return Ok(());
            }
            let mut columns = vec![
                ColumnDef::new("jobId", self.job_id_sql_type.clone()),
                ColumnDef::new("attempt", "SMALLINT"),
            ];
            columns.extend(received);
            self.sink.lock().create_or_verify(&self.table, &columns)?;
            *schema_guard = Some(columns);
            return Ok(());
        }
        if schema_guard.is_none() && !data.rows.is_empty() {
            let msg = "rows received before any schema fragment".to_string();
            self.error.set(-1, msg.clone());
            return Err(ShardError::Merge(msg));
        }
        Ok(())
    }
}

/// In-memory MySQL-shaped sink used by tests and dry-run tooling. Parses the
/// bulk format back into cells, which keeps the encoder honest.
#[derive(Debug, Default)]
pub struct MemoryInfileSink {
    pub tables: HashMap<String, MemoryTable>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryTable {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl MemoryInfileSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_cell(cell: &[u8]) -> Result<Option<Vec<u8>>> {
        if cell == NULL_TOKEN {
            return Ok(None);
        }
        if cell.len() < 2 || cell[0] != b'\'' || cell[cell.len() - 1] != b'\'' {
            return Err(ShardError::Merge(format!(
                "unquoted cell in bulk stream: {:?}",
                String::from_utf8_lossy(cell)
            )));
        }
        unescape_bytes(&cell[1..cell.len() - 1]).map(Some)
    }
}

impl LocalInfileSink for MemoryInfileSink {
    fn create_or_verify(&mut self, table: &str, columns: &[ColumnDef]) -> Result<()> {
        match self.tables.get(table) {
            None => {
                self.tables.insert(
                    table.to_string(),
                    MemoryTable { columns: columns.to_vec(), rows: Vec::new() },
                );
                Ok(())
            }
            Some(existing) if existing.columns == columns => Ok(()),
            Some(_) => Err(ShardError::AlreadyExists(format!(
                "table {} exists with a different definition",
                table
            ))),
        }
    }

    fn load_infile(&mut self, table: &str, csv: &[u8]) -> i64 {
        let Some(entry) = self.tables.get_mut(table) else {
            return -1;
        };
        for line in csv.split(|&b| b == ROW_SEP) {
            if line.is_empty() {
                continue;
            }
            let mut row = Vec::new();
            for cell in line.split(|&b| b == COL_SEP) {
                match Self::parse_cell(cell) {
                    Ok(value) => row.push(value),
                    Err(_) => return -1,
                }
            }
            if row.len() != entry.columns.len() {
                return -1;
            }
            entry.rows.push(row);
        }
        csv.len() as i64
    }
}

/// A shareable handle: the merger owns one clone while tests or tooling keep
/// another to inspect the loaded tables.
impl LocalInfileSink for Arc<Mutex<MemoryInfileSink>> {
    fn create_or_verify(&mut self, table: &str, columns: &[ColumnDef]) -> Result<()> {
        self.lock().create_or_verify(table, columns)
    }

    fn load_infile(&mut self, table: &str, csv: &[u8]) -> i64 {
        self.lock().load_infile(table, csv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::worker::{ColumnSchema, ResponseData, RowBundle, RowSchema};

    fn schema() -> RowSchema {
        RowSchema {
            columns: vec![
                ColumnSchema::new("name", "VARCHAR(8)"),
                ColumnSchema::new("count", "INT"),
            ],
        }
    }

    fn first_fragment() -> WorkerResponse {
        WorkerResponse::for_data(ResponseData {
            session: 1,
            schema: Some(schema()),
            rows: vec![RowBundle::of(vec![Some(b"a"), Some(b"42")])],
        })
        .unwrap()
    }

    fn merger() -> (InfileMerger, Arc<Mutex<MemoryInfileSink>>) {
        let sink = Arc::new(Mutex::new(MemoryInfileSink::new()));
        (InfileMerger::new(Box::new(sink.clone()), "result_314", "INT(9)"), sink)
    }

    #[test]
    fn test_first_fragment_creates_table_with_provenance() {
        let (merger, sink) = merger();
        merger.merge(1, 1, &first_fragment()).unwrap();
        assert!(merger.is_dirty());

        let sink = sink.lock();
        let table = &sink.tables["result_314"];
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["jobId", "attempt", "name", "count"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(
            table.rows[0],
            vec![
                Some(b"1".to_vec()),
                Some(b"1".to_vec()),
                Some(b"a".to_vec()),
                Some(b"42".to_vec())
            ]
        );
    }

    #[test]
    fn test_schema_drift_is_fatal() {
        let (merger, _sink) = merger();
        merger.merge(1, 1, &first_fragment()).unwrap();

        let drifted = WorkerResponse::for_data(ResponseData {
            session: 1,
            schema: Some(RowSchema { columns: vec![ColumnSchema::new("other", "INT")] }),
            rows: vec![RowBundle::of(vec![Some(b"1")])],
        })
        .unwrap();
        assert!(merger.merge(1, 1, &drifted).is_err());
        assert!(merger.error().is_set());
    }

    #[test]
    fn test_rows_without_schema_rejected() {
        let (merger, _sink) = merger();
        let fragment = WorkerResponse::for_data(ResponseData {
            session: 1,
            schema: None,
            rows: vec![RowBundle::of(vec![Some(b"a")])],
        })
        .unwrap();
        assert!(merger.merge(1, 1, &fragment).is_err());
        assert!(!merger.is_dirty());
    }

    #[test]
    fn test_schema_only_fragment_creates_empty_table() {
        let (merger, sink) = merger();
        let fragment =
            WorkerResponse::for_data(ResponseData { session: 1, schema: Some(schema()), rows: vec![] })
                .unwrap();
        merger.merge(1, 1, &fragment).unwrap();
        assert!(!merger.is_dirty());
        assert!(sink.lock().tables["result_314"].rows.is_empty());
    }

    #[test]
    fn test_null_cells_survive_merge() {
        let (merger, sink) = merger();
        let fragment = WorkerResponse::for_data(ResponseData {
            session: 1,
            schema: Some(schema()),
            rows: vec![RowBundle::of(vec![None, Some(b"0")])],
        })
        .unwrap();
        merger.merge(3, 2, &fragment).unwrap();
        let sink = sink.lock();
        let rows = &sink.tables["result_314"].rows;
        assert_eq!(rows[0][2], None);
        assert_eq!(rows[0][3], Some(b"0".to_vec()));
    }

    #[test]
    fn test_second_fragment_appends_rows() {
        let (merger, sink) = merger();
        merger.merge(1, 1, &first_fragment()).unwrap();
        let follow_up = WorkerResponse::for_data(ResponseData {
            session: 1,
            schema: None,
            rows: vec![RowBundle::of(vec![Some(b"b"), Some(b"43")])],
        })
        .unwrap();
        merger.merge(1, 1, &follow_up).unwrap();
        assert_eq!(sink.lock().tables["result_314"].rows.len(), 2);
    }
}
