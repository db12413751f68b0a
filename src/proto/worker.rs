// Czar/worker message bodies.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::proto::header::ProtoHeader;

/// One per-chunk task payload presented to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMsg {
    pub session: u64,
    pub chunk_id: u32,
    pub db: String,
    /// Per-chunk SQL fragments to execute, in order.
    pub fragments: Vec<String>,
}

impl TaskMsg {
    pub fn new(session: u64, chunk_id: u32, db: impl Into<String>, fragments: Vec<String>) -> Self {
        Self { session, chunk_id, db: db.into(), fragments }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ShardError::Serialization(e.to_string()))
    }

    pub fn parse(bytes: &[u8]) -> Result<TaskMsg> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ShardError::Serialization(e.to_string()))?;
        Ok(msg)
    }

    /// MD5 digest of the serialized message; stable across
    /// serialize/parse cycles.
    pub fn digest(&self) -> Result<[u8; 16]> {
        let bytes = self.serialize()?;
        let mut hasher = Md5::new();
        hasher.update(&bytes);
        Ok(hasher.finalize().into())
    }
}

/// Schema of one result column as advertised by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// SQL column type, e.g. `VARCHAR(32)` or `DOUBLE`
    pub sql_type: String,
    pub has_default: bool,
    pub default_value: String,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self { name: name.into(), sql_type: sql_type.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    pub columns: Vec<ColumnSchema>,
}

/// One result row. `None` cells are SQL NULL; others carry raw column bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBundle {
    pub cells: Vec<Option<Vec<u8>>>,
}

impl RowBundle {
    pub fn of(cells: Vec<Option<&[u8]>>) -> Self {
        Self { cells: cells.into_iter().map(|c| c.map(|b| b.to_vec())).collect() }
    }
}

/// Body of one response fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
    pub session: u64,
    /// Present on the first fragment of a response only.
    pub schema: Option<RowSchema>,
    pub rows: Vec<RowBundle>,
}

impl ResponseData {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ShardError::Serialization(e.to_string()))
    }

    pub fn parse(bytes: &[u8]) -> Result<ResponseData> {
        let (data, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ShardError::Serialization(e.to_string()))?;
        Ok(data)
    }
}

/// A fully decoded response fragment: wire header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponse {
    pub header: ProtoHeader,
    pub data: ResponseData,
}

impl WorkerResponse {
    pub fn new(header: ProtoHeader, data: ResponseData) -> Self {
        Self { header, data }
    }

    /// Wrap `data` under a freshly computed header, as a worker would frame
    /// it on the wire.
    pub fn for_data(data: ResponseData) -> Result<Self> {
        let body = data.serialize()?;
        Ok(Self { header: ProtoHeader::for_body(&body), data })
    }

    /// True when the fragment carries neither schema nor rows.
    pub fn is_empty(&self) -> bool {
        self.data.schema.is_none() && self.data.rows.is_empty()
    }
}
