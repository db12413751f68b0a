// Replica descriptors and replica difference analysis.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};

/// Status of one chunk replica on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    NotFound,
    Corrupt,
    Incomplete,
    Complete,
}

impl ReplicaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::NotFound => "NOT_FOUND",
            ReplicaStatus::Corrupt => "CORRUPT",
            ReplicaStatus::Incomplete => "INCOMPLETE",
            ReplicaStatus::Complete => "COMPLETE",
        }
    }
}

/// One file of a replica as observed on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Control sum; empty when it was not computed
    pub cs: String,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, mtime: i64, cs: impl Into<String>) -> Self {
        Self { name: name.into(), size, mtime, cs: cs.into() }
    }
}

/// A materialization of one chunk's files on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub worker: String,
    pub database: String,
    pub chunk: u32,
    pub status: ReplicaStatus,
    /// When this replica was last inspected, seconds since the epoch.
    /// The verification sweep pulls oldest-inspected replicas first.
    pub verify_time: i64,
    pub files: Vec<FileInfo>,
}

impl ReplicaInfo {
    pub fn new(
        worker: impl Into<String>,
        database: impl Into<String>,
        chunk: u32,
        status: ReplicaStatus,
    ) -> Self {
        Self {
            worker: worker.into(),
            database: database.into(),
            chunk,
            status,
            verify_time: 0,
            files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<FileInfo>) -> Self {
        self.files = files;
        self
    }

    pub fn file_info_map(&self) -> HashMap<&str, &FileInfo> {
        self.files.iter().map(|f| (f.name.as_str(), f)).collect()
    }
}

impl fmt::Display for ReplicaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{} [{}] {} file(s)",
            self.worker,
            self.database,
            self.chunk,
            self.status.as_str(),
            self.files.len()
        )
    }
}

/// Difference between two observations of the same (database, chunk) replica.
///
/// A dedicated type rather than an equality operator because callers inspect
/// which aspects disagree, not only whether they do.
#[derive(Debug, Clone)]
pub struct ReplicaDiff {
    replica1: ReplicaInfo,
    replica2: ReplicaInfo,
    not_equal: bool,
    status_mismatch: bool,
    num_files_mismatch: bool,
    file_names_mismatch: bool,
    file_size_mismatch: bool,
    file_cs_mismatch: bool,
    file_mtime_mismatch: bool,
}

impl ReplicaDiff {
    /// Compare the older observation `replica1` against the newer `replica2`.
    pub fn new(replica1: ReplicaInfo, replica2: ReplicaInfo) -> Result<Self> {
        if replica1.database != replica2.database || replica1.chunk != replica2.chunk {
            return Err(ShardError::InvalidInput(format!(
                "replica diff over incompatible replicas: {}:{} vs {}:{}",
                replica1.database, replica1.chunk, replica2.database, replica2.chunk
            )));
        }

        let status_mismatch = replica1.status != replica2.status;
        let num_files_mismatch = replica1.files.len() != replica2.files.len();

        let files1 = replica1.file_info_map();
        let files2 = replica2.file_info_map();

        let mut file_names_mismatch = false;
        let mut file_size_mismatch = false;
        let mut file_cs_mismatch = false;
        let mut file_mtime_mismatch = false;

        for (name, file1) in &files1 {
            let Some(file2) = files2.get(name) else {
                file_names_mismatch = true;
                continue;
            };
            file_size_mismatch = file_size_mismatch || file1.size != file2.size;
            // Control sums count only when both sides computed one.
            file_cs_mismatch = file_cs_mismatch
                || (!file1.cs.is_empty() && !file2.cs.is_empty() && file1.cs != file2.cs);
            file_mtime_mismatch = file_mtime_mismatch || file1.mtime != file2.mtime;
        }

        let not_equal = status_mismatch
            || num_files_mismatch
            || file_names_mismatch
            || file_size_mismatch
            || file_cs_mismatch
            || file_mtime_mismatch;

        Ok(Self {
            replica1,
            replica2,
            not_equal,
            status_mismatch,
            num_files_mismatch,
            file_names_mismatch,
            file_size_mismatch,
            file_cs_mismatch,
            file_mtime_mismatch,
        })
    }

    /// A diff exhibiting "no difference" behavior.
    pub fn equal(replica: ReplicaInfo) -> Self {
        Self {
            replica1: replica.clone(),
            replica2: replica,
            not_equal: false,
            status_mismatch: false,
            num_files_mismatch: false,
            file_names_mismatch: false,
            file_size_mismatch: false,
            file_cs_mismatch: false,
            file_mtime_mismatch: false,
        }
    }

    pub fn replica1(&self) -> &ReplicaInfo {
        &self.replica1
    }

    pub fn replica2(&self) -> &ReplicaInfo {
        &self.replica2
    }

    /// True when both observations refer to the same worker.
    pub fn is_self(&self) -> bool {
        self.replica1.worker == self.replica2.worker
    }

    /// True when any aspect differs.
    pub fn not_equal(&self) -> bool {
        self.not_equal
    }

    pub fn status_mismatch(&self) -> bool {
        self.status_mismatch
    }

    pub fn num_files_mismatch(&self) -> bool {
        self.num_files_mismatch
    }

    pub fn file_names_mismatch(&self) -> bool {
        self.file_names_mismatch
    }

    pub fn file_size_mismatch(&self) -> bool {
        self.file_size_mismatch
    }

    pub fn file_cs_mismatch(&self) -> bool {
        self.file_cs_mismatch
    }

    pub fn file_mtime_mismatch(&self) -> bool {
        self.file_mtime_mismatch
    }

    /// Compact representation of the failed tests.
    pub fn flags2string(&self) -> String {
        if !self.not_equal {
            return "EQUAL".to_string();
        }
        let mut flags = String::from("DIFF");
        if self.status_mismatch {
            flags.push_str(" status");
        }
        if self.num_files_mismatch {
            flags.push_str(" files");
        }
        if self.file_names_mismatch {
            flags.push_str(" name");
        }
        if self.file_size_mismatch {
            flags.push_str(" size");
        }
        if self.file_cs_mismatch {
            flags.push_str(" cs");
        }
        if self.file_mtime_mismatch {
            flags.push_str(" mtime");
        }
        flags
    }
}

impl fmt::Display for ReplicaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ReplicaDiff")?;
        for (tag, replica) in [("replica1", &self.replica1), ("replica2", &self.replica2)] {
            writeln!(f, "  <{}>", tag)?;
            writeln!(f, "    worker:   {}", replica.worker)?;
            writeln!(f, "    database: {}", replica.database)?;
            writeln!(f, "    chunk:    {}", replica.chunk)?;
            writeln!(f, "    status:   {}", replica.status.as_str())?;
        }
        writeln!(f, "  notEqual:            {}", self.not_equal)?;
        writeln!(f, "    statusMismatch:    {}", self.status_mismatch)?;
        writeln!(f, "    numFilesMismatch:  {}", self.num_files_mismatch)?;
        writeln!(f, "    fileNamesMismatch: {}", self.file_names_mismatch)?;
        writeln!(f, "    fileSizeMismatch:  {}", self.file_size_mismatch)?;
        writeln!(f, "    fileCsMismatch:    {}", self.file_cs_mismatch)?;
        write!(f, "    fileMtimeMismatch: {}", self.file_mtime_mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(worker: &str) -> ReplicaInfo {
        ReplicaInfo::new(worker, "Obj", 100, ReplicaStatus::Complete).with_files(vec![
            FileInfo::new("chunk_100.data", 1000, 42, "abc123"),
            FileInfo::new("chunk_100.index", 64, 42, ""),
        ])
    }

    #[test]
    fn test_identical_replicas_are_equal() {
        let diff = ReplicaDiff::new(replica("w1"), replica("w1")).unwrap();
        assert!(!diff.not_equal());
        assert_eq!(diff.flags2string(), "EQUAL");
        assert!(diff.is_self());
    }

    #[test]
    fn test_file_size_mismatch_flagged() {
        let mut newer = replica("w1");
        newer.files[0].size = 1001;
        let diff = ReplicaDiff::new(replica("w1"), newer).unwrap();
        assert!(diff.not_equal());
        assert!(diff.file_size_mismatch());
        assert!(!diff.file_mtime_mismatch());
        assert!(diff.flags2string().starts_with("DIFF"));
        assert!(diff.flags2string().contains("size"));
    }

    #[test]
    fn test_missing_checksum_not_compared() {
        let mut older = replica("w1");
        older.files[0].cs.clear();
        let mut newer = replica("w1");
        newer.files[0].cs = "different".to_string();
        let diff = ReplicaDiff::new(older, newer).unwrap();
        assert!(!diff.file_cs_mismatch());
    }

    #[test]
    fn test_checksum_mismatch_when_both_present() {
        let mut newer = replica("w1");
        newer.files[0].cs = "zzz999".to_string();
        let diff = ReplicaDiff::new(replica("w1"), newer).unwrap();
        assert!(diff.file_cs_mismatch());
        assert_eq!(diff.flags2string(), "DIFF cs");
    }

    #[test]
    fn test_peer_diff_is_not_self() {
        let diff = ReplicaDiff::new(replica("w1"), replica("w2")).unwrap();
        assert!(!diff.is_self());
        assert!(!diff.not_equal());
    }

    #[test]
    fn test_incompatible_replicas_rejected() {
        let mut other = replica("w1");
        other.chunk = 200;
        assert!(ReplicaDiff::new(replica("w1"), other).is_err());
    }

    #[test]
    fn test_missing_file_flags_names() {
        let mut newer = replica("w1");
        newer.files.pop();
        let diff = ReplicaDiff::new(replica("w1"), newer).unwrap();
        assert!(diff.num_files_mismatch());
        assert!(diff.file_names_mismatch());
    }
}
