// Persistence interface of the control plane and its in-memory stand-in.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ShardError};
use crate::replica::info::ReplicaInfo;

/// Persisted row describing a controller instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub host: String,
}

/// Persisted row describing a job and its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub parent_id: String,
    pub kind: String,
    pub state: String,
    pub extended_state: String,
    pub priority: i32,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Job-specific `(name, value)` parameter pairs
    pub parameters: Vec<(String, String)>,
}

/// Persisted row describing one worker request issued by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub job_id: String,
    pub worker: String,
    pub state: String,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// One structured event emitted for operational tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub controller_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

/// Database-backed state shared by controllers: the replica catalog and the
/// controller/job/request/event log tables.
pub trait DatabaseServices: Send + Sync {
    /// Replicas ordered by oldest inspection time first.
    fn find_oldest_replicas(&self, max_replicas: usize) -> Result<Vec<ReplicaInfo>>;

    /// Every replica of one (database, chunk) pair.
    fn find_replicas(&self, database: &str, chunk: u32) -> Result<Vec<ReplicaInfo>>;

    /// Every replica a worker holds for one database.
    fn find_worker_replicas(&self, worker: &str, database: &str) -> Result<Vec<ReplicaInfo>>;

    /// Chunks a worker holds for one database.
    fn worker_chunks(&self, worker: &str, database: &str) -> Result<Vec<u32>>;

    /// Insert or update one replica; refreshes its inspection time.
    fn save_replica(&self, replica: &ReplicaInfo) -> Result<()>;

    /// Remove one replica from the catalog.
    fn remove_replica(&self, worker: &str, database: &str, chunk: u32) -> Result<()>;

    fn save_controller(&self, record: &ControllerRecord) -> Result<()>;
    fn save_job(&self, record: &JobRecord) -> Result<()>;
    fn save_request(&self, record: &RequestRecord) -> Result<()>;
    fn log_event(&self, event: &EventRecord) -> Result<()>;

    fn job(&self, id: &str) -> Result<JobRecord>;
    fn events(&self, controller_id: &str) -> Result<Vec<EventRecord>>;
}

#[derive(Debug, Default)]
struct Store {
    replicas: Vec<ReplicaInfo>,
    controllers: HashMap<String, ControllerRecord>,
    jobs: HashMap<String, JobRecord>,
    requests: HashMap<String, RequestRecord>,
    events: Vec<EventRecord>,
}

/// Lock-guarded in-memory implementation used by tests and dry-run tooling.
#[derive(Debug, Default)]
pub struct InMemoryDatabaseServices {
    store: RwLock<Store>,
}

impl InMemoryDatabaseServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the replica catalog.
    pub fn with_replicas(replicas: Vec<ReplicaInfo>) -> Self {
        let services = Self::new();
        services.store.write().replicas = replicas;
        services
    }

    pub fn replica_count(&self) -> usize {
        self.store.read().replicas.len()
    }
}

impl DatabaseServices for InMemoryDatabaseServices {
    fn find_oldest_replicas(&self, max_replicas: usize) -> Result<Vec<ReplicaInfo>> {
        let store = self.store.read();
        let mut replicas = store.replicas.clone();
        replicas.sort_by_key(|r| r.verify_time);
        replicas.truncate(max_replicas);
        Ok(replicas)
    }

    fn find_replicas(&self, database: &str, chunk: u32) -> Result<Vec<ReplicaInfo>> {
        let store = self.store.read();
        Ok(store
            .replicas
            .iter()
            .filter(|r| r.database == database && r.chunk == chunk)
            .cloned()
            .collect())
    }

    fn find_worker_replicas(&self, worker: &str, database: &str) -> Result<Vec<ReplicaInfo>> {
        let store = self.store.read();
        Ok(store
            .replicas
            .iter()
            .filter(|r| r.worker == worker && r.database == database)
            .cloned()
            .collect())
    }

    fn worker_chunks(&self, worker: &str, database: &str) -> Result<Vec<u32>> {
        let mut chunks: Vec<u32> = self
            .find_worker_replicas(worker, database)?
            .into_iter()
            .map(|r| r.chunk)
            .collect();
        chunks.sort_unstable();
        chunks.dedup();
        Ok(chunks)
    }

    fn save_replica(&self, replica: &ReplicaInfo) -> Result<()> {
        let mut store = self.store.write();
        let mut replica = replica.clone();
        replica.verify_time = Utc::now().timestamp();
        if let Some(existing) = store.replicas.iter_mut().find(|r| {
            r.worker == replica.worker && r.database == replica.database && r.chunk == replica.chunk
        }) {
            *existing = replica;
        } else {
            store.replicas.push(replica);
        }
        Ok(())
    }

    fn remove_replica(&self, worker: &str, database: &str, chunk: u32) -> Result<()> {
        self.store.write().replicas.retain(|r| {
            !(r.worker == worker && r.database == database && r.chunk == chunk)
        });
        Ok(())
    }

    fn save_controller(&self, record: &ControllerRecord) -> Result<()> {
        self.store.write().controllers.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn save_job(&self, record: &JobRecord) -> Result<()> {
        self.store.write().jobs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn save_request(&self, record: &RequestRecord) -> Result<()> {
        self.store.write().requests.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn log_event(&self, event: &EventRecord) -> Result<()> {
        self.store.write().events.push(event.clone());
        Ok(())
    }

    fn job(&self, id: &str) -> Result<JobRecord> {
        self.store
            .read()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ShardError::NotFound(format!("job {}", id)))
    }

    fn events(&self, controller_id: &str) -> Result<Vec<EventRecord>> {
        Ok(self
            .store
            .read()
            .events
            .iter()
            .filter(|e| e.controller_id == controller_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::info::ReplicaStatus;

    fn replica(worker: &str, chunk: u32, verify_time: i64) -> ReplicaInfo {
        let mut replica = ReplicaInfo::new(worker, "Obj", chunk, ReplicaStatus::Complete);
        replica.verify_time = verify_time;
        replica
    }

    #[test]
    fn test_oldest_replicas_ordering() {
        let services = InMemoryDatabaseServices::with_replicas(vec![
            replica("w1", 100, 300),
            replica("w2", 200, 100),
            replica("w3", 300, 200),
        ]);
        let oldest = services.find_oldest_replicas(2).unwrap();
        assert_eq!(oldest.len(), 2);
        assert_eq!(oldest[0].worker, "w2");
        assert_eq!(oldest[1].worker, "w3");
    }

    #[test]
    fn test_save_replica_refreshes_inspection_time() {
        let services = InMemoryDatabaseServices::with_replicas(vec![replica("w1", 100, 0)]);
        services.save_replica(&replica("w1", 100, 0)).unwrap();
        let stored = services.find_replicas("Obj", 100).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].verify_time > 0);
    }

    #[test]
    fn test_worker_chunks_deduped_sorted() {
        let services = InMemoryDatabaseServices::with_replicas(vec![
            replica("w1", 300, 0),
            replica("w1", 100, 0),
            replica("w1", 100, 0),
        ]);
        assert_eq!(services.worker_chunks("w1", "Obj").unwrap(), vec![100, 300]);
        assert!(services.worker_chunks("w2", "Obj").unwrap().is_empty());
    }

    #[test]
    fn test_job_record_round_trip() {
        let services = InMemoryDatabaseServices::new();
        let record = JobRecord {
            id: "job-1".to_string(),
            parent_id: String::new(),
            kind: "VERIFY".to_string(),
            state: "CREATED".to_string(),
            extended_state: "NONE".to_string(),
            priority: 0,
            begin_time: Utc::now(),
            end_time: None,
            parameters: vec![("max_replicas".to_string(), "4".to_string())],
        };
        services.save_job(&record).unwrap();
        assert_eq!(services.job("job-1").unwrap(), record);
        assert!(services.job("missing").is_err());
    }
}
