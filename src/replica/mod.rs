// # Replication & Verification Control Plane
//
// A Controller hosts long-lived Jobs that fan batched RPCs out to the worker
// fleet: continuous replica verification, fleet-wide index DDL, and chunk
// rebalancing. Job and request state transitions are persisted through the
// database-services interface.

pub mod config;
pub mod controller;
pub mod database;
pub mod info;
pub mod job;
pub mod rebalance_job;
pub mod sql_index_jobs;
pub mod sql_job;
pub mod verify_job;
pub mod worker;

pub use config::{DatabaseConfig, FamilyConfig, ReplicaConfig, TableConfig, WorkerConfig};
pub use controller::Controller;
pub use database::{
    ControllerRecord, DatabaseServices, EventRecord, InMemoryDatabaseServices, JobRecord,
    RequestRecord,
};
pub use info::{FileInfo, ReplicaDiff, ReplicaInfo, ReplicaStatus};
pub use job::{ExtendedState, Job, JobCore, JobOptions, JobState};
pub use rebalance_job::{RebalanceJob, RebalanceJobResult};
pub use sql_index_jobs::{SqlCreateIndexesJob, SqlDropIndexesJob, SqlGetIndexesJob};
pub use sql_job::{distribute_tables, worker_tables, SqlJobResult, DUMMY_CHUNK};
pub use verify_job::{ReplicaDiffCallback, VerifyJob};
pub use worker::{
    IndexRow, IndexSpec, MockWorkerService, SqlIndexColumn, SqlRequestSummary, WorkerCommand,
    WorkerCommandOutcome, WorkerService,
};
