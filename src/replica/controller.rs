// Controller: hosts jobs, runs their worker requests on a thread pool, and
// persists state transitions and events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::replica::config::ReplicaConfig;
use crate::replica::database::{ControllerRecord, DatabaseServices, EventRecord, JobRecord, RequestRecord};
use crate::replica::job::{ExtendedState, Job, JobCore};
use crate::replica::worker::WorkerService;
use crate::util::ThreadPool;

/// Hosts control-plane jobs and the per-worker request traffic they emit.
pub struct Controller {
    id: String,
    host: String,
    config: RwLock<ReplicaConfig>,
    database: Arc<dyn DatabaseServices>,
    worker_service: Arc<dyn WorkerService>,
    pool: ThreadPool,
    /// One outstanding request per (job, worker, kind); duplicates are
    /// suppressed at registration time.
    in_flight: DashMap<(String, String, String), String>,
}

impl Controller {
    pub fn new(
        config: ReplicaConfig,
        database: Arc<dyn DatabaseServices>,
        worker_service: Arc<dyn WorkerService>,
    ) -> Arc<Self> {
        let threads = num_cpus::get().min(8);
        Self::with_threads(config, database, worker_service, threads)
    }

    pub fn with_threads(
        config: ReplicaConfig,
        database: Arc<dyn DatabaseServices>,
        worker_service: Arc<dyn WorkerService>,
        threads: usize,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            config: RwLock::new(config),
            database,
            worker_service,
            pool: ThreadPool::new("replica-req", threads),
            in_flight: DashMap::new(),
        });
        let record = ControllerRecord {
            id: controller.id.clone(),
            start_time: Utc::now(),
            host: controller.host.clone(),
        };
        if let Err(e) = controller.database.save_controller(&record) {
            warn!(error = %e, "failed to persist controller record");
        }
        controller.log_event("CONTROLLER_STARTED", json!({ "host": controller.host }));
        info!(controller_id = %controller.id, "controller started");
        controller
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> ReplicaConfig {
        self.config.read().clone()
    }

    /// Swap the configuration; the rare reconfigure path.
    pub fn reconfigure(&self, config: ReplicaConfig) {
        *self.config.write() = config;
        self.log_event("CONTROLLER_RECONFIGURED", json!({}));
    }

    pub fn database(&self) -> &Arc<dyn DatabaseServices> {
        &self.database
    }

    pub fn worker_service(&self) -> &Arc<dyn WorkerService> {
        &self.worker_service
    }

    /// Run `task` on the request pool.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.execute(task);
    }

    /// Register an outstanding request of `kind` for `(job, worker)`.
    /// Returns the request id, or None when such a request already exists.
    pub fn begin_request(&self, job_id: &str, worker: &str, kind: &str) -> Option<String> {
        let key = (job_id.to_string(), worker.to_string(), kind.to_string());
        let request_id = Uuid::new_v4().to_string();
        match self.in_flight.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(job_id, worker, kind, "duplicate request suppressed");
                None
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(request_id.clone());
                let record = RequestRecord {
                    id: request_id.clone(),
                    job_id: job_id.to_string(),
                    worker: worker.to_string(),
                    state: "IN_PROGRESS".to_string(),
                    begin_time: Utc::now(),
                    end_time: None,
                };
                if let Err(e) = self.database.save_request(&record) {
                    warn!(error = %e, "failed to persist request record");
                }
                Some(request_id)
            }
        }
    }

    /// Retire an outstanding request and persist its terminal state.
    pub fn end_request(&self, job_id: &str, worker: &str, kind: &str, request_id: &str, state: &str) {
        let key = (job_id.to_string(), worker.to_string(), kind.to_string());
        self.in_flight.remove(&key);
        let record = RequestRecord {
            id: request_id.to_string(),
            job_id: job_id.to_string(),
            worker: worker.to_string(),
            state: state.to_string(),
            begin_time: Utc::now(),
            end_time: Some(Utc::now()),
        };
        if let Err(e) = self.database.save_request(&record) {
            warn!(error = %e, "failed to persist request record");
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Persist a job row reflecting the current state of `core`.
    pub fn persist_job(&self, core: &JobCore, parameters: Vec<(String, String)>) {
        let (state, extended) = core.state();
        let record = JobRecord {
            id: core.id().to_string(),
            parent_id: core.parent_id().to_string(),
            kind: core.kind().to_string(),
            state: state.as_str().to_string(),
            extended_state: extended.as_str().to_string(),
            priority: core.options().priority,
            begin_time: core.begin_time(),
            end_time: core.end_time(),
            parameters,
        };
        if let Err(e) = self.database.save_job(&record) {
            warn!(error = %e, "failed to persist job record");
        }
    }

    pub fn log_event(&self, kind: &str, payload: serde_json::Value) {
        let event = EventRecord {
            controller_id: self.id.clone(),
            timestamp: Utc::now(),
            kind: kind.to_string(),
            payload,
        };
        if let Err(e) = self.database.log_event(&event) {
            warn!(error = %e, "failed to log event");
        }
    }

    /// Persist, start, and (when a deadline is configured) watchdog a job.
    pub fn launch(self: &Arc<Self>, job: Arc<dyn Job>) -> Result<()> {
        self.persist_job(job.core(), job.extended_persistent_state());
        self.log_event(
            "JOB_STARTED",
            json!({ "job": job.core().id(), "kind": job.core().kind() }),
        );

        let deadline_sec = self.config.read().job_deadline_sec;
        if deadline_sec > 0 {
            let watched = job.clone();
            std::thread::spawn(move || {
                if !watched.core().wait_timeout(Duration::from_secs(deadline_sec)) {
                    warn!(job_id = %watched.core().id(), "job deadline exceeded");
                    watched.cancel_with(ExtendedState::TimeoutExpired);
                }
            });
        }
        job.start()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
