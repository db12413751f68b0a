// Continuous replica-integrity sweep.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::replica::controller::Controller;
use crate::replica::database::DatabaseServices;
use crate::replica::info::{ReplicaDiff, ReplicaInfo};
use crate::replica::job::{ExtendedState, Job, JobCore, JobOptions};
use crate::util::Flag;

/// Invoked for every inspected replica with the diff against its previously
/// persisted state and the diffs against each non-self peer replica.
pub type ReplicaDiffCallback = Box<dyn Fn(&ReplicaDiff, &[ReplicaDiff]) + Send + Sync>;

const FIND_REPLICA_KIND: &str = "FIND_REPLICA";

/// Walks the replica catalog oldest-inspected first, re-observes each replica
/// at its worker, and reports differences.
///
/// The job keeps a window of at most `max_replicas` inspections in flight and
/// refills it after every completion, so it runs until cancelled. The only
/// self-termination is an empty catalog: fatal on the first scan, a normal
/// drain afterwards.
pub struct VerifyJob {
    core: JobCore,
    controller: Arc<Controller>,
    max_replicas: usize,
    compute_check_sum: bool,
    on_difference: Option<ReplicaDiffCallback>,
    /// request id -> previously persisted state of the replica it inspects
    replicas: Mutex<HashMap<String, ReplicaInfo>>,
    cancelled: Flag,
}

impl VerifyJob {
    pub fn create(
        max_replicas: usize,
        compute_check_sum: bool,
        on_difference: Option<ReplicaDiffCallback>,
        controller: Arc<Controller>,
        parent_id: impl Into<String>,
        options: JobOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new("VERIFY", parent_id, options),
            controller,
            max_replicas: max_replicas.max(1),
            compute_check_sum,
            on_difference,
            replicas: Mutex::new(HashMap::new()),
            cancelled: Flag::new(),
        })
    }

    pub fn max_replicas(&self) -> usize {
        self.max_replicas
    }

    pub fn compute_check_sum(&self) -> bool {
        self.compute_check_sum
    }

    /// Oldest-inspected replicas not already in the inspection window.
    fn next_replicas(&self, count: usize) -> Result<Vec<ReplicaInfo>> {
        let window = self.replicas.lock();
        let in_window: Vec<(String, String, u32)> = window
            .values()
            .map(|r| (r.worker.clone(), r.database.clone(), r.chunk))
            .collect();
        drop(window);

        let candidates = self
            .controller
            .database()
            .find_oldest_replicas(count + in_window.len())?;
        Ok(candidates
            .into_iter()
            .filter(|r| {
                !in_window.contains(&(r.worker.clone(), r.database.clone(), r.chunk))
            })
            .take(count)
            .collect())
    }

    /// Put one replica inspection in flight. Returns false when the request
    /// slot for its worker is already taken.
    fn launch_inspection(self: &Arc<Self>, replica: ReplicaInfo) -> bool {
        let Some(request_id) =
            self.controller
                .begin_request(self.core.id(), &replica.worker, FIND_REPLICA_KIND)
        else {
            return false;
        };
        self.replicas.lock().insert(request_id.clone(), replica.clone());

        let job = self.clone();
        self.controller.submit(move || {
            let observed = job.controller.worker_service().find_replica(
                &replica.worker,
                &replica.database,
                replica.chunk,
                job.compute_check_sum,
            );
            job.on_request_finish(&replica.worker, &request_id, observed);
        });
        true
    }

    fn on_request_finish(
        self: &Arc<Self>,
        worker: &str,
        request_id: &str,
        observed: Result<ReplicaInfo>,
    ) {
        if self.core.is_finished() {
            return;
        }
        let state = if observed.is_ok() { "SUCCESS" } else { "FAILED" };
        self.controller
            .end_request(self.core.id(), worker, FIND_REPLICA_KIND, request_id, state);

        let previous = self.replicas.lock().remove(request_id);
        let mut self_diff: Option<ReplicaDiff> = None;
        let mut peer_diffs: Vec<ReplicaDiff> = Vec::new();

        match (previous, observed) {
            (Some(previous), Ok(observed)) => {
                match ReplicaDiff::new(previous.clone(), observed.clone()) {
                    Ok(diff) => {
                        if diff.not_equal() && self.on_difference.is_none() {
                            info!(
                                worker,
                                database = %previous.database,
                                chunk = previous.chunk,
                                flags = %diff.flags2string(),
                                "replica mismatch against own previous state"
                            );
                        }
                        self_diff = Some(diff);
                    }
                    Err(e) => error!(worker, error = %e, "replica diff failed"),
                }

                // Compare against every other replica of the same chunk.
                if let Ok(peers) = self
                    .controller
                    .database()
                    .find_replicas(&previous.database, previous.chunk)
                {
                    for peer in peers {
                        if peer.worker == observed.worker {
                            continue;
                        }
                        if let Ok(diff) = ReplicaDiff::new(observed.clone(), peer) {
                            peer_diffs.push(diff);
                        }
                    }
                }

                // The refreshed observation becomes the persisted state.
                if let Err(e) = self.controller.database().save_replica(&observed) {
                    error!(worker, error = %e, "failed to persist replica state");
                }
            }
            (Some(previous), Err(e)) => {
                // Report and keep sweeping.
                error!(
                    worker,
                    database = %previous.database,
                    chunk = previous.chunk,
                    error = %e,
                    "replica inspection failed"
                );
            }
            (None, _) => {
                debug!(worker, request_id, "inspection finished after cancel");
            }
        }

        // Keep the inspection window full.
        self.refill();

        if let (Some(on_difference), Some(self_diff)) = (&self.on_difference, &self_diff) {
            on_difference(self_diff, &peer_diffs);
        }
    }

    fn refill(self: &Arc<Self>) {
        if self.cancelled.is_raised() || self.core.is_finished() {
            return;
        }
        match self.next_replicas(1) {
            Ok(replicas) if !replicas.is_empty() => {
                for replica in replicas {
                    self.launch_inspection(replica);
                }
            }
            Ok(_) => {
                // Catalog ran dry mid-sweep; drain outstanding inspections
                // and finish cleanly once none remain.
                if self.replicas.lock().is_empty() {
                    info!(job_id = %self.core.id(), "replica catalog drained");
                    self.finish(ExtendedState::Success);
                }
            }
            Err(e) => {
                error!(job_id = %self.core.id(), error = %e, "replica lookup failed");
                self.finish(ExtendedState::Failed);
            }
        }
    }

    fn finish(&self, extended: ExtendedState) {
        if !self.core.finish(extended) {
            return;
        }
        self.controller.persist_job(&self.core, self.extended_persistent_state());
        self.controller.log_event(
            "JOB_FINISHED",
            json!({
                "job": self.core.id(),
                "kind": self.core.kind(),
                "extended_state": extended.as_str(),
            }),
        );
    }
}

impl Job for VerifyJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn start(self: Arc<Self>) -> Result<()> {
        self.core.start_transition()?;

        let replicas = self.next_replicas(self.max_replicas)?;
        if replicas.is_empty() {
            // An empty catalog on the first scan means there is nothing this
            // job could ever verify.
            error!(job_id = %self.core.id(), "no replicas to verify");
            self.finish(ExtendedState::Failed);
            return Ok(());
        }
        for replica in replicas {
            self.launch_inspection(replica);
        }
        Ok(())
    }

    fn cancel_with(&self, extended: ExtendedState) {
        if !self.cancelled.raise() {
            return;
        }
        let in_flight: Vec<String> = {
            let mut window = self.replicas.lock();
            let ids: Vec<(String, String)> = window
                .iter()
                .map(|(request_id, replica)| (request_id.clone(), replica.worker.clone()))
                .collect();
            window.clear();
            ids.into_iter()
                .map(|(request_id, worker)| {
                    // Tell the worker to stop wasting cycles on the request.
                    if let Err(e) =
                        self.controller.worker_service().stop_request(&worker, &request_id)
                    {
                        debug!(worker = %worker, error = %e, "stop request failed");
                    }
                    request_id
                })
                .collect()
        };
        debug!(job_id = %self.core.id(), stopped = in_flight.len(), "verify sweep cancelled");
        self.finish(extended);
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![
            ("max_replicas".to_string(), self.max_replicas.to_string()),
            ("compute_check_sum".to_string(), if self.compute_check_sum { "1" } else { "0" }.to_string()),
        ]
    }

    fn progress(&self) -> String {
        let window = self.replicas.lock();
        let mut parts: Vec<String> = window.values().map(|r| r.to_string()).collect();
        parts.sort();
        format!("{} inspecting: {}", self.core.context(), parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::config::{ReplicaConfig, WorkerConfig};
    use crate::replica::database::InMemoryDatabaseServices;
    use crate::replica::info::{FileInfo, ReplicaStatus};
    use crate::replica::job::JobState;
    use crate::replica::worker::MockWorkerService;
    use crossbeam::channel::unbounded;
    use std::time::Duration;

    fn fixture(replicas: Vec<ReplicaInfo>) -> Arc<Controller> {
        let database = Arc::new(InMemoryDatabaseServices::with_replicas(replicas));
        let worker_service =
            Arc::new(MockWorkerService::new(database.clone() as Arc<dyn DatabaseServices>));
        let config = ReplicaConfig {
            workers: vec![
                WorkerConfig::new("w1", "host-1", 25000),
                WorkerConfig::new("w2", "host-2", 25000),
            ],
            ..ReplicaConfig::default()
        };
        Controller::with_threads(config, database, worker_service, 2)
    }

    fn replica(worker: &str, chunk: u32, size: u64) -> ReplicaInfo {
        ReplicaInfo::new(worker, "Obj", chunk, ReplicaStatus::Complete)
            .with_files(vec![FileInfo::new(format!("chunk_{}.data", chunk), size, 42, "")])
    }

    #[test]
    fn test_empty_catalog_fails_fast() {
        let controller = fixture(Vec::new());
        let job = VerifyJob::create(4, false, None, controller.clone(), "", JobOptions::default());
        controller.launch(job.clone()).unwrap();
        job.core().wait();
        assert_eq!(job.core().state(), (JobState::Finished, ExtendedState::Failed));
    }

    #[test]
    fn test_sweep_reports_diffs_until_cancelled() {
        // The database remembers size 1000 while the "worker" (the same
        // catalog) reports what is stored, so seed a mismatch by changing
        // the persisted copy after computing what the worker returns.
        let controller = fixture(vec![
            replica("w1", 100, 1000),
            replica("w1", 200, 500),
            replica("w2", 100, 1000),
        ]);
        let (sender, receiver) = unbounded();
        let on_diff: ReplicaDiffCallback = Box::new(move |self_diff, peer_diffs| {
            let _ = sender.send((self_diff.flags2string(), peer_diffs.len()));
        });
        let job = VerifyJob::create(
            2,
            false,
            Some(on_diff),
            controller.clone(),
            "",
            JobOptions::default(),
        );
        controller.launch(job.clone()).unwrap();

        // The sweep must keep producing inspections until cancelled.
        let mut reports = 0;
        while reports < 8 {
            receiver
                .recv_timeout(Duration::from_secs(10))
                .expect("sweep stalled before cancel");
            reports += 1;
        }
        job.cancel();
        job.core().wait();
        assert_eq!(job.core().state(), (JobState::Finished, ExtendedState::Cancelled));
    }

    #[test]
    fn test_peer_diffs_exclude_self() {
        let controller = fixture(vec![replica("w1", 100, 1000), replica("w2", 100, 1000)]);
        let (sender, receiver) = unbounded();
        let on_diff: ReplicaDiffCallback = Box::new(move |self_diff, peer_diffs| {
            let peers: Vec<String> =
                peer_diffs.iter().map(|d| d.replica2().worker.clone()).collect();
            let _ = sender.send((self_diff.is_self(), peers));
        });
        let job = VerifyJob::create(
            1,
            false,
            Some(on_diff),
            controller.clone(),
            "",
            JobOptions::default(),
        );
        controller.launch(job.clone()).unwrap();

        let (is_self, peers) = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(is_self);
        assert_eq!(peers.len(), 1);
        job.cancel();
        job.core().wait();
    }

    #[test]
    fn test_cancel_stops_in_flight_requests() {
        let controller = fixture(vec![replica("w1", 100, 1000)]);
        let job = VerifyJob::create(1, false, None, controller.clone(), "", JobOptions::default());
        controller.launch(job.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        job.cancel();
        job.core().wait();
        let (_, extended) = job.core().state();
        assert_eq!(extended, ExtendedState::Cancelled);
    }
}
