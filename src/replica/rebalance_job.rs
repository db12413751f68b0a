// Chunk placement: even out good-chunk counts across the worker fleet.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::replica::controller::Controller;
use crate::replica::info::ReplicaStatus;
use crate::replica::job::{ExtendedState, Job, JobCore, JobOptions};
use crate::util::Flag;

const MOVE_CHUNK_KIND: &str = "MOVE_CHUNK";

/// One planned move: `(database, chunk)` from a source to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceMove {
    pub database: String,
    pub chunk: u32,
    pub source_worker: String,
    pub destination_worker: String,
}

/// Census, plan, and execution outcome of one rebalance pass.
#[derive(Debug, Clone, Default)]
pub struct RebalanceJobResult {
    /// Workers that reported their chunks
    pub total_workers: usize,
    /// Good (complete) chunk replicas found across the fleet
    pub total_good_chunks: usize,
    /// Mean number of good chunks per worker
    pub avg_chunks: f64,
    /// chunk -> (source worker, destination worker) pairs
    pub plan: BTreeMap<u32, Vec<(String, String)>>,
    pub moved: Vec<RebalanceMove>,
    pub failed_moves: Vec<(RebalanceMove, String)>,
}

impl RebalanceJobResult {
    pub fn planned_moves(&self) -> usize {
        self.plan.values().map(|moves| moves.len()).sum()
    }
}

/// Evens chunk placement within one database family.
///
/// A census of good chunks per worker feeds a plan that moves surplus chunks
/// from overloaded workers toward the mean; with `estimate_only` the plan is
/// computed and reported without touching any worker.
pub struct RebalanceJob {
    core: JobCore,
    controller: Arc<Controller>,
    family: String,
    estimate_only: bool,
    result: Mutex<RebalanceJobResult>,
    cancelled: Flag,
}

impl RebalanceJob {
    pub fn create(
        family: impl Into<String>,
        estimate_only: bool,
        controller: Arc<Controller>,
        parent_id: impl Into<String>,
        options: JobOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new("REBALANCE", parent_id, options),
            controller,
            family: family.into(),
            estimate_only,
            result: Mutex::new(RebalanceJobResult::default()),
            cancelled: Flag::new(),
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn estimate_only(&self) -> bool {
        self.estimate_only
    }

    pub fn result(&self) -> RebalanceJobResult {
        self.result.lock().clone()
    }

    /// Good chunks per worker for every database of the family.
    fn census(&self) -> Result<HashMap<String, Vec<(String, u32)>>> {
        let config = self.controller.config();
        let mut census: HashMap<String, Vec<(String, u32)>> = HashMap::new();
        for worker in config.eligible_workers(false) {
            let mut good: Vec<(String, u32)> = Vec::new();
            for database in config.family_databases(&self.family) {
                for replica in self
                    .controller
                    .database()
                    .find_worker_replicas(&worker.name, &database.name)?
                {
                    if replica.status == ReplicaStatus::Complete {
                        good.push((database.name.clone(), replica.chunk));
                    }
                }
            }
            census.insert(worker.name.clone(), good);
        }
        Ok(census)
    }

    /// Plan moves from workers above the mean to workers below it. A chunk
    /// never moves to a worker that already holds a replica of it.
    fn plan_moves(census: &HashMap<String, Vec<(String, u32)>>) -> Vec<RebalanceMove> {
        let total_good: usize = census.values().map(|chunks| chunks.len()).sum();
        let workers = census.len();
        if workers == 0 || total_good == 0 {
            return Vec::new();
        }
        let target = (total_good as f64 / workers as f64).ceil() as usize;

        let mut counts: BTreeMap<String, usize> =
            census.iter().map(|(worker, chunks)| (worker.clone(), chunks.len())).collect();
        let mut holders: HashMap<(String, u32), HashSet<String>> = HashMap::new();
        for (worker, chunks) in census {
            for key in chunks {
                holders.entry(key.clone()).or_default().insert(worker.clone());
            }
        }

        let mut moves = Vec::new();
        let mut donors: Vec<String> = census
            .iter()
            .filter(|(_, chunks)| chunks.len() > target)
            .map(|(worker, _)| worker.clone())
            .collect();
        donors.sort();
        for donor in donors {
            let surplus: Vec<(String, u32)> =
                census[&donor].iter().skip(target).cloned().collect();
            for key in surplus {
                if counts[&donor] <= target {
                    break;
                }
                let recipient = counts
                    .iter()
                    .filter(|(worker, count)| {
                        **count < target
                            && !holders
                                .get(&key)
                                .map(|held| held.contains(worker.as_str()))
                                .unwrap_or(false)
                    })
                    .min_by_key(|(_, count)| **count)
                    .map(|(worker, _)| worker.clone());
                let Some(recipient) = recipient else {
                    continue;
                };
                *counts.get_mut(&donor).unwrap() -= 1;
                *counts.get_mut(&recipient).unwrap() += 1;
                holders.entry(key.clone()).or_default().insert(recipient.clone());
                moves.push(RebalanceMove {
                    database: key.0.clone(),
                    chunk: key.1,
                    source_worker: donor.clone(),
                    destination_worker: recipient,
                });
            }
        }
        moves
    }

    fn execute_moves(self: &Arc<Self>, moves: Vec<RebalanceMove>) {
        for planned in moves {
            if self.cancelled.is_raised() || self.core.is_finished() {
                return;
            }
            let Some(request_id) = self.controller.begin_request(
                self.core.id(),
                &planned.source_worker,
                MOVE_CHUNK_KIND,
            ) else {
                debug!(chunk = planned.chunk, "move suppressed, worker busy");
                continue;
            };
            let outcome = self.controller.worker_service().move_chunk(
                &planned.source_worker,
                &planned.destination_worker,
                &planned.database,
                planned.chunk,
            );
            let state = if outcome.is_ok() { "SUCCESS" } else { "FAILED" };
            self.controller.end_request(
                self.core.id(),
                &planned.source_worker,
                MOVE_CHUNK_KIND,
                &request_id,
                state,
            );
            let mut result = self.result.lock();
            match outcome {
                Ok(()) => result.moved.push(planned),
                Err(e) => {
                    error!(chunk = planned.chunk, error = %e, "chunk move failed");
                    result.failed_moves.push((planned, e.to_string()));
                }
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

impl Job for RebalanceJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn start(self: Arc<Self>) -> Result<()> {
        self.core.start_transition()?;

        if self.controller.config().family(&self.family).is_none() {
            error!(family = %self.family, "unknown database family");
            self.finish(ExtendedState::Failed);
            return Ok(());
        }

        let census = match self.census() {
            Ok(census) => census,
            Err(e) => {
                error!(error = %e, "chunk census failed");
                self.finish(ExtendedState::Failed);
                return Ok(());
            }
        };
        let moves = Self::plan_moves(&census);
        {
            let mut result = self.result.lock();
            result.total_workers = census.len();
            result.total_good_chunks = census.values().map(|chunks| chunks.len()).sum();
            result.avg_chunks = if census.is_empty() {
                0.0
            } else {
                result.total_good_chunks as f64 / census.len() as f64
            };
            for planned in &moves {
                result.plan.entry(planned.chunk).or_default().push((
                    planned.source_worker.clone(),
                    planned.destination_worker.clone(),
                ));
            }
        }
        info!(
            job_id = %self.core.id(),
            family = %self.family,
            planned = moves.len(),
            estimate_only = self.estimate_only,
            "rebalance plan computed"
        );

        if self.estimate_only {
            self.finish(ExtendedState::Success);
            return Ok(());
        }

        let job = self.clone();
        self.controller.submit(move || {
            job.execute_moves(moves);
            let failed = !job.result.lock().failed_moves.is_empty();
            job.finish(if failed { ExtendedState::Failed } else { ExtendedState::Success });
        });
        Ok(())
    }

    fn cancel_with(&self, extended: ExtendedState) {
        if !self.cancelled.raise() {
            return;
        }
        self.finish(extended);
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![
            ("family".to_string(), self.family.clone()),
            ("estimate_only".to_string(), if self.estimate_only { "1" } else { "0" }.to_string()),
        ]
    }

    fn progress(&self) -> String {
        let result = self.result.lock();
        format!(
            "{} planned={} moved={} failed={}",
            self.core.context(),
            result.planned_moves(),
            result.moved.len(),
            result.failed_moves.len()
        )
    }
}
