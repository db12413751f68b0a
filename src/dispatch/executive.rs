// User-query coordination: owns the per-chunk task fleet.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::dispatch::job_query::{JobDescription, JobQuery};
use crate::dispatch::job_status::{JobPhase, JobStatus};
use crate::dispatch::requester::{MergingRequester, ResponseRequester};
use crate::dispatch::transport::SsiService;
use crate::error::{ErrorReport, ErrorValue};
use crate::merge::infile::InfileMerger;
use crate::util::{BlockPost, Flag, ThreadPool};
use crate::Config;

/// Opaque identifier of one user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QI={}", self.0)
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    incomplete: HashSet<i32>,
    results: HashMap<i32, bool>,
}

/// Coordinates every per-chunk task of one user query.
///
/// The user query succeeds iff every task reports success. `squash` is the
/// cooperative cancellation of all in-flight tasks and is idempotent.
pub struct Executive {
    query_id: QueryId,
    service: Arc<dyn SsiService>,
    merger: Arc<InfileMerger>,
    max_attempts: u32,
    retry_wait: BlockPost,
    dispatch_pool: ThreadPool,
    jobs: DashMap<i32, Arc<JobQuery>>,
    statuses: DashMap<i32, Arc<JobStatus>>,
    completion: Mutex<CompletionState>,
    all_done: Condvar,
    cancelled: Flag,
    error: ErrorReport,
}

impl Executive {
    pub fn new(
        query_id: QueryId,
        service: Arc<dyn SsiService>,
        merger: Arc<InfileMerger>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            service,
            merger,
            max_attempts: config.max_job_attempts,
            retry_wait: BlockPost::new(50, 200),
            dispatch_pool: ThreadPool::new("czar-dispatch", config.dispatch_threads),
            jobs: DashMap::new(),
            statuses: DashMap::new(),
            completion: Mutex::new(CompletionState::default()),
            all_done: Condvar::new(),
            cancelled: Flag::new(),
            error: ErrorReport::new(),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn service(&self) -> &Arc<dyn SsiService> {
        &self.service
    }

    pub fn merger(&self) -> &Arc<InfileMerger> {
        &self.merger
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_raised()
    }

    pub fn error(&self) -> ErrorValue {
        self.error.get()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn job_status(&self, id: i32) -> Option<Arc<JobStatus>> {
        self.statuses.get(&id).map(|s| s.clone())
    }

    /// Create, register, and start the task for one chunk. The response
    /// handler for the task is created here so that every task of this query
    /// feeds the same merger.
    pub fn add_job(
        self: &Arc<Self>,
        id: i32,
        resource_path: impl Into<String>,
        payload: Vec<u8>,
    ) -> Arc<JobQuery> {
        let requester = MergingRequester::new(self.merger.clone(), id as i64);
        let description = JobDescription {
            id,
            resource_path: resource_path.into(),
            payload,
            requester,
        };
        let status = Arc::new(JobStatus::new());
        let job = JobQuery::new(
            Arc::downgrade(self),
            description,
            status.clone(),
            self.max_attempts,
            self.retry_wait,
        );

        self.jobs.insert(id, job.clone());
        self.statuses.insert(id, status);
        self.completion.lock().incomplete.insert(id);
        debug!(query_id = %self.query_id, job_id = id, "job added");

        if self.is_cancelled() {
            warn!(query_id = %self.query_id, job_id = id, "job added after squash, cancelling");
            job.cancel();
        } else {
            let queued = job.clone();
            self.dispatch_pool.execute(move || {
                queued.run();
            });
        }
        job
    }

    /// Record the completion of one task. Fires at most once per job id;
    /// late duplicates (e.g. a cancel racing a failed retry) are dropped.
    pub fn mark_completed(&self, id: i32, success: bool) {
        let became_empty = {
            let mut completion = self.completion.lock();
            if !completion.incomplete.remove(&id) {
                debug!(query_id = %self.query_id, job_id = id, "duplicate completion ignored");
                return;
            }
            completion.results.insert(id, success);
            completion.incomplete.is_empty()
        };
        debug!(query_id = %self.query_id, job_id = id, success, "job completed");

        if let Some(job) = self.jobs.get(&id) {
            let phase = if job.is_cancelled() { JobPhase::Cancelled } else { JobPhase::Complete };
            job.status().update(phase);
            if !success {
                let error = job.description().requester.error();
                if error.is_set() {
                    self.error.set(error.code, error.msg);
                } else {
                    self.error.set(-1, format!("job {} failed", id));
                }
            }
        }
        if became_empty {
            self.all_done.notify_all();
        }
    }

    /// Cooperatively cancel every in-flight task. Idempotent.
    pub fn squash(&self) {
        if !self.cancelled.raise() {
            debug!(query_id = %self.query_id, "squash skipped, already cancelled");
            return;
        }
        info!(query_id = %self.query_id, "squashing user query");
        let jobs: Vec<Arc<JobQuery>> = self.jobs.iter().map(|j| j.clone()).collect();
        for job in jobs {
            job.cancel();
        }
        self.error.set(-1, "user query squashed");
    }

    /// Block until every task completed. Returns true iff all succeeded.
    pub fn join(&self) -> bool {
        let mut completion = self.completion.lock();
        while !completion.incomplete.is_empty() {
            self.all_done.wait(&mut completion);
        }
        !completion.results.is_empty() && completion.results.values().all(|ok| *ok)
    }

    /// Like [`join`](Self::join) with a global wall-clock budget; on timeout
    /// the query is squashed and the call reports failure.
    pub fn join_timeout(&self, budget: Duration) -> bool {
        let deadline = std::time::Instant::now() + budget;
        {
            let mut completion = self.completion.lock();
            while !completion.incomplete.is_empty() {
                if self.all_done.wait_until(&mut completion, deadline).timed_out() {
                    drop(completion);
                    warn!(query_id = %self.query_id, "user query exceeded its time budget");
                    self.squash();
                    return false;
                }
            }
            if completion.results.values().all(|ok| *ok) && !completion.results.is_empty() {
                return true;
            }
        }
        false
    }

    /// Number of tasks that reported success so far.
    pub fn success_count(&self) -> usize {
        self.completion.lock().results.values().filter(|ok| **ok).count()
    }

    /// Rows landed in the result table so far.
    pub fn rows_merged(&self) -> u64 {
        self.merger.rows_merged()
    }
}

impl fmt::Debug for Executive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completion = self.completion.lock();
        f.debug_struct("Executive")
            .field("query_id", &self.query_id)
            .field("jobs", &self.jobs.len())
            .field("incomplete", &completion.incomplete.len())
            .field("cancelled", &self.cancelled.is_raised())
            .finish()
    }
}
