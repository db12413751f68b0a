// Per-chunk task control: describe, run, retry, cancel.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::executive::Executive;
use crate::dispatch::job_status::{JobPhase, JobStatus};
use crate::dispatch::query_request::QueryRequest;
use crate::dispatch::requester::{MergingRequester, ResponseRequester};
use crate::dispatch::transport::QueryResource;
use crate::util::{BlockPost, Flag};

/// Static description of one chunk task.
#[derive(Clone)]
pub struct JobDescription {
    pub id: i32,
    /// Worker resource path, e.g. `/chk/LSST/314`
    pub resource_path: String,
    /// Serialized task payload
    pub payload: Vec<u8>,
    /// Response handler shared across the attempts of this task
    pub requester: Arc<MergingRequester>,
}

impl std::fmt::Debug for JobDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDescription")
            .field("id", &self.id)
            .field("resource_path", &self.resource_path)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Runtime controller of one chunk task.
///
/// A task loops PROVISION -> REQUEST -> RESPONSE_READY -> COMPLETE, returning
/// to PROVISION on a retryable failure until the attempt ceiling is hit, at
/// which point the whole user query is squashed.
pub struct JobQuery {
    executive: Weak<Executive>,
    description: JobDescription,
    status: Arc<JobStatus>,
    attempts: Mutex<u32>,
    max_attempts: u32,
    retry_wait: BlockPost,
    cancelled: Flag,
    query_request: Mutex<Option<Arc<QueryRequest>>>,
}

impl JobQuery {
    pub fn new(
        executive: Weak<Executive>,
        description: JobDescription,
        status: Arc<JobStatus>,
        max_attempts: u32,
        retry_wait: BlockPost,
    ) -> Arc<Self> {
        Arc::new(Self {
            executive,
            description,
            status,
            attempts: Mutex::new(0),
            max_attempts,
            retry_wait,
            cancelled: Flag::new(),
            query_request: Mutex::new(None),
        })
    }

    pub fn id(&self) -> i32 {
        self.description.id
    }

    pub fn description(&self) -> &JobDescription {
        &self.description
    }

    pub fn status(&self) -> Arc<JobStatus> {
        self.status.clone()
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_raised()
    }

    /// Start one attempt. Returns false when no attempt was started; the
    /// task is then either already terminal or has just squashed the query.
    pub fn run(self: &Arc<Self>) -> bool {
        let Some(executive) = self.executive.upgrade() else {
            warn!(job_id = self.id(), "run without executive");
            return false;
        };
        if self.cancelled.is_raised() || executive.is_cancelled() {
            debug!(job_id = self.id(), "run skipped, cancelled");
            return false;
        }

        let attempt = {
            let mut attempts = self.attempts.lock();
            if *attempts >= self.max_attempts {
                error!(
                    job_id = self.id(),
                    attempts = *attempts,
                    "hit maximum number of attempts, squashing user query"
                );
                // Complete this task first so that the error its handler
                // carries, not the squash, is what the query reports.
                drop(attempts);
                executive.mark_completed(self.id(), false);
                executive.squash();
                return false;
            }
            *attempts += 1;
            *attempts
        };

        let requester = &self.description.requester;
        if !requester.reset() {
            warn!(job_id = self.id(), "response handler refused reset");
            self.fail_now(&executive, "response handler not resettable");
            return false;
        }
        requester.set_attempt(attempt);
        self.status.update(JobPhase::Provision);

        let resource =
            QueryResource::new(self.description.resource_path.clone(), self.description.payload.clone());
        let request = self.new_query_request(&executive, resource);
        *self.query_request.lock() = Some(request.clone());
        self.status.update(JobPhase::Request);

        match executive.service().provision(request) {
            Ok(()) => true,
            Err(e) => {
                self.provisioning_failed(&e.to_string(), -1);
                false
            }
        }
    }

    fn new_query_request(
        self: &Arc<Self>,
        executive: &Arc<Executive>,
        resource: QueryResource,
    ) -> Arc<QueryRequest> {
        let job_id = self.id();
        let exec_weak = Arc::downgrade(executive);
        let finish = Box::new(move |success: bool| {
            if let Some(executive) = exec_weak.upgrade() {
                executive.mark_completed(job_id, success);
            }
        });
        let job_weak = Arc::downgrade(self);
        let retry = Box::new(move || {
            if let Some(job) = job_weak.upgrade() {
                if !job.run() {
                    job.finish_failed_run();
                }
            }
        });
        QueryRequest::new(
            resource,
            self.description.requester.clone() as Arc<dyn ResponseRequester>,
            self.status.clone(),
            finish,
            Some(retry),
        )
    }

    /// Provisioning was refused by the transport. The retry runs on a
    /// detached thread holding only a weak reference, so a squashed query
    /// lets the retry quietly evaporate.
    pub fn provisioning_failed(self: &Arc<Self>, msg: &str, code: i32) {
        error!(job_id = self.id(), code, "provisioning failed: {}", msg);
        self.status.update_with(JobPhase::ProvisionNack, code, msg);
        self.description.requester.error_flush(msg, code);
        info!(job_id = self.id(), "provisioning retry scheduled");

        let job_weak = Arc::downgrade(self);
        let retry_wait = self.retry_wait;
        std::thread::spawn(move || {
            retry_wait.wait();
            let Some(job) = job_weak.upgrade() else {
                return;
            };
            debug!(job_id = job.id(), "retrying after provisioning failure");
            if !job.run() {
                job.finish_failed_run();
            }
        });
    }

    /// Record a terminal failure for a run that could not start an attempt.
    /// Completion is deduplicated by the Executive, so racing cancel paths
    /// are harmless.
    fn finish_failed_run(self: &Arc<Self>) {
        if let Some(executive) = self.executive.upgrade() {
            executive.mark_completed(self.id(), false);
        }
    }

    fn fail_now(&self, executive: &Arc<Executive>, msg: &str) {
        self.description.requester.error_flush(msg, -1);
        executive.mark_completed(self.id(), false);
    }

    /// Cancel this task. Returns true only for the call that performed the
    /// cancellation.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if !self.cancelled.raise() {
            debug!(job_id = self.id(), "cancel skipped, already cancelled");
            return false;
        }
        let request = self.query_request.lock().clone();
        match request {
            Some(request) => {
                // The transport conversation owns the completion callback.
                debug!(job_id = self.id(), "cancelling query request in progress");
                request.cancel();
            }
            None => {
                let msg = format!("job {} cancelled before request", self.id());
                self.description.requester.error_flush(&msg, -1);
                if let Some(executive) = self.executive.upgrade() {
                    executive.mark_completed(self.id(), false);
                } else {
                    error!(job_id = self.id(), "cancel without executive");
                }
            }
        }
        self.description.requester.process_cancel();
        self.status.update(JobPhase::Cancelled);
        true
    }
}

impl std::fmt::Debug for JobQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQuery")
            .field("id", &self.id())
            .field("attempts", &self.attempts())
            .field("cancelled", &self.cancelled.is_raised())
            .finish()
    }
}
