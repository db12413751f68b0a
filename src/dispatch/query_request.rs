// One transport-level conversation for one task attempt.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::dispatch::job_status::{JobPhase, JobStatus};
use crate::dispatch::requester::ResponseRequester;
use crate::dispatch::transport::{CancelToken, QueryResource};

/// Finish state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Active,
    Finished,
    Cancelled,
    Error,
}

type FinishFunc = Box<dyn Fn(bool) + Send + Sync>;
type RetryFunc = Box<dyn Fn() + Send + Sync>;

/// Owns one request/response exchange with a worker.
///
/// The transport drives this object from its own threads; the owning task may
/// cancel it from any thread. All terminal transitions are guarded by the
/// finish mutex, and the cancellation sentinel registered with the response
/// handler is disarmed before any terminal path completes, so a cancel
/// arriving late finds nothing to call. The request deliberately keeps no
/// reference to its task: it may outlive the task for the window between
/// logical completion and the transport's post-finish acknowledgment.
pub struct QueryRequest {
    resource: QueryResource,
    requester: Arc<dyn ResponseRequester>,
    status: Arc<JobStatus>,
    finish_status: Mutex<FinishStatus>,
    finish_func: Mutex<Option<FinishFunc>>,
    retry_func: Mutex<Option<RetryFunc>>,
    cancel_token: Arc<CancelToken>,
}

impl QueryRequest {
    pub fn new(
        resource: QueryResource,
        requester: Arc<dyn ResponseRequester>,
        status: Arc<JobStatus>,
        finish_func: FinishFunc,
        retry_func: Option<RetryFunc>,
    ) -> Arc<Self> {
        let cancel_token = requester.cancel_token();
        let request = Arc::new(Self {
            resource,
            requester,
            status,
            finish_status: Mutex::new(FinishStatus::Active),
            finish_func: Mutex::new(Some(finish_func)),
            retry_func: Mutex::new(retry_func),
            cancel_token,
        });
        let weak = Arc::downgrade(&request);
        request.cancel_token.arm(move || {
            if let Some(request) = weak.upgrade() {
                request.cancel();
            }
        });
        request
    }

    pub fn resource_path(&self) -> &str {
        &self.resource.path
    }

    /// The serialized task payload the transport presents to the worker.
    pub fn payload(&self) -> &[u8] {
        &self.resource.payload
    }

    pub fn finish_status(&self) -> FinishStatus {
        *self.finish_status.lock()
    }

    pub fn finished(&self) -> bool {
        self.finish_status() != FinishStatus::Active
    }

    /// Bytes the response handler expects in the next delivery.
    pub fn next_buffer_size(&self) -> usize {
        self.requester.next_buffer_size()
    }

    /// Deliver response bytes from the transport. Returns false once the
    /// conversation is over and no further deliveries are wanted.
    pub fn process_response_data(&self, bytes: &[u8], last: bool) -> bool {
        if self.finished() {
            return false;
        }
        if !self.requester.flush(bytes, last) {
            let error = self.requester.error();
            self.status.update_with(JobPhase::ResponseError, error.code, error.msg);
            self.error_finish();
            return false;
        }
        if last {
            self.status.update(JobPhase::ResponseReady);
            self.finish();
        }
        true
    }

    /// Unrecoverable transport-side failure for this conversation.
    pub fn process_error(&self, msg: &str, code: i32) {
        self.requester.error_flush(msg, code);
        self.status.update_with(JobPhase::ResponseError, code, msg);
        self.error_finish();
    }

    /// Cancel the conversation. Safe from any thread, idempotent.
    pub fn cancel(&self) {
        {
            let mut finish = self.finish_status.lock();
            if *finish != FinishStatus::Active {
                return;
            }
            *finish = FinishStatus::Cancelled;
        }
        debug!(resource = %self.resource.path, "query request cancelled");
        self.cancel_token.disarm();
        self.requester.error_flush("query request cancelled", -1);
        self.call_finish(false);
    }

    fn finish(&self) {
        {
            let mut finish = self.finish_status.lock();
            if *finish != FinishStatus::Active {
                return;
            }
            *finish = FinishStatus::Finished;
        }
        self.cancel_token.disarm();
        self.call_finish(true);
    }

    /// Terminal error path. If the response handler can be wound back (no
    /// bytes were merged) and a retry hook is present, the attempt is retried
    /// instead of failing the task. The handler itself is not reset here:
    /// the retry performs the reset only once the new attempt is admitted,
    /// which keeps the recorded error intact when the attempt ceiling ends
    /// the task instead.
    fn error_finish(&self) {
        {
            let mut finish = self.finish_status.lock();
            if *finish != FinishStatus::Active {
                return;
            }
            *finish = FinishStatus::Error;
        }
        self.cancel_token.disarm();
        let retry = self.retry_func.lock().take();
        if let Some(retry) = retry {
            if self.requester.retriable() {
                retry();
                return;
            }
        }
        self.call_finish(false);
    }

    fn call_finish(&self, success: bool) {
        if let Some(finish) = self.finish_func.lock().take() {
            finish(success);
        }
    }
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRequest")
            .field("resource", &self.resource.path)
            .field("finish_status", &self.finish_status())
            .finish()
    }
}
