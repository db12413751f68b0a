// Job lifecycle base for the control plane.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ShardError};
use crate::util::BlockPost;

/// Primary job state; transitions are monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    InProgress,
    Finished,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Finished => "FINISHED",
        }
    }
}

/// Refinement of FINISHED, set exactly once at the final transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedState {
    None,
    Success,
    Failed,
    Cancelled,
    TimeoutExpired,
}

impl ExtendedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedState::None => "NONE",
            ExtendedState::Success => "SUCCESS",
            ExtendedState::Failed => "FAILED",
            ExtendedState::Cancelled => "CANCELLED",
            ExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
        }
    }
}

/// Scheduling options of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: i32,
    pub exclusive: bool,
    pub preemptable: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self { priority: 0, exclusive: false, preemptable: true }
    }
}

#[derive(Debug)]
struct JobStateInner {
    state: JobState,
    extended: ExtendedState,
}

/// Identity, state machine, and completion signaling shared by every job.
#[derive(Debug)]
pub struct JobCore {
    id: String,
    kind: String,
    parent_id: String,
    options: JobOptions,
    begin_time: DateTime<Utc>,
    end_time: Mutex<Option<DateTime<Utc>>>,
    state: Mutex<JobStateInner>,
    finished: Condvar,
}

impl JobCore {
    pub fn new(kind: impl Into<String>, parent_id: impl Into<String>, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            parent_id: parent_id.into(),
            options,
            begin_time: Utc::now(),
            end_time: Mutex::new(None),
            state: Mutex::new(JobStateInner { state: JobState::Created, extended: ExtendedState::None }),
            finished: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn options(&self) -> JobOptions {
        self.options
    }

    pub fn begin_time(&self) -> DateTime<Utc> {
        self.begin_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.lock()
    }

    pub fn state(&self) -> (JobState, ExtendedState) {
        let inner = self.state.lock();
        (inner.state, inner.extended)
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().state == JobState::Finished
    }

    /// CREATED -> IN_PROGRESS. Starting from any other state is an error.
    pub fn start_transition(&self) -> Result<()> {
        let mut inner = self.state.lock();
        if inner.state != JobState::Created {
            return Err(ShardError::InvalidOperation(format!(
                "job {} cannot start from state {}",
                self.id,
                inner.state.as_str()
            )));
        }
        inner.state = JobState::InProgress;
        Ok(())
    }

    /// Transition to FINISHED with `extended`. Returns true only for the
    /// call that performed the transition; the extended state is never
    /// overwritten afterwards.
    pub fn finish(&self, extended: ExtendedState) -> bool {
        let mut inner = self.state.lock();
        if inner.state == JobState::Finished {
            debug!(job_id = %self.id, "finish skipped, already finished");
            return false;
        }
        inner.state = JobState::Finished;
        inner.extended = extended;
        *self.end_time.lock() = Some(Utc::now());
        drop(inner);
        self.finished.notify_all();
        true
    }

    /// Block until the job reaches FINISHED.
    pub fn wait(&self) {
        let mut inner = self.state.lock();
        while inner.state != JobState::Finished {
            self.finished.wait(&mut inner);
        }
    }

    /// Block up to `budget`. Returns true iff the job finished.
    pub fn wait_timeout(&self, budget: Duration) -> bool {
        let deadline = std::time::Instant::now() + budget;
        let mut inner = self.state.lock();
        while inner.state != JobState::Finished {
            if self.finished.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == JobState::Finished;
            }
        }
        true
    }

    pub fn context(&self) -> String {
        format!("{} [{}]", self.kind, self.id)
    }
}

/// A fleet-wide operation hosted by the Controller.
pub trait Job: Send + Sync {
    fn core(&self) -> &JobCore;

    /// Validate the state and fan out the initial requests.
    fn start(self: Arc<Self>) -> Result<()>;

    /// Cooperative cancellation carrying the terminal extended state; used
    /// by both user cancels and the deadline watchdog.
    fn cancel_with(&self, extended: ExtendedState);

    fn cancel(&self) {
        self.cancel_with(ExtendedState::Cancelled);
    }

    /// Job-specific `(name, value)` pairs stored with the persisted job row.
    fn extended_persistent_state(&self) -> Vec<(String, String)>;

    /// One-line progress summary for `track` loops.
    fn progress(&self) -> String {
        let (state, extended) = self.core().state();
        format!("{} {}/{}", self.core().context(), state.as_str(), extended.as_str())
    }
}

/// Poll `job` until it finishes, printing progress at a jittered cadence.
pub fn track(job: &dyn Job, progress_report: bool, post: BlockPost, out: &mut dyn Write) {
    while !job.core().is_finished() {
        post.wait();
        if progress_report {
            if writeln!(out, "{}", job.progress()).is_err() {
                warn!(job_id = %job.core().id(), "progress stream closed, tracking silently");
            }
        }
    }
}
