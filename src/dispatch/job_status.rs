// Per-task progress tracking.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Phase of one per-chunk task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Unknown,
    /// Provisioning a transport session
    Provision,
    /// Provisioning was refused; a retry is pending
    ProvisionNack,
    /// Conversation handed to the transport
    Request,
    /// Terminal fragment received and merged
    ResponseReady,
    ResponseError,
    Complete,
    Cancelled,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Unknown => "UNKNOWN",
            JobPhase::Provision => "PROVISION",
            JobPhase::ProvisionNack => "PROVISION_NACK",
            JobPhase::Request => "REQUEST",
            JobPhase::ResponseReady => "RESPONSE_READY",
            JobPhase::ResponseError => "RESPONSE_ERROR",
            JobPhase::Complete => "COMPLETE",
            JobPhase::Cancelled => "CANCELLED",
        }
    }
}

/// Snapshot of a task's most recent transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusInfo {
    pub phase: JobPhase,
    pub updated: DateTime<Utc>,
    pub code: i32,
    pub description: String,
}

impl Default for JobStatusInfo {
    fn default() -> Self {
        Self { phase: JobPhase::Unknown, updated: Utc::now(), code: 0, description: String::new() }
    }
}

/// Mutable per-task progress record shared between the task, its transport
/// conversation, and the Executive's status map.
#[derive(Debug, Default)]
pub struct JobStatus {
    info: Mutex<JobStatusInfo>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, phase: JobPhase) {
        self.update_with(phase, 0, String::new());
    }

    pub fn update_with(&self, phase: JobPhase, code: i32, description: impl Into<String>) {
        let mut info = self.info.lock();
        info.phase = phase;
        info.updated = Utc::now();
        info.code = code;
        info.description = description.into();
    }

    pub fn snapshot(&self) -> JobStatusInfo {
        self.info.lock().clone()
    }

    pub fn phase(&self) -> JobPhase {
        self.info.lock().phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_records_transition() {
        let status = JobStatus::new();
        assert_eq!(status.phase(), JobPhase::Unknown);
        status.update(JobPhase::Provision);
        assert_eq!(status.phase(), JobPhase::Provision);
        status.update_with(JobPhase::ResponseError, -2, "md5 mismatch");
        let info = status.snapshot();
        assert_eq!(info.code, -2);
        assert_eq!(info.description, "md5 mismatch");
    }
}
