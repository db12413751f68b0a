use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query parsing error: {0}")]
    QueryParse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Replica error: {0}")]
    Replica(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Job expired: {0}")]
    JobExpired(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;

/// One error value exposed by a component: message plus numeric code.
///
/// Composite operations carry the first non-empty child error upward and
/// never overwrite an error once set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorValue {
    pub msg: String,
    pub code: i32,
}

impl ErrorValue {
    pub fn is_set(&self) -> bool {
        !self.msg.is_empty() || self.code != 0
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.msg)
    }
}

/// Mutex-guarded error slot shared between the threads of one component.
#[derive(Debug, Default)]
pub struct ErrorReport {
    inner: Mutex<ErrorValue>,
}

impl ErrorReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error unless one is already present. Returns true if this
    /// call set the value.
    pub fn set(&self, code: i32, msg: impl Into<String>) -> bool {
        let mut guard = self.inner.lock();
        if guard.is_set() {
            return false;
        }
        guard.code = code;
        guard.msg = msg.into();
        true
    }

    pub fn get(&self) -> ErrorValue {
        self.inner.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_set()
    }

    /// Forget the recorded error. Only retry paths that verified no bytes
    /// went downstream may call this.
    pub fn clear(&self) {
        *self.inner.lock() = ErrorValue::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_report_first_wins() {
        let report = ErrorReport::new();
        assert!(!report.is_set());
        assert!(report.set(4, "first failure"));
        assert!(!report.set(7, "second failure"));
        let value = report.get();
        assert_eq!(value.code, 4);
        assert_eq!(value.msg, "first failure");
    }

    #[test]
    fn test_error_value_display() {
        let value = ErrorValue { msg: "md5 mismatch".to_string(), code: 2 };
        assert_eq!(value.to_string(), "[2] md5 mismatch");
    }
}
