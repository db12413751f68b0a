// Transport-facing primitives: the SSI-like service interface, the
// per-attempt provisioning handle, and the cancellation sentinel.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Cancellation sentinel owned by a response requester.
///
/// The transport-level request arms the token with a weak handle to itself on
/// construction and disarms it before destruction, so a cancel arriving after
/// the request finished is a no-op rather than a use-after-free. `fire()`
/// invokes the armed callback at most once even under concurrent callers.
#[derive(Default)]
pub struct CancelToken {
    armed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    fired: Mutex<bool>,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the callback to run on `fire()`. Replaces any prior callback.
    pub fn arm(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.armed.lock() = Some(Box::new(callback));
    }

    /// Drop the armed callback. Must be called before the target of the
    /// callback is destroyed.
    pub fn disarm(&self) {
        *self.armed.lock() = None;
    }

    /// Invoke the armed callback, exactly once across all callers. The
    /// callback runs outside the token's locks.
    pub fn fire(&self) {
        let callback = {
            let mut fired = self.fired.lock();
            if *fired {
                return;
            }
            *fired = true;
            self.armed.lock().take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn has_fired(&self) -> bool {
        *self.fired.lock()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("armed", &self.armed.lock().is_some())
            .field("fired", &self.fired.lock())
            .finish()
    }
}

/// Provisioning handle for one attempt: the worker resource to contact and
/// the serialized task payload to present.
#[derive(Debug, Clone)]
pub struct QueryResource {
    pub path: String,
    pub payload: Vec<u8>,
}

impl QueryResource {
    pub fn new(path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { path: path.into(), payload }
    }
}

/// The transport layer as seen by the czar: a reliable request/response
/// channel with server-push streaming of response fragments.
///
/// `provision` either accepts the request, after which the service drives the
/// request object from its own I/O threads (serialized per request), or
/// returns an error that triggers the provisioning-retry path.
pub trait SsiService: Send + Sync {
    fn provision(&self, request: Arc<crate::dispatch::query_request::QueryRequest>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fire_runs_callback_once() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let counted = count.clone();
        token.arm(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        token.fire();
        token.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(token.has_fired());
    }

    #[test]
    fn test_disarmed_fire_is_noop() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let counted = count.clone();
        token.arm(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        token.disarm();
        token.fire();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // fire() still latches so a late re-arm cannot resurrect the cancel.
        assert!(token.has_fired());
    }

    #[test]
    fn test_concurrent_fire_single_winner() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let counted = count.clone();
        token.arm(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let mut handles = Vec::new();
        for _ in 0..8 {
            let token = token.clone();
            handles.push(std::thread::spawn(move || token.fire()));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
