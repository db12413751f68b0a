// Czar-side knowledge of the worker response protocol.
//
// The transport is handed a buffer sized to the exact number of bytes the
// next logical fragment piece occupies, fills it, and calls `flush`. There is
// no general-purpose receive buffer: the state machine announces one-byte
// header-size, header, body, header-size, ... until the terminal fragment.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::dispatch::transport::CancelToken;
use crate::error::{ErrorReport, ErrorValue};
use crate::merge::infile::InfileMerger;
use crate::proto::header::{ProtoHeader, PROTOCOL_VERSION};
use crate::proto::worker::{ResponseData, WorkerResponse};
use crate::util::Flag;

/// Message state of a [`MergingRequester`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgState {
    Invalid,
    /// Waiting for the one-byte size of the next header
    HeaderSizeWait,
    /// Waiting for a header of the announced size
    ResultWait(usize),
    /// Header parsed; waiting for the body it announces
    ResultExtra(ProtoHeader),
    /// Body received and handed to the merger
    ResultRecv,
    /// Terminal fragment seen; any remaining bytes are discarded
    BufferDrain,
    HeaderErr,
    ResultErr,
}

impl MsgState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgState::Invalid => "INVALID",
            MsgState::HeaderSizeWait => "HEADER_SIZE_WAIT",
            MsgState::ResultWait(_) => "RESULT_WAIT",
            MsgState::ResultExtra(_) => "RESULT_EXTRA",
            MsgState::ResultRecv => "RESULT_RECV",
            MsgState::BufferDrain => "BUFFER_DRAIN",
            MsgState::HeaderErr => "HEADER_ERR",
            MsgState::ResultErr => "RESULT_ERR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgState::BufferDrain | MsgState::HeaderErr | MsgState::ResultErr)
    }
}

/// Handler for the result bytes of one task. The transport serializes all
/// `next_buffer_size`/`flush`/`error_flush` calls; `cancel` may arrive from
/// any thread and wins over an in-flight `flush`.
pub trait ResponseRequester: Send + Sync {
    /// Number of bytes the requester needs next. The transport fills exactly
    /// this many unless the response ends first.
    fn next_buffer_size(&self) -> usize;

    /// Deliver `bytes`; `last` marks the final delivery of the response.
    /// Returns false on any error, after which no further deliveries are
    /// expected.
    fn flush(&self, bytes: &[u8], last: bool) -> bool;

    /// Unrecoverable transport-side error; terminates the requester.
    fn error_flush(&self, msg: &str, code: i32);

    /// True once the requester reached a terminal state.
    fn finished(&self) -> bool;

    /// Return to the initial state for a retry. Fails once any bytes were
    /// flushed downstream or the requester was cancelled.
    fn reset(&self) -> bool;

    /// True when a [`reset`](Self::reset) would succeed. Unlike `reset` this
    /// carries no side effects, so callers can probe before committing to a
    /// retry.
    fn retriable(&self) -> bool;

    fn error(&self) -> ErrorValue;

    /// Idempotent; fires the registered cancel callback exactly once.
    fn cancel(&self);

    fn cancelled(&self) -> bool;

    /// Abort a merge in progress after the owning task was cancelled.
    fn process_cancel(&self);

    /// The sentinel the transport-level request arms and disarms.
    fn cancel_token(&self) -> Arc<CancelToken>;
}

/// [`ResponseRequester`] that decodes protocol fragments and forwards rows to
/// an [`InfileMerger`].
pub struct MergingRequester {
    merger: Arc<InfileMerger>,
    job_id: i64,
    attempt: AtomicU32,
    state: Mutex<MsgState>,
    flushed: AtomicBool,
    cancelled: Flag,
    error: ErrorReport,
    cancel_token: Arc<CancelToken>,
}

impl MergingRequester {
    pub fn new(merger: Arc<InfileMerger>, job_id: i64) -> Arc<Self> {
        Arc::new(Self {
            merger,
            job_id,
            attempt: AtomicU32::new(0),
            state: Mutex::new(MsgState::HeaderSizeWait),
            flushed: AtomicBool::new(false),
            cancelled: Flag::new(),
            error: ErrorReport::new(),
            cancel_token: CancelToken::new(),
        })
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Record the attempt number stamped into provenance columns.
    pub fn set_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::SeqCst);
    }

    pub fn state(&self) -> MsgState {
        self.state.lock().clone()
    }

    fn fail(&self, state: &mut MsgState, terminal: MsgState, code: i32, msg: String) -> bool {
        warn!(job_id = self.job_id, state = terminal.as_str(), "{}", msg);
        self.error.set(code, msg);
        *state = terminal;
        false
    }

    /// Process one delivery while holding the state lock.
    fn step(&self, state: &mut MsgState, bytes: &[u8], last: bool) -> bool {
        match state.clone() {
            MsgState::HeaderSizeWait => {
                if bytes.is_empty() && last {
                    *state = MsgState::BufferDrain;
                    return true;
                }
                if bytes.len() != 1 {
                    return self.fail(
                        state,
                        MsgState::HeaderErr,
                        -1,
                        format!("expected 1 header-size byte, got {}", bytes.len()),
                    );
                }
                let header_size = bytes[0] as usize;
                if header_size == 0 {
                    return self.fail(
                        state,
                        MsgState::HeaderErr,
                        -1,
                        "zero-length header announced".to_string(),
                    );
                }
                *state = MsgState::ResultWait(header_size);
                true
            }
            MsgState::ResultWait(header_size) => {
                if bytes.len() != header_size {
                    return self.fail(
                        state,
                        MsgState::HeaderErr,
                        -1,
                        format!("truncated header: {} of {} bytes", bytes.len(), header_size),
                    );
                }
                let header = match ProtoHeader::parse(bytes) {
                    Ok(header) => header,
                    Err(e) => {
                        return self.fail(state, MsgState::HeaderErr, -1, e.to_string());
                    }
                };
                if header.protocol != PROTOCOL_VERSION {
                    return self.fail(
                        state,
                        MsgState::HeaderErr,
                        -1,
                        format!("unsupported protocol version {}", header.protocol),
                    );
                }
                if header.size < 0 {
                    return self.fail(
                        state,
                        MsgState::HeaderErr,
                        -1,
                        format!("negative body size {}", header.size),
                    );
                }
                *state = MsgState::ResultExtra(header);
                true
            }
            MsgState::ResultExtra(header) => {
                if bytes.len() != header.size as usize {
                    return self.fail(
                        state,
                        MsgState::ResultErr,
                        -1,
                        format!("truncated body: {} of {} bytes", bytes.len(), header.size),
                    );
                }
                if !header.verify_body(bytes) {
                    return self.fail(
                        state,
                        MsgState::ResultErr,
                        -1,
                        format!("md5 mismatch, expected {}", header.md5_hex()),
                    );
                }
                let data = match ResponseData::parse(bytes) {
                    Ok(data) => data,
                    Err(e) => {
                        return self.fail(state, MsgState::ResultErr, -1, e.to_string());
                    }
                };
                let response = WorkerResponse::new(header, data);
                *state = MsgState::ResultRecv;

                // Cancel wins over a flush in flight: re-check before merging.
                if self.cancelled.is_raised() {
                    return self.fail(state, MsgState::ResultErr, -1, "cancelled".to_string());
                }
                if !response.is_empty() {
                    let attempt = self.attempt.load(Ordering::SeqCst);
                    if let Err(e) = self.merger.merge(self.job_id, attempt, &response) {
                        return self.fail(state, MsgState::ResultErr, -1, e.to_string());
                    }
                    self.flushed.store(true, Ordering::SeqCst);
                }
                if last {
                    *state = MsgState::BufferDrain;
                } else {
                    *state = MsgState::HeaderSizeWait;
                }
                true
            }
            MsgState::BufferDrain => {
                // Remaining bytes after the terminal fragment are discarded.
                debug!(job_id = self.job_id, discarded = bytes.len(), "drained trailing bytes");
                true
            }
            MsgState::ResultRecv | MsgState::Invalid => self.fail(
                state,
                MsgState::HeaderErr,
                -1,
                format!("flush in unexpected state {}", state.as_str()),
            ),
            MsgState::HeaderErr | MsgState::ResultErr => false,
        }
    }
}

impl ResponseRequester for MergingRequester {
    fn next_buffer_size(&self) -> usize {
        match &*self.state.lock() {
            MsgState::HeaderSizeWait => 1,
            MsgState::ResultWait(header_size) => *header_size,
            MsgState::ResultExtra(header) => header.size as usize,
            _ => 0,
        }
    }

    fn flush(&self, bytes: &[u8], last: bool) -> bool {
        if self.cancelled.is_raised() {
            return false;
        }
        let mut state = self.state.lock();
        self.step(&mut state, bytes, last)
    }

    fn error_flush(&self, msg: &str, code: i32) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = MsgState::ResultErr;
        }
        self.error.set(code, msg.to_string());
    }

    fn finished(&self) -> bool {
        self.state.lock().is_terminal()
    }

    fn reset(&self) -> bool {
        if self.cancelled.is_raised() {
            return false;
        }
        let mut state = self.state.lock();
        if self.flushed.load(Ordering::SeqCst) {
            return false;
        }
        *state = MsgState::HeaderSizeWait;
        self.error.clear();
        true
    }

    fn retriable(&self) -> bool {
        !self.cancelled.is_raised() && !self.flushed.load(Ordering::SeqCst)
    }

    fn error(&self) -> ErrorValue {
        self.error.get()
    }

    fn cancel(&self) {
        if self.cancelled.raise() {
            self.cancel_token.fire();
        }
    }

    fn cancelled(&self) -> bool {
        self.cancelled.is_raised()
    }

    fn process_cancel(&self) {
        self.cancelled.raise();
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = MsgState::ResultErr;
        }
        self.error.set(-1, "cancelled".to_string());
    }

    fn cancel_token(&self) -> Arc<CancelToken> {
        self.cancel_token.clone()
    }
}

impl std::fmt::Debug for MergingRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergingRequester")
            .field("job_id", &self.job_id)
            .field("state", &self.state.lock().as_str())
            .field("cancelled", &self.cancelled.is_raised())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::infile::{InfileMerger, MemoryInfileSink};
    use crate::proto::header::{encode_fragment, wrap_header};
    use crate::proto::worker::{ColumnSchema, RowBundle, RowSchema};
    use parking_lot::Mutex as PlMutex;

    fn fragment() -> ResponseData {
        ResponseData {
            session: 1,
            schema: Some(RowSchema {
                columns: vec![
                    ColumnSchema::new("name", "VARCHAR(8)"),
                    ColumnSchema::new("count", "INT"),
                ],
            }),
            rows: vec![RowBundle::of(vec![Some(b"a"), Some(b"42")])],
        }
    }

    fn requester() -> (Arc<MergingRequester>, Arc<PlMutex<MemoryInfileSink>>) {
        let sink = Arc::new(PlMutex::new(MemoryInfileSink::new()));
        let merger = Arc::new(InfileMerger::new(Box::new(sink.clone()), "result_1", "INT(9)"));
        let requester = MergingRequester::new(merger, 1);
        requester.set_attempt(1);
        (requester, sink)
    }

    /// Feed a full wire frame through the exact-size buffer contract.
    fn feed(requester: &MergingRequester, frame: &[u8], last_at_end: bool) -> bool {
        let mut offset = 0;
        while offset < frame.len() {
            let want = requester.next_buffer_size();
            assert!(want > 0, "state machine asked for nothing with bytes pending");
            let end = (offset + want).min(frame.len());
            let last = last_at_end && end == frame.len();
            if !requester.flush(&frame[offset..end], last) {
                return false;
            }
            offset = end;
        }
        true
    }

    #[test]
    fn test_single_fragment_reaches_buffer_drain() {
        let (requester, sink) = requester();
        let frame = encode_fragment(&fragment()).unwrap();
        assert!(feed(&requester, &frame, true));
        assert_eq!(requester.state(), MsgState::BufferDrain);
        assert!(requester.finished());
        assert_eq!(sink.lock().tables["result_1"].rows.len(), 1);
    }

    #[test]
    fn test_two_fragments_then_drain() {
        let (requester, sink) = requester();
        let first = encode_fragment(&fragment()).unwrap();
        let second = encode_fragment(&ResponseData {
            session: 1,
            schema: None,
            rows: vec![RowBundle::of(vec![Some(b"b"), Some(b"43")])],
        })
        .unwrap();
        assert!(feed(&requester, &first, false));
        assert_eq!(requester.state(), MsgState::HeaderSizeWait);
        assert!(feed(&requester, &second, true));
        assert_eq!(requester.state(), MsgState::BufferDrain);
        assert_eq!(sink.lock().tables["result_1"].rows.len(), 2);
    }

    #[test]
    fn test_md5_mismatch_is_result_err() {
        let (requester, _sink) = requester();
        let body = fragment().serialize().unwrap();
        let mut header = ProtoHeader::for_body(&body);
        header.md5 = [0u8; 16];
        let mut frame = wrap_header(&header).unwrap();
        frame.extend_from_slice(&body);

        assert!(!feed(&requester, &frame, true));
        assert_eq!(requester.state(), MsgState::ResultErr);
        assert!(requester.error().msg.contains("md5"));
        // Nothing went downstream, so a retry may reset the requester.
        assert!(requester.reset());
        assert_eq!(requester.state(), MsgState::HeaderSizeWait);
        assert!(!requester.error().is_set());
    }

    #[test]
    fn test_empty_last_flush_drains_without_merger() {
        let (requester, sink) = requester();
        assert!(requester.flush(&[], true));
        assert_eq!(requester.state(), MsgState::BufferDrain);
        assert!(sink.lock().tables.is_empty());
    }

    #[test]
    fn test_reset_after_merge_fails() {
        let (requester, _sink) = requester();
        let frame = encode_fragment(&fragment()).unwrap();
        assert!(feed(&requester, &frame, true));
        assert!(!requester.reset());
        assert_eq!(requester.state(), MsgState::BufferDrain);
    }

    #[test]
    fn test_cancel_wins_over_flush() {
        let (requester, sink) = requester();
        requester.cancel();
        let frame = encode_fragment(&fragment()).unwrap();
        assert!(!feed(&requester, &frame, true));
        assert!(sink.lock().tables.is_empty());
        assert!(requester.cancelled());
    }

    #[test]
    fn test_bad_header_is_header_err() {
        let (requester, _sink) = requester();
        assert!(requester.flush(&[3], false));
        assert_eq!(requester.next_buffer_size(), 3);
        assert!(!requester.flush(&[0xFF, 0xFF, 0xFF], false));
        assert_eq!(requester.state(), MsgState::HeaderErr);
    }

    #[test]
    fn test_error_flush_terminates() {
        let (requester, _sink) = requester();
        requester.error_flush("link severed", 17);
        assert!(requester.finished());
        assert_eq!(requester.error().code, 17);
        // First error wins over later reports.
        requester.error_flush("second", 3);
        assert_eq!(requester.error().code, 17);
    }
}
