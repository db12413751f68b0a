// End-to-end dispatch and merge: a scripted worker speaks the framed
// response protocol to an Executive-owned task fleet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use skyshard::dispatch::{Executive, MsgState, QueryId, QueryRequest, SsiService};
use skyshard::error::Result;
use skyshard::merge::{InfileMerger, MemoryInfileSink};
use skyshard::proto::header::encode_fragment;
use skyshard::proto::header::{wrap_header, ProtoHeader};
use skyshard::proto::{ColumnSchema, ResponseData, RowBundle, RowSchema, TaskMsg};
use skyshard::{Config, ShardError};

/// What the scripted worker does for one resource path.
#[derive(Clone, Default)]
struct WorkerScript {
    /// Response fragments, sent in order
    fragments: Vec<ResponseData>,
    /// Zero the md5 of every header
    corrupt_md5: bool,
    /// Refuse this many provisioning attempts before accepting
    refuse_provisions: usize,
    /// Sleep between fragments, letting callers cancel mid-stream
    inter_fragment_delay: Duration,
}

#[derive(Default)]
struct ScriptedWorker {
    scripts: Mutex<HashMap<String, WorkerScript>>,
    refused: Mutex<HashMap<String, usize>>,
}

impl ScriptedWorker {
    fn script(&self, path: &str, script: WorkerScript) {
        self.scripts.lock().insert(path.to_string(), script);
    }

    fn wire_frames(script: &WorkerScript) -> Vec<Vec<u8>> {
        script
            .fragments
            .iter()
            .map(|fragment| {
                if script.corrupt_md5 {
                    let body = fragment.serialize().unwrap();
                    let mut header = ProtoHeader::for_body(&body);
                    header.md5 = [0u8; 16];
                    let mut frame = wrap_header(&header).unwrap();
                    frame.extend_from_slice(&body);
                    frame
                } else {
                    encode_fragment(fragment).unwrap()
                }
            })
            .collect()
    }

    /// Serve one frame using the exact-size buffer contract.
    fn serve_frame(request: &Arc<QueryRequest>, frame: &[u8], last_frame: bool) -> bool {
        let mut offset = 0;
        while offset < frame.len() {
            if request.finished() {
                return false;
            }
            let want = request.next_buffer_size();
            if want == 0 {
                return false;
            }
            let end = (offset + want).min(frame.len());
            let last = last_frame && end == frame.len();
            if !request.process_response_data(&frame[offset..end], last) {
                return false;
            }
            offset = end;
        }
        true
    }
}

impl SsiService for ScriptedWorker {
    fn provision(&self, request: Arc<QueryRequest>) -> Result<()> {
        let path = request.resource_path().to_string();
        let script = self
            .scripts
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| ShardError::Transport(format!("no worker serves {}", path)))?;

        {
            let mut refused = self.refused.lock();
            let count = refused.entry(path.clone()).or_insert(0);
            if *count < script.refuse_provisions {
                *count += 1;
                return Err(ShardError::Transport(format!("resource {} busy", path)));
            }
        }

        std::thread::spawn(move || {
            // The payload must decode as a task message.
            TaskMsg::parse(request.payload()).expect("payload is a task message");
            let frames = Self::wire_frames(&script);
            let count = frames.len();
            for (i, frame) in frames.iter().enumerate() {
                if i > 0 && !script.inter_fragment_delay.is_zero() {
                    std::thread::sleep(script.inter_fragment_delay);
                }
                if !Self::serve_frame(&request, frame, i + 1 == count) {
                    return;
                }
            }
        });
        Ok(())
    }
}

fn result_fragment(schema: bool, rows: Vec<RowBundle>) -> ResponseData {
    ResponseData {
        session: 1,
        schema: schema.then(|| RowSchema {
            columns: vec![
                ColumnSchema::new("name", "VARCHAR(8)"),
                ColumnSchema::new("count", "INT"),
            ],
        }),
        rows,
    }
}

fn fixture() -> (Arc<ScriptedWorker>, Arc<InfileMerger>, Arc<Mutex<MemoryInfileSink>>) {
    let worker = Arc::new(ScriptedWorker::default());
    let sink = Arc::new(Mutex::new(MemoryInfileSink::new()));
    let merger = Arc::new(InfileMerger::new(
        Box::new(sink.clone()),
        "result_1",
        Config::default().job_id_sql_type,
    ));
    (worker, merger, sink)
}

fn payload(chunk: u32) -> Vec<u8> {
    TaskMsg::new(1, chunk, "LSST", vec![format!("SELECT 1 FROM Obj_{}", chunk)])
        .serialize()
        .unwrap()
}

#[test]
fn test_single_chunk_happy_path() {
    let (worker, merger, sink) = fixture();
    worker.script(
        "/chk/LSST/314",
        WorkerScript {
            fragments: vec![result_fragment(true, vec![RowBundle::of(vec![Some(b"a"), Some(b"42")])])],
            ..WorkerScript::default()
        },
    );

    let executive = Executive::new(QueryId(1), worker, merger, &Config::default());
    let job = executive.add_job(1, "/chk/LSST/314", payload(314));
    assert!(executive.join());

    let requester = &job.description().requester;
    assert_eq!(requester.state(), MsgState::BufferDrain);

    let sink = sink.lock();
    let table = &sink.tables["result_1"];
    assert_eq!(table.rows.len(), 1);
    assert_eq!(
        table.rows[0],
        vec![
            Some(b"1".to_vec()),
            Some(b"1".to_vec()),
            Some(b"a".to_vec()),
            Some(b"42".to_vec())
        ]
    );
    assert_eq!(executive.success_count(), 1);
    assert_eq!(executive.rows_merged(), 1);
}

#[test]
fn test_multi_chunk_fan_out() {
    let (worker, merger, sink) = fixture();
    for chunk in [100u32, 200, 300] {
        worker.script(
            &format!("/chk/LSST/{}", chunk),
            WorkerScript {
                fragments: vec![result_fragment(
                    true,
                    vec![RowBundle::of(vec![
                        Some(format!("c{}", chunk).as_bytes()),
                        Some(b"1"),
                    ])],
                )],
                ..WorkerScript::default()
            },
        );
    }

    let executive = Executive::new(QueryId(2), worker, merger, &Config::default());
    for (id, chunk) in [(1, 100u32), (2, 200), (3, 300)] {
        executive.add_job(id, format!("/chk/LSST/{}", chunk), payload(chunk));
    }
    assert!(executive.join());
    assert_eq!(sink.lock().tables["result_1"].rows.len(), 3);
    assert_eq!(executive.success_count(), 3);
}

#[test]
fn test_md5_mismatch_retries_then_fails() {
    let (worker, merger, sink) = fixture();
    worker.script(
        "/chk/LSST/314",
        WorkerScript {
            fragments: vec![result_fragment(true, vec![RowBundle::of(vec![Some(b"a"), Some(b"42")])])],
            corrupt_md5: true,
            ..WorkerScript::default()
        },
    );

    let executive = Executive::new(QueryId(3), worker, merger, &Config::default());
    let job = executive.add_job(1, "/chk/LSST/314", payload(314));
    assert!(!executive.join());

    // Every attempt was made before the query was squashed.
    assert_eq!(job.attempts(), 5);
    assert!(executive.is_cancelled());
    assert!(executive.error().msg.contains("md5"));
    assert!(sink.lock().tables.is_empty());
}

#[test]
fn test_provisioning_failure_retries_in_background() {
    let (worker, merger, _sink) = fixture();
    worker.script(
        "/chk/LSST/314",
        WorkerScript {
            fragments: vec![result_fragment(true, vec![RowBundle::of(vec![Some(b"a"), Some(b"1")])])],
            refuse_provisions: 2,
            ..WorkerScript::default()
        },
    );

    let executive = Executive::new(QueryId(4), worker, merger, &Config::default());
    let job = executive.add_job(1, "/chk/LSST/314", payload(314));
    assert!(executive.join());
    assert_eq!(job.attempts(), 3);
}

#[test]
fn test_squash_mid_stream_keeps_merged_rows() {
    let (worker, merger, sink) = fixture();
    worker.script(
        "/chk/LSST/314",
        WorkerScript {
            fragments: vec![
                result_fragment(true, vec![RowBundle::of(vec![Some(b"first"), Some(b"1")])]),
                result_fragment(false, vec![RowBundle::of(vec![Some(b"second"), Some(b"2")])]),
                result_fragment(false, vec![RowBundle::of(vec![Some(b"third"), Some(b"3")])]),
            ],
            inter_fragment_delay: Duration::from_millis(300),
            ..WorkerScript::default()
        },
    );

    let executive = Executive::new(QueryId(5), worker, merger, &Config::default());
    let job = executive.add_job(1, "/chk/LSST/314", payload(314));

    // Wait until the first fragment landed in the result table.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if sink.lock().tables.get("result_1").map(|t| !t.rows.is_empty()).unwrap_or(false) {
            break;
        }
        assert!(Instant::now() < deadline, "first fragment never merged");
        std::thread::sleep(Duration::from_millis(10));
    }

    executive.squash();
    let rows_after_squash = sink.lock().tables["result_1"].rows.len();

    assert!(!executive.join());
    assert!(job.is_cancelled());
    assert!(executive.is_cancelled());

    // Rows merged before the squash stay; nothing arrives afterwards. The
    // failed query still reports how many rows it landed.
    std::thread::sleep(Duration::from_millis(800));
    let rows_final = sink.lock().tables["result_1"].rows.len();
    assert_eq!(rows_after_squash, rows_final);
    assert!(rows_final >= 1);
    assert_eq!(executive.rows_merged() as usize, rows_final);
}

#[test]
fn test_empty_result_set_succeeds() {
    let (worker, merger, sink) = fixture();
    worker.script(
        "/chk/LSST/314",
        WorkerScript {
            fragments: vec![result_fragment(true, Vec::new())],
            ..WorkerScript::default()
        },
    );

    let executive = Executive::new(QueryId(6), worker, merger, &Config::default());
    executive.add_job(1, "/chk/LSST/314", payload(314));
    assert!(executive.join());
    // The schema fragment created the (empty) result table.
    assert!(sink.lock().tables["result_1"].rows.is_empty());
}
