// Shared utilities: set-once flags, jittered waits, record-sized copy.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, ShardError};

/// A boolean flag that can be raised exactly once.
///
/// `raise()` returns true only for the caller that performed the transition,
/// which is how idempotent cancellation paths pick a single winner.
#[derive(Debug, Default)]
pub struct Flag {
    value: AtomicBool,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true iff this call changed it.
    pub fn raise(&self) -> bool {
        !self.value.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }
}

/// Sleeps a uniformly random duration drawn from `[min_ms, max_ms]`.
///
/// Used between retry attempts and by job `track()` loops so that many
/// waiters do not pulse in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct BlockPost {
    min_ms: u64,
    max_ms: u64,
}

impl BlockPost {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        assert!(min_ms <= max_ms, "BlockPost interval inverted");
        Self { min_ms, max_ms }
    }

    /// Block the calling thread and return the slept duration.
    pub fn wait(&self) -> Duration {
        let ms = self.next_ms();
        let duration = Duration::from_millis(ms);
        std::thread::sleep(duration);
        duration
    }

    pub fn next_ms(&self) -> u64 {
        if self.min_ms == self.max_ms {
            return self.min_ms;
        }
        rand::rng().random_range(self.min_ms..=self.max_ms)
    }
}

type PoolTask = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads fed from an unbounded queue. Dropping
/// the pool closes the queue and joins the workers.
pub struct ThreadPool {
    sender: Option<crossbeam::channel::Sender<PoolTask>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded::<PoolTask>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("spawn pool thread")
            })
            .collect();
        Self { sender: Some(sender), workers }
    }

    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(task)).is_err() {
                tracing::warn!("thread pool is shut down, task dropped");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool").field("workers", &self.workers.len()).finish()
    }
}

/// Copy `input` to `output` in fixed-size records. Returns the number of
/// bytes copied. The final record may be short.
pub fn copy_records(input: &Path, output: &Path, record_size: usize) -> Result<u64> {
    if record_size == 0 {
        return Err(ShardError::InvalidInput("record size must be positive".to_string()));
    }
    let mut reader = std::fs::File::open(input)?;
    let mut writer = std::fs::File::create(output)?;
    let mut record = vec![0u8; record_size];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut record)?;
        if n == 0 {
            break;
        }
        writer.write_all(&record[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}
