//! Decimated, non-blocking state log.
//!
//! Writes go to a dedicated worker thread. The control cycle never waits on
//! it: a write in flight is polled once per attempt, and while it is still
//! pending new records are buffered and prefixed to the next write with a
//! blank line marking the gap. A failed write closes the log for good.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{info, warn};
use serde::Serialize;

use crate::error::TrackerResult;
use crate::types::{StateVec, TagId, Timestamp};

pub const LOG_HEADER: &str = "ts_sec ts_nsec tag valid x y z";

/// `sec nsec id 1 x y z`
pub fn format_record(timestamp: Timestamp, id: TagId, position: &StateVec) -> String {
    format!(
        "{} {} {} 1 {:.6} {:.6} {:.6}\n",
        timestamp.sec, timestamp.nsec, id, position.x, position.y, position.z
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    /// Cycles handed to the log
    pub cycles: u64,
    /// Decimated cycles on which a write was attempted
    pub attempts: u64,
    /// Writes handed to the worker
    pub issued: u64,
    /// Attempts that found the previous write still in flight
    pub deferred: u64,
    pub failed: bool,
}

enum WriteState {
    Idle,
    InFlight,
    Closed,
}

struct Worker {
    requests: Sender<String>,
    completions: Receiver<io::Result<usize>>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<W: Write + Send + 'static>(mut writer: W) -> Self {
        let (requests, request_rx) = channel::unbounded::<String>();
        let (completion_tx, completions) = channel::bounded(1);

        let handle = thread::spawn(move || {
            for buffer in request_rx.iter() {
                let result = writer
                    .write_all(buffer.as_bytes())
                    .and_then(|_| writer.flush())
                    .map(|_| buffer.len());
                if completion_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Self {
            requests,
            completions,
            handle,
        }
    }
}

pub struct PoseLog {
    worker: Option<Worker>,
    state: WriteState,
    decimation: u32,
    /// Records waiting for the next write
    buffer: String,
    /// A write was skipped since the last one went out
    gap: bool,
    stats: LogStats,
}

impl PoseLog {
    /// Truncate `path` and write the header line.
    pub fn create(path: &Path, decimation: u32) -> TrackerResult<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", LOG_HEADER)?;
        writer.flush()?;
        info!("Logging tag states to {} (every {} cycles)", path.display(), decimation);
        Ok(Self::new(writer, decimation))
    }

    pub fn new<W: Write + Send + 'static>(writer: W, decimation: u32) -> Self {
        Self {
            worker: Some(Worker::spawn(writer)),
            state: WriteState::Idle,
            decimation: decimation.max(1),
            buffer: String::new(),
            gap: false,
            stats: LogStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, WriteState::Closed)
    }

    pub fn is_write_pending(&self) -> bool {
        matches!(self.state, WriteState::InFlight)
    }

    pub fn stats(&self) -> LogStats {
        self.stats
    }

    /// Hand one cycle's estimates to the log. Never blocks.
    pub fn record(&mut self, timestamp: Timestamp, snapshot: &[(TagId, StateVec)]) {
        if !self.is_enabled() {
            return;
        }

        self.stats.cycles += 1;
        if !self.stats.cycles.is_multiple_of(u64::from(self.decimation)) {
            return;
        }
        self.stats.attempts += 1;

        let mut batch = String::new();
        for (id, position) in snapshot {
            batch.push_str(&format_record(timestamp, *id, position));
        }

        self.poll();
        match self.state {
            WriteState::Closed => {}
            WriteState::InFlight => {
                self.stats.deferred += 1;
                self.gap = true;
                self.buffer.push_str(&batch);
            }
            WriteState::Idle => {
                if self.gap {
                    self.buffer.insert(0, '\n');
                    self.gap = false;
                }
                self.buffer.push_str(&batch);
                self.issue();
            }
        }
    }

    /// Block until every buffered record is written, then stop the worker.
    pub fn finish(mut self) -> LogStats {
        if let (WriteState::InFlight, Some(worker)) = (&self.state, &self.worker) {
            let outcome = worker.completions.recv();
            self.state = WriteState::Idle;
            self.handle_completion(outcome.map_err(|_| TryRecvError::Disconnected));
        }

        if matches!(self.state, WriteState::Idle) && !self.buffer.is_empty() {
            if self.gap {
                self.buffer.insert(0, '\n');
                self.gap = false;
            }
            self.issue();
            if let Some(worker) = &self.worker {
                let outcome = worker.completions.recv();
                self.state = WriteState::Idle;
                self.handle_completion(outcome.map_err(|_| TryRecvError::Disconnected));
            }
        }

        self.shutdown();
        self.stats
    }

    fn poll(&mut self) {
        if !matches!(self.state, WriteState::InFlight) {
            return;
        }
        let Some(worker) = &self.worker else {
            self.state = WriteState::Closed;
            return;
        };

        match worker.completions.try_recv() {
            Err(TryRecvError::Empty) => {}
            outcome => {
                self.state = WriteState::Idle;
                self.handle_completion(outcome);
            }
        }
    }

    fn handle_completion(&mut self, outcome: Result<io::Result<usize>, TryRecvError>) {
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => self.close(&format!("write failed: {}", e)),
            Err(_) => self.close("writer thread exited"),
        }
    }

    fn issue(&mut self) {
        let Some(worker) = &self.worker else {
            self.state = WriteState::Closed;
            return;
        };

        let buffer = std::mem::take(&mut self.buffer);
        if worker.requests.send(buffer).is_err() {
            self.close("writer thread exited");
            return;
        }
        self.stats.issued += 1;
        self.state = WriteState::InFlight;
    }

    fn close(&mut self, reason: &str) {
        warn!("Tag log disabled: {}", reason);
        self.stats.failed = true;
        self.state = WriteState::Closed;
        self.buffer.clear();
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Dropping the request sender ends the worker loop
            drop(worker.requests);
            if worker.handle.join().is_err() {
                warn!("Tag log writer thread panicked");
            }
        }
    }
}

impl Drop for PoseLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
