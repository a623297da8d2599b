//! In-process `Transport` used only by this crate's own tests
//! (`crate::composite`, `crate::lock`). Not part of the public API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::command::Command;
use crate::sense::ScsiStatus;
use crate::transport::Transport;

struct Recorded {
    cmd: Command,
    status: ScsiStatus,
}

/// Records one completion at a time and lets a test (or the CLI smoke
/// harness) block for it. `wait_for_completion` *consumes* the recorded
/// completion so a caller that dispatches several commands in sequence
/// always observes the one it just issued, never a stale completion left
/// over from an earlier command on the same transport.
#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Option<Recorded>>,
    ready: Condvar,
    last: Mutex<Option<Recorded>>,
    lock_lost: Mutex<Vec<String>>,
    conn_lost: Mutex<Vec<String>>,
    processing_complete_count: Mutex<usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the next completion is recorded, consuming it and
    /// caching it as "last" for the `last_*` accessors below. Panics after a
    /// short timeout — every test using this backs onto the `MockBackend`,
    /// whose completions always fire promptly from a spawned thread or a
    /// worker.
    pub fn wait_for_completion(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut inner = self.inner.lock();
        while inner.is_none() {
            if Instant::now() > deadline {
                panic!("timed out waiting for a completion to be recorded");
            }
            self.ready.wait_for(&mut inner, Duration::from_millis(50));
        }
        *self.last.lock() = inner.take();
    }

    pub fn last_status(&self) -> Option<ScsiStatus> {
        self.last.lock().as_ref().map(|r| r.status)
    }

    pub fn last_sense(&self) -> Option<[u8; crate::sense::SENSE_BUFFER_SIZE]> {
        self.last.lock().as_ref().map(|r| r.cmd.sense)
    }

    pub fn last_iovec(&self) -> Option<crate::iovec::IoVec> {
        self.last.lock().as_ref().map(|r| r.cmd.iovec.clone())
    }

    pub fn processing_complete_count(&self) -> usize {
        *self.processing_complete_count.lock()
    }

    /// Device names passed to successive `notify_lock_lost` calls, in order.
    pub fn lock_lost_events(&self) -> Vec<String> {
        self.lock_lost.lock().clone()
    }

    /// Device names passed to successive `notify_conn_lost` calls, in order.
    pub fn conn_lost_events(&self) -> Vec<String> {
        self.conn_lost.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn complete(&self, cmd: Command, status: ScsiStatus) {
        let mut inner = self.inner.lock();
        *inner = Some(Recorded { cmd, status });
        self.ready.notify_one();
    }

    fn processing_complete(&self, _device: &str) {
        *self.processing_complete_count.lock() += 1;
    }

    fn notify_lock_lost(&self, device: &str) {
        self.lock_lost.lock().push(device.to_string());
    }

    fn notify_conn_lost(&self, device: &str) {
        self.conn_lost.lock().push(device.to_string());
    }
}

pub fn recording_transport() -> Arc<RecordingTransport> {
    Arc::new(RecordingTransport::new())
}
